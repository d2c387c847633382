//! Scriptable in-process mock LSP server for integration tests.
//!
//! The mock speaks real `Content-Length` framing over a duplex pipe, answers
//! requests according to configurable per-method patterns, records every
//! notification it receives, and can emit server-originated notifications
//! (progress, log messages) on demand.

// Each integration test crate compiles this module and uses its own subset.
#![allow(dead_code)]

use lsp_session_daemon::lsp_server::LspServer;
use lsp_session_daemon::protocol;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{split, BufReader};
use tokio::sync::mpsc;

/// Configurable response pattern for LSP methods.
#[derive(Debug, Clone)]
pub enum MockResponsePattern {
    /// Return a fixed result, optionally after a delay.
    Success { result: Value, delay_ms: Option<u64> },
    /// Return `{"echo": <params>}` so callers can verify correlation.
    Echo { delay_ms: Option<u64> },
    /// Return a JSON-RPC error.
    Error { code: i64, message: String },
    /// Never respond.
    Timeout,
}

#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// The `capabilities` object returned from `initialize`.
    pub capabilities: Value,
    /// Delay before the `initialize` response.
    pub initialize_delay_ms: Option<u64>,
    /// Response patterns by method; unknown methods get a null result.
    pub method_patterns: HashMap<String, MockResponsePattern>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            capabilities: json!({"hoverProvider": true}),
            initialize_delay_ms: None,
            method_patterns: HashMap::new(),
        }
    }
}

pub struct MockLsp {
    notifications: Arc<Mutex<Vec<(String, Value)>>>,
    outbound_tx: mpsc::Sender<Value>,
}

impl MockLsp {
    /// Start the mock and return the broker-side transport wired to it.
    pub fn spawn(config: MockServerConfig) -> (LspServer, MockLsp) {
        let (broker_io, mock_io) = tokio::io::duplex(4 * 1024 * 1024);
        let (broker_read, broker_write) = split(broker_io);
        let server = LspServer::from_transport(broker_write, broker_read);

        let (mock_read, mock_write) = split(mock_io);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(64);
        let notifications = Arc::new(Mutex::new(Vec::new()));

        let mock = MockLsp {
            notifications: notifications.clone(),
            outbound_tx: outbound_tx.clone(),
        };

        tokio::spawn(async move {
            let mut reader = BufReader::new(mock_read);
            let mut writer = mock_write;

            loop {
                tokio::select! {
                    incoming = protocol::read_message(&mut reader) => {
                        match incoming {
                            Ok(msg) => handle_message(&config, &notifications, &outbound_tx, msg),
                            Err(_) => break,
                        }
                    }
                    outgoing = outbound_rx.recv() => {
                        match outgoing {
                            Some(msg) => {
                                if protocol::write_message(&mut writer, &msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        (server, mock)
    }

    /// Emit a server-originated notification toward the broker.
    pub async fn send_notification(&self, method: &str, params: Value) {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let _ = self.outbound_tx.send(msg).await;
    }

    /// Snapshot of every notification received so far, in arrival order.
    pub fn notifications(&self) -> Vec<(String, Value)> {
        self.notifications.lock().unwrap().clone()
    }

    /// Methods of the received notifications matching `filter`.
    pub fn notification_methods(&self, filter: &[&str]) -> Vec<String> {
        self.notifications()
            .into_iter()
            .map(|(method, _)| method)
            .filter(|method| filter.contains(&method.as_str()))
            .collect()
    }

    /// Wait until a notification with the given method arrives.
    pub async fn wait_for_notification(&self, method: &str, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some((_, params)) = self
                .notifications()
                .into_iter()
                .find(|(received, _)| received == method)
            {
                return Some(params);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn handle_message(
    config: &MockServerConfig,
    notifications: &Arc<Mutex<Vec<(String, Value)>>>,
    outbound_tx: &mpsc::Sender<Value>,
    msg: Value,
) {
    let method = msg.get("method").and_then(|m| m.as_str()).map(str::to_string);
    let id = msg.get("id").cloned();

    match (id, method) {
        (Some(id), Some(method)) => {
            if method == "initialize" {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"capabilities": config.capabilities},
                });
                respond_after(outbound_tx.clone(), config.initialize_delay_ms, response);
                return;
            }

            let params = msg.get("params").cloned().unwrap_or(Value::Null);
            let pattern = config
                .method_patterns
                .get(&method)
                .cloned()
                .unwrap_or(MockResponsePattern::Success {
                    result: Value::Null,
                    delay_ms: None,
                });

            match pattern {
                MockResponsePattern::Success { result, delay_ms } => {
                    let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
                    respond_after(outbound_tx.clone(), delay_ms, response);
                }
                MockResponsePattern::Echo { delay_ms } => {
                    let response =
                        json!({"jsonrpc": "2.0", "id": id, "result": {"echo": params}});
                    respond_after(outbound_tx.clone(), delay_ms, response);
                }
                MockResponsePattern::Error { code, message } => {
                    let response = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": code, "message": message},
                    });
                    respond_after(outbound_tx.clone(), None, response);
                }
                MockResponsePattern::Timeout => {}
            }
        }

        (None, Some(method)) => {
            let params = msg.get("params").cloned().unwrap_or(Value::Null);
            notifications.lock().unwrap().push((method, params));
        }

        // A response from the broker (ack of a server request); ignore.
        _ => {}
    }
}

fn respond_after(tx: mpsc::Sender<Value>, delay_ms: Option<u64>, msg: Value) {
    tokio::spawn(async move {
        if let Some(ms) = delay_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let _ = tx.send(msg).await;
    });
}
