//! The session singleton: one LSP child, one workspace, many clients.
//!
//! Owns the initialization handshake, the stdout read loop that classifies
//! and routes every server message, the open-document registry, the progress
//! tracker, and the buffer of server log messages.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::document_registry::DocumentRegistry;
use crate::error::BrokerError;
use crate::file_watcher::{FileChange, FileWatcher};
use crate::logging::LspLogBuffer;
use crate::lsp_server::{BoxedReader, LspServer};
use crate::progress_tracker::ProgressTracker;
use crate::protocol::{RequestId, ResponseError, INTERNAL_ERROR};
use crate::request_registry::LspResponse;

/// Deadline for the `initialize` handshake. JVM-based servers routinely take
/// tens of seconds to come up before they even answer.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Bootstrap {
    initialized: bool,
    capabilities: Value,
}

pub struct SessionManager {
    workspace_dir: PathBuf,
    server: LspServer,
    bootstrap: RwLock<Bootstrap>,
    progress: Arc<ProgressTracker>,
    documents: DocumentRegistry,
    lsp_logs: LspLogBuffer,
    transport_dead: Notify,
}

impl SessionManager {
    /// Spawn the LSP child and bring the session up: read loop first, then
    /// the `initialize`/`initialized` handshake. Callers may issue requests
    /// as soon as this returns; indexing completes in the background.
    pub async fn start(
        command: &str,
        args: &[String],
        workspace_dir: &Path,
    ) -> Result<Arc<Self>, BrokerError> {
        let server = LspServer::spawn(command, args)?;
        Self::start_with_server(server, workspace_dir).await
    }

    /// Bring up a session over an already-constructed server transport.
    pub async fn start_with_server(
        server: LspServer,
        workspace_dir: &Path,
    ) -> Result<Arc<Self>, BrokerError> {
        let reader = server
            .take_stdout()
            .ok_or_else(|| BrokerError::Spawn("LSP stdout unavailable".into()))?;

        let session = Arc::new(Self {
            workspace_dir: workspace_dir.to_path_buf(),
            server,
            bootstrap: RwLock::new(Bootstrap::default()),
            progress: Arc::new(ProgressTracker::new()),
            documents: DocumentRegistry::new(),
            lsp_logs: LspLogBuffer::new(),
            transport_dead: Notify::new(),
        });

        tokio::spawn({
            let session = session.clone();
            async move { session.read_loop(reader).await }
        });

        session.initialize().await?;
        Ok(session)
    }

    async fn initialize(&self) -> Result<(), BrokerError> {
        info!("Initializing LSP session...");

        let root_uri = Url::from_file_path(&self.workspace_dir)
            .map_err(|_| {
                BrokerError::Handshake(format!(
                    "workspace is not an absolute path: {}",
                    self.workspace_dir.display()
                ))
            })?
            .to_string();

        let params = json!({
            // Do not tie the LSP's lifetime to a parent-process watch.
            "processId": null,
            "rootUri": root_uri,
            "workspaceFolders": [{
                "uri": root_uri,
                "name": "workspace",
            }],
            "capabilities": {
                "textDocument": {
                    "hover": {
                        "contentFormat": ["markdown", "plaintext"],
                    },
                    "definition": {
                        "linkSupport": true,
                    },
                    "references": {},
                    "callHierarchy": {},
                    "documentSymbol": {},
                    "diagnostic": {},
                },
                "workspace": {
                    "workspaceFolders": true,
                },
                "window": {
                    "workDoneProgress": true,
                },
            },
        });

        let result = self
            .server
            .request("initialize", params, INITIALIZE_TIMEOUT)
            .await
            .map_err(|e| BrokerError::Handshake(e.to_string()))?;

        {
            let mut bootstrap = self.bootstrap.write().await;
            bootstrap.capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
            bootstrap.initialized = true;
        }
        info!("LSP session initialized");

        if let Err(e) = self.server.notify("initialized", json!({})).await {
            warn!("failed to send initialized notification: {}", e);
        }

        Ok(())
    }

    /// The single reader of the LSP stdout stream. Malformed messages are
    /// dropped and the loop continues; transport errors fail every pending
    /// request and end the session.
    async fn read_loop(self: Arc<Self>, mut reader: BufReader<BoxedReader>) {
        loop {
            match crate::protocol::read_message(&mut reader).await {
                Ok(msg) => self.route_message(msg).await,
                Err(BrokerError::Protocol(e)) => {
                    warn!("dropping malformed LSP message: {}", e);
                }
                Err(e) => {
                    warn!("LSP read loop terminated: {}", e);
                    self.server.registry().fail_all();
                    self.transport_dead.notify_one();
                    break;
                }
            }
        }
    }

    async fn route_message(&self, msg: Value) {
        debug!(target: "lsp_protocol", "<<< {}", msg);

        let id = msg.get("id").and_then(RequestId::from_value);
        let method = msg.get("method").and_then(|m| m.as_str());

        match (id, method) {
            // Response: has an id, no method.
            (Some(id), None) => match id.as_i64() {
                Some(num) => self.deliver_response(num, &msg),
                None => warn!("response with unusable id {:?}", id.to_value()),
            },

            // Server-originated request: both id and method.
            (Some(id), Some(method)) => {
                self.handle_server_request(&id, method, msg.get("params"))
                    .await
            }

            // Notification: method only.
            (None, Some(method)) => self.handle_notification(method, msg.get("params")),

            (None, None) => debug!("ignoring message with neither id nor method"),
        }
    }

    fn deliver_response(&self, id: i64, msg: &Value) {
        let error = match msg.get("error") {
            None | Some(Value::Null) => None,
            Some(err) => Some(serde_json::from_value(err.clone()).unwrap_or(ResponseError {
                code: INTERNAL_ERROR,
                message: err.to_string(),
            })),
        };

        let response = LspResponse {
            result: msg.get("result").cloned().unwrap_or(Value::Null),
            error,
        };

        if !self.server.registry().complete(id, response) {
            debug!("discarding response for unknown or expired request {}", id);
        }
    }

    async fn handle_server_request(&self, id: &RequestId, method: &str, params: Option<&Value>) {
        let result = match method {
            // Accept progress tokens; some servers block until the ack.
            "window/workDoneProgress/create" => Value::Null,

            // Empty per-item configuration lets the server use its defaults.
            "workspace/configuration" => {
                let count = params
                    .and_then(|p| p.get("items"))
                    .and_then(|i| i.as_array())
                    .map(|items| items.len())
                    .unwrap_or(1);
                Value::Array(vec![json!({}); count])
            }

            other => {
                debug!("leaving server request {} unanswered", other);
                return;
            }
        };

        if let Err(e) = self.server.respond(id.to_value(), result).await {
            warn!("failed to answer server request {}: {}", method, e);
        }
    }

    fn handle_notification(&self, method: &str, params: Option<&Value>) {
        match method {
            "$/progress" => {
                if let Some(params) = params {
                    self.progress.handle_progress(params);
                }
            }

            "window/logMessage" => {
                if let Some(params) = params {
                    let message_type = params.get("type").and_then(|t| t.as_i64()).unwrap_or(0);
                    let message = params
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or_default();
                    info!(target: "lsp_log", "[type={}] {}", message_type, message);
                    self.lsp_logs.push(message_type, message);
                }
            }

            // Diagnostics are pulled by clients, never pushed by the broker.
            "textDocument/publishDiagnostics" => {}

            other => debug!("unhandled notification: {}", other),
        }
    }

    pub fn server(&self) -> &LspServer {
        &self.server
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    pub async fn did_open(&self, params: Value) -> Result<(), BrokerError> {
        self.documents.open(&self.server, params).await
    }

    pub async fn did_close(&self, params: Value) -> Result<(), BrokerError> {
        self.documents.close(&self.server, params).await
    }

    pub async fn open_document_count(&self) -> usize {
        self.documents.count().await
    }

    pub async fn status(&self) -> Value {
        let initialized = self.bootstrap.read().await.initialized;
        json!({
            "initialized": initialized,
            "openDocuments": self.documents.count().await,
            "pid": self.server.pid(),
            "indexing": self.progress.snapshot(),
        })
    }

    pub async fn capabilities(&self) -> Value {
        self.bootstrap.read().await.capabilities.clone()
    }

    pub fn recent_logs(&self, params: &Value) -> Value {
        let count = params
            .get("count")
            .and_then(|c| c.as_u64())
            .unwrap_or(100) as usize;
        json!(self.lsp_logs.last(count))
    }

    /// Spawn the deferred file watcher plus the task forwarding its batches
    /// as `workspace/didChangeWatchedFiles` notifications.
    pub fn start_file_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<Vec<FileChange>>(16);

        let session = self.clone();
        tokio::spawn(async move {
            while let Some(changes) = rx.recv().await {
                let count = changes.len();
                let params = json!({ "changes": changes });
                match session
                    .server
                    .notify("workspace/didChangeWatchedFiles", params)
                    .await
                {
                    Ok(()) => info!("sent didChangeWatchedFiles with {} changes", count),
                    Err(e) => warn!("failed to send didChangeWatchedFiles: {}", e),
                }
            }
        });

        let watcher = FileWatcher::new(self.workspace_dir.clone(), self.progress.clone(), tx);
        tokio::spawn(watcher.run_after_indexing())
    }

    /// Resolves when the LSP stdio transport dies. A dead LSP is a failure
    /// surface, not something to recover from: the daemon exits on it.
    pub async fn transport_closed(&self) {
        self.transport_dead.notified().await;
    }

    pub async fn shutdown(&self) {
        self.server.shutdown().await;
    }
}
