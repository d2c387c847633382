//! Supervision of the LSP child process and ownership of its stdio transport.
//!
//! One write mutex serializes every framed message onto the child's stdin.
//! The child's stdout is handed to a single read loop (see
//! `session_manager`); responses come back through the request registry.
//! The supervisor never restarts the child: a dead LSP fails in-flight
//! requests and takes the daemon down with it.

use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::BrokerError;
use crate::process_group;
use crate::protocol::{self, JSONRPC_VERSION};
use crate::request_registry::RequestRegistry;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

pub struct LspServer {
    stdin: Mutex<BoxedWriter>,
    stdout: StdMutex<Option<BufReader<BoxedReader>>>,
    registry: RequestRegistry,
    child: StdMutex<Option<Child>>,
    pid: Option<u32>,
}

impl LspServer {
    /// Spawn the configured LSP command with piped stdin/stdout. Stderr is
    /// inherited so server-side stack traces land on the daemon's own stream.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, BrokerError> {
        info!("Spawning LSP server: {} {:?}", command, args);

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        process_group::assign_new_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| BrokerError::Spawn(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Spawn("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Spawn("failed to capture stdout".into()))?;

        let pid = child.id();
        info!("LSP server started with pid {:?}", pid);

        Ok(Self {
            stdin: Mutex::new(Box::new(stdin)),
            stdout: StdMutex::new(Some(BufReader::new(Box::new(stdout) as BoxedReader))),
            registry: RequestRegistry::new(),
            child: StdMutex::new(Some(child)),
            pid,
        })
    }

    /// Build a server over an arbitrary transport instead of a child process.
    /// Used by tests to wire the broker to an in-process mock over a duplex
    /// pipe.
    pub fn from_transport<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            stdin: Mutex::new(Box::new(writer)),
            stdout: StdMutex::new(Some(BufReader::new(Box::new(reader) as BoxedReader))),
            registry: RequestRegistry::new(),
            child: StdMutex::new(None),
            pid: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    /// Hand the stdout reader to the read loop. Yields `None` on the second
    /// call; there is exactly one reader.
    pub fn take_stdout(&self) -> Option<BufReader<BoxedReader>> {
        self.stdout.lock().unwrap().take()
    }

    async fn write(&self, msg: &Value) -> Result<(), BrokerError> {
        debug!(target: "lsp_protocol", ">>> {}", msg);
        let mut stdin = self.stdin.lock().await;
        protocol::write_message(&mut *stdin, msg).await
    }

    /// Send a request and wait for its response or the deadline, whichever
    /// comes first. The pending entry is cleared on every exit path.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, BrokerError> {
        let (id, rx) = self.registry.register();

        let msg = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        });

        if let Err(e) = self.write(&msg).await {
            self.registry.remove(id);
            return Err(e);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(err) => Err(BrokerError::Lsp {
                    code: err.code,
                    message: err.message,
                }),
                None => Ok(response.result),
            },
            Ok(Err(_)) => Err(BrokerError::ChannelClosed),
            Err(_) => {
                self.registry.remove(id);
                Err(BrokerError::Timeout(deadline))
            }
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), BrokerError> {
        let msg = json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
        });
        self.write(&msg).await
    }

    /// Answer a server-originated request, echoing the id in its original
    /// wire shape.
    pub async fn respond(&self, id: Value, result: Value) -> Result<(), BrokerError> {
        let msg = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "result": result,
        });
        self.write(&msg).await
    }

    /// Best-effort `exit`, then terminate the whole process group.
    pub async fn shutdown(&self) {
        if let Err(e) = self.notify("exit", Value::Null).await {
            debug!("exit notification failed: {}", e);
        }

        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                process_group::terminate_group(pid).await;
            }
            let _ = child.start_kill();
        }
    }
}
