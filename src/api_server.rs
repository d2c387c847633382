//! Line-delimited JSON-RPC server for broker clients.
//!
//! One request per line, one response per line. Requests on a single
//! connection run sequentially; connections run concurrently against the
//! shared session.

use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::protocol::{JSONRPC_VERSION, PARSE_ERROR};
use crate::router;
use crate::session_manager::SessionManager;

#[derive(Debug, Deserialize)]
struct ApiRequest {
    #[serde(default)]
    id: i64,
    method: String,
    #[serde(default)]
    params: Value,
}

pub struct ApiServer {
    listener: TcpListener,
}

impl ApiServer {
    pub async fn bind(port: u16) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, session: Arc<SessionManager>) {
        match self.local_addr() {
            Ok(addr) => info!("API listening on {}", addr),
            Err(_) => info!("API listening"),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let session = session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, addr, session).await {
                            debug!("client {} connection error: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    session: Arc<SessionManager>,
) -> std::io::Result<()> {
    info!("API client connected: {}", addr);

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: ApiRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                debug!("parse error from {}: {}", addr, e);
                write_response(&mut write_half, &error_response(0, PARSE_ERROR, "Parse error"))
                    .await?;
                continue;
            }
        };

        debug!("handling {} (id={}) from {}", request.method, request.id, addr);

        let response = match router::dispatch(&session, &request.method, request.params).await {
            Ok(result) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": request.id,
                "result": result,
            }),
            Err(e) => {
                warn!("error handling {}: {}", request.method, e);
                let (code, message) = e.api_error();
                error_response(request.id, code, &message)
            }
        };

        write_response(&mut write_half, &response).await?;
    }

    info!("API client disconnected: {}", addr);
    Ok(())
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Value) -> std::io::Result<()> {
    let mut buf = serde_json::to_vec(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    buf.push(b'\n');
    writer.write_all(&buf).await
}

fn error_response(id: i64, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message,
        },
    })
}
