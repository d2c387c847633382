//! The TCP API surface: line-delimited JSON-RPC framing, error shapes, and
//! connection survival across bad input.

mod mock_lsp;

use lsp_session_daemon::api_server::ApiServer;
use lsp_session_daemon::session_manager::SessionManager;
use mock_lsp::{MockLsp, MockServerConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

async fn start_api(config: MockServerConfig) -> (SocketAddr, Arc<SessionManager>, MockLsp) {
    let (server, mock) = MockLsp::spawn(config);
    let session = SessionManager::start_with_server(server, Path::new("/projects"))
        .await
        .expect("session failed to start");

    let api = ApiServer::bind(0).await.expect("bind failed");
    let addr = api.local_addr().expect("no local addr");
    tokio::spawn(api.run(session.clone()));

    (addr, session, mock)
}

async fn round_trip(stream: &mut BufReader<TcpStream>, request: &Value) -> Value {
    let mut line = serde_json::to_string(request).unwrap();
    line.push('\n');
    stream.get_mut().write_all(line.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_line(&mut response).await.unwrap();
    serde_json::from_str(&response).unwrap()
}

#[tokio::test]
async fn status_round_trips_over_tcp() {
    let (addr, _session, _mock) = start_api(MockServerConfig::default()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);

    let response = round_trip(
        &mut stream,
        &json!({"jsonrpc": "2.0", "id": 7, "method": "session/status"}),
    )
    .await;

    assert_eq!(response["jsonrpc"], json!("2.0"));
    assert_eq!(response["id"], json!(7));
    assert_eq!(response["result"]["initialized"], json!(true));
    assert_eq!(response["result"]["indexing"]["state"], json!("idle"));
}

#[tokio::test]
async fn a_connection_survives_parse_errors() {
    let (addr, _session, _mock) = start_api(MockServerConfig::default()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);

    stream.get_mut().write_all(b"this is not json\n").await.unwrap();
    let mut line = String::new();
    stream.read_line(&mut line).await.unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["error"]["code"], json!(-32700));

    // The same connection keeps working.
    let response = round_trip(
        &mut stream,
        &json!({"jsonrpc": "2.0", "id": 1, "method": "session/capabilities"}),
    )
    .await;
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["result"], json!({"hoverProvider": true}));
}

#[tokio::test]
async fn unknown_methods_report_method_not_found() {
    let (addr, _session, _mock) = start_api(MockServerConfig::default()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);

    let response = round_trip(
        &mut stream,
        &json!({"jsonrpc": "2.0", "id": 3, "method": "session/nonsense"}),
    )
    .await;
    assert_eq!(response["id"], json!(3));
    assert_eq!(response["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn requests_from_separate_connections_interleave() {
    let mut config = MockServerConfig::default();
    config.method_patterns.insert(
        "textDocument/hover".to_string(),
        mock_lsp::MockResponsePattern::Echo { delay_ms: Some(50) },
    );
    let (addr, _session, _mock) = start_api(config).await;

    let mut handles = Vec::new();
    for i in 0..8i64 {
        handles.push(tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut stream = BufReader::new(stream);
            let response = round_trip(
                &mut stream,
                &json!({
                    "jsonrpc": "2.0",
                    "id": i,
                    "method": "textDocument/hover",
                    "params": {"marker": i},
                }),
            )
            .await;
            (i, response)
        }));
    }

    for handle in handles {
        let (i, response) = handle.await.unwrap();
        assert_eq!(response["id"], json!(i));
        assert_eq!(response["result"]["echo"]["marker"], json!(i));
    }
}
