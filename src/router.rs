//! Mapping of API methods onto session operations and forwarded LSP calls,
//! with the per-method timeout policy.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::BrokerError;
use crate::session_manager::SessionManager;

/// LSP methods forwarded to the server verbatim. Anything else (other than
/// the local and notification methods below) is rejected.
pub const FORWARDED_METHODS: &[&str] = &[
    "textDocument/hover",
    "textDocument/definition",
    "textDocument/references",
    "textDocument/documentSymbol",
    "textDocument/diagnostic",
    "textDocument/implementation",
    "textDocument/codeAction",
    "textDocument/formatting",
    "textDocument/rename",
    "textDocument/prepareRename",
    "textDocument/prepareCallHierarchy",
    "callHierarchy/incomingCalls",
    "callHierarchy/outgoingCalls",
    "workspace/symbol",
    "workspace/diagnostic",
];

/// Deadline per method. Workspace-wide diagnostics walk the whole index;
/// rename and formatting are also far slower than point queries.
pub fn method_timeout(method: &str) -> Duration {
    match method {
        "workspace/diagnostic" => Duration::from_secs(600),
        "textDocument/diagnostic" | "textDocument/formatting" => Duration::from_secs(300),
        "textDocument/rename" | "textDocument/prepareRename" => Duration::from_secs(120),
        _ => Duration::from_secs(90),
    }
}

pub async fn dispatch(
    session: &SessionManager,
    method: &str,
    params: Value,
) -> Result<Value, BrokerError> {
    match method {
        "session/status" => Ok(session.status().await),

        "session/capabilities" => Ok(session.capabilities().await),

        "session/logs" => Ok(session.recent_logs(&params)),

        "textDocument/didOpen" => session.did_open(params).await.map(|_| Value::Null),

        "textDocument/didClose" => session.did_close(params).await.map(|_| Value::Null),

        // A notification on the LSP side, but our API is request/response:
        // forward it and acknowledge.
        "workspace/didChangeWatchedFiles" => {
            session.server().notify(method, params).await?;
            Ok(json!({"ok": true}))
        }

        method if FORWARDED_METHODS.contains(&method) => {
            let start = Instant::now();
            let result = session
                .server()
                .request(method, params, method_timeout(method))
                .await;
            debug!(
                "method {} finished in {:?} (ok={})",
                method,
                start.elapsed(),
                result.is_ok()
            );
            result
        }

        other => Err(BrokerError::UnknownMethod(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_policy_by_method() {
        assert_eq!(
            method_timeout("workspace/diagnostic"),
            Duration::from_secs(600)
        );
        assert_eq!(
            method_timeout("textDocument/diagnostic"),
            Duration::from_secs(300)
        );
        assert_eq!(
            method_timeout("textDocument/formatting"),
            Duration::from_secs(300)
        );
        assert_eq!(
            method_timeout("textDocument/rename"),
            Duration::from_secs(120)
        );
        assert_eq!(
            method_timeout("textDocument/prepareRename"),
            Duration::from_secs(120)
        );
        assert_eq!(method_timeout("textDocument/hover"), Duration::from_secs(90));
        assert_eq!(method_timeout("session/status"), Duration::from_secs(90));
    }

    #[test]
    fn whitelist_contains_the_point_queries() {
        for method in [
            "textDocument/hover",
            "textDocument/definition",
            "workspace/symbol",
            "callHierarchy/incomingCalls",
        ] {
            assert!(FORWARDED_METHODS.contains(&method));
        }
        assert!(!FORWARDED_METHODS.contains(&"shutdown"));
        assert!(!FORWARDED_METHODS.contains(&"textDocument/didOpen"));
    }
}
