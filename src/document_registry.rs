//! Tracking of documents opened on the LSP server.
//!
//! A second `didOpen` for a URI the server already has is turned into a
//! close-then-reopen so the server re-reads the supplied text. The set mutex
//! only guards the membership check and update; notifications go out after
//! it is released, so a stalled LSP stdin can never wedge the set.

use serde_json::{json, Value};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::BrokerError;
use crate::lsp_server::LspServer;

pub struct DocumentRegistry {
    open: Mutex<HashSet<String>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashSet::new()),
        }
    }

    fn uri_of(params: &Value) -> Result<String, BrokerError> {
        params
            .get("textDocument")
            .and_then(|t| t.get("uri"))
            .and_then(|u| u.as_str())
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Protocol("params missing textDocument.uri".into()))
    }

    /// Forward a `didOpen`, refreshing by close-then-reopen when the document
    /// is already open.
    pub async fn open(&self, server: &LspServer, params: Value) -> Result<(), BrokerError> {
        let uri = Self::uri_of(&params)?;

        let already_open = {
            let mut docs = self.open.lock().await;
            let already_open = docs.contains(&uri);
            docs.insert(uri.clone());
            already_open
        };

        if already_open {
            debug!("document {} already open, refreshing", uri);
            server
                .notify(
                    "textDocument/didClose",
                    json!({"textDocument": {"uri": uri}}),
                )
                .await?;
        }

        server.notify("textDocument/didOpen", params).await
    }

    /// Forward a `didClose` unconditionally and drop the URI from the set.
    pub async fn close(&self, server: &LspServer, params: Value) -> Result<(), BrokerError> {
        let uri = Self::uri_of(&params)?;

        {
            let mut docs = self.open.lock().await;
            docs.remove(&uri);
        }
        server.notify("textDocument/didClose", params).await
    }

    pub async fn count(&self) -> usize {
        self.open.lock().await.len()
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
