//! Correlation of outstanding LSP requests with their waiting callers.
//!
//! The registry owns the request-id counter and a map of single-slot response
//! channels. Entries are removed on every exit path (delivery, timeout,
//! transport death) so the map never leaks. A response arriving after its
//! caller gave up is silently discarded; `oneshot` sends never block.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::ResponseError;

/// A raw response from the LSP server, before error unwrapping.
#[derive(Debug)]
pub struct LspResponse {
    pub result: Value,
    pub error: Option<ResponseError>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    pending: HashMap<i64, oneshot::Sender<LspResponse>>,
}

pub struct RequestRegistry {
    inner: Mutex<Inner>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
            }),
        }
    }

    /// Allocate the next request id and insert its response slot. Both happen
    /// under one lock acquisition so ids are never shared.
    pub fn register(&self) -> (i64, oneshot::Receiver<LspResponse>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.insert(id, tx);
        (id, rx)
    }

    /// Deliver a response to the waiting caller, removing the entry. Returns
    /// false when no caller is waiting (unknown id, or the caller timed out).
    pub fn complete(&self, id: i64, response: LspResponse) -> bool {
        let sender = self.inner.lock().unwrap().pending.remove(&id);
        match sender {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!("caller for request {} left before delivery", id);
                }
                true
            }
            None => false,
        }
    }

    /// Drop a pending entry without delivering anything. Used by callers whose
    /// deadline expired.
    pub fn remove(&self, id: i64) {
        self.inner.lock().unwrap().pending.remove(&id);
    }

    /// Fail every outstanding request by dropping its sender; the waiting
    /// callers observe a closed channel. Called when the read loop dies.
    pub fn fail_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.pending.len();
        inner.pending.clear();
        if count > 0 {
            debug!("failed {} in-flight requests on channel close", count);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
