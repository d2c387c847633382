//! In-memory ring buffer for `window/logMessage` notifications from the LSP
//! server, served back to clients through the `session/logs` API method.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Maximum number of server log entries kept in memory.
const MAX_LOG_ENTRIES: usize = 1000;

/// One `window/logMessage` entry. `message_type` carries the LSP MessageType
/// value (1=Error, 2=Warning, 3=Info, 4=Log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LspLogEntry {
    #[serde(rename = "type")]
    pub message_type: i64,
    pub message: String,
    pub received_at: String,
}

/// Thread-safe circular buffer of server log messages.
#[derive(Debug, Clone)]
pub struct LspLogBuffer {
    entries: Arc<Mutex<VecDeque<LspLogEntry>>>,
}

impl LspLogBuffer {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push(&self, message_type: i64, message: &str) {
        let entry = LspLogEntry {
            message_type,
            message: message.to_string(),
            received_at: chrono::Utc::now()
                .format("%Y-%m-%d %H:%M:%S%.3f UTC")
                .to_string(),
        };

        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > MAX_LOG_ENTRIES {
                entries.pop_front();
            }
        }
    }

    /// The most recent `count` entries, oldest first.
    pub fn last(&self, count: usize) -> Vec<LspLogEntry> {
        if let Ok(entries) = self.entries.lock() {
            let take_count = count.min(entries.len());
            entries
                .iter()
                .rev()
                .take(take_count)
                .rev()
                .cloned()
                .collect()
        } else {
            Vec::new()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LspLogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
