// LSP Session Daemon Library
// Exports public interfaces for embedding and for the integration tests

pub mod api_server;
pub mod document_registry;
pub mod error;
pub mod file_watcher;
pub mod logging;
pub mod lsp_server;
pub mod polling_watcher;
pub mod process_group;
pub mod progress_tracker;
pub mod protocol;
pub mod request_registry;
pub mod router;
pub mod session_manager;

// Re-export commonly used types
pub use api_server::ApiServer;
pub use error::BrokerError;
pub use file_watcher::{FileChange, FileWatcher, WatcherMode};
pub use logging::{LspLogBuffer, LspLogEntry};
pub use lsp_server::LspServer;
pub use polling_watcher::PollingWatcher;
pub use progress_tracker::{IndexingSnapshot, IndexingState, ProgressTracker};
pub use protocol::{RequestId, ResponseError};
pub use request_registry::{LspResponse, RequestRegistry};
pub use session_manager::SessionManager;
