//! Workspace file watching with two backends: the native `notify` watcher
//! for filesystems that deliver events, and the polling scanner for those
//! that don't (Docker-on-Windows bind mounts being the canonical offender).
//! Auto mode tries native first and falls back.
//!
//! The watcher does not start until the first indexing cycle completes;
//! scanning the tree while the JVM indexes the same tree starves both.

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::BrokerError;
use crate::polling_watcher::{PollingWatcher, DEFAULT_POLL_INTERVAL, DEFAULT_WORKERS};
use crate::progress_tracker::ProgressTracker;

/// LSP FileChangeType values.
pub const CHANGE_CREATED: u32 = 1;
pub const CHANGE_CHANGED: u32 = 2;
pub const CHANGE_DELETED: u32 = 3;

/// Source-file suffixes the watcher cares about, matched case-insensitively.
pub const WATCHED_EXTENSIONS: &[&str] = &["bsl", "os"];

/// Directory names skipped entirely, in addition to any leading-dot name.
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", "vendor"];

/// Quiet window before a batch of native events is flushed.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// How often the deferred-start task checks whether indexing finished.
const INDEXING_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One entry of a `workspace/didChangeWatchedFiles` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub uri: String,
    #[serde(rename = "type")]
    pub change_type: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherMode {
    Off,
    Polling,
    Native,
    Auto,
}

impl WatcherMode {
    pub fn parse(value: &str) -> WatcherMode {
        match value.to_lowercase().as_str() {
            "off" | "manual" | "disabled" => WatcherMode::Off,
            "polling" | "poll" => WatcherMode::Polling,
            "fsnotify" | "inotify" | "native" => WatcherMode::Native,
            "auto" | "" => WatcherMode::Auto,
            other => {
                warn!("unknown FILE_WATCHER_MODE '{}', using auto", other);
                WatcherMode::Auto
            }
        }
    }

    pub fn from_env() -> WatcherMode {
        Self::parse(&std::env::var("FILE_WATCHER_MODE").unwrap_or_default())
    }
}

impl fmt::Display for WatcherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatcherMode::Off => "off",
            WatcherMode::Polling => "polling",
            WatcherMode::Native => "fsnotify",
            WatcherMode::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Parse a duration like `500ms`, `30s`, `2m`, `1h`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, unit) = value.split_at(value.find(|c: char| !c.is_ascii_digit())?);
    let number: u64 = number.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(number)),
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 3600)),
        _ => None,
    }
}

pub fn poll_interval_from_env() -> Duration {
    match std::env::var("FILE_WATCHER_INTERVAL") {
        Ok(value) => parse_duration(&value).unwrap_or_else(|| {
            warn!("invalid FILE_WATCHER_INTERVAL '{}', using 30s", value);
            DEFAULT_POLL_INTERVAL
        }),
        Err(_) => DEFAULT_POLL_INTERVAL,
    }
}

pub fn worker_count_from_env() -> usize {
    match std::env::var("FILE_WATCHER_WORKERS") {
        Ok(value) => match value.parse::<usize>() {
            Ok(workers) if workers >= 1 => workers,
            _ => {
                warn!("invalid FILE_WATCHER_WORKERS '{}', using 8", value);
                DEFAULT_WORKERS
            }
        },
        Err(_) => DEFAULT_WORKERS,
    }
}

pub fn is_watched_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            WATCHED_EXTENSIONS.iter().any(|watched| *watched == ext)
        })
        .unwrap_or(false)
}

pub fn is_excluded_dir(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name)
}

pub fn path_to_uri(path: &Path) -> String {
    Url::from_file_path(path)
        .map(String::from)
        .unwrap_or_else(|_| format!("file://{}", path.display()))
}

pub struct FileWatcher {
    workspace: PathBuf,
    mode: WatcherMode,
    progress: Arc<ProgressTracker>,
    notify_tx: mpsc::Sender<Vec<FileChange>>,
}

impl FileWatcher {
    pub fn new(
        workspace: PathBuf,
        progress: Arc<ProgressTracker>,
        notify_tx: mpsc::Sender<Vec<FileChange>>,
    ) -> Self {
        Self::with_mode(workspace, WatcherMode::from_env(), progress, notify_tx)
    }

    pub fn with_mode(
        workspace: PathBuf,
        mode: WatcherMode,
        progress: Arc<ProgressTracker>,
        notify_tx: mpsc::Sender<Vec<FileChange>>,
    ) -> Self {
        Self {
            workspace,
            mode,
            progress,
            notify_tx,
        }
    }

    /// Wait for the initial indexing cycle to finish, then run the selected
    /// backend until shutdown.
    pub async fn run_after_indexing(self) {
        loop {
            tokio::time::sleep(INDEXING_POLL_INTERVAL).await;
            if !self.progress.is_active() {
                break;
            }
            debug!("file watcher: waiting for indexing to complete");
        }

        info!("indexing complete, starting file watcher (mode: {})", self.mode);
        self.run().await;
    }

    pub async fn run(self) {
        match self.mode {
            WatcherMode::Off => {
                info!("file watcher disabled; send workspace/didChangeWatchedFiles manually");
            }

            WatcherMode::Polling => self.run_polling().await,

            WatcherMode::Native => match self.start_native() {
                Ok((watcher, rx)) => {
                    self.debounce_loop(rx).await;
                    drop(watcher);
                }
                Err(e) => warn!("native file watcher failed: {}; watcher disabled", e),
            },

            WatcherMode::Auto => match self.start_native() {
                Ok((watcher, rx)) => {
                    self.debounce_loop(rx).await;
                    drop(watcher);
                }
                Err(e) => {
                    warn!("native file watcher unavailable ({}), falling back to polling", e);
                    self.run_polling().await;
                }
            },
        }
    }

    async fn run_polling(&self) {
        let watcher = PollingWatcher::new(
            self.workspace.clone(),
            poll_interval_from_env(),
            worker_count_from_env(),
            self.progress.clone(),
            self.notify_tx.clone(),
        );
        watcher.run().await;
    }

    fn start_native(
        &self,
    ) -> Result<(RecommendedWatcher, mpsc::Receiver<notify::Event>), BrokerError> {
        let (raw_tx, raw_rx) = mpsc::channel(256);

        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                match result {
                    // The callback runs on the watcher's own thread, so a
                    // blocking send into the async side is safe.
                    Ok(event) => {
                        let _ = raw_tx.blocking_send(event);
                    }
                    Err(e) => warn!("file watcher error: {}", e),
                }
            })
            .map_err(|e| BrokerError::Watcher(e.to_string()))?;

        watcher
            .watch(&self.workspace, RecursiveMode::Recursive)
            .map_err(|e| BrokerError::Watcher(e.to_string()))?;

        info!("native file watcher started for {}", self.workspace.display());
        Ok((watcher, raw_rx))
    }

    /// Accumulate native events per URI and flush the batch once no event has
    /// arrived for [`DEBOUNCE_WINDOW`]. While indexing is active the batch is
    /// retained, not dropped, so nothing is lost across a re-index.
    async fn debounce_loop(&self, mut rx: mpsc::Receiver<notify::Event>) {
        let mut pending: HashMap<String, u32> = HashMap::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let flush_at = deadline;
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.collect_event(&event, &mut pending) {
                                deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
                            }
                        }
                        None => break,
                    }
                }

                _ = async {
                    match flush_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if self.progress.is_active() {
                        deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
                        continue;
                    }

                    deadline = None;
                    if !pending.is_empty() {
                        let changes: Vec<FileChange> = pending
                            .drain()
                            .map(|(uri, change_type)| FileChange { uri, change_type })
                            .collect();
                        info!("file watcher detected {} changes", changes.len());
                        if self.notify_tx.send(changes).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Fold one native event into the pending batch. Returns true when the
    /// batch changed (and the debounce timer should restart).
    fn collect_event(&self, event: &notify::Event, pending: &mut HashMap<String, u32>) -> bool {
        let mut updated = false;

        for path in &event.paths {
            let relative = path.strip_prefix(&self.workspace).unwrap_or(path);
            let excluded = relative.components().any(|component| {
                matches!(
                    component,
                    Component::Normal(name)
                        if name.to_str().map(is_excluded_dir).unwrap_or(false)
                )
            });
            if excluded || !is_watched_file(path) {
                continue;
            }

            let uri = path_to_uri(path);
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    pending.insert(uri, CHANGE_CREATED);
                    updated = true;
                }
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                    pending.insert(uri, CHANGE_DELETED);
                    updated = true;
                }
                EventKind::Modify(_) => {
                    // A write to a freshly created file is still a creation.
                    if pending.get(&uri) != Some(&CHANGE_CREATED) {
                        pending.insert(uri, CHANGE_CHANGED);
                    }
                    updated = true;
                }
                _ => {}
            }
        }

        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    #[test]
    fn mode_parsing_covers_aliases() {
        assert_eq!(WatcherMode::parse("off"), WatcherMode::Off);
        assert_eq!(WatcherMode::parse("manual"), WatcherMode::Off);
        assert_eq!(WatcherMode::parse("DISABLED"), WatcherMode::Off);
        assert_eq!(WatcherMode::parse("polling"), WatcherMode::Polling);
        assert_eq!(WatcherMode::parse("poll"), WatcherMode::Polling);
        assert_eq!(WatcherMode::parse("fsnotify"), WatcherMode::Native);
        assert_eq!(WatcherMode::parse("inotify"), WatcherMode::Native);
        assert_eq!(WatcherMode::parse("native"), WatcherMode::Native);
        assert_eq!(WatcherMode::parse("auto"), WatcherMode::Auto);
        assert_eq!(WatcherMode::parse(""), WatcherMode::Auto);
        assert_eq!(WatcherMode::parse("bogus"), WatcherMode::Auto);
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("30"), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn watched_file_matching_is_case_insensitive() {
        assert!(is_watched_file(Path::new("/ws/module.bsl")));
        assert!(is_watched_file(Path::new("/ws/Module.BSL")));
        assert!(is_watched_file(Path::new("/ws/script.os")));
        assert!(!is_watched_file(Path::new("/ws/readme.md")));
        assert!(!is_watched_file(Path::new("/ws/noext")));
    }

    #[test]
    fn dot_and_denylisted_dirs_are_excluded() {
        assert!(is_excluded_dir(".git"));
        assert!(is_excluded_dir(".vscode"));
        assert!(is_excluded_dir("node_modules"));
        assert!(is_excluded_dir("vendor"));
        assert!(!is_excluded_dir("src"));
    }

    fn watcher_for_tests() -> FileWatcher {
        let (tx, _rx) = mpsc::channel(1);
        FileWatcher::with_mode(
            PathBuf::from("/ws"),
            WatcherMode::Native,
            Arc::new(ProgressTracker::new()),
            tx,
        )
    }

    fn event(kind: EventKind, path: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn native_events_map_to_change_types() {
        let watcher = watcher_for_tests();
        let mut pending = HashMap::new();

        assert!(watcher.collect_event(
            &event(EventKind::Create(CreateKind::File), "/ws/a.bsl"),
            &mut pending
        ));
        assert!(watcher.collect_event(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/ws/b.bsl"
            ),
            &mut pending
        ));
        assert!(watcher.collect_event(
            &event(EventKind::Remove(RemoveKind::File), "/ws/c.bsl"),
            &mut pending
        ));

        assert_eq!(pending.get("file:///ws/a.bsl"), Some(&CHANGE_CREATED));
        assert_eq!(pending.get("file:///ws/b.bsl"), Some(&CHANGE_CHANGED));
        assert_eq!(pending.get("file:///ws/c.bsl"), Some(&CHANGE_DELETED));
    }

    #[test]
    fn write_after_create_stays_created() {
        let watcher = watcher_for_tests();
        let mut pending = HashMap::new();

        watcher.collect_event(
            &event(EventKind::Create(CreateKind::File), "/ws/a.bsl"),
            &mut pending,
        );
        watcher.collect_event(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/ws/a.bsl",
            ),
            &mut pending,
        );

        assert_eq!(pending.get("file:///ws/a.bsl"), Some(&CHANGE_CREATED));
    }

    #[test]
    fn events_in_excluded_or_unwatched_paths_are_ignored() {
        let watcher = watcher_for_tests();
        let mut pending = HashMap::new();

        assert!(!watcher.collect_event(
            &event(
                EventKind::Create(CreateKind::File),
                "/ws/node_modules/dep.bsl"
            ),
            &mut pending
        ));
        assert!(!watcher.collect_event(
            &event(EventKind::Create(CreateKind::File), "/ws/.git/a.bsl"),
            &mut pending
        ));
        assert!(!watcher.collect_event(
            &event(EventKind::Create(CreateKind::File), "/ws/readme.md"),
            &mut pending
        ));
        assert!(pending.is_empty());
    }
}
