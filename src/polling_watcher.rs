//! Polling file-watcher backend for filesystems without usable native
//! notifications (bind mounts into containers, network shares).
//!
//! Each tick rebuilds a path -> mtime snapshot with a small worker pool and
//! diffs it against the previous one. While the LSP is indexing the whole
//! tick is deferred - the snapshot must not advance, or a change made during
//! indexing would never be reported.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::file_watcher::{
    is_excluded_dir, is_watched_file, path_to_uri, FileChange, CHANGE_CHANGED, CHANGE_CREATED,
    CHANGE_DELETED,
};
use crate::progress_tracker::ProgressTracker;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKERS: usize = 8;

/// Bound on the directory queue; beyond it workers recurse in place instead
/// of queueing, which caps memory on very wide trees.
const DIR_QUEUE_CAPACITY: usize = 1000;

pub struct PollingWatcher {
    workspace: PathBuf,
    interval: Duration,
    workers: usize,
    progress: Arc<ProgressTracker>,
    notify_tx: mpsc::Sender<Vec<FileChange>>,
}

impl PollingWatcher {
    pub fn new(
        workspace: PathBuf,
        interval: Duration,
        workers: usize,
        progress: Arc<ProgressTracker>,
        notify_tx: mpsc::Sender<Vec<FileChange>>,
    ) -> Self {
        Self {
            workspace,
            interval,
            workers: workers.max(1),
            progress,
            notify_tx,
        }
    }

    /// Scan forever. The initial snapshot is the silent baseline; every later
    /// tick emits the diff against the previous snapshot.
    pub async fn run(&self) {
        info!(
            "polling watcher starting (interval: {:?}, workers: {})",
            self.interval, self.workers
        );

        let start = Instant::now();
        let mut snapshot = self.scan().await;
        info!(
            "polling watcher initial scan: {} files in {:?}",
            snapshot.len(),
            start.elapsed()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // the first tick completes immediately

        loop {
            ticker.tick().await;
            if !self.check(&mut snapshot).await {
                break;
            }
        }
    }

    /// One tick. Returns false when the notification channel is gone.
    async fn check(&self, snapshot: &mut HashMap<PathBuf, i64>) -> bool {
        if self.progress.is_active() {
            debug!("polling watcher: indexing active, deferring scan");
            return true;
        }

        let start = Instant::now();
        let new_snapshot = self.scan().await;
        let changes = diff_snapshots(snapshot, &new_snapshot);
        *snapshot = new_snapshot;

        if changes.is_empty() {
            return true;
        }

        info!(
            "polling watcher detected {} changes (scan took {:?})",
            changes.len(),
            start.elapsed()
        );
        self.notify_tx.send(changes).await.is_ok()
    }

    async fn scan(&self) -> HashMap<PathBuf, i64> {
        let root = self.workspace.clone();
        let workers = self.workers;
        tokio::task::spawn_blocking(move || scan_workspace(&root, workers))
            .await
            .unwrap_or_default()
    }
}

/// Compare two snapshots: new paths are Created, differing mtimes Changed,
/// vanished paths Deleted.
pub(crate) fn diff_snapshots(
    old: &HashMap<PathBuf, i64>,
    new: &HashMap<PathBuf, i64>,
) -> Vec<FileChange> {
    let mut changes = Vec::new();

    for (path, mtime) in new {
        match old.get(path) {
            None => changes.push(FileChange {
                uri: path_to_uri(path),
                change_type: CHANGE_CREATED,
            }),
            Some(old_mtime) if old_mtime != mtime => changes.push(FileChange {
                uri: path_to_uri(path),
                change_type: CHANGE_CHANGED,
            }),
            Some(_) => {}
        }
    }

    for path in old.keys() {
        if !new.contains_key(path) {
            changes.push(FileChange {
                uri: path_to_uri(path),
                change_type: CHANGE_DELETED,
            });
        }
    }

    changes
}

/// Parallel directory walk producing a path -> mtime (millisecond) map of
/// every watched source file under `root`.
pub(crate) fn scan_workspace(root: &Path, workers: usize) -> HashMap<PathBuf, i64> {
    let queue = Mutex::new(VecDeque::from([root.to_path_buf()]));
    let active = AtomicUsize::new(0);
    let result = Mutex::new(HashMap::new());

    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| loop {
                // Claiming a directory and bumping the active count happen
                // under the queue lock, so "empty queue, zero active" is a
                // reliable termination signal.
                let dir = {
                    let mut queue = queue.lock().unwrap();
                    match queue.pop_front() {
                        Some(dir) => {
                            active.fetch_add(1, Ordering::SeqCst);
                            Some(dir)
                        }
                        None => None,
                    }
                };

                match dir {
                    Some(dir) => {
                        scan_dir(&dir, &queue, &result);
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                    None => {
                        {
                            let queue = queue.lock().unwrap();
                            if queue.is_empty() && active.load(Ordering::SeqCst) == 0 {
                                break;
                            }
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            });
        }
    });

    result.into_inner().unwrap()
}

fn scan_dir(
    dir: &Path,
    queue: &Mutex<VecDeque<PathBuf>>,
    result: &Mutex<HashMap<PathBuf, i64>>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(_) => continue,
        };

        if file_type.is_dir() {
            let name = entry.file_name();
            if is_excluded_dir(&name.to_string_lossy()) {
                continue;
            }

            let queued = {
                let mut queue = queue.lock().unwrap();
                if queue.len() < DIR_QUEUE_CAPACITY {
                    queue.push_back(path.clone());
                    true
                } else {
                    false
                }
            };
            if !queued {
                // Queue full: recurse in place rather than grow unbounded.
                scan_dir(&path, queue, result);
            }
        } else if is_watched_file(&path) {
            if let Ok(metadata) = entry.metadata() {
                if let Ok(modified) = metadata.modified() {
                    let mtime = modified
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as i64)
                        .unwrap_or(0);
                    result.lock().unwrap().insert(path, mtime);
                }
            }
        }
    }
}
