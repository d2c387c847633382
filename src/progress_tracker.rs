//! Indexing state machine driven by `$/progress` notifications.
//!
//! A single indexing cycle may span several progress phases (the server ends
//! one token and begins another). Counters survive across phases; they reset
//! only when a `begin` arrives after more than [`CYCLE_GAP`] of silence,
//! which marks a genuinely new cycle. `first_started_at` anchors the elapsed
//! time of the whole cycle.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Silence gap after which a `begin` starts a new indexing cycle instead of
/// continuing the previous one.
pub const CYCLE_GAP: Duration = Duration::from_secs(30);

static COUNTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)/(\d+)").unwrap());

/// Extract the first `current/total` pair with a positive total from a
/// progress message like `"123/456 files"`.
fn parse_progress_counts(message: &str) -> Option<(u64, u64)> {
    for caps in COUNTS_RE.captures_iter(message) {
        let current: u64 = caps[1].parse().ok()?;
        let total: u64 = caps[2].parse().ok()?;
        if total > 0 {
            return Some((current, total));
        }
    }
    None
}

#[derive(Debug, Default)]
struct ProgressState {
    active: bool,
    title: String,
    message: String,
    current: u64,
    total: u64,
    percentage: u64,
    /// Files per second, exponentially smoothed.
    speed: f64,
    started_at: Option<Instant>,
    first_started_at: Option<Instant>,
    last_update: Option<Instant>,
}

/// Derived indexing state exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingState {
    Idle,
    Indexing,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingSnapshot {
    pub state: IndexingState,
    pub current: u64,
    pub total: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
}

pub struct ProgressTracker {
    state: RwLock<ProgressState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ProgressState::default()),
        }
    }

    /// Feed one `$/progress` notification's params.
    pub fn handle_progress(&self, params: &Value) {
        let Some(value) = params.get("value") else {
            return;
        };
        let Some(kind) = value.get("kind").and_then(|k| k.as_str()) else {
            return;
        };

        let title = value.get("title").and_then(|t| t.as_str());
        let message = value.get("message").and_then(|m| m.as_str());
        let percentage = value
            .get("percentage")
            .and_then(|p| p.as_u64().or_else(|| p.as_f64().map(|f| f as u64)));

        if !kind.is_empty() {
            debug!(
                "progress [{}]: {} {} ({}%)",
                kind,
                title.unwrap_or(""),
                message.unwrap_or(""),
                percentage.unwrap_or(0)
            );
        }

        self.apply(kind, title, message, percentage, Instant::now());
    }

    fn apply(
        &self,
        kind: &str,
        title: Option<&str>,
        message: Option<&str>,
        percentage: Option<u64>,
        now: Instant,
    ) {
        let mut s = self.state.write().unwrap();

        match kind {
            "begin" => {
                s.active = true;
                if let Some(title) = title {
                    s.title = title.to_string();
                }
                s.message = message.unwrap_or_default().to_string();
                if let Some(pct) = percentage {
                    s.percentage = pct;
                }
                s.started_at = Some(now);

                let new_cycle = s.first_started_at.is_none()
                    || s.last_update
                        .map_or(true, |last| now.duration_since(last) > CYCLE_GAP);
                if new_cycle {
                    s.first_started_at = Some(now);
                    s.current = 0;
                    s.total = 0;
                    s.speed = 0.0;
                }
                s.last_update = Some(now);
            }

            "report" => {
                if let Some(message) = message {
                    s.message = message.to_string();

                    if let Some((current, total)) = parse_progress_counts(message) {
                        // Fold the instantaneous rate into a rolling average so
                        // the ETA doesn't jitter with every report.
                        if s.current > 0 && current > s.current {
                            if let Some(last) = s.last_update {
                                let elapsed = now.duration_since(last).as_secs_f64();
                                if elapsed > 0.0 {
                                    let instant_speed = (current - s.current) as f64 / elapsed;
                                    s.speed = if s.speed > 0.0 {
                                        s.speed * 0.7 + instant_speed * 0.3
                                    } else {
                                        instant_speed
                                    };
                                }
                            }
                        }
                        s.current = current;
                        s.total = total;
                    }
                }
                if let Some(pct) = percentage {
                    s.percentage = pct;
                }
                s.last_update = Some(now);
            }

            "end" => {
                s.active = false;
                if let Some(message) = message {
                    s.message = message.to_string();
                    if !message.is_empty() {
                        s.title = message.to_string();
                    }
                }
                s.percentage = 100;
                if s.total > 0 {
                    s.current = s.total;
                }
                s.last_update = Some(now);
                // first_started_at survives so elapsed time stays reportable.
            }

            _ => {}
        }
    }

    /// Raw activity flag, used by the file watcher to defer scans and
    /// suppress notifications.
    pub fn is_active(&self) -> bool {
        self.state.read().unwrap().active
    }

    pub fn snapshot(&self) -> IndexingSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> IndexingSnapshot {
        let s = self.state.read().unwrap();

        let indexing = s.active || (s.total > 0 && s.current < s.total);
        let complete = s.total > 0 && s.current >= s.total;

        let state = if indexing {
            IndexingState::Indexing
        } else if complete {
            IndexingState::Complete
        } else {
            IndexingState::Idle
        };

        let eta_seconds = if indexing && s.speed > 0.0 && s.total > s.current {
            Some(((s.total - s.current) as f64 / s.speed) as u64)
        } else {
            None
        };

        let anchor = s.first_started_at.or(s.started_at);
        let elapsed_seconds = anchor.and_then(|started| {
            if indexing {
                Some(now.duration_since(started).as_secs())
            } else if complete {
                s.last_update
                    .map(|last| last.duration_since(started).as_secs())
            } else {
                None
            }
        });

        IndexingSnapshot {
            state,
            current: s.current,
            total: s.total,
            message: s.message.clone(),
            eta_seconds,
            elapsed_seconds,
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
