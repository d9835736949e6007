//! Progress reporting toward whatever front end is attached.
//!
//! The core never talks to a UI. A queue run owns a [`ProgressReporter`]
//! holding the per-entry board; the supervisor publishes a [`Snapshot`]
//! through it every tick and runners push account mutations and the final
//! report. Sinks decide what to do with them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::AccountUpdate;
use crate::queue::QueueReport;

/// Where one queue entry currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Waiting,
    Running,
    Done,
    Failed,
    Skipped,
}

impl EntryStatus {
    pub fn label(self) -> &'static str {
        match self {
            EntryStatus::Waiting => "waiting",
            EntryStatus::Running => "running",
            EntryStatus::Done => "done",
            EntryStatus::Failed => "failed",
            EntryStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Live view of one queue run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub queue: String,
    pub title: String,
    pub waiting: Vec<String>,
    pub running: Vec<String>,
    pub done: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub log_excerpt: String,
}

/// Observer for queue progress.
///
/// Called from runner threads, hence `Send + Sync`. All methods default to
/// no-ops so sinks only implement what they care about.
pub trait ProgressSink: Send + Sync {
    fn on_snapshot(&self, _snapshot: &Snapshot) {}
    fn on_account_update(&self, _update: &AccountUpdate) {}
    fn on_completion(&self, _report: &QueueReport) {}
}

/// Fan-out over several sinks, in registration order.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ProgressSink for SinkSet {
    fn on_snapshot(&self, snapshot: &Snapshot) {
        for sink in &self.sinks {
            sink.on_snapshot(snapshot);
        }
    }

    fn on_account_update(&self, update: &AccountUpdate) {
        for sink in &self.sinks {
            sink.on_account_update(update);
        }
    }

    fn on_completion(&self, report: &QueueReport) {
        for sink in &self.sinks {
            sink.on_completion(report);
        }
    }
}

/// Per-entry board for one queue, in queue order.
#[derive(Debug, Clone, Default)]
pub struct QueueBoard {
    queue: String,
    entries: Vec<(String, EntryStatus)>,
}

impl QueueBoard {
    /// All entries start out waiting.
    pub fn new(queue: &str, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            queue: queue.to_string(),
            entries: labels
                .into_iter()
                .map(|label| (label, EntryStatus::Waiting))
                .collect(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn set(&mut self, index: usize, status: EntryStatus) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.1 = status;
        }
    }

    pub fn status(&self, index: usize) -> Option<EntryStatus> {
        self.entries.get(index).map(|(_, status)| *status)
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.iter().filter(|(_, s)| *s == status).count()
    }

    fn labels(&self, status: EntryStatus) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, s)| *s == status)
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn snapshot(&self, title: &str, log_excerpt: &str) -> Snapshot {
        Snapshot {
            queue: self.queue.clone(),
            title: title.to_string(),
            waiting: self.labels(EntryStatus::Waiting),
            running: self.labels(EntryStatus::Running),
            done: self.labels(EntryStatus::Done),
            failed: self.labels(EntryStatus::Failed),
            skipped: self.labels(EntryStatus::Skipped),
            log_excerpt: log_excerpt.to_string(),
        }
    }
}

/// The board of one queue run plus the sink it reports to.
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    board: QueueBoard,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, board: QueueBoard) -> Self {
        Self { sink, board }
    }

    /// Reporter for a nested queue, sharing this one's sink.
    pub fn child(&self, board: QueueBoard) -> Self {
        Self::new(Arc::clone(&self.sink), board)
    }

    pub fn set_status(&mut self, index: usize, status: EntryStatus) {
        self.board.set(index, status);
    }

    pub fn publish(&self, title: &str, log_excerpt: &str) {
        self.sink.on_snapshot(&self.board.snapshot(title, log_excerpt));
    }

    pub fn account_updated(&self, update: &AccountUpdate) {
        self.sink.on_account_update(update);
    }
}

/// Mirrors progress into the tracing output.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_snapshot(&self, snapshot: &Snapshot) {
        debug!(
            queue = %snapshot.queue,
            title = %snapshot.title,
            waiting = snapshot.waiting.len(),
            done = snapshot.done.len(),
            failed = snapshot.failed.len(),
            "progress"
        );
    }

    fn on_account_update(&self, update: &AccountUpdate) {
        info!(
            uid = %update.uid,
            remaining_quota = update.remaining_quota,
            attempts_today = update.attempts_today,
            "account updated"
        );
    }

    fn on_completion(&self, report: &QueueReport) {
        info!(
            queue = %report.queue,
            cancelled = report.cancelled,
            "queue finished\n{}",
            report.summary
        );
    }
}

/// Appends human-readable progress lines to a per-run log file.
///
/// Snapshots arrive every tick; only title changes are written.
pub struct LogFileSink {
    log_path: PathBuf,
    last_title: Mutex<String>,
}

impl LogFileSink {
    pub fn new(log_path: &Path) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir: {}", parent.display()))?;
        }
        Ok(Self {
            log_path: log_path.to_path_buf(),
            last_title: Mutex::new(String::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    fn append(&self, line: &str) {
        use std::io::Write;
        if let Ok(mut f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(f, "[{stamp}] [automaa] {line}");
        }
    }
}

impl ProgressSink for LogFileSink {
    fn on_snapshot(&self, snapshot: &Snapshot) {
        let mut last = self.last_title.lock().unwrap_or_else(|e| e.into_inner());
        if *last == snapshot.title {
            return;
        }
        last.clone_from(&snapshot.title);
        drop(last);
        self.append(&format!(
            "{} | {} (waiting {}, done {}, failed {})",
            snapshot.queue,
            snapshot.title,
            snapshot.waiting.len(),
            snapshot.done.len(),
            snapshot.failed.len()
        ));
    }

    fn on_account_update(&self, update: &AccountUpdate) {
        let date = update
            .last_run_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        self.append(&format!(
            "account {} quota={} attempts_today={} last_run={date}",
            update.uid, update.remaining_quota, update.attempts_today
        ));
    }

    fn on_completion(&self, report: &QueueReport) {
        let outcome = if report.cancelled {
            "cancelled"
        } else {
            "finished"
        };
        self.append(&format!("queue {} {outcome}", report.queue));
        for line in report.summary.lines() {
            self.append(line);
        }
    }
}
