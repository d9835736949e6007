//! Run history: one JSON object per finished queue run.
//!
//! The CLI keeps `.automaa/history.jsonl`. Each line is a self-contained
//! record (run id, task name, full queue report) so the file can be grepped,
//! tailed, or post-processed without a parser for the whole thing.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::QueueReport;

/// Aggregated outcome of one task, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub run_id: Uuid,
    /// Task name the queue was registered under.
    pub task: String,
    #[serde(flatten)]
    pub report: QueueReport,
}

/// Where finished runs go.
pub trait HistorySink: Send + Sync {
    fn persist(&self, record: &HistoryRecord) -> Result<()>;
}

/// Append-only JSON lines history file.
pub struct HistoryLog {
    writer: Mutex<BufWriter<File>>,
}

impl HistoryLog {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create history directory: {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open history file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl HistorySink for HistoryLog {
    fn persist(&self, record: &HistoryRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("failed to serialize history record")?;
        debug!(run_id = %record.run_id, task = %record.task, "history record");

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write history record")?;
        writer.flush().context("failed to flush history")?;
        Ok(())
    }
}

/// Read every record from a history file. Malformed lines are skipped.
pub fn read_history(path: &Path) -> Result<Vec<HistoryRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open history: {}", path.display()));
        }
    };

    let mut records = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = number + 1, error = %e, "skipping malformed history line"),
        }
    }
    Ok(records)
}
