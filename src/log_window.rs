//! Incremental view of the Agent's log for the current run.
//!
//! The Agent appends to one plain-text log across runs. Each entry starts
//! with `[YYYY-MM-DD HH:MM:SS`. Every line is judged by its own stamp: only
//! lines stamped strictly after the run start are kept, and lines without a
//! parseable stamp are dropped. The window only ever grows while the run
//! lasts.
//!
//! Bytes are buffered until a full line is available, so a multi-byte
//! character split across two polls is decoded whole.
//!
//! Reading is incremental (seek to the last offset, read new bytes), the same
//! polling approach used for any append-only log the supervisor tails.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::debug;

use crate::error::RunError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static TIMESTAMP_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})").unwrap());

/// Parse the leading `[YYYY-MM-DD HH:MM:SS` stamp of a log line.
pub fn parse_line_timestamp(line: &str) -> Option<NaiveDateTime> {
    let caps = TIMESTAMP_PREFIX.captures(line)?;
    NaiveDateTime::parse_from_str(caps.get(1)?.as_str(), TIMESTAMP_FORMAT).ok()
}

pub struct LogWindow {
    path: PathBuf,
    run_start: NaiveDateTime,
    position: u64,
    partial: Vec<u8>,
    lines: Vec<String>,
}

impl LogWindow {
    pub fn new(path: &Path, run_start: NaiveDateTime) -> Self {
        Self {
            path: path.to_path_buf(),
            run_start,
            position: 0,
            partial: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Read whatever was appended since the last poll.
    ///
    /// A missing file counts as empty. Returns the number of lines added to
    /// the window.
    pub fn poll(&mut self) -> Result<usize, RunError> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(RunError::LogRead(format!(
                    "{}: {e}",
                    self.path.display()
                )));
            }
        };

        let file_len = file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| RunError::LogRead(e.to_string()))?;
        if file_len < self.position {
            // Rotated or truncated underneath us: rescan the new file.
            debug!(path = %self.path.display(), "agent log shrank, rescanning");
            self.position = 0;
            self.partial.clear();
        }

        file.seek(SeekFrom::Start(self.position))
            .map_err(|e| RunError::LogRead(e.to_string()))?;
        let mut new_bytes = Vec::new();
        let n = file
            .read_to_end(&mut new_bytes)
            .map_err(|e| RunError::LogRead(e.to_string()))?;
        if n == 0 {
            return Ok(0);
        }
        self.position += n as u64;
        self.partial.extend_from_slice(&new_bytes);

        let mut added = 0;
        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=newline).collect();
            let decoded = String::from_utf8_lossy(&raw);
            let line = decoded.trim_end_matches(['\n', '\r']);
            if self.accept(line) {
                self.lines.push(line.to_string());
                added += 1;
            }
        }
        Ok(added)
    }

    fn accept(&self, line: &str) -> bool {
        parse_line_timestamp(line).is_some_and(|stamp| stamp > self.run_start)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Last line of the window, ignoring blank lines.
    pub fn last_line(&self) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .map(String::as_str)
            .find(|l| !l.trim().is_empty())
    }

    /// The trailing `max_lines` lines joined with newlines.
    pub fn excerpt(&self, max_lines: usize) -> String {
        let skip = self.lines.len().saturating_sub(max_lines);
        self.lines[skip..].join("\n")
    }
}
