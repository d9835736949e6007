//! Sequential run over one queue's entries.
//!
//! Entries are resolved against the roster snapshot, then run strictly in
//! order. An entry whose identifier is already in the running set belongs to
//! another queue right now and is skipped, never waited for. Nested queues
//! run inline with their own board.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::account::{AccountOutcome, AccountRunner, RunSettings};
use crate::cancel::CancelToken;
use crate::model::{AccountDescriptor, AccountUpdate, QueueDescriptor, QueueEntry, Roster};
use crate::progress::{EntryStatus, ProgressReporter, ProgressSink, QueueBoard};
use crate::running_set::RunningSet;
use crate::supervisor::ProcessSupervisor;

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// History line for one queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub label: String,
    pub status: EntryStatus,
    pub timestamp: NaiveDateTime,
    pub summary: String,
    /// Agent log excerpts of the entry's launches.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log: String,
    /// The account wants a notification about this result.
    #[serde(default)]
    pub notify: bool,
}

/// Everything a finished queue run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    pub queue: String,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub cancelled: bool,
    /// Accounts (nested queues flattened) plus entries that never ran.
    pub history: Vec<HistoryEntry>,
    pub updates: Vec<AccountUpdate>,
    pub summary: String,
}

impl QueueReport {
    pub fn count(&self, status: EntryStatus) -> usize {
        self.history.iter().filter(|e| e.status == status).count()
    }

    /// True when every entry finished successfully.
    pub fn all_done(&self) -> bool {
        self.history.iter().all(|e| e.status == EntryStatus::Done)
    }
}

fn labels(history: &[HistoryEntry], pred: impl Fn(EntryStatus) -> bool) -> Vec<&str> {
    history
        .iter()
        .filter(|e| pred(e.status))
        .map(|e| e.label.as_str())
        .collect()
}

/// Human-readable recap of a queue run.
pub fn render_summary(
    queue: &str,
    started_at: NaiveDateTime,
    finished_at: NaiveDateTime,
    history: &[HistoryEntry],
) -> String {
    let done = labels(history, |s| s == EntryStatus::Done);
    let failed = labels(history, |s| s == EntryStatus::Failed);
    let not_started = labels(history, |s| {
        matches!(s, EntryStatus::Waiting | EntryStatus::Skipped)
    });

    let mut out = String::new();
    let _ = writeln!(out, "Queue: {queue}");
    let _ = writeln!(out, "Started: {}", started_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Finished: {}", finished_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(
        out,
        "Completed: {}, not completed: {}",
        done.len(),
        history.len() - done.len()
    );
    if !failed.is_empty() {
        let _ = writeln!(out, "Failed: {}", failed.join(", "));
    }
    if !not_started.is_empty() {
        let _ = writeln!(out, "Not started: {}", not_started.join(", "));
    }
    out
}

enum Resolved<'r> {
    Account(&'r AccountDescriptor),
    Queue(&'r QueueDescriptor),
}

impl Resolved<'_> {
    fn id(&self) -> &str {
        match self {
            Resolved::Account(a) => &a.uid,
            Resolved::Queue(q) => &q.name,
        }
    }

    fn label(&self) -> &str {
        match self {
            Resolved::Account(a) => a.label(),
            Resolved::Queue(q) => &q.name,
        }
    }
}

/// Accumulates results across a queue and its nested queues.
#[derive(Default)]
struct RunLog {
    history: Vec<HistoryEntry>,
    updates: Vec<AccountUpdate>,
}

impl RunLog {
    fn push_unrun(&mut self, entry: &Resolved<'_>, status: EntryStatus, summary: &str) {
        self.history.push(HistoryEntry {
            id: entry.id().to_string(),
            label: entry.label().to_string(),
            status,
            timestamp: now(),
            summary: summary.to_string(),
            log: String::new(),
            notify: false,
        });
    }

    fn push_account(
        &mut self,
        account: &AccountDescriptor,
        outcome: AccountOutcome,
    ) -> EntryStatus {
        let status = if outcome.succeeded {
            EntryStatus::Done
        } else {
            EntryStatus::Failed
        };
        let summary = if outcome.cancelled {
            "cancelled".to_string()
        } else if outcome.succeeded {
            format!("completed after {} attempt(s)", outcome.state.attempts)
        } else {
            let reason = outcome
                .state
                .last_reason
                .as_ref()
                .and_then(|r| r.error())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "not run".to_string());
            format!(
                "not completed after {} attempt(s): {reason}",
                outcome.state.attempts
            )
        };
        self.history.push(HistoryEntry {
            id: account.uid.clone(),
            label: account.label().to_string(),
            status,
            timestamp: now(),
            summary,
            log: outcome.state.log_excerpt,
            notify: outcome.notify,
        });
        if outcome.update != account.to_update() {
            self.updates.push(outcome.update);
        }
        status
    }
}

pub struct QueueRunner<'a> {
    roster: &'a Roster,
    running: &'a RunningSet,
    supervisor: &'a ProcessSupervisor,
    settings: &'a RunSettings,
    cancel: &'a CancelToken,
}

impl<'a> QueueRunner<'a> {
    pub fn new(
        roster: &'a Roster,
        running: &'a RunningSet,
        supervisor: &'a ProcessSupervisor,
        settings: &'a RunSettings,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            roster,
            running,
            supervisor,
            settings,
            cancel,
        }
    }

    /// Run `queue` to the end or until cancelled.
    ///
    /// The queue's own name is expected to be held in the running set by the
    /// caller; nested entries are claimed here.
    pub fn run(&self, queue: &QueueDescriptor, sink: Arc<dyn ProgressSink>) -> QueueReport {
        let started_at = now();
        info!(queue = %queue.name, "queue started");

        let entries = self.resolve(queue);
        let mut reporter = ProgressReporter::new(sink, board_for(queue, &entries));
        let mut log = RunLog::default();
        let mut stack = vec![queue.name.clone()];
        self.run_entries(&entries, &mut reporter, &mut stack, &mut log);

        let finished_at = now();
        let summary = render_summary(&queue.name, started_at, finished_at, &log.history);
        reporter.publish(&format!("{} finished", queue.name), "");
        info!(
            queue = %queue.name,
            cancelled = self.cancel.is_cancelled(),
            "queue finished"
        );

        QueueReport {
            queue: queue.name.clone(),
            started_at,
            finished_at,
            cancelled: self.cancel.is_cancelled(),
            history: log.history,
            updates: log.updates,
            summary,
        }
    }

    /// Entries that can run, in order. Disabled, exhausted and unknown
    /// references are dropped.
    fn resolve(&self, queue: &QueueDescriptor) -> Vec<Resolved<'a>> {
        let roster = self.roster;
        queue
            .entries
            .iter()
            .filter_map(|entry| match entry {
                QueueEntry::Account(uid) => match roster.account(uid) {
                    Some(account) if account.is_runnable() => Some(Resolved::Account(account)),
                    Some(_) => {
                        debug!(queue = %queue.name, uid = %uid, "account not runnable, dropped");
                        None
                    }
                    None => {
                        warn!(queue = %queue.name, uid = %uid, "unknown account in queue");
                        None
                    }
                },
                QueueEntry::Queue(name) => match roster.queue(name) {
                    Some(nested) => Some(Resolved::Queue(nested)),
                    None => {
                        warn!(queue = %queue.name, nested = %name, "unknown queue in queue");
                        None
                    }
                },
            })
            .collect()
    }

    /// Returns true when every entry finished successfully.
    fn run_entries(
        &self,
        entries: &[Resolved<'a>],
        reporter: &mut ProgressReporter,
        stack: &mut Vec<String>,
        log: &mut RunLog,
    ) -> bool {
        let mut all_done = true;

        for (index, entry) in entries.iter().enumerate() {
            if self.cancel.is_cancelled() {
                for rest in &entries[index..] {
                    log.push_unrun(rest, EntryStatus::Waiting, "cancelled before start");
                }
                return false;
            }

            let id = entry.id();
            if let Resolved::Queue(q) = entry
                && stack.contains(&q.name)
            {
                warn!(queue = %q.name, "queue nests itself, skipped");
                reporter.set_status(index, EntryStatus::Skipped);
                log.push_unrun(entry, EntryStatus::Skipped, "recursive queue reference");
                all_done = false;
                continue;
            }

            let Some(_guard) = self.running.claim(id) else {
                info!(id = %id, "already running elsewhere, skipped");
                reporter.set_status(index, EntryStatus::Skipped);
                log.push_unrun(entry, EntryStatus::Skipped, "already running");
                all_done = false;
                continue;
            };

            reporter.set_status(index, EntryStatus::Running);
            reporter.publish(&format!("Starting {}", entry.label()), "");

            let status = match entry {
                Resolved::Account(account) => {
                    let outcome = AccountRunner::new(self.supervisor, self.settings).run(
                        account,
                        now(),
                        self.cancel,
                        reporter,
                    );
                    log.push_account(account, outcome)
                }
                Resolved::Queue(nested) => {
                    stack.push(nested.name.clone());
                    let nested_entries = self.resolve(nested);
                    let mut child = reporter.child(board_for(nested, &nested_entries));
                    let ok = self.run_entries(&nested_entries, &mut child, stack, log);
                    stack.pop();
                    if ok {
                        EntryStatus::Done
                    } else {
                        EntryStatus::Failed
                    }
                }
            };

            if status != EntryStatus::Done {
                all_done = false;
            }
            reporter.set_status(index, status);
            reporter.publish(&format!("{} {}", entry.label(), status), "");
        }

        all_done
    }
}

fn board_for(queue: &QueueDescriptor, entries: &[Resolved<'_>]) -> QueueBoard {
    QueueBoard::new(&queue.name, entries.iter().map(|e| e.label().to_string()))
}
