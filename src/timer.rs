//! Cron-driven queue starts.
//!
//! Each queue may list cron expressions (seconds first, as the `cron` crate
//! expects: `"0 30 5 * * *"` is 05:30:00 daily). The timer remembers the last
//! instant it was asked about and reports every queue with a fire time in
//! `(last, now]`.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use cron::Schedule;
use tracing::debug;

use crate::model::QueueDescriptor;

pub struct Timer {
    entries: Vec<(String, Schedule)>,
    last: DateTime<Local>,
}

impl Timer {
    /// Parse every schedule of `queues`, counting from `start`.
    pub fn new<'q>(
        queues: impl IntoIterator<Item = &'q QueueDescriptor>,
        start: DateTime<Local>,
    ) -> Result<Self> {
        let mut entries = Vec::new();
        for queue in queues {
            for expr in &queue.schedule {
                let schedule = Schedule::from_str(expr).with_context(|| {
                    format!("invalid schedule '{expr}' for queue '{}'", queue.name)
                })?;
                entries.push((queue.name.clone(), schedule));
            }
        }
        Ok(Self {
            entries,
            last: start,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues due since the previous call, in configuration order, each once.
    pub fn due(&mut self, now: DateTime<Local>) -> Vec<String> {
        let mut due: Vec<String> = Vec::new();
        if now <= self.last {
            return due;
        }
        for (queue, schedule) in &self.entries {
            let fires = schedule
                .after(&self.last)
                .next()
                .is_some_and(|at| at <= now);
            if fires && !due.contains(queue) {
                debug!(queue = %queue, "schedule fired");
                due.push(queue.clone());
            }
        }
        self.last = now;
        due
    }

    /// Earliest upcoming start across all queues.
    pub fn next_fire(&self) -> Option<(&str, DateTime<Local>)> {
        self.entries
            .iter()
            .filter_map(|(queue, schedule)| {
                schedule
                    .after(&self.last)
                    .next()
                    .map(|at| (queue.as_str(), at))
            })
            .min_by_key(|(_, at)| *at)
    }
}
