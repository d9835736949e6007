//! Multi-account supervision and scheduling for an external automation agent.
//!
//! The agent is a GUI program configured through a JSON file and observed
//! only through its log. This crate launches it once per account and phase,
//! decides from the log when a run has succeeded, failed or stalled, retries
//! within a budget, and runs named queues of accounts concurrently with the
//! guarantee that no account or queue ever runs twice at once.

pub mod account;
pub mod agent_config;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod log_window;
pub mod manager;
pub mod markers;
pub mod model;
pub mod power;
pub mod progress;
pub mod queue;
pub mod render;
pub mod running_set;
pub mod stagnation;
pub mod state;
pub mod supervisor;
pub mod timer;

#[cfg(test)]
mod test_support;
