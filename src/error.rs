use thiserror::Error;

/// Why a single Agent launch did not succeed.
///
/// Everything except [`RunError::Cancelled`] ends the current phase attempt
/// and lets the retry loop move on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("failed to write agent config: {0}")]
    ConfigWrite(String),
    #[error("failed to launch agent: {0}")]
    ProcessLaunch(String),
    #[error("failed to read agent log: {0}")]
    LogRead(String),
    #[error("agent reported failure: {0}")]
    AgentFailure(String),
    #[error("agent log unchanged for {minutes} minute(s)")]
    Stagnation { minutes: u32 },
    #[error("cancelled by user")]
    Cancelled,
}

/// Why `TaskManager::add` refused a queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("task '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("'{0}' is already running")]
    AlreadyRunning(String),
    #[error("failed to start task '{name}': {detail}")]
    Spawn { name: String, detail: String },
}
