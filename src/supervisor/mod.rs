//! Agent process supervision.
//!
//! One launch of the Agent, start to finish: write its config, spawn it,
//! tail its log once per tick, classify, and on any terminal state kill the
//! process tree, wait for it, and let the machine settle before the next
//! launch. The Agent gives no exit code worth reading; the log is the only
//! signal.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::agent_config::RunConfigWriter;
use crate::cancel::CancelToken;
use crate::error::RunError;
use crate::log_window::LogWindow;
use crate::markers::{self, LogVerdict};
use crate::model::{AccountDescriptor, Phase};
use crate::progress::ProgressReporter;
use crate::stagnation::StagnationTimeout;

/// Lines of the log window carried in snapshots and outcomes.
pub const EXCERPT_LINES: usize = 100;

/// Longest a sleep goes without looking at the cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// A running Agent instance.
pub trait AgentProcess: Send {
    fn pid(&self) -> u32;
    /// Non-blocking exit check.
    fn has_exited(&mut self) -> io::Result<bool>;
    /// Force-terminate the process and everything it started.
    fn kill_tree(&mut self) -> io::Result<()>;
    /// Block until the process is gone.
    fn wait(&mut self) -> io::Result<()>;
}

/// Starts Agent processes.
pub trait AgentLauncher: Send + Sync {
    fn spawn(&self, exe: &Path) -> io::Result<Box<dyn AgentProcess>>;
}

/// Launches the real executable with no arguments, in its own directory and
/// (on Unix) its own process group.
pub struct SystemLauncher;

impl AgentLauncher for SystemLauncher {
    fn spawn(&self, exe: &Path) -> io::Result<Box<dyn AgentProcess>> {
        let mut cmd = Command::new(exe);
        if let Some(dir) = exe.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        Ok(Box::new(SystemProcess { child }))
    }
}

struct SystemProcess {
    child: Child,
}

impl AgentProcess for SystemProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    #[cfg(unix)]
    fn kill_tree(&mut self) -> io::Result<()> {
        // Spawned with process_group(0): the pid is the pgid.
        let pgid = self.child.id() as libc::pid_t;
        // SAFETY: kill(2) takes plain integers and touches no memory.
        let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Group already gone.
            return Ok(());
        }
        Err(err)
    }

    #[cfg(windows)]
    fn kill_tree(&mut self) -> io::Result<()> {
        let status = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &self.child.id().to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() && !self.has_exited()? {
            return Err(io::Error::other(format!("taskkill exited with {status}")));
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn kill_tree(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<()> {
        self.child.wait().map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Agent executable.
    pub exe: PathBuf,
    /// Agent JSON config, rewritten before every launch.
    pub config_path: PathBuf,
    /// Agent log file.
    pub log_path: PathBuf,
    /// Poll period.
    pub tick: Duration,
    /// Pause after a launch ends, before anything else starts.
    pub settle_delay: Duration,
}

impl SupervisorConfig {
    /// Ring capacity covering `window` at one slot per tick.
    pub fn stagnation_ticks(&self, window: Duration) -> usize {
        let tick = self.tick.as_millis().max(1);
        (window.as_millis() / tick).max(1) as usize
    }
}

/// How a launch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    Succeeded,
    Failed(RunError),
    TimedOut { minutes: u32 },
    Cancelled,
}

impl TerminalReason {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalReason::Succeeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TerminalReason::Cancelled)
    }

    /// The error this reason stands for, if it is not a success.
    pub fn error(&self) -> Option<RunError> {
        match self {
            TerminalReason::Succeeded => None,
            TerminalReason::Failed(e) => Some(e.clone()),
            TerminalReason::TimedOut { minutes } => Some(RunError::Stagnation { minutes: *minutes }),
            TerminalReason::Cancelled => Some(RunError::Cancelled),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub reason: TerminalReason,
    /// Last lines of the run's log window.
    pub excerpt: String,
    /// The Agent reported this week's annihilation cap.
    pub weekly_cap_reached: bool,
}

impl LaunchOutcome {
    fn unlaunched(error: RunError) -> Self {
        Self {
            reason: TerminalReason::Failed(error),
            excerpt: String::new(),
            weekly_cap_reached: false,
        }
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn AgentLauncher>,
    writer: RunConfigWriter,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn AgentLauncher>) -> Self {
        let writer = RunConfigWriter::new(&config.config_path);
        Self {
            config,
            launcher,
            writer,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run one launch of the Agent for `account` in `phase`.
    ///
    /// `stall_window` is how long the log may stay unchanged before the run
    /// is declared stuck. Never returns an error: anything that goes wrong
    /// ends up in the outcome's reason.
    pub fn run(
        &self,
        account: &AccountDescriptor,
        phase: Phase,
        stall_window: Duration,
        cancel: &CancelToken,
        reporter: &ProgressReporter,
    ) -> LaunchOutcome {
        if cancel.is_cancelled() {
            return LaunchOutcome {
                reason: TerminalReason::Cancelled,
                excerpt: String::new(),
                weekly_cap_reached: false,
            };
        }

        let title = format!("{}: {}", phase.title(), account.label());

        if let Err(e) = self.writer.write(account, phase) {
            warn!(uid = %account.uid, phase = %phase, error = %e, "config write failed");
            return LaunchOutcome::unlaunched(e);
        }

        let mut process = match self.launcher.spawn(&self.config.exe) {
            Ok(p) => p,
            Err(e) => {
                let err = RunError::ProcessLaunch(format!("{}: {e}", self.config.exe.display()));
                warn!(uid = %account.uid, phase = %phase, error = %err, "launch failed");
                return LaunchOutcome::unlaunched(err);
            }
        };
        let run_start = chrono::Local::now().naive_local();
        info!(
            uid = %account.uid,
            phase = %phase,
            pid = process.pid(),
            "agent launched"
        );

        let minutes = (stall_window.as_secs() / 60) as u32;
        let mut window = LogWindow::new(&self.config.log_path, run_start);
        let mut stagnation = StagnationTimeout::with_capacity(
            minutes,
            self.config.stagnation_ticks(stall_window),
        );

        let reason = loop {
            let exited = process.has_exited().unwrap_or_else(|e| {
                debug!(error = %e, "exit check failed");
                false
            });
            if let Err(e) = window.poll() {
                // Transient; the next tick retries.
                debug!(error = %e, "log poll failed");
            }
            stagnation.record(window.last_line());
            reporter.publish(&title, &window.excerpt(EXCERPT_LINES));

            if cancel.is_cancelled() {
                break TerminalReason::Cancelled;
            }
            match markers::classify(window.lines(), phase) {
                LogVerdict::Succeeded => break TerminalReason::Succeeded,
                LogVerdict::Failed { reason } => {
                    break TerminalReason::Failed(RunError::AgentFailure(reason.to_string()));
                }
                LogVerdict::Running => {}
            }
            if exited {
                break TerminalReason::Failed(RunError::AgentFailure(
                    "agent exited before completion".to_string(),
                ));
            }
            if stagnation.fired() {
                break TerminalReason::TimedOut {
                    minutes: stagnation.limit_minutes(),
                };
            }

            cancel.sleep(self.config.tick, self.config.tick.min(CANCEL_POLL));
        };

        info!(
            uid = %account.uid,
            phase = %phase,
            outcome = ?reason,
            lines = window.lines().len(),
            "agent run ended"
        );

        if let Err(e) = process.kill_tree() {
            warn!(pid = process.pid(), error = %e, "failed to kill agent process tree");
        }
        if let Err(e) = process.wait() {
            warn!(pid = process.pid(), error = %e, "failed to reap agent process");
        }

        if !reason.is_cancelled() && !self.config.settle_delay.is_zero() {
            debug!(delay = ?self.config.settle_delay, "settling");
            cancel.sleep(self.config.settle_delay, CANCEL_POLL);
        }

        LaunchOutcome {
            reason,
            excerpt: window.excerpt(EXCERPT_LINES),
            weekly_cap_reached: phase == Phase::Annihilation
                && markers::annihilation_capped(window.lines()),
        }
    }
}
