//! Machine power actions run after the last queue finishes.
//!
//! The action is announced, optionally confirmed on the terminal, and then
//! counted down; Ctrl-C during the countdown aborts it. `KillSelf` only asks
//! the CLI to exit once the current task has wound down.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::manager::PowerController;
use crate::model::AfterCompletionAction;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status_success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<CommandResult>;
}

#[derive(Debug, Default, Clone)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<CommandResult> {
        let output = Command::new(program)
            .current_dir(cwd)
            .args(args)
            .output()
            .with_context(|| format!("failed to run command '{}' in {}", program, cwd.display()))?;

        Ok(CommandResult {
            status_success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// OS command carrying out `action`, if it needs one.
pub fn power_command(action: AfterCompletionAction) -> Option<(&'static str, Vec<String>)> {
    let (program, args): (&str, &[&str]) = match action {
        AfterCompletionAction::NoAction | AfterCompletionAction::KillSelf => return None,
        #[cfg(windows)]
        AfterCompletionAction::Sleep => ("rundll32.exe", &["powrprof.dll,SetSuspendState", "0,1,0"]),
        #[cfg(windows)]
        AfterCompletionAction::Hibernate => ("shutdown", &["/h"]),
        #[cfg(windows)]
        AfterCompletionAction::Shutdown => ("shutdown", &["/s", "/t", "0"]),
        #[cfg(windows)]
        AfterCompletionAction::ShutdownForce => ("shutdown", &["/s", "/f", "/t", "0"]),
        #[cfg(target_os = "macos")]
        AfterCompletionAction::Sleep | AfterCompletionAction::Hibernate => {
            ("pmset", &["sleepnow"])
        }
        #[cfg(target_os = "macos")]
        AfterCompletionAction::Shutdown | AfterCompletionAction::ShutdownForce => {
            ("shutdown", &["-h", "now"])
        }
        #[cfg(not(any(windows, target_os = "macos")))]
        AfterCompletionAction::Sleep => ("systemctl", &["suspend"]),
        #[cfg(not(any(windows, target_os = "macos")))]
        AfterCompletionAction::Hibernate => ("systemctl", &["hibernate"]),
        #[cfg(not(any(windows, target_os = "macos")))]
        AfterCompletionAction::Shutdown => ("systemctl", &["poweroff"]),
        #[cfg(not(any(windows, target_os = "macos")))]
        AfterCompletionAction::ShutdownForce => ("systemctl", &["poweroff", "--force"]),
    };
    Some((program, args.iter().map(|a| a.to_string()).collect()))
}

/// Runs power actions on this machine.
pub struct SystemPowerController<R: CommandRunner = ShellCommandRunner> {
    runner: R,
    countdown: Duration,
    confirm: bool,
    abort: CancelToken,
    exit_requested: Arc<AtomicBool>,
}

impl SystemPowerController<ShellCommandRunner> {
    pub fn new(countdown: Duration, confirm: bool) -> Self {
        Self::with_runner(ShellCommandRunner, countdown, confirm)
    }
}

impl<R: CommandRunner> SystemPowerController<R> {
    pub fn with_runner(runner: R, countdown: Duration, confirm: bool) -> Self {
        Self {
            runner,
            countdown,
            confirm,
            abort: CancelToken::new(),
            exit_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token that aborts a pending countdown when cancelled.
    pub fn abort_token(&self) -> CancelToken {
        self.abort.clone()
    }

    /// Set once a `KillSelf` action has been requested.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit_requested)
    }

    fn confirmed(&self, action: AfterCompletionAction) -> bool {
        if !self.confirm {
            return true;
        }
        match dialoguer::Confirm::new()
            .with_prompt(format!("All queues finished. Run '{action}' now?"))
            .default(true)
            .interact()
        {
            Ok(answer) => answer,
            Err(e) => {
                // No terminal to ask on; go ahead as configured.
                warn!(error = %e, "cannot confirm power action, proceeding");
                true
            }
        }
    }

    /// Count down, announcing the remaining time. Returns false if aborted.
    fn count_down(&self, action: AfterCompletionAction) -> bool {
        let mut remaining = self.countdown;
        let step = Duration::from_secs(10).min(self.countdown.max(Duration::from_millis(1)));
        while !remaining.is_zero() {
            info!(action = %action, seconds = remaining.as_secs(), "power action pending (Ctrl-C aborts)");
            let slice = step.min(remaining);
            if self.abort.sleep(slice, Duration::from_millis(100).min(slice)) {
                return false;
            }
            remaining -= slice;
        }
        !self.abort.is_cancelled()
    }
}

impl<R: CommandRunner> PowerController for SystemPowerController<R> {
    fn execute(&self, action: AfterCompletionAction) {
        match action {
            AfterCompletionAction::NoAction => return,
            AfterCompletionAction::KillSelf => {
                info!("exit requested after completion");
                self.exit_requested.store(true, Ordering::SeqCst);
                return;
            }
            _ => {}
        }

        if !self.confirmed(action) {
            info!(action = %action, "power action declined");
            return;
        }
        if !self.count_down(action) {
            info!(action = %action, "power action aborted");
            return;
        }
        let Some((program, args)) = power_command(action) else {
            return;
        };

        info!(action = %action, program, "running power action");
        match self.runner.run(program, &args, &std::env::temp_dir()) {
            Ok(result) if result.status_success => {}
            Ok(result) => warn!(
                action = %action,
                stderr = %result.stderr.trim(),
                "power command failed"
            ),
            Err(e) => warn!(action = %action, error = %e, "power command failed"),
        }
    }
}
