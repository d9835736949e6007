//! Fakes shared by the runner tests.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeDelta;

use crate::agent_config::ANNIHILATION_STAGE;
use crate::markers;
use crate::model::{AccountUpdate, Phase};
use crate::progress::{ProgressSink, Snapshot};
use crate::queue::QueueReport;
use crate::supervisor::{AgentLauncher, AgentProcess, SupervisorConfig};

/// What a fake Agent does once launched.
#[derive(Debug, Clone)]
pub enum Script {
    /// Logs progress, then the success marker; stays alive until killed.
    Succeed,
    /// Logs a failure marker.
    Fail,
    /// Never logs, never exits.
    Hang,
    /// Exits without logging anything.
    ExitEarly,
    /// Writes these lines verbatim, without a stamp, one per poll, then
    /// optionally exits.
    Lines { lines: Vec<String>, exit: bool },
}

impl Script {
    /// Lines to write, whether to exit once drained, whether to stamp them.
    fn into_parts(self) -> (Vec<String>, bool, bool) {
        match self {
            Script::Succeed => (
                vec!["开始任务: WakeUp".to_string(), markers::SUCCESS.to_string()],
                false,
                true,
            ),
            Script::Fail => (vec!["已停止".to_string()], false, true),
            Script::Hang => (Vec::new(), false, true),
            Script::ExitEarly => (Vec::new(), true, true),
            Script::Lines { lines, exit } => (lines, exit, false),
        }
    }
}

type Plan = dyn Fn(Phase, usize) -> Script + Send + Sync;

/// Launcher whose processes append scripted lines to the Agent log.
///
/// The phase of each launch is read back from the written Agent config and
/// handed to the plan together with the zero-based launch index.
pub struct FakeLauncher {
    log_path: PathBuf,
    plan: Box<Plan>,
    fail_spawn: bool,
    launches: AtomicUsize,
    kills: Arc<AtomicUsize>,
    phases: Mutex<Vec<Phase>>,
}

impl FakeLauncher {
    pub fn new(
        log_path: &Path,
        plan: impl Fn(Phase, usize) -> Script + Send + Sync + 'static,
    ) -> Self {
        Self {
            log_path: log_path.to_path_buf(),
            plan: Box::new(plan),
            fail_spawn: false,
            launches: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            phases: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(log_path: &Path) -> Self {
        let mut launcher = Self::new(log_path, |_, _| Script::Hang);
        launcher.fail_spawn = true;
        launcher
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.phases.lock().unwrap().clone()
    }

    fn launched_phase(&self) -> Phase {
        // Sits next to the log in `supervisor_config`.
        let path = self.log_path.with_file_name("gui.json");
        let stage = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .and_then(|v| {
                v["Configurations"]["Default"]["MainFunction.Stage1"]
                    .as_str()
                    .map(str::to_string)
            });
        match stage.as_deref() {
            Some(ANNIHILATION_STAGE) => Phase::Annihilation,
            _ => Phase::Routine,
        }
    }
}

impl AgentLauncher for FakeLauncher {
    fn spawn(&self, _exe: &Path) -> io::Result<Box<dyn AgentProcess>> {
        if self.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such agent"));
        }
        let index = self.launches.fetch_add(1, Ordering::SeqCst);
        let phase = self.launched_phase();
        self.phases.lock().unwrap().push(phase);
        let (lines, exit, stamped) = (self.plan)(phase, index).into_parts();

        // Each launch starts from a fresh log.
        std::fs::write(&self.log_path, "")?;
        Ok(Box::new(FakeProcess {
            pid: 4000 + index as u32,
            log_path: self.log_path.clone(),
            pending: lines.into_iter().rev().collect(),
            exit_when_drained: exit,
            stamped,
            killed: false,
            kills: Arc::clone(&self.kills),
        }))
    }
}

struct FakeProcess {
    pid: u32,
    log_path: PathBuf,
    pending: Vec<String>,
    exit_when_drained: bool,
    stamped: bool,
    killed: bool,
    kills: Arc<AtomicUsize>,
}

impl AgentProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        if self.killed {
            return Ok(true);
        }
        if let Some(line) = self.pending.pop() {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.log_path)?;
            if self.stamped {
                let stamp = chrono::Local::now().naive_local() + TimeDelta::seconds(2);
                writeln!(f, "[{}] {line}", stamp.format("%Y-%m-%d %H:%M:%S"))?;
            } else {
                writeln!(f, "{line}")?;
            }
            return Ok(false);
        }
        Ok(self.exit_when_drained)
    }

    fn kill_tree(&mut self) -> io::Result<()> {
        self.killed = true;
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `line` stamped far enough ahead to land inside any run window.
pub fn future_line(line: &str) -> String {
    format!("[2099-01-01 00:00:00] {line}")
}

/// Fast supervisor settings rooted in `dir`.
pub fn supervisor_config(dir: &Path) -> SupervisorConfig {
    SupervisorConfig {
        exe: dir.join("MAA.exe"),
        config_path: dir.join("gui.json"),
        log_path: dir.join("gui.log"),
        tick: Duration::from_millis(5),
        settle_delay: Duration::ZERO,
    }
}

/// Sink that keeps everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    snapshots: Mutex<Vec<Snapshot>>,
    updates: Mutex<Vec<AccountUpdate>>,
    reports: Mutex<Vec<QueueReport>>,
}

impl RecordingSink {
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<AccountUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<QueueReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_snapshot(&self, snapshot: &Snapshot) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }

    fn on_account_update(&self, update: &AccountUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }

    fn on_completion(&self, report: &QueueReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}
