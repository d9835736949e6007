use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser;
use tracing::{info, warn};

use automaa_cli::cancel::CancelToken;
use automaa_cli::cli::{Cli, Command};
use automaa_cli::config::{self, ConfigSettings, ProjectConfig};
use automaa_cli::history::{HistoryLog, read_history};
use automaa_cli::manager::{ALL_TASKS, Collaborators, TaskManager};
use automaa_cli::power::SystemPowerController;
use automaa_cli::progress::{LogFileSink, SinkSet, TracingSink};
use automaa_cli::render::{render_config_human, render_config_json, render_history};
use automaa_cli::state::StateStore;
use automaa_cli::supervisor::{ProcessSupervisor, SystemLauncher};
use automaa_cli::timer::Timer;

const HISTORY_FILE: &str = "history.jsonl";
const STATE_FILE: &str = "state.json";
const PROGRESS_LOG: &str = "automaa.log";

/// Everything a `run` or `schedule` invocation drives.
struct App {
    config: ProjectConfig,
    manager: Arc<TaskManager>,
    state: Arc<StateStore>,
    interrupted: CancelToken,
    exit_requested: Arc<AtomicBool>,
}

impl App {
    fn build(config: ProjectConfig, config_path: Option<&Path>, root: &Path) -> Result<Self> {
        let data_dir = root.join(config::CONFIG_DIR);
        let state = Arc::new(StateStore::load(&data_dir.join(STATE_FILE))?);
        let history = Arc::new(HistoryLog::new(&data_dir.join(HISTORY_FILE))?);
        let progress_log = LogFileSink::new(&data_dir.join("logs").join(PROGRESS_LOG))?;

        let power = SystemPowerController::new(
            Duration::from_secs(config.power.countdown_secs),
            config.power.confirm,
        );
        let abort_power = power.abort_token();
        let exit_requested = power.exit_flag();

        let hooks = Collaborators {
            progress: Arc::new(
                SinkSet::new()
                    .with(Arc::new(TracingSink))
                    .with(Arc::new(progress_log))
                    .with(state.clone()),
            ),
            history,
            settings: Arc::new(ConfigSettings::new(&config, config_path)),
            power: Arc::new(power),
        };
        let supervisor = ProcessSupervisor::new(
            config.supervisor_config(root),
            Arc::new(SystemLauncher),
        );
        let manager = Arc::new(TaskManager::new(supervisor, config.run_settings(), hooks));

        let interrupted = CancelToken::new();
        {
            let manager = Arc::clone(&manager);
            let interrupted = interrupted.clone();
            ctrlc::set_handler(move || {
                warn!("interrupted, stopping all queues");
                interrupted.cancel();
                abort_power.cancel();
                manager.stop(ALL_TASKS);
            })
            .context("failed to install Ctrl-C handler")?;
        }

        Ok(Self {
            config,
            manager,
            state,
            interrupted,
            exit_requested,
        })
    }

    /// Start queue `name` against the current account state.
    fn submit(&self, name: &str) -> bool {
        let Some(queue) = self.config.queue(name) else {
            warn!(queue = %name, "no such queue");
            return false;
        };
        let roster = Arc::new(self.config.roster(Some(&self.state)));
        match self.manager.add(name, queue.clone(), roster) {
            Ok(run_id) => {
                info!(queue = %name, run_id = %run_id, "queue submitted");
                true
            }
            Err(e) => {
                warn!(queue = %name, error = %e, "queue not started");
                false
            }
        }
    }

    fn run(&self, queues: &[String]) -> Result<()> {
        let unknown: Vec<&str> = queues
            .iter()
            .filter(|name| self.config.queue(name).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            bail!("unknown queue(s): {}", unknown.join(", "));
        }

        let started = queues.iter().filter(|name| self.submit(name)).count();
        if started == 0 {
            bail!("no queue could be started");
        }
        self.manager.join(ALL_TASKS);
        if self.interrupted.is_cancelled() {
            info!("stopped by user");
        }
        Ok(())
    }

    fn schedule(&self) -> Result<()> {
        let mut timer = Timer::new(&self.config.queues, Local::now())?;
        if timer.is_empty() {
            bail!("no queue has a schedule; add `schedule = [...]` to a [[queues]] entry");
        }
        info!("scheduler started, Ctrl-C to stop");

        let mut announced = None;
        loop {
            if self.exit_requested.load(Ordering::SeqCst) {
                info!("exit requested by after-completion action");
                break;
            }
            if let Some((queue, at)) = timer.next_fire()
                && announced != Some(at)
            {
                info!(queue = %queue, at = %at.format("%Y-%m-%d %H:%M:%S"), "next scheduled start");
                announced = Some(at);
            }
            if self
                .interrupted
                .sleep(Duration::from_secs(1), Duration::from_millis(100))
            {
                break;
            }
            for name in timer.due(Local::now()) {
                self.submit(&name);
            }
        }

        self.manager.join(ALL_TASKS);
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet = matches!(&cli.command, Command::Config { .. } | Command::History { .. });

    let level = match cli.verbose {
        0 if quiet => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("automaa={level},automaa_cli={level}"))
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !quiet || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .automaa/config.toml found, using defaults"),
        }
    }

    let root: PathBuf = config_path
        .as_deref()
        .and_then(config::project_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());

    match cli.command {
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
        Command::History { limit } => {
            let records = read_history(&root.join(config::CONFIG_DIR).join(HISTORY_FILE))?;
            print!("{}", render_history(&records, limit));
        }
        Command::Run { queues } => {
            let app = App::build(config, config_path.as_deref(), &root)?;
            app.run(&queues)?;
        }
        Command::Schedule => {
            let app = App::build(config, config_path.as_deref(), &root)?;
            app.schedule()?;
        }
    }

    Ok(())
}
