use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::account::RunSettings;
use crate::manager::SettingsProvider;
use crate::model::{AccountDescriptor, AfterCompletionAction, QueueDescriptor, QueueEntry, Roster};
use crate::state::StateStore;
use crate::supervisor::SupervisorConfig;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".automaa";

/// Where the Agent lives and how it is polled.
///
/// Relative paths are resolved against the project root (the directory
/// holding `.automaa/`).
#[derive(Debug, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_exe")]
    pub exe: PathBuf,
    #[serde(default = "default_agent_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_agent_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

#[derive(Debug, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_annihilation_timeout_minutes")]
    pub annihilation_timeout_minutes: u64,
    #[serde(default = "default_routine_timeout_minutes")]
    pub routine_timeout_minutes: u64,
    #[serde(default = "default_rollover_hour")]
    pub server_day_rollover_hour: u32,
    /// Skip Annihilation for the rest of an ISO week once the Agent reports
    /// the weekly cap.
    #[serde(default = "default_true")]
    pub annihilation_weekly_limit: bool,
}

/// After-completion power action behaviour.
#[derive(Debug, Deserialize)]
pub struct PowerConfig {
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u64,
    #[serde(default = "default_confirm")]
    pub confirm: bool,
}

fn default_agent_exe() -> PathBuf {
    PathBuf::from("MAA").join("MAA.exe")
}

fn default_agent_config_path() -> PathBuf {
    PathBuf::from("MAA").join("config").join("gui.json")
}

fn default_agent_log_path() -> PathBuf {
    PathBuf::from("MAA").join("debug").join("gui.log")
}

fn default_settle_secs() -> u64 {
    10
}

fn default_tick_millis() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_annihilation_timeout_minutes() -> u64 {
    40
}

fn default_routine_timeout_minutes() -> u64 {
    10
}

fn default_rollover_hour() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_countdown_secs() -> u64 {
    60
}

fn default_confirm() -> bool {
    true
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            exe: default_agent_exe(),
            config_path: default_agent_config_path(),
            log_path: default_agent_log_path(),
            settle_secs: default_settle_secs(),
            tick_millis: default_tick_millis(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            annihilation_timeout_minutes: default_annihilation_timeout_minutes(),
            routine_timeout_minutes: default_routine_timeout_minutes(),
            server_day_rollover_hour: default_rollover_hour(),
            annihilation_weekly_limit: default_true(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown_secs(),
            confirm: default_confirm(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub accounts: Vec<AccountDescriptor>,
    #[serde(default)]
    pub queues: Vec<QueueDescriptor>,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.automaa/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let config = Self::read(&path)?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    /// Parse and validate one config file.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: ProjectConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Duplicate uids or queue names, a zero tick, zero attempts and timeouts
    /// too large to express in seconds are rejected. Queue
    /// entries naming unknown accounts or queues only warn; the runner skips
    /// them.
    pub fn validate(&self) -> Result<()> {
        let mut uids = HashSet::new();
        for account in &self.accounts {
            if account.uid.trim().is_empty() {
                bail!("account with empty uid");
            }
            if !uids.insert(account.uid.as_str()) {
                bail!("duplicate account uid '{}'", account.uid);
            }
        }
        let mut names = HashSet::new();
        for queue in &self.queues {
            if !names.insert(queue.name.as_str()) {
                bail!("duplicate queue name '{}'", queue.name);
            }
        }
        if self.agent.tick_millis == 0 {
            bail!("agent.tick_millis must be greater than zero");
        }
        if self.run.server_day_rollover_hour > 23 {
            bail!("run.server_day_rollover_hour must be between 0 and 23");
        }
        if self.run.max_attempts == 0 {
            bail!("run.max_attempts must be at least 1");
        }
        for (key, minutes) in [
            ("annihilation_timeout_minutes", self.run.annihilation_timeout_minutes),
            ("routine_timeout_minutes", self.run.routine_timeout_minutes),
        ] {
            if minutes.checked_mul(60).is_none() {
                bail!("run.{key} is too large");
            }
        }

        for queue in &self.queues {
            for entry in &queue.entries {
                let known = match entry {
                    QueueEntry::Account(uid) => uids.contains(uid.as_str()),
                    QueueEntry::Queue(name) => names.contains(name.as_str()),
                };
                if !known {
                    warn!(queue = %queue.name, entry = %entry.id(), "queue entry refers to nothing");
                }
            }
        }
        Ok(())
    }

    pub fn supervisor_config(&self, root: &Path) -> SupervisorConfig {
        SupervisorConfig {
            exe: root.join(&self.agent.exe),
            config_path: root.join(&self.agent.config_path),
            log_path: root.join(&self.agent.log_path),
            tick: Duration::from_millis(self.agent.tick_millis),
            settle_delay: Duration::from_secs(self.agent.settle_secs),
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            max_attempts: self.run.max_attempts,
            annihilation_window: minutes(self.run.annihilation_timeout_minutes),
            routine_window: minutes(self.run.routine_timeout_minutes),
            rollover_hour: self.run.server_day_rollover_hour,
            annihilation_weekly_limit: self.run.annihilation_weekly_limit,
        }
    }

    /// Snapshot of accounts and queues, with stored counters applied.
    pub fn roster(&self, state: Option<&StateStore>) -> Roster {
        let mut accounts = self.accounts.clone();
        if let Some(state) = state {
            state.apply(&mut accounts);
        }
        Roster::new(accounts, self.queues.clone())
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDescriptor> {
        self.queues.iter().find(|q| q.name == name)
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

/// Directory holding `.automaa/` for a found config file.
pub fn project_root(config_path: &Path) -> Option<&Path> {
    config_path.parent()?.parent()
}

/// Re-reads the config file on demand, so edits made while a queue runs
/// take effect when it finishes.
pub struct ConfigSettings {
    path: Option<PathBuf>,
    fallback: BTreeMap<String, AfterCompletionAction>,
}

impl ConfigSettings {
    pub fn new(config: &ProjectConfig, path: Option<&Path>) -> Self {
        Self {
            path: path.map(Path::to_path_buf),
            fallback: action_map(config),
        }
    }
}

fn action_map(config: &ProjectConfig) -> BTreeMap<String, AfterCompletionAction> {
    config
        .queues
        .iter()
        .map(|q| (q.name.clone(), q.after_completion))
        .collect()
}

impl SettingsProvider for ConfigSettings {
    fn after_completion_action(&self, queue: &str) -> AfterCompletionAction {
        let current = self.path.as_deref().map(ProjectConfig::read);
        let actions = match current {
            Some(Ok(config)) => action_map(&config),
            Some(Err(e)) => {
                warn!(error = %e, "cannot re-read config, using values from start");
                self.fallback.clone()
            }
            None => self.fallback.clone(),
        };
        actions.get(queue).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.agent.exe, PathBuf::from("MAA").join("MAA.exe"));
        assert_eq!(config.agent.settle_secs, 10);
        assert_eq!(config.agent.tick_millis, 1000);
        assert_eq!(config.run.max_attempts, 3);
        assert_eq!(config.run.annihilation_timeout_minutes, 40);
        assert_eq!(config.run.routine_timeout_minutes, 10);
        assert_eq!(config.run.server_day_rollover_hour, 4);
        assert_eq!(config.power.countdown_secs, 60);
        assert!(config.power.confirm);
        assert!(config.accounts.is_empty());
        assert!(config.queues.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[agent]
exe = "tools/MAA.exe"
config_path = "tools/config/gui.json"
log_path = "tools/debug/gui.log"
settle_secs = 5
tick_millis = 500

[run]
max_attempts = 2
annihilation_timeout_minutes = 30
routine_timeout_minutes = 15
server_day_rollover_hour = 5

[power]
countdown_secs = 10
confirm = false

[[accounts]]
uid = "10001"
name = "alice"
remaining_quota = 5
login = "13812345678"
stages = { primary = "1-7", alternate_1 = "CE-6" }
notify = { enabled = true, only_on_error = true }

[[accounts]]
uid = "10002"
enabled = false
client_type = "Bilibili"

[[queues]]
name = "daily"
entries = [{ account = "10001" }, { account = "10002" }]
after_completion = "shutdown"
schedule = ["0 30 5 * * *"]
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.agent.exe, PathBuf::from("tools/MAA.exe"));
        assert_eq!(config.agent.tick_millis, 500);
        assert_eq!(config.run.max_attempts, 2);
        assert_eq!(config.run.server_day_rollover_hour, 5);
        assert!(!config.power.confirm);

        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].label(), "alice");
        assert_eq!(config.accounts[0].stages.alternate_1(), "CE-6");
        assert!(config.accounts[0].notify.wants(false));
        assert!(!config.accounts[1].enabled);
        assert_eq!(config.accounts[1].remaining_quota, -1);

        let daily = config.queue("daily").unwrap();
        assert_eq!(daily.after_completion, AfterCompletionAction::Shutdown);
        assert_eq!(daily.schedule, vec!["0 30 5 * * *"]);

        let settings = config.run_settings();
        assert_eq!(settings.annihilation_window, Duration::from_secs(30 * 60));
        assert_eq!(settings.routine_window, Duration::from_secs(15 * 60));
        assert!(settings.annihilation_weekly_limit);

        let supervisor = config.supervisor_config(Path::new("/srv"));
        assert_eq!(supervisor.exe, PathBuf::from("/srv/tools/MAA.exe"));
        assert_eq!(supervisor.tick, Duration::from_millis(500));
        assert_eq!(supervisor.settle_delay, Duration::from_secs(5));
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[run]
max_attempts = 1
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.run.max_attempts, 1);
        assert_eq!(config.run.routine_timeout_minutes, 10);
        assert_eq!(config.agent.settle_secs, 10);
    }

    #[test]
    fn duplicates_are_rejected() {
        let config: ProjectConfig = toml::from_str(
            r#"
[[accounts]]
uid = "1"
[[accounts]]
uid = "1"
"#,
        )
        .unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("duplicate account"));

        let config: ProjectConfig = toml::from_str(
            r#"
[[queues]]
name = "q"
[[queues]]
name = "q"
"#,
        )
        .unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("duplicate queue"));
    }

    #[test]
    fn roster_applies_stored_state() {
        let tmp = tempfile::tempdir().unwrap();
        let config: ProjectConfig = toml::from_str(
            r#"
[[accounts]]
uid = "10001"
remaining_quota = 5
"#,
        )
        .unwrap();

        let state = StateStore::load(&tmp.path().join("state.json")).unwrap();
        let mut stored = config.accounts[0].to_update();
        stored.remaining_quota = 2;
        state.record(&stored).unwrap();

        assert_eq!(config.roster(None).account("10001").unwrap().remaining_quota, 5);
        assert_eq!(
            config.roster(Some(&state)).account("10001").unwrap().remaining_quota,
            2
        );
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.run.max_attempts, 3);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            r#"
[run]
max_attempts = 7
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        let path = path.unwrap();
        assert_eq!(config.run.max_attempts, 7);
        assert_eq!(project_root(&path), Some(tmp.path()));
    }

    #[test]
    fn settings_provider_sees_edits() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join("config.toml");
        fs::write(&path, "[[queues]]\nname = \"daily\"\n").unwrap();

        let (config, found) = ProjectConfig::load(tmp.path()).unwrap();
        let settings = ConfigSettings::new(&config, found.as_deref());
        assert_eq!(
            settings.after_completion_action("daily"),
            AfterCompletionAction::NoAction
        );

        fs::write(
            &path,
            "[[queues]]\nname = \"daily\"\nafter_completion = \"hibernate\"\n",
        )
        .unwrap();
        assert_eq!(
            settings.after_completion_action("daily"),
            AfterCompletionAction::Hibernate
        );
        assert_eq!(
            settings.after_completion_action("unknown"),
            AfterCompletionAction::NoAction
        );

        fs::write(&path, "not = [valid").unwrap();
        assert_eq!(
            settings.after_completion_action("daily"),
            AfterCompletionAction::NoAction
        );
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let config: ProjectConfig = toml::from_str("[run]\nmax_attempts = 0\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_attempts"), "{err}");
    }

    #[test]
    fn overflowing_timeouts_are_rejected() {
        let toml = format!("[run]\nroutine_timeout_minutes = {}\n", i64::MAX);
        let config: ProjectConfig = toml::from_str(&toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("routine_timeout_minutes"), "{err}");
        // Never panics even when the check was skipped.
        assert_eq!(config.run_settings().routine_window, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn weekly_limit_can_be_turned_off() {
        let config: ProjectConfig =
            toml::from_str("[run]\nannihilation_weekly_limit = false\n").unwrap();
        config.validate().unwrap();
        assert!(!config.run_settings().annihilation_weekly_limit);
    }
}
