//! Account and queue descriptors.
//!
//! These are read-only snapshots handed to the runners at task start. The
//! runners never write them back; account progress leaves the core as an
//! [`AccountUpdate`] for the owner to persist.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Quota value meaning "no daily limit".
pub const UNLIMITED_QUOTA: i32 = -1;

/// Local hour at which the server day rolls over.
pub const DEFAULT_ROLLOVER_HOUR: u32 = 4;

/// Placeholder the shell stores for "no stage selected".
const UNSET_STAGE: &str = "-";

/// The calendar day an instant belongs to, with the day boundary at
/// `rollover_hour` instead of midnight.
pub fn server_date(now: NaiveDateTime, rollover_hour: u32) -> NaiveDate {
    if now.hour() < rollover_hour {
        (now - Duration::days(1)).date()
    } else {
        now.date()
    }
}

/// One launch flavour of the Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Settings shared by every launch: self-terminating, auto-start emulator.
    ///
    /// Only an input to the config writer, which applies these settings to
    /// every launch anyway. Account runs never launch it on its own, so the
    /// runners treat it as already done.
    Bootstrap,
    /// Weekly annihilation stage only.
    Annihilation,
    /// The full daily routine.
    Routine,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Bootstrap => "bootstrap",
            Phase::Annihilation => "annihilation",
            Phase::Routine => "routine",
        }
    }

    /// Capitalized name for progress titles.
    pub fn title(self) -> &'static str {
        match self {
            Phase::Bootstrap => "Bootstrap",
            Phase::Annihilation => "Annihilation",
            Phase::Routine => "Routine",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ClientType {
    #[default]
    Official,
    Bilibili,
}

impl ClientType {
    pub fn as_agent_value(self) -> &'static str {
        match self {
            ClientType::Official => "Official",
            ClientType::Bilibili => "Bilibili",
        }
    }
}

/// Stage selections for the routine phase.
///
/// Empty strings and `"-"` both mean "not set".
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StageSelection {
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub alternate_1: String,
    #[serde(default)]
    pub alternate_2: String,
    #[serde(default)]
    pub remainder: String,
}

impl StageSelection {
    pub fn primary(&self) -> &str {
        normalize_stage(&self.primary)
    }

    pub fn alternate_1(&self) -> &str {
        normalize_stage(&self.alternate_1)
    }

    pub fn alternate_2(&self) -> &str {
        normalize_stage(&self.alternate_2)
    }

    pub fn remainder(&self) -> &str {
        normalize_stage(&self.remainder)
    }

    pub fn has_alternate(&self) -> bool {
        !self.alternate_1().is_empty() || !self.alternate_2().is_empty()
    }
}

fn normalize_stage(stage: &str) -> &str {
    let trimmed = stage.trim();
    if trimmed == UNSET_STAGE {
        ""
    } else {
        trimmed
    }
}

/// Per-account notification preferences, consumed by the notifier.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NotifySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub only_on_error: bool,
    #[serde(default)]
    pub address: Option<String>,
}

impl NotifySettings {
    /// Whether a run with the given outcome should be reported.
    pub fn wants(&self, succeeded: bool) -> bool {
        self.enabled && (!self.only_on_error || !succeeded)
    }
}

fn default_true() -> bool {
    true
}

fn default_quota() -> i32 {
    UNLIMITED_QUOTA
}

/// A managed account.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AccountDescriptor {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_quota")]
    pub remaining_quota: i32,
    #[serde(default)]
    pub last_run_date: Option<NaiveDate>,
    #[serde(default)]
    pub attempts_today: u32,
    /// Server day on which the Agent last reported the weekly annihilation cap.
    #[serde(default)]
    pub last_annihilation_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub annihilation_enabled: bool,
    #[serde(default)]
    pub stages: StageSelection,
    /// Raw login id; only ever written masked.
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub client_type: ClientType,
    #[serde(default)]
    pub infrast_plan: Option<PathBuf>,
    #[serde(default)]
    pub notify: NotifySettings,
}

impl AccountDescriptor {
    pub fn new(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: String::new(),
            enabled: true,
            remaining_quota: UNLIMITED_QUOTA,
            last_run_date: None,
            attempts_today: 0,
            last_annihilation_date: None,
            annihilation_enabled: true,
            stages: StageSelection::default(),
            login: String::new(),
            client_type: ClientType::Official,
            infrast_plan: None,
            notify: NotifySettings::default(),
        }
    }

    /// Display label: the name when set, otherwise the uid.
    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.uid
        } else {
            &self.name
        }
    }

    /// Disabled accounts and accounts with no quota left never run.
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.remaining_quota != 0
    }

    /// Login name as the Agent expects it.
    ///
    /// Official 11-character phone logins are masked as
    /// `first3 + "****" + rest-from-index-7`; everything else is passed raw.
    pub fn masked_login(&self) -> String {
        let chars: Vec<char> = self.login.chars().collect();
        if self.client_type == ClientType::Official && chars.len() == 11 {
            let head: String = chars[..3].iter().collect();
            let tail: String = chars[7..].iter().collect();
            format!("{head}****{tail}")
        } else {
            self.login.clone()
        }
    }

    /// Current persisted counters as a mutation record.
    pub fn to_update(&self) -> AccountUpdate {
        AccountUpdate {
            uid: self.uid.clone(),
            remaining_quota: self.remaining_quota,
            last_run_date: self.last_run_date,
            attempts_today: self.attempts_today,
            last_annihilation_date: self.last_annihilation_date,
        }
    }

    /// Overlay persisted counters onto this descriptor.
    pub fn apply_update(&mut self, update: &AccountUpdate) {
        self.remaining_quota = update.remaining_quota;
        self.last_run_date = update.last_run_date;
        self.attempts_today = update.attempts_today;
        self.last_annihilation_date = update.last_annihilation_date;
    }
}

/// The counters an account run changes, for the owner to persist.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountUpdate {
    pub uid: String,
    pub remaining_quota: i32,
    pub last_run_date: Option<NaiveDate>,
    pub attempts_today: u32,
    #[serde(default)]
    pub last_annihilation_date: Option<NaiveDate>,
}

/// What to do with the machine once the last active queue finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AfterCompletionAction {
    #[default]
    NoAction,
    KillSelf,
    Sleep,
    Hibernate,
    Shutdown,
    ShutdownForce,
}

impl AfterCompletionAction {
    pub fn label(self) -> &'static str {
        match self {
            AfterCompletionAction::NoAction => "no-action",
            AfterCompletionAction::KillSelf => "kill-self",
            AfterCompletionAction::Sleep => "sleep",
            AfterCompletionAction::Hibernate => "hibernate",
            AfterCompletionAction::Shutdown => "shutdown",
            AfterCompletionAction::ShutdownForce => "shutdown-force",
        }
    }
}

impl fmt::Display for AfterCompletionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One item of a queue.
///
/// ```toml
/// entries = [{ account = "10001" }, { queue = "weekend" }]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntry {
    Account(String),
    Queue(String),
}

impl QueueEntry {
    /// Identifier used in the running set.
    pub fn id(&self) -> &str {
        match self {
            QueueEntry::Account(uid) => uid,
            QueueEntry::Queue(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueueDescriptor {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<QueueEntry>,
    #[serde(default)]
    pub after_completion: AfterCompletionAction,
    /// Cron expressions (seconds field first) at which the timer starts this queue.
    #[serde(default)]
    pub schedule: Vec<String>,
}

impl QueueDescriptor {
    pub fn new(name: &str, entries: Vec<QueueEntry>) -> Self {
        Self {
            name: name.to_string(),
            entries,
            after_completion: AfterCompletionAction::NoAction,
            schedule: Vec::new(),
        }
    }
}

/// Everything a queue run may reference, snapshotted at task start.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    accounts: BTreeMap<String, AccountDescriptor>,
    queues: BTreeMap<String, QueueDescriptor>,
}

impl Roster {
    pub fn new(accounts: Vec<AccountDescriptor>, queues: Vec<QueueDescriptor>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.uid.clone(), account))
                .collect(),
            queues: queues
                .into_iter()
                .map(|queue| (queue.name.clone(), queue))
                .collect(),
        }
    }

    pub fn account(&self, uid: &str) -> Option<&AccountDescriptor> {
        self.accounts.get(uid)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDescriptor> {
        self.queues.get(name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueDescriptor> {
        self.queues.values()
    }
}
