//! Agent run configuration.
//!
//! Before every launch the account's intent for the phase is written into
//! the Agent's JSON config (`Configurations.Default.<Key>` plus a few
//! `Global.<Key>` switches). The Agent stores every primitive as a string,
//! booleans included (`"True"` / `"False"`). Keys the supervisor does not own
//! are left untouched when the file already exists.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::RunError;
use crate::model::{AccountDescriptor, Phase};

/// Stage value the Agent reads as "this week's annihilation".
pub const ANNIHILATION_STAGE: &str = "Annihilation";

/// Primary stage that is farmed in longer series.
pub const LONG_FORM_STAGE: &str = "1-7";
pub const LONG_FORM_SERIES: &str = "6";
pub const DEFAULT_SERIES: &str = "1";

/// Exit emulator and the Agent itself once the task list finishes.
const EXIT_EMULATOR_AND_SELF: &str = "ExitEmulatorAndSelf";

const PROFILE: &str = "Default";

/// The Agent's scheduled-start slots; all are disabled so only we launch it.
const TIMER_SLOTS: u32 = 8;

const SUBTASKS: [&str; 6] = ["WakeUp", "Recruiting", "Base", "Combat", "Mission", "Mall"];

fn flag(on: bool) -> Value {
    Value::String(if on { "True" } else { "False" }.to_string())
}

fn text(value: &str) -> Value {
    Value::String(value.to_string())
}

/// Writes the Agent config for one (account, phase) pair.
pub struct RunConfigWriter {
    path: PathBuf,
}

impl RunConfigWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Overwrite the config file. Writing the same input twice produces the
    /// same bytes. An existing file that is not valid JSON is left alone and
    /// reported, since rewriting it would drop the Agent's own settings.
    pub fn write(&self, account: &AccountDescriptor, phase: Phase) -> Result<(), RunError> {
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => None,
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(value) => Some(value),
                Err(e) => {
                    return Err(RunError::ConfigWrite(format!(
                        "{}: existing config is not valid JSON: {e}",
                        self.path.display()
                    )));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(RunError::ConfigWrite(format!(
                    "{}: {e}",
                    self.path.display()
                )));
            }
        };

        let document = render(existing, account, phase);
        let mut body = serde_json::to_string_pretty(&document)
            .map_err(|e| RunError::ConfigWrite(e.to_string()))?;
        body.push('\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RunError::ConfigWrite(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(&self.path, body)
            .map_err(|e| RunError::ConfigWrite(format!("{}: {e}", self.path.display())))?;

        debug!(
            path = %self.path.display(),
            uid = %account.uid,
            phase = %phase,
            "agent config written"
        );
        Ok(())
    }
}

/// Apply the account's run intent for `phase` on top of an existing document.
pub fn render(existing: Option<Value>, account: &AccountDescriptor, phase: Phase) -> Value {
    let mut root = match existing {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    // The Agent runs whichever profile is current; fold it into Default.
    let current = root
        .get("Current")
        .and_then(Value::as_str)
        .map(str::to_string);
    let configurations = object_entry(&mut root, "Configurations");
    if let Some(current) = current.filter(|c| c != PROFILE)
        && let Some(active) = configurations.get(&current).cloned()
    {
        configurations.insert(PROFILE.to_string(), active);
    }
    root.insert("Current".to_string(), text(PROFILE));

    let global = object_entry(&mut root, "Global");
    for slot in 1..=TIMER_SLOTS {
        global.insert(format!("Timer.Timer{slot}"), flag(false));
    }

    let profile = object_entry(object_entry(&mut root, "Configurations"), PROFILE);
    apply_bootstrap(profile, account);
    match phase {
        Phase::Bootstrap => set_subtasks(profile, &["WakeUp"]),
        Phase::Annihilation => apply_annihilation(profile),
        Phase::Routine => apply_routine(profile, account),
    }

    Value::Object(root)
}

fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(inner) => inner,
        _ => unreachable!("slot was just made an object"),
    }
}

fn apply_bootstrap(profile: &mut Map<String, Value>, account: &AccountDescriptor) {
    profile.insert(
        "MainFunction.ActionAfterCompleted".to_string(),
        text(EXIT_EMULATOR_AND_SELF),
    );
    profile.insert("Start.RunDirectly".to_string(), flag(true));
    profile.insert("Start.StartEmulator".to_string(), flag(true));
    profile.insert(
        "Start.ClientType".to_string(),
        text(account.client_type.as_agent_value()),
    );
    profile.insert("Start.AccountName".to_string(), text(&account.masked_login()));
    profile.insert("GUI.CustomStageCode".to_string(), flag(true));
    profile.insert("Fight.UseExpiringMedicine".to_string(), flag(true));
}

fn set_subtasks(profile: &mut Map<String, Value>, enabled: &[&str]) {
    for task in SUBTASKS {
        profile.insert(
            format!("TaskQueue.{task}.IsChecked"),
            flag(enabled.contains(&task)),
        );
    }
}

fn apply_annihilation(profile: &mut Map<String, Value>) {
    set_subtasks(profile, &["WakeUp", "Combat"]);
    profile.insert("MainFunction.Stage1".to_string(), text(ANNIHILATION_STAGE));
    profile.insert("MainFunction.Stage2".to_string(), text(""));
    profile.insert("MainFunction.Stage3".to_string(), text(""));
    profile.insert("MainFunction.Series.Quantity".to_string(), text(DEFAULT_SERIES));
    profile.insert("GUI.UseAlternateStage".to_string(), flag(false));
    profile.insert("Fight.RemainingSanityStage".to_string(), text(""));
    profile.insert("Fight.UseRemainingSanityStage".to_string(), flag(false));
}

fn apply_routine(profile: &mut Map<String, Value>, account: &AccountDescriptor) {
    set_subtasks(profile, &SUBTASKS);

    let stages = &account.stages;
    profile.insert("MainFunction.Stage1".to_string(), text(stages.primary()));
    profile.insert("MainFunction.Stage2".to_string(), text(stages.alternate_1()));
    profile.insert("MainFunction.Stage3".to_string(), text(stages.alternate_2()));
    let series = if stages.primary() == LONG_FORM_STAGE {
        LONG_FORM_SERIES
    } else {
        DEFAULT_SERIES
    };
    profile.insert("MainFunction.Series.Quantity".to_string(), text(series));
    profile.insert(
        "GUI.UseAlternateStage".to_string(),
        flag(stages.has_alternate()),
    );
    profile.insert(
        "Fight.RemainingSanityStage".to_string(),
        text(stages.remainder()),
    );
    profile.insert(
        "Fight.UseRemainingSanityStage".to_string(),
        flag(!stages.remainder().is_empty()),
    );

    match &account.infrast_plan {
        Some(plan) => {
            profile.insert("Infrast.CustomInfrastEnabled".to_string(), flag(true));
            profile.insert("Infrast.DefaultInfrast".to_string(), text("user_defined"));
            profile.insert(
                "Infrast.CustomInfrastFile".to_string(),
                text(&plan.display().to_string()),
            );
        }
        None => {
            profile.insert("Infrast.CustomInfrastEnabled".to_string(), flag(false));
        }
    }
}
