//! Persisted account counters.
//!
//! Accounts are declared in `config.toml`, but the counters a run changes
//! (quota, last run date, attempts today) live in `.automaa/state.json`,
//! keyed by uid. The store is loaded over the declared accounts at start
//! and rewritten whenever a runner reports an update.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::model::{AccountDescriptor, AccountUpdate};
use crate::progress::ProgressSink;

pub struct StateStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, AccountUpdate>>,
}

impl StateStore {
    /// Load `path`; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, uid: &str) -> Option<AccountUpdate> {
        self.lock().get(uid).cloned()
    }

    /// Overlay stored counters onto `accounts`.
    pub fn apply(&self, accounts: &mut [AccountDescriptor]) {
        let entries = self.lock();
        for account in accounts {
            if let Some(update) = entries.get(&account.uid) {
                account.apply_update(update);
            }
        }
    }

    /// Record `update` and rewrite the file.
    pub fn record(&self, update: &AccountUpdate) -> Result<()> {
        let mut entries = self.lock();
        entries.insert(update.uid.clone(), update.clone());
        let json =
            serde_json::to_string_pretty(&*entries).context("failed to serialize account state")?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(uid = %update.uid, path = %self.path.display(), "account state saved");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, AccountUpdate>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProgressSink for StateStore {
    fn on_account_update(&self, update: &AccountUpdate) {
        if let Err(e) = self.record(update) {
            warn!(uid = %update.uid, error = %e, "failed to save account state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn update(uid: &str, quota: i32) -> AccountUpdate {
        AccountUpdate {
            uid: uid.to_string(),
            remaining_quota: quota,
            last_run_date: NaiveDate::from_ymd_opt(2026, 10, 16),
            attempts_today: 1,
            last_annihilation_date: None,
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::load(&tmp.path().join("state.json")).unwrap();
        assert!(store.get("10001").is_none());
    }

    #[test]
    fn updates_survive_reload_and_overlay_accounts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".automaa").join("state.json");

        let store = StateStore::load(&path).unwrap();
        store.on_account_update(&update("10001", 4));
        store.on_account_update(&update("10001", 3));
        store.on_account_update(&update("10002", -1));
        assert_eq!(store.path(), path);

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.get("10001"), Some(update("10001", 3)));

        let mut accounts = vec![AccountDescriptor::new("10001"), AccountDescriptor::new("99")];
        reloaded.apply(&mut accounts);
        assert_eq!(accounts[0].remaining_quota, 3);
        assert_eq!(accounts[0].attempts_today, 1);
        assert_eq!(accounts[1].remaining_quota, -1);
        assert_eq!(accounts[1].attempts_today, 0);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = StateStore::load(&path).err().unwrap();
        assert!(format!("{err:#}").contains("failed to parse"));
    }
}
