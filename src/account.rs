//! Two-phase run of a single account.
//!
//! An account run is Annihilation then Routine, sharing one attempt budget.
//! Within an attempt a failed phase does not stop the other one from being
//! tried; finished phases are never re-run. Quota is charged on the first
//! success of a server day only. Once the Agent reports the weekly
//! annihilation cap, Annihilation is skipped for the rest of that ISO week.

use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::model::{
    AccountDescriptor, AccountUpdate, DEFAULT_ROLLOVER_HOUR, Phase, UNLIMITED_QUOTA, server_date,
};
use crate::progress::ProgressReporter;
use crate::supervisor::{LaunchOutcome, ProcessSupervisor, TerminalReason};

/// Retry and timeout policy for account runs.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_attempts: u32,
    /// How long the log may stay unchanged during Annihilation.
    pub annihilation_window: Duration,
    /// Same, for Routine.
    pub routine_window: Duration,
    pub rollover_hour: u32,
    /// Skip Annihilation for the rest of a week once its cap was reported.
    pub annihilation_weekly_limit: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            annihilation_window: Duration::from_secs(40 * 60),
            routine_window: Duration::from_secs(10 * 60),
            rollover_hour: DEFAULT_ROLLOVER_HOUR,
            annihilation_weekly_limit: true,
        }
    }
}

impl RunSettings {
    /// Whether `account` already hit the annihilation cap in `today`'s week.
    fn annihilation_capped(&self, account: &AccountDescriptor, today: NaiveDate) -> bool {
        self.annihilation_weekly_limit
            && account
                .last_annihilation_date
                .is_some_and(|d| d.iso_week() == today.iso_week())
    }

    fn window(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Annihilation => self.annihilation_window,
            Phase::Bootstrap | Phase::Routine => self.routine_window,
        }
    }
}

/// Progress of one account run.
#[derive(Debug, Clone, Default)]
pub struct RunAttemptState {
    pub annihilation_done: bool,
    pub routine_done: bool,
    /// Attempts fully consumed; a cancelled attempt does not count.
    pub attempts: u32,
    /// Log excerpts of every launch, in order.
    pub log_excerpt: String,
    pub last_reason: Option<TerminalReason>,
}

impl RunAttemptState {
    fn new(annihilation_enabled: bool) -> Self {
        Self {
            annihilation_done: !annihilation_enabled,
            ..Self::default()
        }
    }

    pub fn is_done(&self, phase: Phase) -> bool {
        match phase {
            Phase::Annihilation => self.annihilation_done,
            Phase::Routine => self.routine_done,
            Phase::Bootstrap => true,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.annihilation_done && self.routine_done
    }

    fn record(&mut self, phase: Phase, outcome: &LaunchOutcome) {
        if outcome.reason.is_success() {
            match phase {
                Phase::Annihilation => self.annihilation_done = true,
                Phase::Routine => self.routine_done = true,
                Phase::Bootstrap => {}
            }
        }
        if !outcome.excerpt.is_empty() {
            if !self.log_excerpt.is_empty() {
                self.log_excerpt.push('\n');
            }
            self.log_excerpt
                .push_str(&format!("--- {} ---\n{}", phase.title(), outcome.excerpt));
        }
        self.last_reason = Some(outcome.reason.clone());
    }
}

#[derive(Debug, Clone)]
pub struct AccountOutcome {
    pub succeeded: bool,
    pub cancelled: bool,
    pub update: AccountUpdate,
    pub state: RunAttemptState,
    /// The account asked to be notified about this result.
    pub notify: bool,
}

pub struct AccountRunner<'a> {
    supervisor: &'a ProcessSupervisor,
    settings: &'a RunSettings,
}

impl<'a> AccountRunner<'a> {
    pub fn new(supervisor: &'a ProcessSupervisor, settings: &'a RunSettings) -> Self {
        Self {
            supervisor,
            settings,
        }
    }

    /// Drive `account` to completion or until attempts run out.
    ///
    /// `now` decides the server day the run is charged to. The resulting
    /// counters are reported through `reporter` whenever they changed.
    pub fn run(
        &self,
        account: &AccountDescriptor,
        now: NaiveDateTime,
        cancel: &CancelToken,
        reporter: &ProgressReporter,
    ) -> AccountOutcome {
        let today = server_date(now, self.settings.rollover_hour);
        let mut update = account.to_update();
        if update.last_run_date != Some(today) {
            update.attempts_today = 0;
            update.last_run_date = Some(today);
        }

        let capped = self.settings.annihilation_capped(account, today);
        if capped {
            info!(uid = %account.uid, "weekly annihilation cap reached, skipping annihilation");
        }
        let mut state = RunAttemptState::new(account.annihilation_enabled && !capped);
        let mut cancelled = false;

        'attempts: for attempt in 1..=self.settings.max_attempts {
            for phase in [Phase::Annihilation, Phase::Routine] {
                if state.is_done(phase) {
                    continue;
                }
                info!(uid = %account.uid, phase = %phase, attempt, "starting phase");
                let outcome = self.supervisor.run(
                    account,
                    phase,
                    self.settings.window(phase),
                    cancel,
                    reporter,
                );
                state.record(phase, &outcome);
                if outcome.weekly_cap_reached {
                    info!(uid = %account.uid, "agent reported the weekly annihilation cap");
                    update.last_annihilation_date = Some(today);
                }
                match &outcome.reason {
                    TerminalReason::Cancelled => {
                        cancelled = true;
                        break 'attempts;
                    }
                    TerminalReason::Succeeded => {}
                    other => {
                        warn!(
                            uid = %account.uid,
                            phase = %phase,
                            attempt,
                            reason = ?other,
                            "phase failed"
                        );
                    }
                }
            }
            state.attempts = attempt;
            if state.is_complete() {
                break;
            }
        }

        let succeeded = state.is_complete() && !cancelled;
        if succeeded {
            if update.attempts_today == 0
                && update.remaining_quota != UNLIMITED_QUOTA
                && update.remaining_quota > 0
            {
                update.remaining_quota -= 1;
            }
            update.attempts_today += 1;
        } else if !cancelled {
            warn!(
                uid = %account.uid,
                attempts = state.attempts,
                "account did not finish"
            );
        }

        if update != account.to_update() {
            reporter.account_updated(&update);
        }

        AccountOutcome {
            succeeded,
            cancelled,
            update,
            notify: !cancelled && account.notify.wants(succeeded),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;

    use crate::progress::QueueBoard;
    use crate::markers;
    use crate::test_support::{
        FakeLauncher, RecordingSink, Script, future_line, supervisor_config,
    };

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        launcher: Arc<FakeLauncher>,
        supervisor: ProcessSupervisor,
        sink: Arc<RecordingSink>,
        settings: RunSettings,
    }

    impl Harness {
        fn new(plan: impl Fn(Phase, usize) -> Script + Send + Sync + 'static) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let config = supervisor_config(tmp.path());
            let launcher = Arc::new(FakeLauncher::new(&config.log_path, plan));
            let supervisor = ProcessSupervisor::new(config, launcher.clone());
            Self {
                _tmp: tmp,
                launcher,
                supervisor,
                sink: Arc::new(RecordingSink::default()),
                settings: RunSettings {
                    max_attempts: 3,
                    annihilation_window: Duration::from_millis(30),
                    routine_window: Duration::from_millis(30),
                    rollover_hour: 4,
                    annihilation_weekly_limit: true,
                },
            }
        }

        fn run(&self, account: &AccountDescriptor, cancel: &CancelToken) -> AccountOutcome {
            let reporter = ProgressReporter::new(
                self.sink.clone(),
                QueueBoard::new("q", [account.label().to_string()]),
            );
            AccountRunner::new(&self.supervisor, &self.settings)
                .run(account, noon(), cancel, &reporter)
        }
    }

    fn account(quota: i32) -> AccountDescriptor {
        let mut account = AccountDescriptor::new("10001");
        account.remaining_quota = quota;
        account
    }

    #[test]
    fn exhausted_attempts_launch_exactly_max_times() {
        let h = Harness::new(|_, _| Script::Fail);
        let mut acc = account(5);
        acc.annihilation_enabled = false;

        let outcome = h.run(&acc, &CancelToken::new());

        assert!(!outcome.succeeded);
        assert_eq!(h.launcher.launches(), 3);
        assert_eq!(h.launcher.phases(), vec![Phase::Routine; 3]);
        assert_eq!(outcome.state.attempts, 3);
        assert_eq!(outcome.update.remaining_quota, 5);
        assert_eq!(outcome.update.attempts_today, 0);
        assert_eq!(outcome.update.last_run_date, Some(today()));
    }

    #[test]
    fn failed_phase_moves_on_to_next_phase() {
        let h = Harness::new(|phase, _| match phase {
            Phase::Annihilation => Script::Hang,
            _ => Script::Succeed,
        });
        let outcome = h.run(&account(-1), &CancelToken::new());

        // Annihilation is retried each attempt, Routine ran once.
        assert_eq!(
            h.launcher.phases(),
            vec![
                Phase::Annihilation,
                Phase::Routine,
                Phase::Annihilation,
                Phase::Annihilation
            ]
        );
        assert!(!outcome.succeeded);
        assert!(outcome.state.routine_done);
        assert!(!outcome.state.annihilation_done);
        assert!(matches!(
            outcome.state.last_reason,
            Some(TerminalReason::TimedOut { .. })
        ));
    }

    #[test]
    fn finished_phase_is_not_rerun() {
        let h = Harness::new(|phase, index| match (phase, index) {
            (Phase::Annihilation, 0) => Script::Fail,
            _ => Script::Succeed,
        });
        let outcome = h.run(&account(-1), &CancelToken::new());

        assert!(outcome.succeeded);
        assert_eq!(
            h.launcher.phases(),
            vec![Phase::Annihilation, Phase::Routine, Phase::Annihilation]
        );
        assert_eq!(outcome.state.attempts, 2);
        assert!(outcome.state.log_excerpt.contains("--- Routine ---"));
    }

    #[test]
    fn first_success_of_the_day_charges_quota() {
        let h = Harness::new(|_, _| Script::Succeed);
        let outcome = h.run(&account(2), &CancelToken::new());

        assert!(outcome.succeeded);
        assert_eq!(outcome.update.remaining_quota, 1);
        assert_eq!(outcome.update.attempts_today, 1);
        assert_eq!(outcome.update.last_run_date, Some(today()));
        assert_eq!(h.sink.updates(), vec![outcome.update.clone()]);
    }

    #[test]
    fn later_success_same_day_does_not_charge() {
        let h = Harness::new(|_, _| Script::Succeed);
        let mut acc = account(1);
        acc.attempts_today = 1;
        acc.last_run_date = Some(today());

        let outcome = h.run(&acc, &CancelToken::new());
        assert_eq!(outcome.update.remaining_quota, 1);
        assert_eq!(outcome.update.attempts_today, 2);
    }

    #[test]
    fn new_server_day_resets_attempts() {
        let h = Harness::new(|_, _| Script::Succeed);
        let mut acc = account(3);
        acc.attempts_today = 4;
        acc.last_run_date = NaiveDate::from_ymd_opt(2026, 10, 15);

        let outcome = h.run(&acc, &CancelToken::new());
        assert_eq!(outcome.update.remaining_quota, 2);
        assert_eq!(outcome.update.attempts_today, 1);
        assert_eq!(outcome.update.last_run_date, Some(today()));
    }

    #[test]
    fn unlimited_quota_is_never_decremented() {
        let h = Harness::new(|_, _| Script::Succeed);
        let outcome = h.run(&account(UNLIMITED_QUOTA), &CancelToken::new());
        assert!(outcome.succeeded);
        assert_eq!(outcome.update.remaining_quota, UNLIMITED_QUOTA);
        assert_eq!(outcome.update.attempts_today, 1);
    }

    #[test]
    fn cancellation_unwinds_without_consuming_attempts() {
        let h = Harness::new(|_, _| Script::Succeed);
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = h.run(&account(2), &cancel);
        assert!(outcome.cancelled);
        assert!(!outcome.succeeded);
        assert!(!outcome.notify);
        assert_eq!(outcome.state.attempts, 0);
        assert_eq!(h.launcher.launches(), 0);
        assert_eq!(outcome.update.remaining_quota, 2);
    }

    #[test]
    fn notify_follows_account_settings() {
        let h = Harness::new(|_, _| Script::Fail);
        let mut acc = account(-1);
        acc.notify.enabled = true;
        acc.notify.only_on_error = true;

        let outcome = h.run(&acc, &CancelToken::new());
        assert!(!outcome.succeeded);
        assert!(outcome.notify);
    }

    #[test]
    fn reported_cap_is_recorded_and_skips_annihilation_that_week() {
        let h = Harness::new(|phase, _| match phase {
            Phase::Annihilation => Script::Lines {
                lines: vec![
                    future_line(markers::ANNIHILATION_CAPPED),
                    future_line(markers::SUCCESS),
                ],
                exit: false,
            },
            _ => Script::Succeed,
        });
        let mut acc = account(-1);

        let outcome = h.run(&acc, &CancelToken::new());
        assert!(outcome.succeeded);
        assert_eq!(outcome.update.last_annihilation_date, Some(today()));

        acc.apply_update(&outcome.update);
        let outcome = h.run(&acc, &CancelToken::new());
        assert!(outcome.succeeded);
        assert_eq!(
            h.launcher.phases(),
            vec![Phase::Annihilation, Phase::Routine, Phase::Routine]
        );
    }

    #[test]
    fn cap_from_an_earlier_week_does_not_skip() {
        let h = Harness::new(|_, _| Script::Succeed);
        let mut acc = account(-1);
        // 2026-10-16 is a Friday; the Sunday before belongs to the prior ISO week.
        acc.last_annihilation_date = NaiveDate::from_ymd_opt(2026, 10, 11);

        let outcome = h.run(&acc, &CancelToken::new());
        assert!(outcome.succeeded);
        assert_eq!(h.launcher.phases(), vec![Phase::Annihilation, Phase::Routine]);
        assert_eq!(outcome.update.last_annihilation_date, acc.last_annihilation_date);
    }

    #[test]
    fn cap_is_ignored_when_weekly_limit_is_off() {
        let mut h = Harness::new(|_, _| Script::Succeed);
        h.settings.annihilation_weekly_limit = false;
        let mut acc = account(-1);
        acc.last_annihilation_date = NaiveDate::from_ymd_opt(2026, 10, 12);

        h.run(&acc, &CancelToken::new());
        assert_eq!(h.launcher.phases(), vec![Phase::Annihilation, Phase::Routine]);
    }
}
