//! Registry of concurrently running queues.
//!
//! Each admitted queue gets its own thread. Admission is checked against
//! both the registry and the running set under the registry lock, so two
//! callers racing on the same name cannot both get in. When a runner thread
//! finishes it releases its name, records history and, if nothing else is
//! running, triggers the queue's after-completion power action. Its registry
//! entry goes last.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account::RunSettings;
use crate::cancel::CancelToken;
use crate::error::AdmitError;
use crate::history::{HistoryRecord, HistorySink};
use crate::model::{AfterCompletionAction, QueueDescriptor, Roster};
use crate::progress::ProgressSink;
use crate::queue::QueueRunner;
use crate::running_set::{RunningGuard, RunningSet};
use crate::supervisor::ProcessSupervisor;

/// Name that addresses every registered task in [`TaskManager::stop`].
pub const ALL_TASKS: &str = "ALL";

/// Resolves settings that may change while a queue runs.
pub trait SettingsProvider: Send + Sync {
    fn after_completion_action(&self, queue: &str) -> AfterCompletionAction;
}

/// Carries out machine-level actions.
pub trait PowerController: Send + Sync {
    fn execute(&self, action: AfterCompletionAction);
}

/// External collaborators a task reports to.
#[derive(Clone)]
pub struct Collaborators {
    pub progress: Arc<dyn ProgressSink>,
    pub history: Arc<dyn HistorySink>,
    pub settings: Arc<dyn SettingsProvider>,
    pub power: Arc<dyn PowerController>,
}

/// A live task.
pub struct TaskRecord {
    pub name: String,
    pub run_id: Uuid,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    running: RunningSet,
    supervisor: ProcessSupervisor,
    settings: RunSettings,
    hooks: Collaborators,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Body of a runner thread.
    fn run_task(
        &self,
        name: String,
        run_id: Uuid,
        queue: QueueDescriptor,
        roster: Arc<Roster>,
        cancel: CancelToken,
        guard: RunningGuard,
    ) {
        let report = QueueRunner::new(
            &roster,
            &self.running,
            &self.supervisor,
            &self.settings,
            &cancel,
        )
        .run(&queue, Arc::clone(&self.hooks.progress));

        drop(guard);

        let cancelled = report.cancelled;
        let record = HistoryRecord {
            run_id,
            task: name.clone(),
            report,
        };
        if let Err(e) = self.hooks.history.persist(&record) {
            warn!(task = %name, error = %e, "failed to persist history");
        }
        self.hooks.progress.on_completion(&record.report);

        if cancelled {
            info!(task = %name, "task cancelled");
        } else {
            self.after_completion(&name, &queue.name);
        }

        // Last, so a join that finds the record sees every hook above done.
        self.tasks().remove(&name);
    }

    fn after_completion(&self, task: &str, queue: &str) {
        if !self.running.is_empty() {
            debug!(
                task = %task,
                still_running = ?self.running.snapshot(),
                "not idle, no power action"
            );
            return;
        }
        let action = self.hooks.settings.after_completion_action(queue);
        if action == AfterCompletionAction::NoAction {
            return;
        }
        info!(task = %task, action = %action, "all tasks finished, running power action");
        self.hooks.power.execute(action);
    }
}

/// Admits, runs and stops named queue tasks.
pub struct TaskManager {
    shared: Arc<Shared>,
}

impl TaskManager {
    pub fn new(
        supervisor: ProcessSupervisor,
        settings: RunSettings,
        hooks: Collaborators,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(HashMap::new()),
                running: RunningSet::new(),
                supervisor,
                settings,
                hooks,
            }),
        }
    }

    pub fn running(&self) -> &RunningSet {
        &self.shared.running
    }

    /// Start `queue` under `name`. Returns as soon as the thread is spawned.
    ///
    /// Rejected without side effects when `name` is registered or anything
    /// by that name is already running.
    pub fn add(
        &self,
        name: &str,
        queue: QueueDescriptor,
        roster: Arc<Roster>,
    ) -> Result<Uuid, AdmitError> {
        let mut tasks = self.shared.tasks();
        if tasks.contains_key(name) {
            return Err(AdmitError::AlreadyRegistered(name.to_string()));
        }
        let Some(guard) = self.shared.running.claim(name) else {
            return Err(AdmitError::AlreadyRunning(name.to_string()));
        };

        let run_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let shared = Arc::clone(&self.shared);
        let thread_name = name.to_string();
        let thread_cancel = cancel.clone();
        // The thread cannot deregister before the record exists: we hold
        // the registry lock until it is inserted.
        let handle = thread::Builder::new()
            .name(format!("queue-{name}"))
            .spawn(move || {
                shared.run_task(thread_name, run_id, queue, roster, thread_cancel, guard);
            })
            .map_err(|e| AdmitError::Spawn {
                name: name.to_string(),
                detail: e.to_string(),
            })?;

        info!(task = %name, run_id = %run_id, "task started");
        tasks.insert(
            name.to_string(),
            TaskRecord {
                name: name.to_string(),
                run_id,
                cancel,
                handle: Some(handle),
            },
        );
        Ok(run_id)
    }

    /// Cancel `name` (or every task for [`ALL_TASKS`]) and wait for it to
    /// finish. Returns false when nothing matched.
    pub fn stop(&self, name: &str) -> bool {
        let taken = self.take(name, true);
        let found = !taken.is_empty();
        self.join_all(taken);
        found
    }

    /// Wait for `name` (or every task) without cancelling.
    pub fn join(&self, name: &str) -> bool {
        let taken = self.take(name, false);
        let found = !taken.is_empty();
        self.join_all(taken);
        found
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.shared.tasks().contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.tasks().keys().cloned().collect();
        names.sort();
        names
    }

    fn take(&self, name: &str, cancel: bool) -> Vec<(String, Option<JoinHandle<()>>)> {
        let mut tasks = self.shared.tasks();
        tasks
            .values_mut()
            .filter(|r| name == ALL_TASKS || r.name == name)
            .map(|r| {
                if cancel {
                    info!(task = %r.name, "stopping task");
                    r.cancel.cancel();
                }
                (r.name.clone(), r.handle.take())
            })
            .collect()
    }

    fn join_all(&self, taken: Vec<(String, Option<JoinHandle<()>>)>) {
        for (name, handle) in taken {
            match handle {
                Some(handle) => {
                    if handle.join().is_err() {
                        error!(task = %name, "task thread panicked");
                        self.shared.tasks().remove(&name);
                    }
                }
                // Someone else is joining it; wait for the record to go.
                None => {
                    while self.is_running(&name) {
                        thread::sleep(std::time::Duration::from_millis(10));
                    }
                }
            }
        }
    }
}
