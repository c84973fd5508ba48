//! Persistent task store
//!
//! A single mutex guards the task map and the queue together; every
//! mutation rewrites the whole task list file before the lock is
//! released, so the on-disk file always matches memory. The file is
//! small and operator-editable; whole-file overwrites are deliberate.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::patch::{PatchAction, PatchSet};
use crate::task::{RetryCounter, TaskRecord, TaskStatus, TaskUpdate};

/// Upper bound on waiting for the store mutex.
const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Initial retry budgets for tasks that do not carry their own.
#[derive(Debug, Clone, Copy)]
pub struct RetryDefaults {
    /// Initial `remaining_retries_testcase`
    pub testcase: u32,
    /// Initial `remaining_retries_resource`
    pub resource: u32,
}

struct StoreState {
    tasks: BTreeMap<String, TaskRecord>,
    queue: VecDeque<String>,
}

/// Mutex-guarded task map plus run queue, persisted to the task list.
pub struct TaskStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl TaskStore {
    /// Load the task list, apply counter defaults and save it back.
    pub fn load(path: &Path, defaults: &RetryDefaults) -> SchedulerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut tasks: BTreeMap<String, TaskRecord> = toml::from_str(&content)?;

        for record in tasks.values_mut() {
            record.remaining_retries_testcase.get_or_insert(defaults.testcase);
            record.remaining_retries_resource.get_or_insert(defaults.resource);
        }
        info!("loaded {} task(s) from {}", tasks.len(), path.display());

        let store = Self {
            path: path.to_path_buf(),
            state: Mutex::new(StoreState {
                tasks,
                queue: VecDeque::new(),
            }),
        };
        {
            let state = store.lock()?;
            store.persist(&state)?;
        }
        Ok(store)
    }

    fn lock(&self) -> SchedulerResult<MutexGuard<'_, StoreState>> {
        self.state
            .try_lock_for(LOCK_TIMEOUT)
            .ok_or(SchedulerError::LockTimeout)
    }

    fn persist(&self, state: &StoreState) -> SchedulerResult<()> {
        let content = toml::to_string(&state.tasks)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// One producer tick: apply a pending patch, then audit every
    /// record, all under a single lock acquisition.
    pub fn producer_tick(
        &self,
        patch: Option<PatchSet>,
        defaults: &RetryDefaults,
    ) -> SchedulerResult<()> {
        let mut state = self.lock()?;
        let mut mutated = false;

        if let Some(patches) = patch {
            mutated |= apply_patch_locked(&mut state.tasks, &patches);
        }
        mutated |= audit_locked(&mut state, defaults);

        if mutated {
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Audit all records without patch intake (producer scan only).
    pub fn audit(&self, defaults: &RetryDefaults) -> SchedulerResult<()> {
        self.producer_tick(None, defaults)
    }

    /// Update one record; in retry mode the record is archived into
    /// its own history and reset to `TOBERUN` with the selected
    /// counter decremented, provided that counter is still positive.
    pub fn update(
        &self,
        flavor: &str,
        fields: TaskUpdate,
        retry: Option<RetryCounter>,
    ) -> SchedulerResult<()> {
        let mut state = self.lock()?;
        let record = state.tasks.entry(flavor.to_string()).or_default();

        fields.merge_into(record);

        if let Some(counter) = retry {
            let remaining = match counter {
                RetryCounter::Testcase => record.remaining_retries_testcase,
                RetryCounter::Resource => record.remaining_retries_resource,
            }
            .unwrap_or(0);

            if remaining > 0 {
                let retries_testcase = record.remaining_retries_testcase.unwrap_or(0);
                let retries_resource = record.remaining_retries_resource.unwrap_or(0);

                // Archive the attempt, then rebuild the record fresh.
                let mut history = std::mem::take(&mut record.history);
                history.push(record.clone());

                let mut fresh = TaskRecord {
                    status: Some(TaskStatus::ToBeRun),
                    remaining_retries_testcase: Some(retries_testcase),
                    remaining_retries_resource: Some(retries_resource),
                    history,
                    ..TaskRecord::default()
                };
                match counter {
                    RetryCounter::Testcase => {
                        fresh.remaining_retries_testcase = Some(retries_testcase - 1);
                    }
                    RetryCounter::Resource => {
                        fresh.remaining_retries_resource = Some(retries_resource - 1);
                    }
                }
                *record = fresh;
            }
        }

        debug!("task \"{flavor}\" updated: {record:?}");
        self.persist(&state)
    }

    /// Pop the queue head, if any.
    pub fn pop_next(&self) -> SchedulerResult<Option<String>> {
        let mut state = self.lock()?;
        Ok(state.queue.pop_front())
    }

    /// Number of queued flavors.
    pub fn queue_len(&self) -> SchedulerResult<usize> {
        Ok(self.lock()?.queue.len())
    }

    /// Number of archived attempts for a flavor.
    pub fn attempts(&self, flavor: &str) -> SchedulerResult<usize> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .get(flavor)
            .map(|record| record.history.len())
            .unwrap_or(0))
    }

    /// Read-only copy of the task map.
    pub fn snapshot(&self) -> SchedulerResult<BTreeMap<String, TaskRecord>> {
        Ok(self.lock()?.tasks.clone())
    }
}

fn apply_patch_locked(tasks: &mut BTreeMap<String, TaskRecord>, patches: &PatchSet) -> bool {
    let mut mutated = false;

    for (flavor, patch) in patches {
        info!("apply patch {patch:?} to task \"{flavor}\"");

        let status = tasks.get(flavor).and_then(|record| record.status);
        match patch.action {
            Some(PatchAction::Schedule)
                if !matches!(
                    status,
                    None | Some(TaskStatus::ToBeRun)
                        | Some(TaskStatus::Finished)
                        | Some(TaskStatus::Withdrawn)
                ) =>
            {
                warn!("cannot SCHEDULE a task in {status:?} status");
                continue;
            }
            Some(PatchAction::Withdraw) if status != Some(TaskStatus::Waiting) => {
                warn!("cannot WITHDRAW a task in {status:?} status");
                continue;
            }
            _ => {}
        }

        let record = tasks.entry(flavor.clone()).or_default();
        match patch.action {
            Some(PatchAction::Schedule) => record.status = Some(TaskStatus::ToBeRun),
            Some(PatchAction::Withdraw) => record.status = Some(TaskStatus::Withdrawing),
            None => {}
        }
        if let Some(retries) = patch.remaining_retries_testcase {
            record.remaining_retries_testcase = Some(retries);
        }
        if let Some(retries) = patch.remaining_retries_resource {
            record.remaining_retries_resource = Some(retries);
        }
        debug!("patched task info: {record:?}");
        mutated = true;
    }

    mutated
}

fn audit_locked(state: &mut StoreState, defaults: &RetryDefaults) -> bool {
    let StoreState { tasks, queue } = state;
    let mut mutated = false;

    for (flavor, record) in tasks.iter_mut() {
        match record.status {
            None | Some(TaskStatus::ToBeRun) => {
                queue.push_back(flavor.clone());
                record.status = Some(TaskStatus::Waiting);
                record.remaining_retries_testcase.get_or_insert(defaults.testcase);
                record.remaining_retries_resource.get_or_insert(defaults.resource);
                mutated = true;
            }
            Some(TaskStatus::Waiting) => {
                // Exactly one queue entry per waiting task.
                let mut count = queue.iter().filter(|queued| *queued == flavor).count();
                while count > 1 {
                    info!("remove duplicated \"{flavor}\" from the queue");
                    if let Some(pos) = queue.iter().position(|queued| queued == flavor) {
                        queue.remove(pos);
                    }
                    count -= 1;
                }
                if count == 0 {
                    info!("reinsert missing \"{flavor}\" into the queue");
                    queue.push_back(flavor.clone());
                }
            }
            Some(TaskStatus::Withdrawing) => {
                queue.retain(|queued| queued != flavor);
                record.status = Some(TaskStatus::Withdrawn);
                mutated = true;
            }
            Some(TaskStatus::Running) | Some(TaskStatus::Finished) | Some(TaskStatus::Withdrawn) => {}
        }
    }

    mutated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchRecord;
    use tempfile::TempDir;

    const DEFAULTS: RetryDefaults = RetryDefaults {
        testcase: 2,
        resource: 10,
    };

    fn store_with(dir: &TempDir, content: &str) -> TaskStore {
        let path = dir.path().join("tasklist.toml");
        std::fs::write(&path, content).unwrap();
        TaskStore::load(&path, &DEFAULTS).unwrap()
    }

    fn reload(dir: &TempDir) -> BTreeMap<String, TaskRecord> {
        let content = std::fs::read_to_string(dir.path().join("tasklist.toml")).unwrap();
        toml::from_str(&content).unwrap()
    }

    #[test]
    fn load_applies_counter_defaults_and_saves() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\n");

        let tasks = store.snapshot().unwrap();
        assert_eq!(tasks["fX"].remaining_retries_testcase, Some(2));
        assert_eq!(tasks["fX"].remaining_retries_resource, Some(10));
        assert_eq!(reload(&dir), tasks);
    }

    #[test]
    fn load_preserves_existing_counters() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\nremaining_retries_resource = 4\n");

        let tasks = store.snapshot().unwrap();
        assert_eq!(tasks["fX"].remaining_retries_resource, Some(4));
        assert_eq!(tasks["fX"].remaining_retries_testcase, Some(2));
    }

    #[test]
    fn audit_queues_newborn_tasks_once() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\n[\"fY\"]\nstatus = \"TOBERUN\"\n");

        store.audit(&DEFAULTS).unwrap();
        store.audit(&DEFAULTS).unwrap();

        let tasks = store.snapshot().unwrap();
        assert_eq!(tasks["fX"].status, Some(TaskStatus::Waiting));
        assert_eq!(tasks["fY"].status, Some(TaskStatus::Waiting));
        assert_eq!(store.queue_len().unwrap(), 2);

        let mut popped = vec![
            store.pop_next().unwrap().unwrap(),
            store.pop_next().unwrap().unwrap(),
        ];
        popped.sort();
        assert_eq!(popped, vec!["fX", "fY"]);
        assert_eq!(store.pop_next().unwrap(), None);
    }

    #[test]
    fn audit_reinserts_missing_waiting_task() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\nstatus = \"WAITING\"\n");

        store.audit(&DEFAULTS).unwrap();
        assert_eq!(store.queue_len().unwrap(), 1);
        assert_eq!(store.pop_next().unwrap().as_deref(), Some("fX"));
    }

    #[test]
    fn audit_leaves_running_tasks_alone() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\nstatus = \"RUNNING\"\n");

        store.audit(&DEFAULTS).unwrap();

        assert_eq!(store.queue_len().unwrap(), 0);
        assert_eq!(
            store.snapshot().unwrap()["fX"].status,
            Some(TaskStatus::Running)
        );
    }

    #[test]
    fn withdrawing_tasks_are_purged_and_marked() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\nstatus = \"WAITING\"\n");
        store.audit(&DEFAULTS).unwrap();
        assert_eq!(store.queue_len().unwrap(), 1);

        let patches = PatchSet::from([(
            "fX".to_string(),
            PatchRecord {
                action: Some(PatchAction::Withdraw),
                ..PatchRecord::default()
            },
        )]);
        store.producer_tick(Some(patches), &DEFAULTS).unwrap();

        assert_eq!(store.queue_len().unwrap(), 0);
        assert_eq!(
            store.snapshot().unwrap()["fX"].status,
            Some(TaskStatus::Withdrawn)
        );
    }

    #[test]
    fn schedule_patch_rejected_while_waiting_or_running() {
        let dir = TempDir::new().unwrap();
        let store = store_with(
            &dir,
            "[\"fW\"]\nstatus = \"WAITING\"\n[\"fR\"]\nstatus = \"RUNNING\"\n",
        );

        let patches: PatchSet = ["fW", "fR"]
            .into_iter()
            .map(|flavor| {
                (
                    flavor.to_string(),
                    PatchRecord {
                        action: Some(PatchAction::Schedule),
                        remaining_retries_resource: Some(99),
                        ..PatchRecord::default()
                    },
                )
            })
            .collect();
        store.producer_tick(Some(patches), &DEFAULTS).unwrap();

        let tasks = store.snapshot().unwrap();
        // Rejected entries are skipped entirely, counters included.
        assert_ne!(tasks["fW"].remaining_retries_resource, Some(99));
        assert_ne!(tasks["fR"].remaining_retries_resource, Some(99));
        assert_eq!(tasks["fR"].status, Some(TaskStatus::Running));
    }

    #[test]
    fn schedule_patch_requeues_finished_task() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\nstatus = \"FINISHED\"\n");

        let patches = PatchSet::from([(
            "fX".to_string(),
            PatchRecord {
                action: Some(PatchAction::Schedule),
                remaining_retries_testcase: Some(5),
                ..PatchRecord::default()
            },
        )]);
        store.producer_tick(Some(patches), &DEFAULTS).unwrap();

        let tasks = store.snapshot().unwrap();
        // The same tick's audit already moved it to the queue.
        assert_eq!(tasks["fX"].status, Some(TaskStatus::Waiting));
        assert_eq!(tasks["fX"].remaining_retries_testcase, Some(5));
        assert_eq!(store.queue_len().unwrap(), 1);
    }

    #[test]
    fn withdraw_patch_rejected_unless_waiting() {
        let dir = TempDir::new().unwrap();
        let store = store_with(
            &dir,
            "[\"fT\"]\nstatus = \"TOBERUN\"\n[\"fR\"]\nstatus = \"RUNNING\"\n",
        );

        let patches: PatchSet = ["fT", "fR", "fNew"]
            .into_iter()
            .map(|flavor| {
                (
                    flavor.to_string(),
                    PatchRecord {
                        action: Some(PatchAction::Withdraw),
                        ..PatchRecord::default()
                    },
                )
            })
            .collect();
        store.producer_tick(Some(patches), &DEFAULTS).unwrap();

        let tasks = store.snapshot().unwrap();
        // TOBERUN survived the rejected withdraw and got queued.
        assert_eq!(tasks["fT"].status, Some(TaskStatus::Waiting));
        assert_eq!(tasks["fR"].status, Some(TaskStatus::Running));
        assert!(!tasks.contains_key("fNew"));
    }

    #[test]
    fn actionless_patch_merges_counters_regardless_of_status() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\nstatus = \"RUNNING\"\n");

        let patches = PatchSet::from([(
            "fX".to_string(),
            PatchRecord {
                remaining_retries_testcase: Some(7),
                remaining_retries_resource: Some(8),
                ..PatchRecord::default()
            },
        )]);
        store.producer_tick(Some(patches), &DEFAULTS).unwrap();

        let tasks = store.snapshot().unwrap();
        assert_eq!(tasks["fX"].status, Some(TaskStatus::Running));
        assert_eq!(tasks["fX"].remaining_retries_testcase, Some(7));
        assert_eq!(tasks["fX"].remaining_retries_resource, Some(8));
    }

    #[test]
    fn plain_update_merges_fields() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\n");

        store
            .update(
                "fX",
                TaskUpdate {
                    status: Some(TaskStatus::Running),
                    time_start: Some("2021-12-07 11:17:48".to_string()),
                    ..TaskUpdate::default()
                },
                None,
            )
            .unwrap();

        let tasks = store.snapshot().unwrap();
        assert_eq!(tasks["fX"].status, Some(TaskStatus::Running));
        assert_eq!(reload(&dir), tasks);
    }

    #[test]
    fn retry_update_archives_and_decrements() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\n");

        store
            .update(
                "fX",
                TaskUpdate {
                    status: Some(TaskStatus::Finished),
                    return_code: Some(24),
                    status_code: Some("flavor_azone_occupied".to_string()),
                    test_log: Some("task_1_fX.log".to_string()),
                    ..TaskUpdate::default()
                },
                Some(RetryCounter::Resource),
            )
            .unwrap();

        let tasks = store.snapshot().unwrap();
        let record = &tasks["fX"];
        assert_eq!(record.status, Some(TaskStatus::ToBeRun));
        assert_eq!(record.remaining_retries_resource, Some(9));
        assert_eq!(record.remaining_retries_testcase, Some(2));
        assert_eq!(record.return_code, None);
        assert_eq!(record.history.len(), 1);

        let archived = &record.history[0];
        assert_eq!(archived.status, Some(TaskStatus::Finished));
        assert_eq!(archived.return_code, Some(24));
        assert_eq!(archived.remaining_retries_resource, Some(10));
        assert!(archived.history.is_empty());

        assert_eq!(reload(&dir), tasks);
    }

    #[test]
    fn retry_update_degrades_when_counter_exhausted() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\nremaining_retries_testcase = 0\n");

        store
            .update(
                "fX",
                TaskUpdate {
                    status: Some(TaskStatus::Finished),
                    return_code: Some(15),
                    status_code: Some("test_failed_error_cases".to_string()),
                    ..TaskUpdate::default()
                },
                Some(RetryCounter::Testcase),
            )
            .unwrap();

        let tasks = store.snapshot().unwrap();
        let record = &tasks["fX"];
        assert_eq!(record.status, Some(TaskStatus::Finished));
        assert_eq!(record.return_code, Some(15));
        assert_eq!(record.remaining_retries_testcase, Some(0));
        assert!(record.history.is_empty());
    }

    #[test]
    fn history_accumulates_across_retries() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\n");

        for code in [24, 32] {
            store
                .update(
                    "fX",
                    TaskUpdate {
                        status: Some(TaskStatus::Finished),
                        return_code: Some(code),
                        ..TaskUpdate::default()
                    },
                    Some(RetryCounter::Resource),
                )
                .unwrap();
        }

        let record = &store.snapshot().unwrap()["fX"];
        assert_eq!(record.remaining_retries_resource, Some(8));
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history[0].return_code, Some(24));
        assert_eq!(record.history[1].return_code, Some(32));
    }

    #[test]
    fn file_always_matches_memory() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, "[\"fX\"]\n[\"ecs.g7.large\"]\n");

        store.audit(&DEFAULTS).unwrap();
        assert_eq!(reload(&dir), store.snapshot().unwrap());

        store
            .update(
                "ecs.g7.large",
                TaskUpdate {
                    status: Some(TaskStatus::Finished),
                    return_code: Some(12),
                    ..TaskUpdate::default()
                },
                Some(RetryCounter::Resource),
            )
            .unwrap();
        assert_eq!(reload(&dir), store.snapshot().unwrap());
    }
}
