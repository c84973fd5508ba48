//! Task records and their lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Eligible for queueing on the next producer tick
    ToBeRun,
    /// Queued, not yet picked up by a worker
    Waiting,
    /// An executor attempt is in flight
    Running,
    /// Terminal: the last attempt has been classified
    Finished,
    /// Marked for removal from the queue
    Withdrawing,
    /// Terminal: removed before any attempt started
    Withdrawn,
}

/// Which retry budget a failed attempt draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCounter {
    /// Flaky-test budget
    Testcase,
    /// Cloud/container shortage budget
    Resource,
}

/// One task in the list, keyed by its flavor.
///
/// Every field is optional so that an empty TOML table is a valid
/// newborn task. `history` holds a snapshot of the record as it stood
/// before each retry, oldest first; snapshots never nest their own
/// history. The field stays last so scalar keys precede the
/// array-of-tables in the serialized file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_retries_testcase: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_retries_resource: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_stop: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_log: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<TaskRecord>,
}

/// Field updates merged into a record by [`crate::TaskStore::update`].
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub time_start: Option<String>,
    pub time_stop: Option<String>,
    pub time_used: Option<String>,
    pub return_code: Option<i32>,
    pub status_code: Option<String>,
    pub test_log: Option<String>,
}

impl TaskUpdate {
    /// Merge the set fields into the record.
    pub fn merge_into(&self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = Some(status);
        }
        if let Some(time_start) = &self.time_start {
            record.time_start = Some(time_start.clone());
        }
        if let Some(time_stop) = &self.time_stop {
            record.time_stop = Some(time_stop.clone());
        }
        if let Some(time_used) = &self.time_used {
            record.time_used = Some(time_used.clone());
        }
        if let Some(return_code) = self.return_code {
            record.return_code = Some(return_code);
        }
        if let Some(status_code) = &self.status_code {
            record.status_code = Some(status_code.clone());
        }
        if let Some(test_log) = &self.test_log {
            record.test_log = Some(test_log.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(
            toml::to_string(&BTreeMap::from([("s", TaskStatus::ToBeRun)])).unwrap(),
            "s = \"TOBERUN\"\n"
        );
        assert_eq!(
            toml::to_string(&BTreeMap::from([("s", TaskStatus::Withdrawing)])).unwrap(),
            "s = \"WITHDRAWING\"\n"
        );
    }

    #[test]
    fn empty_table_is_a_valid_record() {
        let tasks: BTreeMap<String, TaskRecord> =
            toml::from_str("[\"ecs.g7.large\"]\n").unwrap();
        assert_eq!(tasks["ecs.g7.large"], TaskRecord::default());
    }

    #[test]
    fn record_round_trips_through_toml() {
        let record = TaskRecord {
            status: Some(TaskStatus::Finished),
            remaining_retries_testcase: Some(2),
            remaining_retries_resource: Some(9),
            time_start: Some("2021-12-07 11:17:48".to_string()),
            time_stop: Some("2021-12-07 11:18:00".to_string()),
            time_used: Some("11.76".to_string()),
            return_code: Some(0),
            status_code: Some("test_passed".to_string()),
            test_log: Some("task_211207111748_ecs.t5-lc2m1.nano.log".to_string()),
            history: vec![TaskRecord {
                status: Some(TaskStatus::Finished),
                return_code: Some(24),
                status_code: Some("flavor_azone_occupied".to_string()),
                ..TaskRecord::default()
            }],
        };
        let tasks = BTreeMap::from([("ecs.t5-lc2m1.nano".to_string(), record)]);

        let text = toml::to_string(&tasks).unwrap();
        let reloaded: BTreeMap<String, TaskRecord> = toml::from_str(&text).unwrap();

        assert_eq!(reloaded, tasks);
    }

    #[test]
    fn merge_overwrites_only_set_fields() {
        let mut record = TaskRecord {
            status: Some(TaskStatus::Waiting),
            remaining_retries_resource: Some(10),
            ..TaskRecord::default()
        };

        TaskUpdate {
            status: Some(TaskStatus::Running),
            time_start: Some("2021-12-07 11:17:48".to_string()),
            ..TaskUpdate::default()
        }
        .merge_into(&mut record);

        assert_eq!(record.status, Some(TaskStatus::Running));
        assert_eq!(record.time_start.as_deref(), Some("2021-12-07 11:17:48"));
        assert_eq!(record.remaining_retries_resource, Some(10));
        assert_eq!(record.return_code, None);
    }
}
