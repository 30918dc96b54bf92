//! `TaskLedger`: the project-root dot-file recording one [`TaskRecord`] per
//! task id, written via write-temp-then-rename.

use std::{collections::BTreeMap, path::Path};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};

use crate::{clock, fingerprint::Fingerprint, fs::ObjectPath, task::TaskId};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

/// One task's last-known outcome: its input fingerprint at that run, the
/// outputs it was declared to produce, and when it last ran. A task is
/// up-to-date iff `inputs_fingerprint` matches the freshly computed one,
/// `status` is `Succeeded`, and every declared output still exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub inputs_fingerprint: Fingerprint,
    pub outputs: Vec<ObjectPath>,
    pub status: TaskStatus,
    pub last_run_ts: String,
}

impl TaskRecord {
    pub fn succeeded(task_id: TaskId, inputs_fingerprint: Fingerprint, outputs: Vec<ObjectPath>) -> Self {
        Self { task_id, inputs_fingerprint, outputs, status: TaskStatus::Succeeded, last_run_ts: clock::compact() }
    }

    pub fn failed(task_id: TaskId, inputs_fingerprint: Fingerprint, outputs: Vec<ObjectPath>) -> Self {
        Self { task_id, inputs_fingerprint, outputs, status: TaskStatus::Failed, last_run_ts: clock::compact() }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskLedger {
    #[serde(flatten)]
    records: BTreeMap<TaskId, TaskRecord>,
}

impl TaskLedger {
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).context("parse task ledger"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).context("read task ledger"),
        }
    }

    pub async fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context("create task ledger directory")?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let bytes = serde_json::to_vec_pretty(self).context("serialize task ledger")?;
        tokio::fs::write(&tmp, &bytes).await.with_context(|| format!("stage task ledger at {tmp:?}"))?;
        tokio::fs::rename(&tmp, path).await.with_context(|| format!("commit task ledger to {path:?}"))?;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.records.get(task_id)
    }

    pub fn record(&mut self, record: TaskRecord) {
        self.records.insert(record.task_id.clone(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".alto-tasks.json");

        let mut ledger = TaskLedger::default();
        ledger.record(TaskRecord::succeeded("build:tap-x".to_string(), Fingerprint::of_bytes(b"x"), vec!["plugins/tap-x".to_string()]));
        ledger.store(&path).await.unwrap();

        let reloaded = TaskLedger::load(&path).await.unwrap();
        assert_eq!(reloaded.get("build:tap-x").unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TaskLedger::load(&dir.path().join("nope.json")).await.unwrap();
        assert!(ledger.get("anything").is_none());
    }
}
