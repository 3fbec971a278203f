//! Durable device-info and task records.
//!
//! [`DeviceInfoStore`] persists the reconciled device list of a node as one
//! checksummed record. Writes are create-or-update with a short-circuit when
//! the stored record already holds the same content, wrapped in a bounded
//! polling retry. A write that times out is dropped; the next polling cycle
//! produces a fresh one.
//!
//! The same store keeps per-task reset and fault-rank records for the
//! hot-reset path.

use chrono::Utc;
use npu_common::types::{
    PersistedDeviceRecord, TaskDevRecord, TaskFaultInfo, TaskResetInfo, is_virtual_resource_key,
};
use npu_common::PolicyLevel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, RecordBackend};

pub const DEVICE_INFO_KEY_PREFIX: &str = "mindx-dl-deviceinfo-";
pub const RESET_INFO_KEY_PREFIX: &str = "reset-config-";
pub const FAULT_INFO_KEY_PREFIX: &str = "fault-config-";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to encode or decode record: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("gave up after {attempts} attempts: {last_error}")]
    Timeout { attempts: u32, last_error: String },

    #[error("record {key} failed checksum verification")]
    Corrupt { key: String },

    #[error("task {task} rejected: {reason}")]
    Rejected { task: String, reason: String },
}

impl StoreError {
    /// Whether the bounded retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict(_) | StoreError::Marshal(_) => true,
            StoreError::Backend(BackendError::InvalidKey(_)) => false,
            StoreError::Backend(_) => true,
            StoreError::Timeout { .. } | StoreError::Corrupt { .. } | StoreError::Rejected { .. } => false,
        }
    }
}

/// Retry and freshness settings of a [`DeviceInfoStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Pause between write attempts.
    pub interval: Duration,
    /// Give up once this much time has passed since the first attempt.
    pub timeout: Duration,
    /// Unchanged records older than this are rewritten to refresh `updateTime`.
    pub flush_interval: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            flush_interval: Duration::from_secs(3600),
        }
    }
}

impl From<&npu_common::config::StoreConfig> for StoreSettings {
    fn from(config: &npu_common::config::StoreConfig) -> Self {
        Self {
            interval: config.write_interval(),
            timeout: config.write_timeout(),
            flush_interval: config.flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    /// Stored record already matched; nothing was written.
    Unchanged,
}

// ── Checksums ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRecordBody<'a> {
    device_list: &'a BTreeMap<String, String>,
    update_time: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetRecordBody<'a> {
    rank_list: &'a [TaskDevRecord],
    update_time: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FaultRecordBody<'a> {
    fault_rank: &'a [i32],
    update_time: i64,
}

/// Lowercase hex SHA-256 of the JSON encoding of `body`.
pub fn checksum<T: Serialize>(body: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(body)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn device_record_checksum(record: &PersistedDeviceRecord) -> Result<String, serde_json::Error> {
    checksum(&DeviceRecordBody {
        device_list: &record.device_list,
        update_time: record.update_time,
    })
}

/// Persisted reset record of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResetRecord {
    pub rank_list: Vec<TaskDevRecord>,
    pub update_time: i64,
    pub check_code: String,
}

impl TaskResetRecord {
    fn verify(&self) -> Result<bool, serde_json::Error> {
        let expected = checksum(&ResetRecordBody {
            rank_list: &self.rank_list,
            update_time: self.update_time,
        })?;
        Ok(expected == self.check_code)
    }

    /// True if any rank carries the `isolate` policy.
    pub fn has_isolate(&self) -> bool {
        self.rank_list
            .iter()
            .any(|r| r.policy.parse::<PolicyLevel>() == Ok(PolicyLevel::Isolate))
    }
}

/// Persisted fault-rank record of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFaultRecord {
    pub fault_rank: Vec<i32>,
    pub update_time: i64,
    pub check_code: String,
}

impl TaskFaultRecord {
    fn verify(&self) -> Result<bool, serde_json::Error> {
        let expected = checksum(&FaultRecordBody {
            fault_rank: &self.fault_rank,
            update_time: self.update_time,
        })?;
        Ok(expected == self.check_code)
    }
}

// ── Store ──────────────────────────────────────────────────────────────────

pub struct DeviceInfoStore {
    backend: Arc<dyn RecordBackend>,
    node_name: String,
    settings: StoreSettings,
}

impl DeviceInfoStore {
    pub fn new(backend: Arc<dyn RecordBackend>, node_name: impl Into<String>, settings: StoreSettings) -> Self {
        Self {
            backend,
            node_name: node_name.into(),
            settings,
        }
    }

    pub fn settings(&self) -> StoreSettings {
        self.settings
    }

    pub fn device_info_key(&self) -> String {
        format!("{DEVICE_INFO_KEY_PREFIX}{}", self.node_name)
    }

    /// One create-or-update attempt at time `now` (unix seconds).
    pub fn write_once(
        &self,
        device_list: &BTreeMap<String, String>,
        now: i64,
    ) -> Result<(WriteOutcome, PersistedDeviceRecord), StoreError> {
        let key = self.device_info_key();
        let pruned: BTreeMap<String, String> = device_list
            .iter()
            .filter(|(k, _)| !is_virtual_resource_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut record = PersistedDeviceRecord {
            device_list: pruned,
            update_time: now,
            checksum: String::new(),
        };
        record.checksum = device_record_checksum(&record)?;
        let bytes = serde_json::to_vec(&record)?;

        match self.backend.create(&key, &bytes) {
            Ok(()) => {
                info!(key = %key, "device info record created");
                return Ok((WriteOutcome::Created, record));
            }
            Err(BackendError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let current = self.backend.get(&key)?;
        match serde_json::from_slice::<PersistedDeviceRecord>(&current) {
            Ok(existing) => {
                let intact = device_record_checksum(&existing)? == existing.checksum;
                if !intact {
                    warn!(key = %key, "stored device info failed checksum verification, rewriting");
                }
                let age = now.saturating_sub(existing.update_time);
                let fresh = age >= 0 && (age as u64) < self.settings.flush_interval.as_secs();
                if intact && fresh && existing.device_list == record.device_list {
                    debug!(key = %key, "device info unchanged, skipping write");
                    return Ok((WriteOutcome::Unchanged, existing));
                }
            }
            Err(e) => warn!(key = %key, error = %e, "stored device info unreadable, rewriting"),
        }

        match self.backend.update(&key, &bytes) {
            Ok(()) => Ok((WriteOutcome::Updated, record)),
            Err(BackendError::NotFound(_)) => Err(StoreError::Conflict(key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `device_list`, retrying every `interval` until `timeout`.
    pub async fn write(
        &self,
        device_list: &BTreeMap<String, String>,
    ) -> Result<(WriteOutcome, PersistedDeviceRecord), StoreError> {
        let deadline = Instant::now() + self.settings.timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.write_once(device_list, Utc::now().timestamp()) {
                Ok(result) => {
                    if attempts > 1 {
                        debug!(attempts, "device info written after retry");
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    if Instant::now() + self.settings.interval > deadline {
                        return Err(StoreError::Timeout {
                            attempts,
                            last_error: e.to_string(),
                        });
                    }
                    debug!(attempt = attempts, error = %e, "device info write failed, retrying");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.settings.interval).await;
        }
    }

    /// Current device info record, if any.
    pub fn read(&self) -> Result<Option<PersistedDeviceRecord>, StoreError> {
        let key = self.device_info_key();
        let bytes = match self.backend.get(&key) {
            Ok(bytes) => bytes,
            Err(BackendError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: PersistedDeviceRecord = serde_json::from_slice(&bytes)?;
        if device_record_checksum(&record)? != record.checksum {
            return Err(StoreError::Corrupt { key });
        }
        Ok(Some(record))
    }

    /// Replace the record with an empty device list.
    pub async fn reset(&self) -> Result<PersistedDeviceRecord, StoreError> {
        info!(node = %self.node_name, "resetting device info record");
        self.write(&BTreeMap::new()).await.map(|(_, record)| record)
    }

    fn upsert(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        match self.backend.create(key, bytes) {
            Ok(()) => Ok(()),
            Err(BackendError::AlreadyExists(_)) => match self.backend.update(key, bytes) {
                Ok(()) => Ok(()),
                Err(BackendError::NotFound(_)) => Err(StoreError::Conflict(key.to_string())),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    // ── Task records ───────────────────────────────────────────────────────

    /// Persist the reset rank list of `task`.
    ///
    /// A list holding non-isolate ranks is refused once the stored record
    /// carries an `isolate` rank: such a task has to be rescheduled, not
    /// reset. Isolate-only lists refresh the record.
    pub fn write_reset_info(&self, task: &str, info: &TaskResetInfo) -> Result<TaskResetRecord, StoreError> {
        let key = format!("{RESET_INFO_KEY_PREFIX}{task}");
        let isolate_only = info.rank_list.iter().all(|d| d.policy == PolicyLevel::Isolate);
        if !isolate_only
            && let Some(existing) = self.read_reset_info(task)?
            && existing.has_isolate()
        {
            return Err(StoreError::Rejected {
                task: task.to_string(),
                reason: "task should be rescheduled".to_string(),
            });
        }

        let rank_list: Vec<TaskDevRecord> = info.rank_list.iter().map(|d| d.to_record()).collect();
        let update_time = if info.update_time > 0 {
            info.update_time
        } else {
            Utc::now().timestamp()
        };
        let check_code = checksum(&ResetRecordBody {
            rank_list: &rank_list,
            update_time,
        })?;
        let record = TaskResetRecord {
            rank_list,
            update_time,
            check_code,
        };
        self.upsert(&key, &serde_json::to_vec(&record)?)?;
        debug!(task, ranks = record.rank_list.len(), "reset info written");
        Ok(record)
    }

    pub fn read_reset_info(&self, task: &str) -> Result<Option<TaskResetRecord>, StoreError> {
        let key = format!("{RESET_INFO_KEY_PREFIX}{task}");
        let bytes = match self.backend.get(&key) {
            Ok(bytes) => bytes,
            Err(BackendError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: TaskResetRecord = serde_json::from_slice(&bytes)?;
        if !record.verify()? {
            return Err(StoreError::Corrupt { key });
        }
        Ok(Some(record))
    }

    /// Persist the fault ranks of `task`.
    pub fn write_fault_info(&self, task: &str, info: &TaskFaultInfo) -> Result<TaskFaultRecord, StoreError> {
        let key = format!("{FAULT_INFO_KEY_PREFIX}{task}");
        let update_time = if info.update_time > 0 {
            info.update_time
        } else {
            Utc::now().timestamp()
        };
        let check_code = checksum(&FaultRecordBody {
            fault_rank: &info.fault_rank,
            update_time,
        })?;
        let record = TaskFaultRecord {
            fault_rank: info.fault_rank.clone(),
            update_time,
            check_code,
        };
        self.upsert(&key, &serde_json::to_vec(&record)?)?;
        debug!(task, fault_ranks = ?record.fault_rank, "fault info written");
        Ok(record)
    }

    pub fn read_fault_info(&self, task: &str) -> Result<Option<TaskFaultRecord>, StoreError> {
        let key = format!("{FAULT_INFO_KEY_PREFIX}{task}");
        let bytes = match self.backend.get(&key) {
            Ok(bytes) => bytes,
            Err(BackendError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: TaskFaultRecord = serde_json::from_slice(&bytes)?;
        if !record.verify()? {
            return Err(StoreError::Corrupt { key });
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use npu_common::types::{RecoverStatus, TaskDevInfo};

    fn settings() -> StoreSettings {
        StoreSettings {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
            flush_interval: Duration::from_secs(3600),
        }
    }

    fn store(backend: Arc<MemoryBackend>) -> DeviceInfoStore {
        DeviceInfoStore::new(backend, "node1", settings())
    }

    fn list() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("huawei.com/Ascend910".to_string(), "Ascend910-1".to_string()),
            ("huawei.com/Ascend910-Unhealthy".to_string(), "Ascend910-0".to_string()),
            ("huawei.com/Ascend910-2c".to_string(), "Ascend910-2c-100-1".to_string()),
        ])
    }

    fn dev(rank_id: i32, logical_id: i32, policy: PolicyLevel) -> TaskDevInfo {
        TaskDevInfo {
            rank_id,
            logical_id,
            status: RecoverStatus::Unrecovered,
            policy,
            initial_policy: policy,
            error_codes: vec![],
        }
    }

    #[test]
    fn test_first_write_creates_and_prunes_virtual_keys() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone());

        let (outcome, record) = store.write_once(&list(), 1000).unwrap();
        assert_eq!(outcome, WriteOutcome::Created);
        assert!(!record.device_list.contains_key("huawei.com/Ascend910-2c"));
        assert_eq!(record.device_list.len(), 2);
        assert_eq!(record.checksum.len(), 64);
        assert_eq!(store.read().unwrap(), Some(record));
    }

    #[test]
    fn test_identical_write_short_circuits() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone());

        store.write_once(&list(), 1000).unwrap();
        let (outcome, record) = store.write_once(&list(), 1005).unwrap();
        assert_eq!(outcome, WriteOutcome::Unchanged);
        assert_eq!(record.update_time, 1000);
        assert_eq!(backend.update_count(), 0);
    }

    #[test]
    fn test_changed_content_updates() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone());

        store.write_once(&list(), 1000).unwrap();
        let mut changed = list();
        changed.insert("huawei.com/Ascend910".to_string(), String::new());
        let (outcome, _) = store.write_once(&changed, 1001).unwrap();
        assert_eq!(outcome, WriteOutcome::Updated);
        assert_eq!(backend.update_count(), 1);
    }

    #[test]
    fn test_stale_unchanged_record_is_flushed() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone());

        store.write_once(&list(), 1000).unwrap();
        let (outcome, record) = store.write_once(&list(), 1000 + 3600).unwrap();
        assert_eq!(outcome, WriteOutcome::Updated);
        assert_eq!(record.update_time, 4600);
    }

    #[test]
    fn test_tampered_record_is_rewritten_and_read_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone());

        let (_, mut record) = store.write_once(&list(), 1000).unwrap();
        record.checksum = "0".repeat(64);
        backend.insert_raw(&store.device_info_key(), &serde_json::to_vec(&record).unwrap());
        assert!(matches!(store.read(), Err(StoreError::Corrupt { .. })));

        let (outcome, _) = store.write_once(&list(), 1001).unwrap();
        assert_eq!(outcome, WriteOutcome::Updated);
        assert!(store.read().unwrap().is_some());
    }

    #[test]
    fn test_read_missing_record() {
        let store = store(Arc::new(MemoryBackend::new()));
        assert_eq!(store.read().unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_retries_transient_failures() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone());
        backend.fail_next(2);

        let (outcome, _) = store.write(&list()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Created);
        assert_eq!(backend.create_count(), 3);
    }

    #[tokio::test]
    async fn test_write_times_out() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone());
        backend.fail_next(1000);

        let err = store.write(&list()).await.unwrap_err();
        match err {
            StoreError::Timeout { attempts, .. } => assert!(attempts >= 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_reset_writes_empty_list() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone());
        store.write(&list()).await.unwrap();

        let record = store.reset().await.unwrap();
        assert!(record.device_list.is_empty());
        assert!(store.read().unwrap().unwrap().device_list.is_empty());
    }

    #[test]
    fn test_reset_info_round_trip() {
        let store = store(Arc::new(MemoryBackend::new()));
        let info = TaskResetInfo {
            rank_list: vec![dev(0, 0, PolicyLevel::Reset), dev(1, 1, PolicyLevel::Reset)],
            update_time: 42,
        };
        let written = store.write_reset_info("default-job1", &info).unwrap();
        assert_eq!(written.rank_list[0].policy, "reset");
        assert_eq!(store.read_reset_info("default-job1").unwrap(), Some(written));
        assert_eq!(store.read_reset_info("other").unwrap(), None);
    }

    #[test]
    fn test_isolated_task_rejects_new_reset() {
        let store = store(Arc::new(MemoryBackend::new()));
        let isolated = TaskResetInfo {
            rank_list: vec![dev(0, 0, PolicyLevel::Isolate)],
            update_time: 1,
        };
        store.write_reset_info("job", &isolated).unwrap();

        let err = store
            .write_reset_info(
                "job",
                &TaskResetInfo {
                    rank_list: vec![dev(0, 0, PolicyLevel::Reset)],
                    update_time: 2,
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));

        // Clearing the list is still allowed.
        store.write_reset_info("job", &TaskResetInfo::default()).unwrap();
    }

    #[test]
    fn test_isolated_task_record_can_be_refreshed() {
        let store = store(Arc::new(MemoryBackend::new()));
        let isolated = |update_time| TaskResetInfo {
            rank_list: vec![dev(2, 2, PolicyLevel::Isolate)],
            update_time,
        };
        store.write_reset_info("job", &isolated(1)).unwrap();

        let refreshed = store.write_reset_info("job", &isolated(5)).unwrap();
        assert_eq!(refreshed.update_time, 5);
        assert!(refreshed.has_isolate());
        assert_eq!(store.read_reset_info("job").unwrap(), Some(refreshed));
    }

    #[test]
    fn test_fault_info_round_trip() {
        let store = store(Arc::new(MemoryBackend::new()));
        let info = TaskFaultInfo {
            fault_rank: vec![0, 1, 2, 3],
            update_time: 7,
        };
        let written = store.write_fault_info("job", &info).unwrap();
        assert_eq!(store.read_fault_info("job").unwrap(), Some(written));
    }

    #[test]
    fn test_retryability() {
        assert!(StoreError::Conflict("k".into()).is_retryable());
        assert!(StoreError::Backend(BackendError::Unavailable("x".into())).is_retryable());
        assert!(!StoreError::Backend(BackendError::InvalidKey("a/b".into())).is_retryable());
        assert!(!StoreError::Corrupt { key: "k".into() }.is_retryable());
    }
}
