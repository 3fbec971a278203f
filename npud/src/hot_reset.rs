//! Hot-reset coordination.
//!
//! Maps device faults to task-level remediation. Devices are wired in
//! fixed-size rings; a fault needing a restart or reset marks the whole
//! ring, never a single device. In-flight resets are tracked per task and per
//! device so two remediations never touch the same hardware at once.
//!
//! Each cache lives behind its own mutex. Operations that touch two caches
//! (classify, then mark in reset) are two critical sections, and callers
//! must not assume atomicity across them.

use chrono::Utc;
use npu_common::config::HotResetMode;
use npu_common::types::{
    ChipKind, Device, FaultInfo, RecoverStatus, TaskDevInfo, TaskDevRecord, TaskFaultInfo, TaskResetInfo,
};
use npu_common::{FaultType, PolicyLevel, PolicyRegistry};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Rank index of inference tasks; every device shares one rank.
pub const INFER_RANK_INDEX: &str = "-1";

pub const ASCEND910_RING_SIZE: usize = 4;
pub const ASCEND910B_TRAIN_RING_SIZE: usize = 8;
pub const ASCEND910B_INFER_RING_SIZE: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HotResetError {
    #[error("task {0} is not in the task fault cache")]
    UnknownTask(String),

    #[error("invalid policy '{policy}' on device {logical_id} of task {task}")]
    InvalidDevicePolicy {
        task: String,
        logical_id: i32,
        policy: String,
    },

    #[error("device {0} is not in the global fault cache")]
    DeviceNotInGlobalCache(i32),

    #[error("{0} input is absent")]
    NilInput(&'static str),

    #[error("{0} is already in reset")]
    AlreadyInProgress(String),

    #[error("{0} is not in reset")]
    NotInReset(String),

    #[error("invalid rank index '{0}'")]
    InvalidRankIndex(String),

    #[error("hot reset mode {mode} is not supported on {chip}")]
    Unsupported { chip: ChipKind, mode: HotResetMode },
}

/// Devices per ring for a chip family and workload mode.
pub fn ring_size(chip: ChipKind, mode: HotResetMode) -> Option<usize> {
    match (chip, mode) {
        (ChipKind::Ascend910, HotResetMode::Train) => Some(ASCEND910_RING_SIZE),
        (ChipKind::Ascend910B, HotResetMode::Train) => Some(ASCEND910B_TRAIN_RING_SIZE),
        (ChipKind::Ascend910B, HotResetMode::Infer) => Some(ASCEND910B_INFER_RING_SIZE),
        _ => None,
    }
}

// ── States ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Normal,
    FaultDetected(PolicyLevel),
    InReset,
    /// Terminal until manual intervention.
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Normal,
    ResetPending,
    InReset,
    Recovered,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Normal => write!(f, "normal"),
            TaskState::ResetPending => write!(f, "reset_pending"),
            TaskState::InReset => write!(f, "in_reset"),
            TaskState::Recovered => write!(f, "recovered"),
        }
    }
}

/// Resolved remediation for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationPlan {
    pub task: String,
    pub policy: PolicyLevel,
    /// Devices the action covers, re-tagged with `policy`.
    pub reset_info: TaskResetInfo,
    pub fault_info: TaskFaultInfo,
}

impl RemediationPlan {
    /// Isolation is reported, never reset.
    pub fn requires_reset(&self) -> bool {
        self.policy.needs_ring_reset() && !self.reset_info.rank_list.is_empty()
    }

    pub fn logical_ids(&self) -> Vec<i32> {
        self.reset_info.logical_ids().collect()
    }
}

// ── Coordinator ────────────────────────────────────────────────────────────

pub struct HotResetCoordinator {
    ring_size: usize,
    registry: Arc<PolicyRegistry>,
    reset_tasks: Mutex<BTreeSet<String>>,
    reset_devices: Mutex<BTreeSet<i32>>,
    global_dev_fault_info: Mutex<BTreeMap<i32, FaultInfo>>,
    all_task_dev_list: Mutex<BTreeMap<String, Vec<i32>>>,
    all_task_dev_fault_info: Mutex<BTreeMap<String, Vec<TaskDevInfo>>>,
    task_namespace: Mutex<BTreeMap<String, String>>,
    fault_dev_task: Mutex<BTreeMap<i32, String>>,
    recovered_tasks: Mutex<BTreeSet<String>>,
}

impl HotResetCoordinator {
    pub fn new(chip: ChipKind, mode: HotResetMode, registry: Arc<PolicyRegistry>) -> Result<Self, HotResetError> {
        let size = ring_size(chip, mode).ok_or(HotResetError::Unsupported { chip, mode })?;
        info!(%chip, %mode, ring_size = size, "hot reset coordinator ready");
        Ok(Self::with_ring_size(size, registry))
    }

    /// Coordinator with an explicit ring size (at least 1).
    pub fn with_ring_size(ring_size: usize, registry: Arc<PolicyRegistry>) -> Self {
        Self {
            ring_size: ring_size.max(1),
            registry,
            reset_tasks: Mutex::default(),
            reset_devices: Mutex::default(),
            global_dev_fault_info: Mutex::default(),
            all_task_dev_list: Mutex::default(),
            all_task_dev_fault_info: Mutex::default(),
            task_namespace: Mutex::default(),
            fault_dev_task: Mutex::default(),
            recovered_tasks: Mutex::default(),
        }
    }

    pub fn ring_size(&self) -> usize {
        self.ring_size
    }

    fn ring_of(&self, logical_id: i32) -> i32 {
        logical_id.div_euclid(self.ring_size as i32)
    }

    // ── Classification ─────────────────────────────────────────────────────

    pub fn classify_device_policy(&self, fault_type: FaultType) -> PolicyLevel {
        PolicyLevel::from_fault_type(fault_type)
    }

    /// Classify one device over both its fault axes.
    pub fn fault_info_for(&self, device: &Device) -> FaultInfo {
        let fault_type = self
            .registry
            .classify(&device.fault_codes)
            .max(self.registry.classify_network(&device.network_fault_codes));
        FaultInfo {
            logical_id: device.logical_id,
            fault_type,
            policy: self.classify_device_policy(fault_type),
            error_codes: device.fault_codes.iter().copied().collect(),
        }
    }

    /// Highest-severity policy across the task's devices, with its level.
    pub fn resolve_task_policy(&self, task: &str) -> Result<(PolicyLevel, u8), HotResetError> {
        let cache = self.all_task_dev_fault_info.lock().unwrap_or_else(|e| e.into_inner());
        let devices = cache
            .get(task)
            .ok_or_else(|| HotResetError::UnknownTask(task.to_string()))?;
        let policy = devices
            .iter()
            .map(|d| d.policy)
            .max()
            .unwrap_or(PolicyLevel::Empty);
        Ok((policy, policy.level()))
    }

    /// Rebuild typed task devices from persisted records.
    pub fn task_dev_info_from_records(
        &self,
        task: &str,
        records: &[TaskDevRecord],
    ) -> Result<Vec<TaskDevInfo>, HotResetError> {
        let parse = |record: &TaskDevRecord, raw: &str| {
            raw.parse::<PolicyLevel>().map_err(|_| HotResetError::InvalidDevicePolicy {
                task: task.to_string(),
                logical_id: record.logical_id,
                policy: raw.to_string(),
            })
        };
        records
            .iter()
            .map(|record| {
                Ok(TaskDevInfo {
                    rank_id: record.rank_id,
                    logical_id: record.logical_id,
                    status: record.status,
                    policy: parse(record, &record.policy)?,
                    initial_policy: parse(record, &record.initial_policy)?,
                    error_codes: record.error_codes.clone(),
                })
            })
            .collect()
    }

    // ── Ring expansion ─────────────────────────────────────────────────────

    /// Logical ids of devices whose policy is at least `level`.
    pub fn get_dev_list_by_policy_level(&self, devices: &[TaskDevInfo], level: PolicyLevel) -> BTreeSet<i32> {
        devices
            .iter()
            .filter(|d| d.policy >= level)
            .map(|d| d.logical_id)
            .collect()
    }

    fn faulty_rings(&self, devices: &[TaskDevInfo]) -> BTreeSet<i32> {
        devices
            .iter()
            .filter(|d| d.policy.needs_ring_reset())
            .map(|d| self.ring_of(d.logical_id))
            .collect()
    }

    /// Every logical id in every ring holding a device that needs a reset.
    pub fn get_need_reset_dev_list(&self, devices: &[TaskDevInfo]) -> BTreeSet<i32> {
        let size = self.ring_size as i64;
        self.faulty_rings(devices)
            .into_iter()
            .flat_map(|ring| {
                let start = i64::from(ring) * size;
                (start..start + size).filter_map(|id| i32::try_from(id).ok())
            })
            .collect()
    }

    /// Task devices inside faulty rings, re-tagged for the remediation action.
    pub fn get_task_reset_info(
        &self,
        devices: &[TaskDevInfo],
        policy: PolicyLevel,
        initial_policy: PolicyLevel,
        status: RecoverStatus,
    ) -> TaskResetInfo {
        let rings = self.faulty_rings(devices);
        let rank_list = devices
            .iter()
            .filter(|d| rings.contains(&self.ring_of(d.logical_id)))
            .map(|d| TaskDevInfo {
                policy,
                initial_policy,
                status,
                ..d.clone()
            })
            .collect();
        TaskResetInfo {
            rank_list,
            update_time: Utc::now().timestamp(),
        }
    }

    /// Rank ids of task devices inside faulty rings.
    pub fn get_task_fault_rank_info(&self, devices: &[TaskDevInfo]) -> TaskFaultInfo {
        let rings = self.faulty_rings(devices);
        TaskFaultInfo {
            fault_rank: devices
                .iter()
                .filter(|d| rings.contains(&self.ring_of(d.logical_id)))
                .map(|d| d.rank_id)
                .collect(),
            update_time: Utc::now().timestamp(),
        }
    }

    /// Build the task device list of a pod from the global fault cache.
    ///
    /// Ids are sorted; rank ids form a contiguous block starting at
    /// `rank_index * device_count`. Inference tasks (`"-1"`) give every
    /// device rank `-1`.
    pub fn generate_task_dev_fault_info_list(
        &self,
        dev_ids: &[i32],
        rank_index: &str,
    ) -> Result<Vec<TaskDevInfo>, HotResetError> {
        let rank_start: i32 = rank_index
            .trim()
            .parse()
            .map_err(|_| HotResetError::InvalidRankIndex(rank_index.to_string()))?;
        let infer = rank_index.trim() == INFER_RANK_INDEX;
        if rank_start < 0 && !infer {
            return Err(HotResetError::InvalidRankIndex(rank_index.to_string()));
        }

        let mut sorted = dev_ids.to_vec();
        sorted.sort_unstable();
        let count = sorted.len() as i32;

        let cache = self.global_dev_fault_info.lock().unwrap_or_else(|e| e.into_inner());
        sorted
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let fault = cache.get(id).ok_or(HotResetError::DeviceNotInGlobalCache(*id))?;
                let rank_id = if infer { rank_start } else { rank_start * count + index as i32 };
                Ok(TaskDevInfo {
                    rank_id,
                    logical_id: *id,
                    status: RecoverStatus::Unrecovered,
                    policy: fault.policy,
                    initial_policy: fault.policy,
                    error_codes: fault.error_codes.clone(),
                })
            })
            .collect()
    }

    // ── Cache replacement ──────────────────────────────────────────────────

    pub fn update_global_dev_fault_info_cache(
        &self,
        faults: Option<BTreeMap<i32, FaultInfo>>,
    ) -> Result<(), HotResetError> {
        let faults = faults
            .filter(|f| !f.is_empty())
            .ok_or(HotResetError::NilInput("device fault info"))?;
        *self.global_dev_fault_info.lock().unwrap_or_else(|e| e.into_inner()) = faults;
        Ok(())
    }

    /// Classify physical devices and replace the global fault cache.
    pub fn refresh_global_dev_fault_info(&self, devices: &[Device]) -> Result<(), HotResetError> {
        let faults: BTreeMap<i32, FaultInfo> = devices
            .iter()
            .filter(|d| !d.is_virtual())
            .map(|d| (d.logical_id, self.fault_info_for(d)))
            .collect();
        self.update_global_dev_fault_info_cache(Some(faults))
    }

    pub fn global_fault_info(&self, logical_id: i32) -> Option<FaultInfo> {
        self.global_dev_fault_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&logical_id)
            .cloned()
    }

    pub fn update_task_dev_list_cache(&self, lists: Option<BTreeMap<String, Vec<i32>>>) -> Result<(), HotResetError> {
        let lists = lists.ok_or(HotResetError::NilInput("task device list"))?;
        *self.all_task_dev_list.lock().unwrap_or_else(|e| e.into_inner()) = lists;
        Ok(())
    }

    pub fn update_task_dev_fault_info_cache(
        &self,
        infos: Option<BTreeMap<String, Vec<TaskDevInfo>>>,
    ) -> Result<(), HotResetError> {
        let infos = infos.ok_or(HotResetError::NilInput("task device fault info"))?;
        *self.all_task_dev_fault_info.lock().unwrap_or_else(|e| e.into_inner()) = infos;
        Ok(())
    }

    pub fn update_task_namespace_cache(&self, namespaces: Option<BTreeMap<String, String>>) -> Result<(), HotResetError> {
        let namespaces = namespaces.ok_or(HotResetError::NilInput("task namespace"))?;
        *self.task_namespace.lock().unwrap_or_else(|e| e.into_inner()) = namespaces;
        Ok(())
    }

    pub fn task_namespace(&self, task: &str) -> Option<String> {
        self.task_namespace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task)
            .cloned()
    }

    pub fn task_dev_fault_info(&self, task: &str) -> Result<Vec<TaskDevInfo>, HotResetError> {
        self.all_task_dev_fault_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task)
            .cloned()
            .ok_or_else(|| HotResetError::UnknownTask(task.to_string()))
    }

    /// Forget in-reset tasks that no longer hold devices.
    pub fn update_free_task(&self, active_tasks: &BTreeSet<String>) {
        let mut tasks = self.reset_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| {
            let keep = active_tasks.contains(task);
            if !keep {
                info!(task = %task, "task gone, dropping reset mark");
            }
            keep
        });
        drop(tasks);
        self.recovered_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|task| active_tasks.contains(task));
    }

    // ── Fault device ownership ─────────────────────────────────────────────

    /// Remember which task owns each faulty device; forget healthy ones.
    pub fn update_fault_dev_task_map(&self, dev_ids: &[i32], task: &str) {
        let global = self.global_dev_fault_info.lock().unwrap_or_else(|e| e.into_inner());
        let faulty: Vec<(i32, bool)> = dev_ids
            .iter()
            .map(|id| (*id, global.get(id).is_some_and(|f| f.policy.is_fault())))
            .collect();
        drop(global);

        let mut map = self.fault_dev_task.lock().unwrap_or_else(|e| e.into_inner());
        for (id, is_faulty) in faulty {
            if is_faulty {
                map.insert(id, task.to_string());
            } else {
                map.remove(&id);
            }
        }
    }

    pub fn has_faulty_device_in_task(&self, task: &str) -> bool {
        let known = self
            .all_task_dev_list
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task);
        if !known {
            warn!(task, "task not in device list cache");
            return false;
        }
        self.fault_dev_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|owner| owner == task)
    }

    // ── In-reset marks ─────────────────────────────────────────────────────

    pub fn set_task_in_reset(&self, task: &str) -> Result<(), HotResetError> {
        let mut tasks = self.reset_tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.insert(task.to_string()) {
            return Err(HotResetError::AlreadyInProgress(format!("task {task}")));
        }
        Ok(())
    }

    pub fn unset_task_in_reset(&self, task: &str) -> Result<(), HotResetError> {
        let mut tasks = self.reset_tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.remove(task) {
            return Err(HotResetError::NotInReset(format!("task {task}")));
        }
        Ok(())
    }

    pub fn set_dev_in_reset(&self, logical_id: i32) -> Result<(), HotResetError> {
        let mut devices = self.reset_devices.lock().unwrap_or_else(|e| e.into_inner());
        if !devices.insert(logical_id) {
            return Err(HotResetError::AlreadyInProgress(format!("device {logical_id}")));
        }
        Ok(())
    }

    pub fn unset_dev_in_reset(&self, logical_id: i32) -> Result<(), HotResetError> {
        let mut devices = self.reset_devices.lock().unwrap_or_else(|e| e.into_inner());
        if !devices.remove(&logical_id) {
            return Err(HotResetError::NotInReset(format!("device {logical_id}")));
        }
        Ok(())
    }

    /// Mark every device of `info`, or none if any is already marked.
    pub fn set_all_dev_in_reset(&self, info: &TaskResetInfo) -> Result<(), HotResetError> {
        let ids: BTreeSet<i32> = info.logical_ids().collect();
        let mut devices = self.reset_devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = ids.iter().find(|id| devices.contains(id)) {
            return Err(HotResetError::AlreadyInProgress(format!("device {busy}")));
        }
        devices.extend(ids);
        Ok(())
    }

    /// Unmark every device of `info`, or none if any is not marked.
    pub fn unset_all_dev_in_reset(&self, info: &TaskResetInfo) -> Result<(), HotResetError> {
        let ids: BTreeSet<i32> = info.logical_ids().collect();
        let mut devices = self.reset_devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idle) = ids.iter().find(|id| !devices.contains(id)) {
            return Err(HotResetError::NotInReset(format!("device {idle}")));
        }
        for id in &ids {
            devices.remove(id);
        }
        Ok(())
    }

    pub fn is_task_in_reset(&self, task: &str) -> bool {
        self.reset_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(task)
    }

    pub fn is_dev_in_reset(&self, logical_id: i32) -> bool {
        self.reset_devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&logical_id)
    }

    pub fn devices_in_reset(&self) -> BTreeSet<i32> {
        self.reset_devices.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ── State queries ──────────────────────────────────────────────────────

    pub fn device_state(&self, logical_id: i32) -> DeviceState {
        if self.is_dev_in_reset(logical_id) {
            return DeviceState::InReset;
        }
        match self.global_fault_info(logical_id).map(|f| f.policy) {
            Some(PolicyLevel::Isolate) => DeviceState::Isolated,
            Some(policy) if policy.is_fault() => DeviceState::FaultDetected(policy),
            _ => DeviceState::Normal,
        }
    }

    pub fn task_state(&self, task: &str) -> TaskState {
        if self.is_task_in_reset(task) {
            return TaskState::InReset;
        }
        if let Ok((policy, _)) = self.resolve_task_policy(task)
            && policy.needs_ring_reset()
        {
            return TaskState::ResetPending;
        }
        let recovered = self
            .recovered_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(task);
        if recovered { TaskState::Recovered } else { TaskState::Normal }
    }

    // ── Remediation ────────────────────────────────────────────────────────

    /// Resolve the remediation `task` needs, if any.
    pub fn plan_remediation(&self, task: &str) -> Result<Option<RemediationPlan>, HotResetError> {
        let devices = self.task_dev_fault_info(task)?;
        let (policy, level) = self.resolve_task_policy(task)?;
        if !policy.is_fault() {
            return Ok(None);
        }
        debug!(task, %policy, level, "task needs remediation");

        let plan = if policy == PolicyLevel::Isolate {
            let isolated: Vec<TaskDevInfo> = devices
                .iter()
                .filter(|d| d.policy == PolicyLevel::Isolate)
                .cloned()
                .collect();
            let now = Utc::now().timestamp();
            RemediationPlan {
                task: task.to_string(),
                policy,
                fault_info: TaskFaultInfo {
                    fault_rank: isolated.iter().map(|d| d.rank_id).collect(),
                    update_time: now,
                },
                reset_info: TaskResetInfo {
                    rank_list: isolated,
                    update_time: now,
                },
            }
        } else {
            RemediationPlan {
                task: task.to_string(),
                policy,
                reset_info: self.get_task_reset_info(&devices, policy, policy, RecoverStatus::Unrecovered),
                fault_info: self.get_task_fault_rank_info(&devices),
            }
        };
        Ok(Some(plan))
    }

    /// Mark the task and all its plan devices in reset, or nothing.
    pub fn begin_reset(&self, plan: &RemediationPlan) -> Result<(), HotResetError> {
        self.set_task_in_reset(&plan.task)?;
        if let Err(e) = self.set_all_dev_in_reset(&plan.reset_info) {
            let _ = self.unset_task_in_reset(&plan.task);
            return Err(e);
        }
        self.recovered_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&plan.task);
        info!(task = %plan.task, policy = %plan.policy, devices = ?plan.logical_ids(), "reset started");
        Ok(())
    }

    /// Release the marks of `plan`; returns the rank list with its final status.
    pub fn finish_reset(&self, plan: &RemediationPlan, success: bool) -> Result<TaskResetInfo, HotResetError> {
        self.unset_all_dev_in_reset(&plan.reset_info)?;
        self.unset_task_in_reset(&plan.task)?;

        let status = if success {
            self.recovered_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(plan.task.clone());
            RecoverStatus::Recovered
        } else {
            RecoverStatus::Failed
        };
        info!(task = %plan.task, %status, "reset finished");

        Ok(TaskResetInfo {
            rank_list: plan
                .reset_info
                .rank_list
                .iter()
                .map(|d| TaskDevInfo { status, ..d.clone() })
                .collect(),
            update_time: Utc::now().timestamp(),
        })
    }
}
