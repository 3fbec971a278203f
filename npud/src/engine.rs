//! The polling engine.
//!
//! One cycle runs inventory → aggregation → staged recovery → persistence,
//! and, when hot reset is enabled, the task remediation pass. Cycles run on
//! a fixed interval until the stop signal flips; a cycle in flight is never
//! interrupted.

use chrono::Utc;
use npu_common::config::{HotResetMode, PluginConfig};
use npu_common::types::{
    ChipKind, Device, DeviceStatusSet, Health, network_recover_label, recover_label,
    unhealthy_from_device_list,
};
use npu_common::{PolicyLevel, PolicyRegistry};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, LabelBackend};
use crate::executor::ResetExecutor;
use crate::health;
use crate::hot_reset::{HotResetCoordinator, HotResetError, RemediationPlan};
use crate::inventory::{DeviceInventory, InventoryError, InventorySnapshot};
use crate::recovery::{RecoveryMode, RecoveryReconciler, StagedSets};
use crate::store::{DeviceInfoStore, StoreError, WriteOutcome};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("failed to read node labels: {0}")]
    Labels(#[source] BackendError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub node_name: String,
    pub chip: ChipKind,
    pub recovery_mode: RecoveryMode,
    pub hot_reset_mode: HotResetMode,
    pub period: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            chip: ChipKind::Ascend910,
            recovery_mode: RecoveryMode::AutoStowing,
            hot_reset_mode: HotResetMode::Off,
            period: Duration::from_secs(5),
        }
    }
}

impl From<&PluginConfig> for EngineSettings {
    fn from(config: &PluginConfig) -> Self {
        Self {
            node_name: config.general.node_name.clone(),
            chip: config.hot_reset.chip,
            recovery_mode: RecoveryMode::from_auto_stowing(config.recovery.auto_stowing_devs),
            hot_reset_mode: config.hot_reset.mode,
            period: config.list_and_watch_period(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub devices: usize,
    /// Snapshot as published, with staged devices withheld.
    pub published: DeviceStatusSet,
    pub staged: StagedSets,
    /// `None` when the write failed or timed out.
    pub write_outcome: Option<WriteOutcome>,
    pub resets_started: Vec<String>,
    pub isolated_tasks: Vec<String>,
}

/// Per-device state carried between cycles.
#[derive(Debug, Clone, Default)]
struct DeviceMemory {
    alarm_raised_at: i64,
    /// Codes raised by occur events and not yet recovered.
    event_codes: BTreeSet<i64>,
}

pub struct PluginEngine<I, E> {
    settings: EngineSettings,
    inventory: Arc<I>,
    labels: Arc<dyn LabelBackend>,
    store: Arc<DeviceInfoStore>,
    registry: Arc<PolicyRegistry>,
    reconciler: RecoveryReconciler,
    hot_reset: Option<Arc<HotResetCoordinator>>,
    executor: Arc<E>,
    memory: Mutex<BTreeMap<String, DeviceMemory>>,
    remediations: Mutex<JoinSet<()>>,
    cycles: AtomicU64,
}

impl<I, E> PluginEngine<I, E>
where
    I: DeviceInventory + 'static,
    E: ResetExecutor + 'static,
{
    pub fn new(
        settings: EngineSettings,
        inventory: Arc<I>,
        labels: Arc<dyn LabelBackend>,
        store: Arc<DeviceInfoStore>,
        registry: Arc<PolicyRegistry>,
        executor: Arc<E>,
    ) -> Result<Self, HotResetError> {
        let hot_reset = match settings.hot_reset_mode {
            HotResetMode::Off => None,
            mode => Some(Arc::new(HotResetCoordinator::new(settings.chip, mode, registry.clone())?)),
        };
        Ok(Self {
            reconciler: RecoveryReconciler::new(settings.recovery_mode),
            settings,
            inventory,
            labels,
            store,
            registry,
            hot_reset,
            executor,
            memory: Mutex::default(),
            remediations: Mutex::default(),
            cycles: AtomicU64::new(0),
        })
    }

    /// Replace the hot-reset coordinator (e.g. one with a custom ring size).
    pub fn with_hot_reset(mut self, coordinator: Arc<HotResetCoordinator>) -> Self {
        self.hot_reset = Some(coordinator);
        self
    }

    pub fn hot_reset(&self) -> Option<&Arc<HotResetCoordinator>> {
        self.hot_reset.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one polling cycle end to end.
    pub async fn run_cycle(&self) -> Result<CycleReport, EngineError> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now().timestamp();
        let snapshot = self.inventory.snapshot()?;

        let (mut devices, transient) = self.merge_devices(&snapshot, now);
        let current = health::aggregate(&health::group_by_type(&devices), &snapshot.used);

        let (persisted_unhealthy, persisted_network) = match self.store.read() {
            Ok(Some(record)) => unhealthy_from_device_list(&record.device_list),
            Ok(None) => Default::default(),
            Err(e) => {
                warn!(error = %e, "previous device info unavailable, reconciling without it");
                Default::default()
            }
        };
        let staged = StagedSets::from_labels(&self.labels.labels().map_err(EngineError::Labels)?, self.settings.chip);

        let reconciliation = self
            .reconciler
            .reconcile(&current, &persisted_unhealthy, &persisted_network, &staged);
        self.publish_staged(&reconciliation.staged());

        let write_outcome = match self.store.write(&reconciliation.published.device_list()).await {
            Ok((outcome, _)) => Some(outcome),
            Err(e @ StoreError::Timeout { .. }) => {
                warn!(error = %e, "device info write dropped, next cycle retries");
                None
            }
            Err(e) => {
                error!(error = %e, "device info write failed");
                None
            }
        };

        let mut report = CycleReport {
            cycle,
            devices: devices.len(),
            published: reconciliation.published.clone(),
            staged: reconciliation.staged(),
            write_outcome,
            ..Default::default()
        };

        if let Some(coordinator) = &self.hot_reset {
            self.remediate(coordinator, &devices, &snapshot, &mut report);
        }

        self.remember(&mut devices, &snapshot, &transient, now);

        debug!(
            cycle,
            free = report.published.free_count(),
            unhealthy = report.published.unhealthy.len(),
            network_unhealthy = report.published.network_unhealthy.len(),
            staged = report.staged.withheld().len(),
            "cycle complete"
        );
        Ok(report)
    }

    /// Overlay carried state and driver events onto the inventory devices.
    ///
    /// Returns the devices and, per device name, the event codes to clear
    /// at the end of the cycle.
    fn merge_devices(&self, snapshot: &InventorySnapshot, now: i64) -> (Vec<Device>, BTreeMap<String, Vec<i64>>) {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        let mut transient = BTreeMap::new();
        let devices = snapshot
            .devices
            .iter()
            .map(|raw| {
                let mut device = raw.clone();
                let carried = memory.get(&device.name).cloned().unwrap_or_default();
                device.alarm_raised_at = carried.alarm_raised_at;
                let mut codes = raw.fault_codes.clone();
                codes.extend(carried.event_codes);
                device.set_fault_codes(codes, now);

                if let Some(events) = snapshot.fault_events.get(&device.name) {
                    let transient_codes = device.apply_fault_events(events, now);
                    if !transient_codes.is_empty() {
                        transient.insert(device.name.clone(), transient_codes);
                    }
                }

                if PolicyLevel::from_fault_type(self.registry.classify(&device.fault_codes)).is_fault() {
                    device.health = Health::Unhealthy;
                }
                if PolicyLevel::from_fault_type(self.registry.classify_network(&device.network_fault_codes)).is_fault() {
                    device.network_health = Health::Unhealthy;
                }
                device
            })
            .collect();
        (devices, transient)
    }

    fn remember(
        &self,
        devices: &mut [Device],
        snapshot: &InventorySnapshot,
        transient: &BTreeMap<String, Vec<i64>>,
        now: i64,
    ) {
        let polled: BTreeMap<&str, &BTreeSet<i64>> = snapshot
            .devices
            .iter()
            .map(|d| (d.name.as_str(), &d.fault_codes))
            .collect();
        let mut next = BTreeMap::new();
        for device in devices.iter_mut() {
            if let Some(codes) = transient.get(&device.name) {
                device.clear_transient_faults(codes, now);
            }
            let event_codes = match polled.get(device.name.as_str()) {
                Some(polled) => device.fault_codes.difference(polled).copied().collect(),
                None => device.fault_codes.clone(),
            };
            next.insert(
                device.name.clone(),
                DeviceMemory {
                    alarm_raised_at: device.alarm_raised_at,
                    event_codes,
                },
            );
        }
        *self.memory.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn publish_staged(&self, staged: &StagedSets) {
        let chip = self.settings.chip;
        let result = match self.reconciler.mode() {
            RecoveryMode::Staged => self.labels.patch_labels(&staged.to_labels(chip), &[]),
            RecoveryMode::AutoStowing => self
                .labels
                .patch_labels(&BTreeMap::new(), &[recover_label(chip), network_recover_label(chip)]),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to publish recovery labels");
        }
    }

    // ── Hot reset ──────────────────────────────────────────────────────────

    fn remediate(
        &self,
        coordinator: &Arc<HotResetCoordinator>,
        devices: &[Device],
        snapshot: &InventorySnapshot,
        report: &mut CycleReport,
    ) {
        if let Err(e) = coordinator.refresh_global_dev_fault_info(devices) {
            debug!(error = %e, "no devices to classify");
            return;
        }

        let by_name: BTreeMap<&str, i32> = devices
            .iter()
            .filter(|d| !d.is_virtual())
            .map(|d| (d.name.as_str(), d.logical_id))
            .collect();

        let mut dev_lists = BTreeMap::new();
        let mut fault_infos = BTreeMap::new();
        let mut namespaces = BTreeMap::new();
        for task in &snapshot.tasks {
            let ids: Vec<i32> = task
                .devices
                .iter()
                .filter_map(|name| {
                    let id = by_name.get(name.as_str()).copied();
                    if id.is_none() {
                        warn!(task = %task.name, device = %name, "task device not in inventory");
                    }
                    id
                })
                .collect();
            match coordinator.generate_task_dev_fault_info_list(&ids, &task.rank_index) {
                Ok(list) => {
                    fault_infos.insert(task.name.clone(), list);
                }
                Err(e) => {
                    warn!(task = %task.name, error = %e, "skipping task");
                    continue;
                }
            }
            dev_lists.insert(task.name.clone(), ids);
            namespaces.insert(task.name.clone(), task.namespace.clone());
        }

        let active: BTreeSet<String> = dev_lists.keys().cloned().collect();
        // Only `None` is rejected; the maps are always present here.
        let _ = coordinator.update_task_dev_list_cache(Some(dev_lists.clone()));
        let _ = coordinator.update_task_dev_fault_info_cache(Some(fault_infos));
        let _ = coordinator.update_task_namespace_cache(Some(namespaces));
        coordinator.update_free_task(&active);

        for (task, ids) in &dev_lists {
            coordinator.update_fault_dev_task_map(ids, task);
            if !coordinator.has_faulty_device_in_task(task) {
                continue;
            }
            let plan = match coordinator.plan_remediation(task) {
                Ok(Some(plan)) => plan,
                Ok(None) => continue,
                Err(e) => {
                    error!(task = %task, error = %e, "cannot resolve task policy");
                    continue;
                }
            };

            if plan.requires_reset() {
                if self.start_reset(coordinator, plan) {
                    report.resets_started.push(task.clone());
                }
            } else {
                self.report_isolation(&plan);
                report.isolated_tasks.push(task.clone());
            }
        }
    }

    fn report_isolation(&self, plan: &RemediationPlan) {
        warn!(task = %plan.task, ranks = ?plan.fault_info.fault_rank, "task has isolated devices, needs rescheduling");
        if let Err(e) = self.store.write_reset_info(&plan.task, &plan.reset_info) {
            warn!(task = %plan.task, error = %e, "failed to record isolation");
        }
        if let Err(e) = self.store.write_fault_info(&plan.task, &plan.fault_info) {
            warn!(task = %plan.task, error = %e, "failed to record fault ranks");
        }
    }

    fn start_reset(&self, coordinator: &Arc<HotResetCoordinator>, plan: RemediationPlan) -> bool {
        match coordinator.begin_reset(&plan) {
            Ok(()) => {}
            Err(HotResetError::AlreadyInProgress(what)) => {
                debug!(task = %plan.task, %what, "reset already in progress, skipping");
                return false;
            }
            Err(e) => {
                warn!(task = %plan.task, error = %e, "cannot start reset");
                return false;
            }
        }

        if let Err(e) = self.store.write_reset_info(&plan.task, &plan.reset_info) {
            warn!(task = %plan.task, error = %e, "reset info not recorded, abandoning reset");
            let _ = coordinator.finish_reset(&plan, false);
            return false;
        }
        if let Err(e) = self.store.write_fault_info(&plan.task, &plan.fault_info) {
            warn!(task = %plan.task, error = %e, "failed to record fault ranks");
        }

        let coordinator = coordinator.clone();
        let executor = self.executor.clone();
        let store = self.store.clone();
        self.remediations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .spawn(async move {
                let mut success = true;
                for logical_id in plan.logical_ids() {
                    if let Err(e) = executor.reset_device(logical_id).await {
                        error!(task = %plan.task, logical_id, error = %e, "device reset failed");
                        success = false;
                        break;
                    }
                }
                match coordinator.finish_reset(&plan, success) {
                    Ok(info) => {
                        if let Err(e) = store.write_reset_info(&plan.task, &info) {
                            warn!(task = %plan.task, error = %e, "failed to record reset result");
                        }
                    }
                    Err(e) => error!(task = %plan.task, error = %e, "reset marks out of sync"),
                }
            });
        true
    }

    /// Wait for every spawned remediation to finish.
    pub async fn wait_for_remediations(&self) {
        let mut set = std::mem::take(&mut *self.remediations.lock().unwrap_or_else(|e| e.into_inner()));
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "remediation task panicked");
            }
        }
    }

    /// Run cycles every `period` until `stop` becomes true.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            node = %self.settings.node_name,
            period = ?self.settings.period,
            recovery = ?self.settings.recovery_mode,
            hot_reset = %self.settings.hot_reset_mode,
            "polling engine started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *stop.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                warn!(error = %e, "polling cycle failed");
            }
        }

        self.wait_for_remediations().await;
        info!("polling engine stopped");
    }
}
