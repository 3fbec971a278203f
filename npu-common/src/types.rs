//! Device model shared by the aggregation, recovery and hot-reset paths.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use crate::errors::DeviceNameError;
use crate::policy::{FaultType, PolicyLevel};

/// Prefix of every extended resource name and node label.
pub const RESOURCE_NAME_PREFIX: &str = "huawei.com/";
pub const UNHEALTHY_SUFFIX: &str = "-Unhealthy";
pub const NETWORK_UNHEALTHY_SUFFIX: &str = "-NetworkUnhealthy";
pub const RECOVER_SUFFIX: &str = "-Recover";
pub const NETWORK_RECOVER_SUFFIX: &str = "-NetworkRecover";

/// Separator between device names in a persisted device list.
pub const DEVICE_LIST_SEPARATOR: char = ',';
/// Separator between physical ids in a recover label value.
pub const LABEL_DEVICE_SEPARATOR: char = '.';

// ── Chips ──────────────────────────────────────────────────────────────────

/// Chip family the node carries. Determines the ring size used by hot reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChipKind {
    #[default]
    Ascend910,
    Ascend910B,
}

impl ChipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChipKind::Ascend910 => "Ascend910",
            ChipKind::Ascend910B => "Ascend910B",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Ascend910" => Some(ChipKind::Ascend910),
            "Ascend910B" => Some(ChipKind::Ascend910B),
            _ => None,
        }
    }
}

impl fmt::Display for ChipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Device names ───────────────────────────────────────────────────────────

/// Parsed form of an Ascend device name.
///
/// Physical devices look like `Ascend910-3`; virtual slices carry a
/// compute template and a virtual id: `Ascend910-2c-100-3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceName {
    /// Resource type, e.g. `Ascend910` or `Ascend910-2c`.
    pub dev_type: String,
    pub physical_id: i32,
    pub vdev_id: Option<u32>,
}

impl DeviceName {
    pub fn is_virtual(&self) -> bool {
        self.vdev_id.is_some()
    }
}

fn device_name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<chip>Ascend[0-9A-Za-z]+)(?:-(?P<template>[0-9]+c[0-9A-Za-z.]*)-(?P<vdev>[0-9]+))?-(?P<phy>[0-9]+)$",
        )
        .ok()
    })
    .as_ref()
}

/// Parse a device name into its type and ids.
pub fn parse_device_name(name: &str) -> Result<DeviceName, DeviceNameError> {
    let malformed = || DeviceNameError::Malformed(name.to_string());
    let caps = device_name_regex()
        .and_then(|re| re.captures(name))
        .ok_or_else(malformed)?;

    let chip = caps.name("chip").ok_or_else(malformed)?.as_str();
    let physical_id = caps
        .name("phy")
        .ok_or_else(malformed)?
        .as_str()
        .parse::<i32>()
        .map_err(|_| DeviceNameError::IdOutOfRange(name.to_string()))?;

    match (caps.name("template"), caps.name("vdev")) {
        (Some(template), Some(vdev)) => Ok(DeviceName {
            dev_type: format!("{chip}-{}", template.as_str()),
            physical_id,
            vdev_id: Some(
                vdev.as_str()
                    .parse::<u32>()
                    .map_err(|_| DeviceNameError::IdOutOfRange(name.to_string()))?,
            ),
        }),
        _ => Ok(DeviceName {
            dev_type: chip.to_string(),
            physical_id,
            vdev_id: None,
        }),
    }
}

/// True for resource types naming a virtual slice (`Ascend910-2c`).
pub fn is_virtual_type(dev_type: &str) -> bool {
    match dev_type.split_once('-') {
        Some((_, template)) => template
            .split_once('c')
            .is_some_and(|(cores, _)| !cores.is_empty() && cores.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

/// Name of the physical device with the given id.
pub fn physical_device_name(chip: ChipKind, physical_id: i32) -> String {
    format!("{chip}-{physical_id}")
}

// ── Resource keys ──────────────────────────────────────────────────────────

pub fn resource_key(dev_type: &str) -> String {
    format!("{RESOURCE_NAME_PREFIX}{dev_type}")
}

pub fn unhealthy_key(dev_type: &str) -> String {
    format!("{RESOURCE_NAME_PREFIX}{dev_type}{UNHEALTHY_SUFFIX}")
}

pub fn network_unhealthy_key(dev_type: &str) -> String {
    format!("{RESOURCE_NAME_PREFIX}{dev_type}{NETWORK_UNHEALTHY_SUFFIX}")
}

/// Node label carrying the staged device-recovery set.
pub fn recover_label(chip: ChipKind) -> String {
    format!("{RESOURCE_NAME_PREFIX}{chip}{RECOVER_SUFFIX}")
}

/// Node label carrying the staged network-recovery set.
pub fn network_recover_label(chip: ChipKind) -> String {
    format!("{RESOURCE_NAME_PREFIX}{chip}{NETWORK_RECOVER_SUFFIX}")
}

/// True if a device-list key refers to a virtual resource type.
pub fn is_virtual_resource_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix(RESOURCE_NAME_PREFIX) else {
        return false;
    };
    let dev_type = rest
        .strip_suffix(NETWORK_UNHEALTHY_SUFFIX)
        .or_else(|| rest.strip_suffix(UNHEALTHY_SUFFIX))
        .unwrap_or(rest);
    is_virtual_type(dev_type)
}

/// Join device names into a persisted list value.
pub fn join_devices<'a>(names: impl IntoIterator<Item = &'a String>) -> String {
    names
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a persisted list value back into device names. Malformed names are dropped.
pub fn split_devices(value: &str) -> BTreeSet<String> {
    value
        .split(DEVICE_LIST_SEPARATOR)
        .map(str::trim)
        .filter(|name| parse_device_name(name).is_ok())
        .map(str::to_string)
        .collect()
}

// ── Devices ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Health {
    #[default]
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "Healthy"),
            Health::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Kind of a fault event reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultAssertion {
    /// Fault raised and still active.
    Occur,
    /// Previously raised fault cleared.
    Recover,
    /// Fault raised and cleared within the same report.
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultEvent {
    pub event_id: i64,
    pub assertion: FaultAssertion,
}

/// One NPU as seen by the plugin during a polling cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub dev_type: String,
    pub name: String,
    #[serde(rename = "logicID")]
    pub logical_id: i32,
    #[serde(rename = "physicalID")]
    pub physical_id: i32,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub network_health: Health,
    #[serde(default)]
    pub fault_codes: BTreeSet<i64>,
    /// Link-level fault codes reported by the network agent.
    #[serde(default)]
    pub network_fault_codes: BTreeSet<String>,
    /// Unix seconds when `fault_codes` last became non-empty, 0 when clear.
    #[serde(default)]
    pub alarm_raised_at: i64,
}

impl Device {
    pub fn new(dev_type: impl Into<String>, name: impl Into<String>, logical_id: i32, physical_id: i32) -> Self {
        Self {
            dev_type: dev_type.into(),
            name: name.into(),
            logical_id,
            physical_id,
            health: Health::Healthy,
            network_health: Health::Healthy,
            fault_codes: BTreeSet::new(),
            network_fault_codes: BTreeSet::new(),
            alarm_raised_at: 0,
        }
    }

    pub fn is_virtual(&self) -> bool {
        is_virtual_type(&self.dev_type)
    }

    /// Replace the active fault codes and maintain `alarm_raised_at`.
    pub fn set_fault_codes(&mut self, codes: BTreeSet<i64>, now: i64) {
        self.fault_codes = codes;
        self.sync_alarm(now);
    }

    /// Apply driver fault events for one cycle.
    ///
    /// Recover events are applied before occur/once events so a fault that
    /// recovers and re-occurs in the same report is visible for this cycle.
    /// Returns the codes of every recover and once event; they must be dropped
    /// again at the end of the cycle (see [`Device::clear_transient_faults`]).
    pub fn apply_fault_events(&mut self, events: &[FaultEvent], now: i64) -> Vec<i64> {
        for event in events {
            if event.assertion == FaultAssertion::Recover {
                self.fault_codes.remove(&event.event_id);
            }
        }
        for event in events {
            if matches!(event.assertion, FaultAssertion::Occur | FaultAssertion::Once) {
                self.fault_codes.insert(event.event_id);
            }
        }
        self.sync_alarm(now);

        let transient: BTreeSet<i64> = events
            .iter()
            .filter(|e| matches!(e.assertion, FaultAssertion::Recover | FaultAssertion::Once))
            .map(|e| e.event_id)
            .collect();
        transient.into_iter().collect()
    }

    /// Drop codes that were only meant to be visible for a single cycle.
    pub fn clear_transient_faults(&mut self, codes: &[i64], now: i64) {
        for code in codes {
            self.fault_codes.remove(code);
        }
        self.sync_alarm(now);
    }

    fn sync_alarm(&mut self, now: i64) {
        if self.fault_codes.is_empty() {
            self.alarm_raised_at = 0;
        } else if self.alarm_raised_at == 0 {
            self.alarm_raised_at = now;
        }
    }
}

// ── Per-cycle status ───────────────────────────────────────────────────────

/// Per-cycle health snapshot derived from the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatusSet {
    /// Healthy devices not allocated to a workload, keyed by resource type.
    /// Every type seen in the inventory has an entry, even when empty.
    pub free_healthy_by_type: BTreeMap<String, BTreeSet<String>>,
    pub unhealthy: BTreeSet<String>,
    pub network_unhealthy: BTreeSet<String>,
}

impl DeviceStatusSet {
    pub fn free_count(&self) -> usize {
        self.free_healthy_by_type.values().map(BTreeSet::len).sum()
    }

    /// Encode the snapshot as a device list for persistence.
    ///
    /// Produces the free list per type plus `-Unhealthy` and
    /// `-NetworkUnhealthy` lists for every known type.
    pub fn device_list(&self) -> BTreeMap<String, String> {
        let mut types: BTreeSet<String> = self.free_healthy_by_type.keys().cloned().collect();
        let name_type = |name: &String| parse_device_name(name).ok().map(|n| n.dev_type);
        types.extend(self.unhealthy.iter().filter_map(name_type));
        types.extend(self.network_unhealthy.iter().filter_map(name_type));

        let mut list = BTreeMap::new();
        for dev_type in &types {
            let of_type = |set: &BTreeSet<String>| -> BTreeSet<String> {
                set.iter()
                    .filter(|name| name_type(*name).as_deref() == Some(dev_type.as_str()))
                    .cloned()
                    .collect()
            };
            let free = self.free_healthy_by_type.get(dev_type).cloned().unwrap_or_default();
            list.insert(resource_key(dev_type), join_devices(&free));
            list.insert(unhealthy_key(dev_type), join_devices(&of_type(&self.unhealthy)));
            list.insert(
                network_unhealthy_key(dev_type),
                join_devices(&of_type(&self.network_unhealthy)),
            );
        }
        list
    }
}

/// Read the unhealthy and network-unhealthy sets back out of a persisted device list.
pub fn unhealthy_from_device_list(list: &BTreeMap<String, String>) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut unhealthy = BTreeSet::new();
    let mut network = BTreeSet::new();
    for (key, value) in list {
        if key.ends_with(NETWORK_UNHEALTHY_SUFFIX) {
            network.extend(split_devices(value));
        } else if key.ends_with(UNHEALTHY_SUFFIX) {
            unhealthy.extend(split_devices(value));
        }
    }
    (unhealthy, network)
}

/// Consolidated device-info record persisted once per cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDeviceRecord {
    pub device_list: BTreeMap<String, String>,
    pub update_time: i64,
    pub checksum: String,
}

// ── Task fault bookkeeping ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoverStatus {
    #[default]
    Unrecovered,
    Recovered,
    Failed,
}

impl fmt::Display for RecoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoverStatus::Unrecovered => write!(f, "unrecovered"),
            RecoverStatus::Recovered => write!(f, "recovered"),
            RecoverStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Latest classification of a single device, keyed by logical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultInfo {
    pub logical_id: i32,
    pub fault_type: FaultType,
    pub policy: PolicyLevel,
    pub error_codes: Vec<i64>,
}

/// A device's place in a task, with its remediation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDevInfo {
    pub rank_id: i32,
    #[serde(rename = "logicId")]
    pub logical_id: i32,
    pub status: RecoverStatus,
    pub policy: PolicyLevel,
    pub initial_policy: PolicyLevel,
    #[serde(rename = "errorCode")]
    pub error_codes: Vec<i64>,
}

impl TaskDevInfo {
    pub fn to_record(&self) -> TaskDevRecord {
        TaskDevRecord {
            rank_id: self.rank_id,
            logical_id: self.logical_id,
            status: self.status,
            policy: self.policy.as_str().to_string(),
            initial_policy: self.initial_policy.as_str().to_string(),
            error_codes: self.error_codes.clone(),
        }
    }
}

/// Wire form of [`TaskDevInfo`] as found in persisted task records.
///
/// Policies stay strings here; they are validated when the record is turned
/// back into a [`TaskDevInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDevRecord {
    pub rank_id: i32,
    #[serde(rename = "logicId")]
    pub logical_id: i32,
    pub status: RecoverStatus,
    pub policy: String,
    pub initial_policy: String,
    #[serde(rename = "errorCode", default)]
    pub error_codes: Vec<i64>,
}

/// Ring-expanded device list driving one remediation action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResetInfo {
    pub rank_list: Vec<TaskDevInfo>,
    pub update_time: i64,
}

impl TaskResetInfo {
    pub fn logical_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.rank_list.iter().map(|d| d.logical_id)
    }

    /// True if any device in the list carries the given policy.
    pub fn contains_policy(&self, policy: PolicyLevel) -> bool {
        self.rank_list.iter().any(|d| d.policy == policy)
    }
}

/// Fault ranks of one task, reported upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFaultInfo {
    pub fault_rank: Vec<i32>,
    pub update_time: i64,
}
