//! Shared building blocks for the Ascend NPU device plugin.
//!
//! - [`types`]: devices, per-cycle status sets, persisted records and task fault bookkeeping
//! - [`policy`]: fault code classification and device remediation policies
//! - [`config`]: TOML plus `NPU_*` environment configuration
//! - [`logging`]: tracing subscriber setup

pub mod config;
pub mod errors;
pub mod logging;
pub mod policy;
pub mod types;

pub use config::{HotResetMode, PluginConfig};
pub use errors::{ConfigError, DeviceNameError};
pub use policy::{FaultPolicyTable, FaultType, PolicyLevel, PolicyRegistry, UnknownPolicy};
pub use types::{
    ChipKind, Device, DeviceStatusSet, FaultInfo, Health, PersistedDeviceRecord, RecoverStatus,
    TaskDevInfo, TaskDevRecord, TaskFaultInfo, TaskResetInfo,
};
