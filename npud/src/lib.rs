//! Ascend NPU device plugin daemon.
//!
//! Per polling cycle the [`engine::PluginEngine`] reads the device inventory,
//! aggregates health ([`health`]), stages recoveries ([`recovery`]), persists
//! the consolidated view ([`store`]) and, when enabled, drives task hot
//! resets ([`hot_reset`], [`executor`]).

#![forbid(unsafe_code)]

pub mod backend;
pub mod engine;
pub mod executor;
pub mod health;
pub mod hot_reset;
pub mod inventory;
pub mod recovery;
pub mod store;

pub use backend::{BackendError, FileBackend, LabelBackend, MemoryBackend, RecordBackend};
pub use engine::{CycleReport, EngineError, EngineSettings, PluginEngine};
pub use executor::{CommandResetExecutor, ResetError, ResetExecutor};
pub use hot_reset::{HotResetCoordinator, HotResetError, RemediationPlan};
pub use inventory::{DeviceInventory, InventorySnapshot, JsonInventory, MemoryInventory, TaskAssignment};
pub use recovery::{RecoveryMode, RecoveryReconciler, StagedSets};
pub use store::{DeviceInfoStore, StoreError, StoreSettings, WriteOutcome};
