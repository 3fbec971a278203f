//! Device inventory source.
//!
//! The vendor-driver side enumerates devices and workloads; the plugin only
//! consumes a snapshot of them once per polling cycle.

use npu_common::types::{Device, FaultEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse inventory {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}

/// A workload holding devices on this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Rank block index of this node's pod, `"-1"` for inference.
    #[serde(default = "default_rank_index")]
    pub rank_index: String,
    /// Physical device names allocated to the task.
    #[serde(default)]
    pub devices: Vec<String>,
}

fn default_rank_index() -> String {
    "0".to_string()
}

/// Everything the plugin learns from its collaborators in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySnapshot {
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Device names allocated to running workloads, by resource type.
    #[serde(default)]
    pub used: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub tasks: Vec<TaskAssignment>,
    /// Driver fault events since the last snapshot, by device name.
    #[serde(default)]
    pub fault_events: BTreeMap<String, Vec<FaultEvent>>,
}

pub trait DeviceInventory: Send + Sync {
    fn snapshot(&self) -> Result<InventorySnapshot, InventoryError>;
}

/// Reads a snapshot file rewritten by the driver side.
#[derive(Debug, Clone)]
pub struct JsonInventory {
    path: PathBuf,
}

impl JsonInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceInventory for JsonInventory {
    fn snapshot(&self) -> Result<InventorySnapshot, InventoryError> {
        let bytes = std::fs::read(&self.path).map_err(|source| InventoryError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| InventoryError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// In-process inventory whose snapshot tests change between cycles.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    snapshot: Mutex<InventorySnapshot>,
}

impl MemoryInventory {
    pub fn new(snapshot: InventorySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: InventorySnapshot) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    pub fn update(&self, f: impl FnOnce(&mut InventorySnapshot)) {
        f(&mut self.snapshot.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

impl DeviceInventory for MemoryInventory {
    fn snapshot(&self) -> Result<InventorySnapshot, InventoryError> {
        Ok(self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_inventory_reads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(
            &path,
            r#"{
                "devices": [
                    {"devType": "Ascend910", "name": "Ascend910-0", "logicID": 0, "physicalID": 0,
                     "health": "Unhealthy", "faultCodes": [2350927360]}
                ],
                "used": {"Ascend910": ["Ascend910-0"]},
                "tasks": [{"name": "job", "devices": ["Ascend910-0"]}],
                "faultEvents": {"Ascend910-0": [{"eventId": 7, "assertion": "once"}]}
            }"#,
        )
        .unwrap();

        let snapshot = JsonInventory::new(&path).snapshot().unwrap();
        assert_eq!(snapshot.devices.len(), 1);
        assert!(snapshot.devices[0].fault_codes.contains(&0x8C204E00));
        assert_eq!(snapshot.tasks[0].rank_index, "0");
        assert_eq!(snapshot.fault_events["Ascend910-0"][0].event_id, 7);
    }

    #[test]
    fn test_json_inventory_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = JsonInventory::new(dir.path().join("missing.json"));
        assert!(matches!(missing.snapshot(), Err(InventoryError::Read { .. })));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{ nope").unwrap();
        assert!(matches!(
            JsonInventory::new(&path).snapshot(),
            Err(InventoryError::Parse { .. })
        ));
    }

    #[test]
    fn test_memory_inventory_update() {
        let inventory = MemoryInventory::default();
        inventory.update(|s| s.devices.push(Device::new("Ascend910", "Ascend910-0", 0, 0)));
        assert_eq!(inventory.snapshot().unwrap().devices.len(), 1);
    }
}
