//! Per-cycle device health aggregation.
//!
//! Turns the inventory of one polling cycle into a [`DeviceStatusSet`]:
//! free healthy devices per resource type, unhealthy devices and
//! network-unhealthy devices. Virtual slices inherit unhealthiness from
//! their physical parent.

use npu_common::types::{Device, DeviceStatusSet, Health};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Group a flat device list by resource type.
pub fn group_by_type(devices: &[Device]) -> BTreeMap<String, Vec<Device>> {
    let mut grouped: BTreeMap<String, Vec<Device>> = BTreeMap::new();
    for device in devices {
        grouped.entry(device.dev_type.clone()).or_default().push(device.clone());
    }
    grouped
}

/// Compute the health snapshot of one cycle.
///
/// `used_by_type` lists devices currently allocated to running workloads;
/// those are healthy but not free. Missing or empty inputs yield empty sets.
pub fn aggregate(
    devices_by_type: &BTreeMap<String, Vec<Device>>,
    used_by_type: &BTreeMap<String, BTreeSet<String>>,
) -> DeviceStatusSet {
    let unhealthy_physical: BTreeSet<i32> = devices_by_type
        .values()
        .flatten()
        .filter(|d| !d.is_virtual() && d.health == Health::Unhealthy)
        .map(|d| d.physical_id)
        .collect();

    let mut status = DeviceStatusSet::default();
    let no_used = BTreeSet::new();

    for (dev_type, devices) in devices_by_type {
        let used = used_by_type.get(dev_type).unwrap_or(&no_used);
        let free = status.free_healthy_by_type.entry(dev_type.clone()).or_default();

        for device in devices {
            let inherited = device.is_virtual() && unhealthy_physical.contains(&device.physical_id);
            if device.health == Health::Unhealthy || inherited {
                if inherited && device.health == Health::Healthy {
                    debug!(
                        device = %device.name,
                        physical_id = device.physical_id,
                        "virtual device inherits unhealthy parent"
                    );
                }
                status.unhealthy.insert(device.name.clone());
            } else if !used.contains(&device.name) {
                free.insert(device.name.clone());
            }

            if device.network_health == Health::Unhealthy {
                status.network_unhealthy.insert(device.name.clone());
            }
        }
    }

    status
}
