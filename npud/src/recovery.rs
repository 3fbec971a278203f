//! Staged recovery of unhealthy devices.
//!
//! A device that shows healthy for one cycle is not trusted immediately.
//! It is first placed in a staged-recovery set, published as a node label so
//! the stage survives a restart, and withheld from the free set. It becomes
//! free only when the next cycle still sees it healthy. A relapse while
//! staged cancels the stage.
//!
//! Per axis, with `P` the previously persisted unhealthy set, `S` the staged
//! set read back from the labels and `U` the current unhealthy set:
//!
//! ```text
//! newly     = P - U
//! confirmed = S - U
//! relapsed  = S ∩ U
//! S'        = ((S - confirmed) ∪ newly) - U
//! ```
//!
//! Device health and network health run the same algebra independently.

use npu_common::types::{
    ChipKind, DeviceStatusSet, LABEL_DEVICE_SEPARATOR, network_recover_label, parse_device_name,
    physical_device_name, recover_label,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// How recovered devices are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Withhold recovered devices for one confirmation cycle.
    Staged,
    /// Publish the raw current-cycle sets.
    AutoStowing,
}

impl RecoveryMode {
    pub fn from_auto_stowing(auto_stowing_devs: bool) -> Self {
        if auto_stowing_devs {
            RecoveryMode::AutoStowing
        } else {
            RecoveryMode::Staged
        }
    }
}

/// Staged-recovery sets for both axes.
///
/// The labels only carry physical ids, so a staged virtual slice comes back
/// from [`StagedSets::from_labels`] as its physical parent. `confirmed` and
/// `relapsed` of the next cycle then name the parent device, while the newly
/// staged set is still computed from the current names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StagedSets {
    pub device: BTreeSet<String>,
    pub network: BTreeSet<String>,
}

impl StagedSets {
    /// Decode the recover labels. Label values are physical ids joined by `.`.
    pub fn from_labels(labels: &BTreeMap<String, String>, chip: ChipKind) -> Self {
        let decode = |key: String| -> BTreeSet<String> {
            labels
                .get(&key)
                .map(|value| {
                    value
                        .split(LABEL_DEVICE_SEPARATOR)
                        .filter_map(|id| id.trim().parse::<i32>().ok())
                        .filter(|id| *id >= 0)
                        .map(|id| physical_device_name(chip, id))
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            device: decode(recover_label(chip)),
            network: decode(network_recover_label(chip)),
        }
    }

    /// Encode both sets as label values. Virtual slices collapse to their
    /// physical id.
    pub fn to_labels(&self, chip: ChipKind) -> BTreeMap<String, String> {
        let encode = |set: &BTreeSet<String>| -> String {
            let mut ids: Vec<i32> = set
                .iter()
                .filter_map(|name| parse_device_name(name).ok())
                .map(|n| n.physical_id)
                .collect();
            ids.sort_unstable();
            ids.dedup();
            ids.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(".")
        };
        BTreeMap::from([
            (recover_label(chip), encode(&self.device)),
            (network_recover_label(chip), encode(&self.network)),
        ])
    }

    pub fn withheld(&self) -> BTreeSet<String> {
        self.device.union(&self.network).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.device.is_empty() && self.network.is_empty()
    }
}

/// Result of reconciling one axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AxisOutcome {
    /// Unhealthy last cycle, healthy now.
    pub newly_recovered: BTreeSet<String>,
    /// Staged last cycle and still healthy: released this cycle.
    pub confirmed: BTreeSet<String>,
    /// Staged last cycle but unhealthy again.
    pub relapsed: BTreeSet<String>,
    /// Staged set to carry into the next cycle.
    pub staged: BTreeSet<String>,
}

/// Reconcile one axis.
pub fn reconcile_axis(
    previously_unhealthy: &BTreeSet<String>,
    staged: &BTreeSet<String>,
    current_unhealthy: &BTreeSet<String>,
) -> AxisOutcome {
    let newly_recovered: BTreeSet<String> =
        previously_unhealthy.difference(current_unhealthy).cloned().collect();
    let confirmed: BTreeSet<String> = staged.difference(current_unhealthy).cloned().collect();
    let relapsed: BTreeSet<String> = staged.intersection(current_unhealthy).cloned().collect();

    let next: BTreeSet<String> = staged
        .difference(&confirmed)
        .cloned()
        .chain(newly_recovered.iter().cloned())
        .filter(|name| !current_unhealthy.contains(name))
        .collect();

    AxisOutcome {
        newly_recovered,
        confirmed,
        relapsed,
        staged: next,
    }
}

/// Output of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Snapshot to publish: free sets exclude staged devices, unhealthy sets stay raw.
    pub published: DeviceStatusSet,
    pub device: AxisOutcome,
    pub network: AxisOutcome,
}

impl Reconciliation {
    pub fn staged(&self) -> StagedSets {
        StagedSets {
            device: self.device.staged.clone(),
            network: self.network.staged.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryReconciler {
    mode: RecoveryMode,
}

impl RecoveryReconciler {
    pub fn new(mode: RecoveryMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    /// Reconcile the current snapshot against the persisted unhealthy sets
    /// and the staged sets carried over from the previous cycle.
    pub fn reconcile(
        &self,
        current: &DeviceStatusSet,
        persisted_unhealthy: &BTreeSet<String>,
        persisted_network_unhealthy: &BTreeSet<String>,
        staged: &StagedSets,
    ) -> Reconciliation {
        if self.mode == RecoveryMode::AutoStowing {
            return Reconciliation {
                published: current.clone(),
                ..Default::default()
            };
        }

        let device = reconcile_axis(persisted_unhealthy, &staged.device, &current.unhealthy);
        let network = reconcile_axis(
            persisted_network_unhealthy,
            &staged.network,
            &current.network_unhealthy,
        );

        for name in device.relapsed.iter().chain(network.relapsed.iter()) {
            info!(device = %name, "staged device relapsed, recovery cancelled");
        }
        for name in device.confirmed.iter().chain(network.confirmed.iter()) {
            info!(device = %name, "device recovery confirmed");
        }

        let withheld: BTreeSet<&String> = device.staged.iter().chain(network.staged.iter()).collect();
        let mut published = current.clone();
        for free in published.free_healthy_by_type.values_mut() {
            free.retain(|name| !withheld.contains(name));
        }
        if !withheld.is_empty() {
            debug!(withheld = withheld.len(), "devices withheld pending recovery confirmation");
        }

        Reconciliation {
            published,
            device,
            network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn status(free: &[&str], unhealthy: &[&str]) -> DeviceStatusSet {
        DeviceStatusSet {
            free_healthy_by_type: BTreeMap::from([("Ascend910".to_string(), set(free))]),
            unhealthy: set(unhealthy),
            network_unhealthy: BTreeSet::new(),
        }
    }

    #[test]
    fn test_recovered_device_is_withheld_one_cycle() {
        let reconciler = RecoveryReconciler::new(RecoveryMode::Staged);

        // Cycle 2: device 0 was unhealthy last cycle, healthy now.
        let now = status(&["Ascend910-0", "Ascend910-1"], &[]);
        let r = reconciler.reconcile(&now, &set(&["Ascend910-0"]), &BTreeSet::new(), &StagedSets::default());
        assert_eq!(r.device.newly_recovered, set(&["Ascend910-0"]));
        assert_eq!(r.device.staged, set(&["Ascend910-0"]));
        assert_eq!(r.published.free_healthy_by_type["Ascend910"], set(&["Ascend910-1"]));

        // Cycle 3: still healthy, stage is confirmed and released.
        let r = reconciler.reconcile(&now, &BTreeSet::new(), &BTreeSet::new(), &r.staged());
        assert_eq!(r.device.confirmed, set(&["Ascend910-0"]));
        assert!(r.device.staged.is_empty());
        assert_eq!(
            r.published.free_healthy_by_type["Ascend910"],
            set(&["Ascend910-0", "Ascend910-1"])
        );
    }

    #[test]
    fn test_staged_virtual_slice_reads_back_as_physical_parent() {
        let staged = StagedSets {
            device: set(&["Ascend910-2c-100-1", "Ascend910-3"]),
            network: BTreeSet::new(),
        };
        let labels = staged.to_labels(ChipKind::Ascend910);
        assert_eq!(labels[&recover_label(ChipKind::Ascend910)], "1.3");

        let restored = StagedSets::from_labels(&labels, ChipKind::Ascend910);
        assert_eq!(restored.device, set(&["Ascend910-1", "Ascend910-3"]));
    }

    #[test]
    fn test_relapse_evicts_from_stage() {
        let staged = StagedSets {
            device: set(&["Ascend910-0"]),
            network: BTreeSet::new(),
        };
        let now = status(&[], &["Ascend910-0"]);
        let r = RecoveryReconciler::new(RecoveryMode::Staged).reconcile(
            &now,
            &BTreeSet::new(),
            &BTreeSet::new(),
            &staged,
        );
        assert_eq!(r.device.relapsed, set(&["Ascend910-0"]));
        assert!(r.device.staged.is_empty());
        assert_eq!(r.published.unhealthy, set(&["Ascend910-0"]));
    }

    #[test]
    fn test_network_axis_stages_independently() {
        let mut now = status(&["Ascend910-0"], &[]);
        now.network_unhealthy = BTreeSet::new();
        let r = RecoveryReconciler::new(RecoveryMode::Staged).reconcile(
            &now,
            &BTreeSet::new(),
            &set(&["Ascend910-0"]),
            &StagedSets::default(),
        );
        assert!(r.device.staged.is_empty());
        assert_eq!(r.network.staged, set(&["Ascend910-0"]));
        assert!(r.published.free_healthy_by_type["Ascend910"].is_empty());
    }

    #[test]
    fn test_auto_stowing_publishes_raw_sets() {
        let now = status(&["Ascend910-0"], &[]);
        let r = RecoveryReconciler::new(RecoveryMode::AutoStowing).reconcile(
            &now,
            &set(&["Ascend910-0"]),
            &BTreeSet::new(),
            &StagedSets::default(),
        );
        assert_eq!(r.published, now);
        assert!(r.staged().is_empty());
    }

    #[test]
    fn test_label_round_trip() {
        let staged = StagedSets {
            device: set(&["Ascend910-3", "Ascend910-0"]),
            network: set(&["Ascend910-7"]),
        };
        let labels = staged.to_labels(ChipKind::Ascend910);
        assert_eq!(labels["huawei.com/Ascend910-Recover"], "0.3");
        assert_eq!(labels["huawei.com/Ascend910-NetworkRecover"], "7");
        assert_eq!(StagedSets::from_labels(&labels, ChipKind::Ascend910), staged);
    }

    #[test]
    fn test_labels_ignore_garbage_ids() {
        let labels = BTreeMap::from([(
            "huawei.com/Ascend910-Recover".to_string(),
            "1.x.-2.".to_string(),
        )]);
        let staged = StagedSets::from_labels(&labels, ChipKind::Ascend910);
        assert_eq!(staged.device, set(&["Ascend910-1"]));
        assert!(staged.network.is_empty());
    }

    fn name_set() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set((0..8i32).prop_map(|i| format!("Ascend910-{i}")), 0..8)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        // Re-running with the same persisted and current sets leaves the stage unchanged.
        #[test]
        fn test_staging_fixed_point(p in name_set(), s in name_set(), u in name_set()) {
            let first = reconcile_axis(&p, &s, &u);
            let second = reconcile_axis(&p, &first.staged, &u);
            prop_assert_eq!(&first.staged, &second.staged);
        }

        #[test]
        fn test_staged_never_unhealthy(p in name_set(), s in name_set(), u in name_set()) {
            let out = reconcile_axis(&p, &s, &u);
            prop_assert!(out.staged.is_disjoint(&u));
            prop_assert!(out.relapsed.is_subset(&u));
        }
    }
}
