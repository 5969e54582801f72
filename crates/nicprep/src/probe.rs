//! Resource Probe: read-only view of host state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{instrument, warn};

use nicprep_common::{
    BusAddress, HostModuleState, HostPrepResult, HugepageSpec, ModuleSpec, ResourceStore,
};
use nicprep_common::types::normalize_module_name;

/// A probed value, or `Unknown` when the read failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Observed<T> {
    Known(T),
    Unknown,
}

impl<T> Observed<T> {
    /// The known value, if any.
    pub fn known(&self) -> Option<&T> {
        match self {
            Observed::Known(v) => Some(v),
            Observed::Unknown => None,
        }
    }

    /// Returns true if the value is known and satisfies `pred`.
    pub fn is_known_and(&self, pred: impl FnOnce(&T) -> bool) -> bool {
        self.known().is_some_and(pred)
    }

    fn from_read(result: HostPrepResult<T>, what: &str, key: &str) -> Self {
        match result {
            Ok(v) => Observed::Known(v),
            Err(e) => {
                warn!(resource = what, key = key, error = %e, "Probe read failed");
                Observed::Unknown
            }
        }
    }
}

/// Snapshot of the host resources a run cares about. Fields that could
/// not be read are `Unknown`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    /// Whether hugetlbfs is mounted, per mount path.
    pub hugetlbfs_mounted: BTreeMap<PathBuf, Observed<bool>>,
    /// Reserved pages per (page size kB, node).
    pub hugepages: BTreeMap<(u64, Option<u32>), Observed<u64>>,
    /// Module state per normalized module name.
    pub modules: BTreeMap<String, Observed<HostModuleState>>,
    /// Bound driver per device.
    pub drivers: BTreeMap<BusAddress, Observed<Option<String>>>,
}

impl HostState {
    /// Returns true if `spec` is known to be loaded with its parameters.
    pub fn module_satisfied(&self, spec: &ModuleSpec) -> bool {
        self.modules
            .get(&normalize_module_name(&spec.name))
            .is_some_and(|m| m.is_known_and(|state| spec.is_satisfied_by(state)))
    }

    /// Returns true if hugetlbfs is known to be mounted for `spec`.
    pub fn mount_satisfied(&self, spec: &HugepageSpec) -> bool {
        self.hugetlbfs_mounted
            .get(&spec.mount_path)
            .is_some_and(|m| m.is_known_and(|mounted| *mounted))
    }

    /// Returns true if the pool is known to hold an acceptable count.
    pub fn reservation_satisfied(&self, spec: &HugepageSpec) -> bool {
        self.hugepages
            .get(&(spec.page_size_kb, spec.node))
            .is_some_and(|c| c.is_known_and(|count| spec.is_met_by(*count)))
    }

    /// Returns true if the device is known to be bound to `driver`.
    pub fn device_bound_to(&self, address: &BusAddress, driver: &str) -> bool {
        self.drivers
            .get(address)
            .is_some_and(|d| d.is_known_and(|bound| bound.as_deref() == Some(driver)))
    }
}

/// Reads host state through the resource store.
#[derive(Clone)]
pub struct ResourceProbe {
    store: Arc<dyn ResourceStore>,
}

impl ResourceProbe {
    /// Creates a probe over `store`.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Reads every resource named by the arguments. Never fails; a
    /// sub-resource that cannot be read is reported as `Unknown`.
    #[instrument(skip_all, fields(modules = modules.len(), devices = devices.len()))]
    pub async fn probe(
        &self,
        modules: &[ModuleSpec],
        hugepages: Option<&HugepageSpec>,
        devices: &[BusAddress],
    ) -> HostState {
        let mut state = HostState::default();

        for spec in modules {
            let name = normalize_module_name(&spec.name);
            let observed =
                Observed::from_read(self.store.module_state(&spec.name).await, "module", &name);
            state.modules.insert(name, observed);
        }

        if let Some(spec) = hugepages {
            let path = spec.mount_path.display().to_string();
            state.hugetlbfs_mounted.insert(
                spec.mount_path.clone(),
                Observed::from_read(
                    self.store.is_hugetlbfs_mounted(&spec.mount_path).await,
                    "hugetlbfs",
                    &path,
                ),
            );
            let pool = format!("hugepages-{}kB@{}", spec.page_size_kb, spec.node_label());
            state.hugepages.insert(
                (spec.page_size_kb, spec.node),
                Observed::from_read(
                    self.store.hugepage_count(spec.page_size_kb, spec.node).await,
                    "hugepages",
                    &pool,
                ),
            );
        }

        for address in devices {
            state.drivers.insert(
                address.clone(),
                Observed::from_read(
                    self.store.bound_driver(address).await,
                    "driver",
                    address.as_str(),
                ),
            );
        }

        state
    }

    /// Reads the driver currently bound to one device.
    pub async fn current_driver(&self, address: &BusAddress) -> HostPrepResult<Option<String>> {
        self.store.bound_driver(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicprep_test::fixtures::{addr, e1000_host, hugepages_2m, DATA_NIC};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_probe_reads_everything() {
        let host =
            e1000_host().with_loaded_module("vfio", &[("enable_unsafe_noiommu_mode", "N")]);
        let probe = ResourceProbe::new(Arc::new(host.clone()));
        let spec = hugepages_2m(1024);

        let state = probe
            .probe(
                &[ModuleSpec::new("vfio"), ModuleSpec::new("vfio-pci")],
                Some(&spec),
                &[addr(DATA_NIC)],
            )
            .await;

        assert!(state.module_satisfied(&ModuleSpec::new("vfio")));
        assert!(!state.module_satisfied(
            &ModuleSpec::new("vfio").with_parameter("enable_unsafe_noiommu_mode", "1")
        ));
        assert!(!state.module_satisfied(&ModuleSpec::new("vfio-pci")));
        assert!(!state.mount_satisfied(&spec));
        assert_eq!(state.hugepages[&(2048, None)], Observed::Known(0));
        assert!(state.device_bound_to(&addr(DATA_NIC), "e1000"));
        assert!(host.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reads_are_unknown() {
        let host = e1000_host().fail_pool_reads();
        let probe = ResourceProbe::new(Arc::new(host));
        let missing = addr("0000:09:00.0");

        let state = probe
            .probe(&[], Some(&hugepages_2m(8)), &[missing.clone()])
            .await;

        assert_eq!(state.hugepages[&(2048, None)], Observed::Unknown);
        assert_eq!(state.drivers[&missing], Observed::Unknown);
        assert!(!state.reservation_satisfied(&hugepages_2m(0)));
    }

    #[test]
    fn test_reservation_accepts_grant_above_minimum() {
        let mut spec = hugepages_2m(1024);
        spec.min_count = Some(512);
        let with_count = |count| HostState {
            hugepages: BTreeMap::from([((2048, None), Observed::Known(count))]),
            ..HostState::default()
        };

        assert!(with_count(600).reservation_satisfied(&spec));
        assert!(with_count(1024).reservation_satisfied(&spec));
        assert!(!with_count(300).reservation_satisfied(&spec));
        assert!(!with_count(2048).reservation_satisfied(&spec));
        assert!(!with_count(600).reservation_satisfied(&hugepages_2m(1024)));
    }
}
