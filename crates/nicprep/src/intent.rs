//! What a run is asked to do.

use std::collections::BTreeSet;

use serde::Serialize;

use nicprep_common::{BusAddress, HugepageSpec, ModuleSpec};

use crate::module_mgr::required_modules;

/// The desired outcome of one run. Immutable for the run's duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ReconciliationIntent {
    /// Hand `devices` to `target_driver` with huge pages reserved.
    Setup {
        devices: BTreeSet<BusAddress>,
        target_driver: String,
        hugepages: HugepageSpec,
        /// Modules to load first, in order.
        modules: Vec<ModuleSpec>,
    },

    /// Return `devices` to their recorded original drivers.
    Teardown { devices: BTreeSet<BusAddress> },
}

impl ReconciliationIntent {
    /// A setup intent with the modules `target_driver` needs.
    pub fn setup(
        devices: impl IntoIterator<Item = BusAddress>,
        target_driver: impl Into<String>,
        hugepages: HugepageSpec,
        no_iommu: bool,
    ) -> Self {
        let target_driver = target_driver.into();
        Self::Setup {
            devices: devices.into_iter().collect(),
            modules: required_modules(&target_driver, no_iommu),
            target_driver,
            hugepages,
        }
    }

    /// A teardown intent.
    pub fn teardown(devices: impl IntoIterator<Item = BusAddress>) -> Self {
        Self::Teardown {
            devices: devices.into_iter().collect(),
        }
    }

    /// Devices the intent concerns.
    pub fn devices(&self) -> &BTreeSet<BusAddress> {
        match self {
            Self::Setup { devices, .. } | Self::Teardown { devices } => devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicprep_test::fixtures::{addr, hugepages_2m, DATA_NIC};

    #[test]
    fn test_setup_intent_modules() {
        let intent = ReconciliationIntent::setup(
            [addr(DATA_NIC), addr("02:02.0")],
            "vfio-pci",
            hugepages_2m(64),
            true,
        );
        assert_eq!(intent.devices().len(), 1);
        match intent {
            ReconciliationIntent::Setup { modules, .. } => {
                assert_eq!(modules.len(), 2);
                assert_eq!(modules[0].name, "vfio");
            }
            ReconciliationIntent::Teardown { .. } => panic!("expected setup"),
        }
    }
}
