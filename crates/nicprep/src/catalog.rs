//! Device Catalog: candidate devices, the management-device safety policy,
//! and the durable original-driver history.
//!
//! The catalog is the only writer of a device's `current_driver` and
//! `original_driver`. The original driver is written once, before the
//! first unbind away from a native driver, and removed only after the
//! device is restored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use nicprep_common::{BusAddress, DeviceFilter, HostPrepResult, PciDevice, ResourceStore};

/// Hosts usually carry their management interface first in enumeration
/// order. The first `reserve_leading` matched devices are never
/// repurposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedDevicePolicy {
    /// Number of leading matched devices to keep on the host.
    pub reserve_leading: usize,
}

impl Default for ReservedDevicePolicy {
    fn default() -> Self {
        Self { reserve_leading: 1 }
    }
}

/// One matched device with its eligibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub device: PciDevice,
    /// Kept on the host by [`ReservedDevicePolicy`].
    pub reserved: bool,
}

/// Candidate devices and their driver history.
pub struct DeviceCatalog {
    store: Arc<dyn ResourceStore>,
    policy: ReservedDevicePolicy,
    passthrough_drivers: BTreeSet<String>,
    records: BTreeMap<BusAddress, PciDevice>,
    reserved: BTreeSet<BusAddress>,
}

impl DeviceCatalog {
    /// Creates a catalog. Drivers in `passthrough_drivers` are never
    /// recorded as a device's original driver.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        policy: ReservedDevicePolicy,
        passthrough_drivers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            store,
            policy,
            passthrough_drivers: passthrough_drivers.into_iter().map(Into::into).collect(),
            records: BTreeMap::new(),
            reserved: BTreeSet::new(),
        }
    }

    /// Enumerates every matching device in discovery order, marking the
    /// ones the policy reserves.
    #[instrument(skip(self))]
    pub async fn enumerate(
        &mut self,
        filter: &DeviceFilter,
    ) -> HostPrepResult<Vec<CatalogEntry>> {
        let descriptors = self.store.list_devices(filter).await?;
        let mut entries = Vec::with_capacity(descriptors.len());

        for (index, desc) in descriptors.into_iter().enumerate() {
            let original = self.store.original_driver(&desc.address).await?;
            let device = PciDevice::from_descriptor(desc, original);
            let reserved = index < self.policy.reserve_leading;
            if reserved {
                debug!(address = %device.address, "Reserved for host management");
                self.reserved.insert(device.address.clone());
            } else {
                self.reserved.remove(&device.address);
            }
            self.records.insert(device.address.clone(), device.clone());
            entries.push(CatalogEntry { device, reserved });
        }

        Ok(entries)
    }

    /// Eligible setup targets: matching devices minus the reserved ones.
    pub async fn discover(&mut self, filter: &DeviceFilter) -> HostPrepResult<Vec<PciDevice>> {
        Ok(self
            .enumerate(filter)
            .await?
            .into_iter()
            .filter(|e| !e.reserved)
            .map(|e| e.device)
            .collect())
    }

    /// Teardown candidates: every matching device with an original driver
    /// on record, reserved or not.
    pub async fn discover_recorded(
        &mut self,
        filter: &DeviceFilter,
    ) -> HostPrepResult<Vec<PciDevice>> {
        Ok(self
            .enumerate(filter)
            .await?
            .into_iter()
            .filter(|e| e.device.original_driver.is_some())
            .map(|e| e.device)
            .collect())
    }

    /// Adds devices that have a durable record but were not matched by
    /// enumeration, so teardown still sees them. Returns the addresses
    /// that are on record but absent from the host.
    pub async fn adopt_recorded(&mut self) -> HostPrepResult<Vec<BusAddress>> {
        let mut missing = Vec::new();
        for (address, original) in self.store.recorded_devices().await? {
            if self.records.contains_key(&address) {
                continue;
            }
            match self.store.bound_driver(&address).await {
                Ok(current) => {
                    self.records.insert(
                        address.clone(),
                        PciDevice {
                            address,
                            class: String::new(),
                            vendor: String::new(),
                            device: String::new(),
                            current_driver: current,
                            original_driver: Some(original),
                        },
                    );
                }
                Err(_) => missing.push(address),
            }
        }
        Ok(missing)
    }

    /// The catalog record of a device.
    pub fn device(&self, address: &BusAddress) -> Option<&PciDevice> {
        self.records.get(address)
    }

    /// Every known device in address order.
    pub fn devices(&self) -> impl Iterator<Item = &PciDevice> {
        self.records.values()
    }

    /// Returns true if the policy keeps the device on the host.
    pub fn is_reserved(&self, address: &BusAddress) -> bool {
        self.reserved.contains(address)
    }

    /// Returns true if `driver` hands the device to user space.
    pub fn is_passthrough(&self, driver: &str) -> bool {
        self.passthrough_drivers.contains(driver)
    }

    /// Notes the driver a device is now bound to.
    pub fn record_binding(&mut self, address: &BusAddress, driver: Option<&str>) {
        if let Some(device) = self.records.get_mut(address) {
            device.current_driver = driver.map(str::to_string);
        }
    }

    /// Durably records `driver` as the device's original driver, unless a
    /// record already exists or `driver` is itself a passthrough driver.
    /// Returns true if a record was written.
    #[instrument(skip(self), fields(address = %address))]
    pub async fn record_original(
        &mut self,
        address: &BusAddress,
        driver: &str,
    ) -> HostPrepResult<bool> {
        if self.is_passthrough(driver) {
            return Ok(false);
        }
        if self.original_driver(address).await?.is_some() {
            return Ok(false);
        }

        self.store.set_original_driver(address, driver).await?;
        if let Some(device) = self.records.get_mut(address) {
            device.original_driver = Some(driver.to_string());
        }
        info!("Recorded original driver");
        Ok(true)
    }

    /// The recorded original driver, from the catalog or the durable store.
    pub async fn original_driver(&self, address: &BusAddress) -> HostPrepResult<Option<String>> {
        if let Some(original) = self
            .records
            .get(address)
            .and_then(|d| d.original_driver.clone())
        {
            return Ok(Some(original));
        }
        self.store.original_driver(address).await
    }

    /// Removes the original-driver record written by a run that is being
    /// rolled back. The device stays in the catalog.
    pub async fn forget_original(&mut self, address: &BusAddress) -> HostPrepResult<()> {
        self.store.clear_original_driver(address).await?;
        if let Some(device) = self.records.get_mut(address) {
            device.original_driver = None;
        }
        Ok(())
    }

    /// Drops a restored device: its durable record and its catalog entry.
    #[instrument(skip(self), fields(address = %address))]
    pub async fn discard(&mut self, address: &BusAddress) -> HostPrepResult<()> {
        self.store.clear_original_driver(address).await?;
        self.records.remove(address);
        self.reserved.remove(address);
        debug!("Discarded device record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicprep_test::fixtures::{
        addr, dual_port_host, e1000_host, DATA_NIC, MGMT_NIC, SECOND_DATA_NIC,
    };
    use nicprep_test::FakeHost;
    use pretty_assertions::assert_eq;

    fn catalog(host: &FakeHost) -> DeviceCatalog {
        DeviceCatalog::new(
            Arc::new(host.clone()),
            ReservedDevicePolicy::default(),
            ["vfio-pci", "uio_pci_generic", "igb_uio"],
        )
    }

    #[tokio::test]
    async fn test_discover_skips_management_device() {
        let host = dual_port_host();
        let mut catalog = catalog(&host);

        let found = catalog.discover(&DeviceFilter::network()).await.unwrap();
        let addresses: Vec<&str> = found.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec![DATA_NIC, SECOND_DATA_NIC]);
        assert!(catalog.is_reserved(&addr(MGMT_NIC)));
        assert_eq!(
            catalog.device(&addr(MGMT_NIC)).unwrap().current_driver.as_deref(),
            Some("e1000")
        );
    }

    #[tokio::test]
    async fn test_discover_is_stable() {
        let host = dual_port_host();
        let mut catalog = catalog(&host);
        let first = catalog.discover(&DeviceFilter::network()).await.unwrap();
        let second = catalog.discover(&DeviceFilter::network()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_reserve_none() {
        let host = e1000_host();
        let mut catalog = DeviceCatalog::new(
            Arc::new(host),
            ReservedDevicePolicy { reserve_leading: 0 },
            ["vfio-pci"],
        );
        let found = catalog.discover(&DeviceFilter::network()).await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_record_original_once() {
        let host = e1000_host();
        let mut catalog = catalog(&host);
        catalog.discover(&DeviceFilter::network()).await.unwrap();
        let nic = addr(DATA_NIC);

        assert!(!catalog.record_original(&nic, "vfio-pci").await.unwrap());
        assert!(catalog.record_original(&nic, "e1000").await.unwrap());
        assert!(!catalog.record_original(&nic, "igb").await.unwrap());
        assert_eq!(host.recorded_original(DATA_NIC).as_deref(), Some("e1000"));
        assert_eq!(
            catalog.device(&nic).unwrap().original_driver.as_deref(),
            Some("e1000")
        );
    }

    #[tokio::test]
    async fn test_discover_recorded_and_discard() {
        let host = e1000_host()
            .with_original_driver(DATA_NIC, "e1000")
            .with_original_driver("0000:0a:00.0", "ixgbe");
        host.set_driver(DATA_NIC, Some("vfio-pci"));
        let mut catalog = catalog(&host);

        let recorded = catalog
            .discover_recorded(&DeviceFilter::network())
            .await
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].current_driver.as_deref(), Some("vfio-pci"));

        let missing = catalog.adopt_recorded().await.unwrap();
        assert_eq!(missing, vec![addr("0000:0a:00.0")]);

        catalog.discard(&addr(DATA_NIC)).await.unwrap();
        assert!(catalog.device(&addr(DATA_NIC)).is_none());
        assert_eq!(host.recorded_original(DATA_NIC), None);
    }

    #[tokio::test]
    async fn test_forget_original_keeps_device() {
        let host = e1000_host();
        let mut catalog = catalog(&host);
        catalog.discover(&DeviceFilter::network()).await.unwrap();
        let nic = addr(DATA_NIC);

        catalog.record_original(&nic, "e1000").await.unwrap();
        catalog.forget_original(&nic).await.unwrap();
        assert_eq!(host.recorded_original(DATA_NIC), None);
        assert_eq!(catalog.device(&nic).unwrap().original_driver, None);
    }
}
