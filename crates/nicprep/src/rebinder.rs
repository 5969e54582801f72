//! Driver Rebinder: moves a device between drivers.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use nicprep_common::{BusAddress, HostPrepError, HostPrepResult, ResourceStore};

use crate::catalog::DeviceCatalog;
use crate::journal::JournalEntry;
use crate::probe::ResourceProbe;

/// A failed rebind. `stranded` is set when the device was unbound and the
/// bind that followed failed; the caller must journal it so rollback can
/// bring the device back.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RebindError {
    #[source]
    pub error: HostPrepError,
    pub stranded: Option<JournalEntry>,
}

impl From<HostPrepError> for RebindError {
    fn from(error: HostPrepError) -> Self {
        Self {
            error,
            stranded: None,
        }
    }
}

/// Unbinds and binds devices, keeping the catalog in step.
pub struct DriverRebinder {
    store: Arc<dyn ResourceStore>,
    probe: ResourceProbe,
}

impl DriverRebinder {
    /// Creates a rebinder over `store`.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        let probe = ResourceProbe::new(store.clone());
        Self { store, probe }
    }

    /// Moves `address` to `target`.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - Already bound to `target`; nothing journaled
    /// * `Ok(Some(DeviceRebound))` - Moved from its prior driver
    /// * `Err(UnbindFailed)` - Still bound to its prior driver
    /// * `Err(BindFailed)` with `stranded` - Left without a driver
    #[instrument(skip(self, catalog), fields(address = %address, target = %target))]
    pub async fn rebind(
        &self,
        catalog: &mut DeviceCatalog,
        address: &BusAddress,
        target: &str,
    ) -> Result<Option<JournalEntry>, RebindError> {
        let current = self.probe.current_driver(address).await?;
        if current.as_deref() == Some(target) {
            debug!("Already bound to target driver");
            catalog.record_binding(address, current.as_deref());
            return Ok(None);
        }

        // Record before unbinding so a crash mid-rebind still leaves the
        // native driver recoverable.
        let recorded_original = match current.as_deref() {
            Some(driver) => catalog.record_original(address, driver).await?,
            None => false,
        };

        if let Some(driver) = current.as_deref() {
            if let Err(e) = self.store.unbind_driver(address, driver).await {
                if recorded_original {
                    if let Err(clear) = catalog.forget_original(address).await {
                        warn!(error = %clear, "Failed to clear original driver record");
                    }
                }
                return Err(HostPrepError::UnbindFailed {
                    address: address.to_string(),
                    driver: driver.to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
            catalog.record_binding(address, None);
            debug!(driver, "Unbound device");
        }

        if let Err(e) = self.store.bind_driver(address, target).await {
            let stranded = current.as_ref().map(|_| JournalEntry::DeviceStranded {
                address: address.clone(),
                prior_driver: current.clone(),
                recorded_original,
            });
            return Err(RebindError {
                error: HostPrepError::BindFailed {
                    address: address.to_string(),
                    driver: target.to_string(),
                    prior_driver: current,
                    reason: e.to_string(),
                },
                stranded,
            });
        }
        catalog.record_binding(address, Some(target));

        info!(prior = current.as_deref().unwrap_or("none"), "Rebound device");
        Ok(Some(JournalEntry::DeviceRebound {
            address: address.clone(),
            prior_driver: current,
            recorded_original,
        }))
    }

    /// Brings `address` back to `prior`, whatever it is bound to now.
    /// With `prior == None` the device is only unbound.
    #[instrument(skip(self, catalog), fields(address = %address))]
    pub async fn revert(
        &self,
        catalog: &mut DeviceCatalog,
        address: &BusAddress,
        prior: Option<&str>,
    ) -> HostPrepResult<()> {
        let current = self.probe.current_driver(address).await?;
        if current.as_deref() == prior {
            catalog.record_binding(address, prior);
            return Ok(());
        }

        if let Some(driver) = current.as_deref() {
            self.store
                .unbind_driver(address, driver)
                .await
                .map_err(|e| HostPrepError::UnbindFailed {
                    address: address.to_string(),
                    driver: driver.to_string(),
                    reason: e.to_string(),
                })?;
            catalog.record_binding(address, None);
        }

        if let Some(driver) = prior {
            self.store
                .bind_driver(address, driver)
                .await
                .map_err(|e| HostPrepError::BindFailed {
                    address: address.to_string(),
                    driver: driver.to_string(),
                    prior_driver: current.clone(),
                    reason: e.to_string(),
                })?;
            catalog.record_binding(address, Some(driver));
        }

        info!(
            from = current.as_deref().unwrap_or("none"),
            to = prior.unwrap_or("none"),
            "Reverted device binding"
        );
        Ok(())
    }

    /// Teardown: returns `address` to its recorded original driver and
    /// discards its record.
    #[instrument(skip(self, catalog), fields(address = %address))]
    pub async fn restore(
        &self,
        catalog: &mut DeviceCatalog,
        address: &BusAddress,
    ) -> HostPrepResult<()> {
        let original = catalog
            .original_driver(address)
            .await?
            .ok_or_else(|| {
                HostPrepError::store("restore", address.as_str(), "no original driver on record")
            })?;

        self.revert(catalog, address, Some(&original)).await?;
        catalog.discard(address).await?;
        info!(driver = %original, "Restored original driver");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ReservedDevicePolicy;
    use nicprep_common::DeviceFilter;
    use nicprep_test::fixtures::{addr, e1000_host, DATA_NIC};
    use nicprep_test::FakeHost;
    use pretty_assertions::assert_eq;

    async fn setup(host: &FakeHost) -> (DriverRebinder, DeviceCatalog) {
        let store: Arc<dyn ResourceStore> = Arc::new(host.clone());
        let mut catalog = DeviceCatalog::new(
            store.clone(),
            ReservedDevicePolicy::default(),
            ["vfio-pci", "uio_pci_generic"],
        );
        catalog.discover(&DeviceFilter::network()).await.unwrap();
        (DriverRebinder::new(store), catalog)
    }

    #[tokio::test]
    async fn test_rebind_and_restore() {
        let host = e1000_host();
        let (rebinder, mut catalog) = setup(&host).await;
        let nic = addr(DATA_NIC);

        let entry = rebinder
            .rebind(&mut catalog, &nic, "vfio-pci")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.to_string(), "(rebind, 0000:02:02.0, e1000)");
        assert_eq!(host.driver_of(DATA_NIC).as_deref(), Some("vfio-pci"));
        assert_eq!(host.recorded_original(DATA_NIC).as_deref(), Some("e1000"));

        assert!(rebinder
            .rebind(&mut catalog, &nic, "vfio-pci")
            .await
            .unwrap()
            .is_none());

        rebinder.restore(&mut catalog, &nic).await.unwrap();
        assert_eq!(host.driver_of(DATA_NIC).as_deref(), Some("e1000"));
        assert_eq!(host.recorded_original(DATA_NIC), None);
        assert!(catalog.device(&nic).is_none());
    }

    #[tokio::test]
    async fn test_unbind_failure_leaves_device_alone() {
        let host = e1000_host().fail_unbind(DATA_NIC);
        let (rebinder, mut catalog) = setup(&host).await;

        let err = rebinder
            .rebind(&mut catalog, &addr(DATA_NIC), "vfio-pci")
            .await
            .unwrap_err();
        assert!(matches!(err.error, HostPrepError::UnbindFailed { .. }));
        assert!(err.stranded.is_none());
        assert_eq!(host.driver_of(DATA_NIC).as_deref(), Some("e1000"));
        assert_eq!(host.recorded_original(DATA_NIC), None);
    }

    #[tokio::test]
    async fn test_bind_failure_strands_device() {
        let host = e1000_host().fail_bind(DATA_NIC, "vfio-pci");
        let (rebinder, mut catalog) = setup(&host).await;
        let nic = addr(DATA_NIC);

        let err = rebinder
            .rebind(&mut catalog, &nic, "vfio-pci")
            .await
            .unwrap_err();
        match &err.error {
            HostPrepError::BindFailed { prior_driver, .. } => {
                assert_eq!(prior_driver.as_deref(), Some("e1000"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            err.stranded,
            Some(JournalEntry::DeviceStranded {
                address: nic.clone(),
                prior_driver: Some("e1000".to_string()),
                recorded_original: true,
            })
        );
        assert_eq!(host.driver_of(DATA_NIC), None);

        rebinder
            .revert(&mut catalog, &nic, Some("e1000"))
            .await
            .unwrap();
        assert_eq!(host.driver_of(DATA_NIC).as_deref(), Some("e1000"));
    }

    #[tokio::test]
    async fn test_rebind_unbound_device() {
        let host = e1000_host();
        host.set_driver(DATA_NIC, None);
        let (rebinder, mut catalog) = setup(&host).await;
        let nic = addr(DATA_NIC);

        let entry = rebinder
            .rebind(&mut catalog, &nic, "vfio-pci")
            .await
            .unwrap();
        assert_eq!(
            entry,
            Some(JournalEntry::DeviceRebound {
                address: nic.clone(),
                prior_driver: None,
                recorded_original: false,
            })
        );
        assert!(rebinder.restore(&mut catalog, &nic).await.is_err());
    }
}
