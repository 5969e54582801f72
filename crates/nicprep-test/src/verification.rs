//! Verification helpers for host state
//!
//! Provides assertion helpers returning descriptive errors, plus
//! [`HostSnapshot`] for "state after equals state before" checks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use nicprep_common::{BusAddress, HostModuleState};
use thiserror::Error;

use crate::FakeHost;

/// Full host state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    /// hugetlbfs mount points.
    pub mounts: BTreeSet<PathBuf>,
    /// Reserved pages per (page size kB, node).
    pub hugepages: BTreeMap<(u64, Option<u32>), u64>,
    /// Loaded modules.
    pub modules: BTreeMap<String, HostModuleState>,
    /// Bound driver per device.
    pub drivers: BTreeMap<BusAddress, Option<String>>,
    /// Durable original-driver records.
    pub original_drivers: BTreeMap<BusAddress, String>,
}

impl HostSnapshot {
    /// Lists human-readable differences from `other`.
    pub fn differences(&self, other: &HostSnapshot) -> Vec<String> {
        let mut diffs = Vec::new();
        if self.mounts != other.mounts {
            diffs.push(format!("mounts: {:?} -> {:?}", self.mounts, other.mounts));
        }
        if self.hugepages != other.hugepages {
            diffs.push(format!(
                "hugepages: {:?} -> {:?}",
                self.hugepages, other.hugepages
            ));
        }
        let before: BTreeSet<_> = self.modules.keys().collect();
        let after: BTreeSet<_> = other.modules.keys().collect();
        if self.modules != other.modules {
            diffs.push(format!("modules: {:?} -> {:?}", before, after));
        }
        for (address, driver) in &self.drivers {
            let now = other.drivers.get(address).cloned().flatten();
            if driver != &now {
                diffs.push(format!("{}: {:?} -> {:?}", address, driver, now));
            }
        }
        if self.original_drivers != other.original_drivers {
            diffs.push(format!(
                "original drivers: {:?} -> {:?}",
                self.original_drivers, other.original_drivers
            ));
        }
        diffs
    }
}

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Device {address}: expected driver {expected:?}, found {actual:?}")]
    DriverMismatch {
        address: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Pool {page_size_kb}kB/{node:?}: expected {expected} pages, found {actual}")]
    PageCountMismatch {
        page_size_kb: u64,
        node: Option<u32>,
        expected: u64,
        actual: u64,
    },

    #[error("Module {module}: expected loaded={expected}")]
    ModuleMismatch { module: String, expected: bool },

    #[error("Device {address}: expected original driver {expected:?}, found {actual:?}")]
    OriginalDriverMismatch {
        address: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Host state changed: {}", .0.join("; "))]
    StateChanged(Vec<String>),
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Host state verification helper
pub struct HostVerifier<'a> {
    host: &'a FakeHost,
}

impl<'a> HostVerifier<'a> {
    /// Create a new verifier over `host`
    pub fn new(host: &'a FakeHost) -> Self {
        Self { host }
    }

    /// Verify the driver bound to a device (`None` for unbound)
    pub fn assert_driver(&self, address: &str, expected: Option<&str>) -> VerifyResult<()> {
        let actual = self.host.driver_of(address);
        if actual.as_deref() == expected {
            return Ok(());
        }
        Err(VerificationError::DriverMismatch {
            address: address.to_string(),
            expected: expected.map(str::to_string),
            actual,
        })
    }

    /// Verify the reservation of a huge page pool
    pub fn assert_pages(
        &self,
        page_size_kb: u64,
        node: Option<u32>,
        expected: u64,
    ) -> VerifyResult<()> {
        let actual = self.host.reserved_pages(page_size_kb, node);
        if actual == expected {
            return Ok(());
        }
        Err(VerificationError::PageCountMismatch {
            page_size_kb,
            node,
            expected,
            actual,
        })
    }

    /// Verify whether a module is loaded
    pub fn assert_module(&self, module: &str, expected: bool) -> VerifyResult<()> {
        if self.host.is_module_loaded(module) == expected {
            return Ok(());
        }
        Err(VerificationError::ModuleMismatch {
            module: module.to_string(),
            expected,
        })
    }

    /// Verify the durable original-driver record of a device
    pub fn assert_original(&self, address: &str, expected: Option<&str>) -> VerifyResult<()> {
        let actual = self.host.recorded_original(address);
        if actual.as_deref() == expected {
            return Ok(());
        }
        Err(VerificationError::OriginalDriverMismatch {
            address: address.to_string(),
            expected: expected.map(str::to_string),
            actual,
        })
    }

    /// Verify the host is exactly as it was when `before` was taken
    pub fn assert_unchanged(&self, before: &HostSnapshot) -> VerifyResult<()> {
        let diffs = before.differences(&self.host.snapshot());
        if diffs.is_empty() {
            Ok(())
        } else {
            Err(VerificationError::StateChanged(diffs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{e1000_host, DATA_NIC};

    #[test]
    fn test_snapshot_differences() {
        let host = e1000_host();
        let before = host.snapshot();
        assert!(HostVerifier::new(&host).assert_unchanged(&before).is_ok());

        host.set_driver(DATA_NIC, None);
        let err = HostVerifier::new(&host)
            .assert_unchanged(&before)
            .unwrap_err();
        assert!(err.to_string().contains("0000:02:02.0"));
    }

    #[test]
    fn test_driver_mismatch() {
        let host = e1000_host();
        let verifier = HostVerifier::new(&host);
        assert!(verifier.assert_driver(DATA_NIC, Some("e1000")).is_ok());
        assert!(matches!(
            verifier.assert_driver(DATA_NIC, Some("vfio-pci")),
            Err(VerificationError::DriverMismatch { .. })
        ));
    }
}
