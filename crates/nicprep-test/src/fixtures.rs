//! Test fixtures for common host topologies.

use std::path::PathBuf;

use nicprep_common::{BusAddress, HugepageSpec};

use crate::FakeHost;

/// First Ethernet controller: the management interface.
pub const MGMT_NIC: &str = "0000:02:01.0";

/// Second Ethernet controller: the usual passthrough target.
pub const DATA_NIC: &str = "0000:02:02.0";

/// Third Ethernet controller, on dual-port hosts.
pub const SECOND_DATA_NIC: &str = "0000:02:03.0";

/// A display controller that network filters must ignore.
pub const GPU: &str = "0000:00:0f.0";

/// Default hugetlbfs mount point.
pub const HUGE_MOUNT: &str = "/mnt/huge";

/// Parses a fixture address.
pub fn addr(address: &str) -> BusAddress {
    address
        .parse()
        .unwrap_or_else(|e| panic!("fixture address '{}': {}", address, e))
}

/// A VM-like host: two e1000 NICs (management first), a GPU, the vfio and
/// uio module families available but not loaded, and an empty 2 MB page
/// pool that can grow to 4096 pages. No hugetlbfs mount.
pub fn e1000_host() -> FakeHost {
    FakeHost::new()
        .with_device(GPU, "0300", "15ad", "0405", Some("vmwgfx"))
        .with_nic(MGMT_NIC, Some("e1000"))
        .with_nic(DATA_NIC, Some("e1000"))
        .with_available_module("vfio")
        .with_available_module("vfio-pci")
        .with_available_module("uio")
        .with_available_module("uio_pci_generic")
        .with_pool(2048, None, 0, 4096)
}

/// [`e1000_host`] with a third NIC.
pub fn dual_port_host() -> FakeHost {
    e1000_host().with_nic(SECOND_DATA_NIC, Some("e1000"))
}

/// Spec for `count` 2 MB pages in the system-wide pool at [`HUGE_MOUNT`].
pub fn hugepages_2m(count: u64) -> HugepageSpec {
    HugepageSpec {
        page_size_kb: 2048,
        node: None,
        count,
        min_count: None,
        mount_path: PathBuf::from(HUGE_MOUNT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e1000_host_topology() {
        let host = e1000_host();
        assert_eq!(host.driver_of(MGMT_NIC).as_deref(), Some("e1000"));
        assert_eq!(host.driver_of(DATA_NIC).as_deref(), Some("e1000"));
        assert_eq!(host.driver_of(SECOND_DATA_NIC), None);
        assert!(!host.is_mounted(HUGE_MOUNT));
        assert_eq!(host.reserved_pages(2048, None), 0);
    }

    #[test]
    fn test_hugepages_fixture() {
        let spec = hugepages_2m(512);
        assert_eq!(spec.required(), 512);
        assert_eq!(spec.mount_path, PathBuf::from("/mnt/huge"));
        assert_eq!(addr("02:02.0").as_str(), DATA_NIC);
    }
}
