//! The resource store: the narrow capability interface through which all
//! host state is read and written.
//!
//! Business logic never touches sysfs, procfs or system tools directly.
//! Every operation is a fallible key-value style read or write with no
//! implied transactionality; ordering and rollback are the caller's job.
//!
//! | Resource | Read | Write |
//! |----------|------|-------|
//! | hugetlbfs mount | [`ResourceStore::is_hugetlbfs_mounted`] | mount / unmount |
//! | hugepage pool | [`ResourceStore::hugepage_count`] | [`ResourceStore::set_hugepage_count`] |
//! | kernel module | [`ResourceStore::module_state`] | load / unload |
//! | device binding | [`ResourceStore::bound_driver`] | unbind / bind |
//! | devices | [`ResourceStore::list_devices`] | - |
//! | device metadata | [`ResourceStore::original_driver`], [`ResourceStore::recorded_devices`] | set / clear |

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::HostPrepResult;
use crate::types::{BusAddress, DeviceDescriptor, DeviceFilter, HostModuleState, ModuleSpec};

/// Host resource capabilities used by the reconciliation engine.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Returns true if a hugetlbfs filesystem is mounted at `path`.
    async fn is_hugetlbfs_mounted(&self, path: &Path) -> HostPrepResult<bool>;

    /// Mounts hugetlbfs for the given page size at `path`.
    async fn mount_hugetlbfs(&self, path: &Path, page_size_kb: u64) -> HostPrepResult<()>;

    /// Unmounts the hugetlbfs filesystem at `path`.
    async fn unmount_hugetlbfs(&self, path: &Path) -> HostPrepResult<()>;

    /// Reads the reserved page count for a (page size, node) pool.
    async fn hugepage_count(&self, page_size_kb: u64, node: Option<u32>) -> HostPrepResult<u64>;

    /// Writes the desired page count for a pool. The kernel may grant
    /// fewer; callers must read the count back.
    async fn set_hugepage_count(
        &self,
        page_size_kb: u64,
        node: Option<u32>,
        count: u64,
    ) -> HostPrepResult<()>;

    /// Reads whether a module is loaded and its parameters.
    async fn module_state(&self, name: &str) -> HostPrepResult<HostModuleState>;

    /// Loads a module with the given parameters.
    async fn load_module(&self, spec: &ModuleSpec) -> HostPrepResult<()>;

    /// Unloads a module.
    async fn unload_module(&self, name: &str) -> HostPrepResult<()>;

    /// Reads the driver bound to a device.
    async fn bound_driver(&self, address: &BusAddress) -> HostPrepResult<Option<String>>;

    /// Detaches a device from `driver`, leaving no driver preference
    /// behind.
    async fn unbind_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()>;

    /// Attaches an unbound device to `driver`. Any driver preference set
    /// for the handover is cleared afterwards, whether or not it succeeded.
    async fn bind_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()>;

    /// Enumerates devices matching `filter`, in enumeration order.
    async fn list_devices(&self, filter: &DeviceFilter) -> HostPrepResult<Vec<DeviceDescriptor>>;

    /// Reads the durable original-driver record for a device.
    async fn original_driver(&self, address: &BusAddress) -> HostPrepResult<Option<String>>;

    /// Writes the durable original-driver record for a device.
    async fn set_original_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()>;

    /// Removes the durable original-driver record for a device.
    async fn clear_original_driver(&self, address: &BusAddress) -> HostPrepResult<()>;

    /// Lists every durable original-driver record.
    async fn recorded_devices(&self) -> HostPrepResult<BTreeMap<BusAddress, String>>;
}
