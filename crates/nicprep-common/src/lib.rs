//! Common infrastructure for nicprep, the kernel-bypass host preparation
//! tool.
//!
//! - [`error`]: error taxonomy shared by every component
//! - [`types`]: data model (bus addresses, module/hugepage specs, devices)
//! - [`store`]: the [`ResourceStore`] capability trait through which all
//!   host state is read and written
//! - [`sysfs`]: [`SysfsStore`], the implementation backed by sysfs, procfs
//!   and the system tools
//! - [`shell`]: quoted shell command execution
//!
//! # Example
//!
//! ```ignore
//! use nicprep_common::{ResourceStore, SysfsStore};
//!
//! let store = SysfsStore::host();
//! let driver = store.bound_driver(&"02:02.0".parse()?).await?;
//! ```

pub mod error;
pub mod shell;
pub mod store;
pub mod sysfs;
pub mod types;

// Re-export commonly used items at crate root
pub use error::{HostPrepError, HostPrepResult};
pub use store::ResourceStore;
pub use sysfs::SysfsStore;
pub use types::{
    BusAddress, DeviceDescriptor, DeviceFilter, HostModuleState, HugepageSpec, ModuleSpec,
    PciDevice,
};
