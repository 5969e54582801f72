//! Error types for host preparation.
//!
//! Every variant names the entity it concerns (module, device address,
//! hugepage pool, lock file) so that operators can act on the report
//! without digging through logs. All errors implement `std::error::Error`
//! via `thiserror`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for host preparation operations.
pub type HostPrepResult<T> = Result<T, HostPrepError>;

/// Errors that can occur while reconciling host resources.
#[derive(Debug, Error)]
pub enum HostPrepError {
    /// A module is already loaded with parameters that differ from the
    /// requested ones. Reloading it could pull the driver out from under
    /// devices that still use it, so this is surfaced instead.
    #[error(
        "Module '{module}' is loaded with {parameter}={actual}, but {parameter}={expected} was requested"
    )]
    ModuleParamConflict {
        /// The module name.
        module: String,
        /// The conflicting parameter.
        parameter: String,
        /// Requested value.
        expected: String,
        /// Value the running module reports.
        actual: String,
    },

    /// Loading a kernel module failed (missing module, permission denied).
    #[error("Failed to load module '{module}': {reason}")]
    ModuleLoadFailed {
        /// The module name.
        module: String,
        /// Underlying failure.
        reason: String,
    },

    /// The kernel granted fewer huge pages than required.
    #[error(
        "Insufficient huge pages for {page_size_kb}kB pool on {node}: requested {requested}, required {required}, granted {granted}"
    )]
    InsufficientHugepages {
        /// Page size in kB.
        page_size_kb: u64,
        /// NUMA node label ("node0", or "all nodes").
        node: String,
        /// Count written to the kernel.
        requested: u64,
        /// Minimum acceptable count.
        required: u64,
        /// Count the kernel actually reserved.
        granted: u64,
    },

    /// The hugetlbfs mount could not be created or is missing.
    #[error("Huge page mount at {path} unavailable: {reason}")]
    HugepageMountFailed {
        /// Mount point.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Unbinding a device from its driver failed (device busy or in use).
    #[error("Failed to unbind {address} from '{driver}': {reason}")]
    UnbindFailed {
        /// PCI bus address.
        address: String,
        /// Driver the device was bound to.
        driver: String,
        /// Underlying failure.
        reason: String,
    },

    /// Binding a device to a driver failed. If `prior_driver` is set the
    /// device was unbound from it first and is now left without a driver.
    #[error("Failed to bind {address} to '{driver}': {reason}")]
    BindFailed {
        /// PCI bus address.
        address: String,
        /// Driver the bind targeted.
        driver: String,
        /// Driver bound before the failed rebind, if any.
        prior_driver: Option<String>,
        /// Underlying failure.
        reason: String,
    },

    /// Another run holds the host lock.
    #[error("Another run holds the host lock {lock_path}")]
    ConcurrentRunRejected {
        /// The lock file.
        lock_path: PathBuf,
    },

    /// The device is not present on the host (or not matched by the filter).
    #[error("Device '{address}' not found")]
    DeviceNotFound {
        /// PCI bus address.
        address: String,
    },

    /// The device is reserved for host management and is never repurposed.
    #[error("Device '{address}' is reserved for host management")]
    ReservedDevice {
        /// PCI bus address.
        address: String,
    },

    /// The run deadline expired between steps.
    #[error("Run timed out after {completed_steps} completed step(s)")]
    RunTimedOut {
        /// Steps completed before the deadline check fired.
        completed_steps: usize,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// A resource store read or write failed.
    #[error("Resource store operation failed: {operation} {target}: {message}")]
    Store {
        /// The operation that failed (e.g., "read", "write", "list").
        operation: String,
        /// The store key (sysfs path, metadata key).
        target: String,
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Local file IO outside the resource store (lock file, config file).
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file concerned.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl HostPrepError {
    /// Creates a resource store error.
    pub fn store(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a device not found error.
    pub fn device_not_found(address: impl ToString) -> Self {
        Self::DeviceNotFound {
            address: address.to_string(),
        }
    }

    /// Returns the identifier of the entity the error concerns, if any.
    pub fn entity(&self) -> Option<String> {
        match self {
            Self::ModuleParamConflict { module, .. } | Self::ModuleLoadFailed { module, .. } => {
                Some(module.clone())
            }
            Self::InsufficientHugepages {
                page_size_kb, node, ..
            } => Some(format!("hugepages-{}kB@{}", page_size_kb, node)),
            Self::HugepageMountFailed { path, .. } => Some(path.display().to_string()),
            Self::UnbindFailed { address, .. }
            | Self::BindFailed { address, .. }
            | Self::DeviceNotFound { address }
            | Self::ReservedDevice { address } => Some(address.clone()),
            Self::ConcurrentRunRejected { lock_path } => Some(lock_path.display().to_string()),
            Self::Io { path, .. } => Some(path.display().to_string()),
            Self::Store { target, .. } => Some(target.clone()),
            Self::InvalidConfig { field, .. } => Some(field.clone()),
            Self::ShellExec { command, .. } | Self::ShellCommandFailed { command, .. } => {
                Some(command.clone())
            }
            Self::RunTimedOut { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HostPrepError::device_not_found("0000:02:02.0");
        assert_eq!(err.to_string(), "Device '0000:02:02.0' not found");
    }

    #[test]
    fn test_param_conflict_display() {
        let err = HostPrepError::ModuleParamConflict {
            module: "vfio".to_string(),
            parameter: "enable_unsafe_noiommu_mode".to_string(),
            expected: "1".to_string(),
            actual: "N".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'vfio'"));
        assert!(msg.contains("enable_unsafe_noiommu_mode=N"));
        assert!(msg.contains("enable_unsafe_noiommu_mode=1 was requested"));
    }

    #[test]
    fn test_shell_command_failed() {
        let err = HostPrepError::ShellCommandFailed {
            command: "/sbin/modprobe \"vfio-pci\"".to_string(),
            exit_code: 1,
            output: "FATAL: Module vfio-pci not found".to_string(),
        };
        assert!(err.to_string().contains("modprobe"));
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn test_entity() {
        let err = HostPrepError::BindFailed {
            address: "0000:02:02.0".to_string(),
            driver: "vfio-pci".to_string(),
            prior_driver: Some("e1000".to_string()),
            reason: "No such device".to_string(),
        };
        assert_eq!(err.entity().as_deref(), Some("0000:02:02.0"));

        let err = HostPrepError::InsufficientHugepages {
            page_size_kb: 2048,
            node: "node0".to_string(),
            requested: 1024,
            required: 1024,
            granted: 512,
        };
        assert_eq!(err.entity().as_deref(), Some("hugepages-2048kB@node0"));

        let err = HostPrepError::RunTimedOut { completed_steps: 3 };
        assert!(err.entity().is_none());
    }
}
