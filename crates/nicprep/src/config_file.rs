//! Configuration file support for nicprep
//!
//! Loads and validates nicprep configuration from TOML files.
//! Default location: /etc/nicprep/nicprep.toml

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use nicprep_common::sysfs::DEFAULT_STATE_DIR;
use nicprep_common::{DeviceFilter, HostPrepError, HostPrepResult, HugepageSpec};

use crate::catalog::ReservedDevicePolicy;
use crate::lock::DEFAULT_LOCK_PATH;
use crate::orchestrator::{OrchestratorConfig, DEFAULT_PASSTHROUGH_DRIVERS};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nicprep/nicprep.toml";

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Passthrough driver devices are handed to
    #[serde(default = "default_target_driver")]
    pub target: String,

    /// Drivers that are never recorded as a device's original driver
    #[serde(default = "default_passthrough_drivers")]
    pub passthrough_drivers: Vec<String>,

    /// Load vfio in unsafe no-IOMMU mode
    #[serde(default)]
    pub no_iommu: bool,
}

/// Device selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// PCI class prefix
    #[serde(default = "default_class")]
    pub class: Option<String>,

    /// PCI vendor id
    #[serde(default)]
    pub vendor: Option<String>,

    /// PCI device id
    #[serde(default)]
    pub device: Option<String>,

    /// Leading matched devices kept for host management
    #[serde(default = "default_reserve_leading")]
    pub reserve_leading: usize,
}

/// Huge page configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HugepagesConfig {
    /// Page size in kB
    #[serde(default = "default_page_size_kb")]
    pub page_size_kb: u64,

    /// Pages to reserve
    #[serde(default = "default_count")]
    pub count: u64,

    /// Smallest acceptable grant
    #[serde(default)]
    pub min_count: Option<u64>,

    /// NUMA node; the system-wide pool when unset
    #[serde(default)]
    pub node: Option<u32>,

    /// hugetlbfs mount point
    #[serde(default = "default_mount_path")]
    pub mount_path: PathBuf,
}

/// Run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Lock file serializing runs
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Directory holding durable device metadata
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Setup deadline in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Root under which sysfs and procfs paths are resolved
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

/// Complete nicprep configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicprepConfig {
    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub devices: DevicesConfig,

    #[serde(default)]
    pub hugepages: HugepagesConfig,

    #[serde(default)]
    pub run: RunConfig,
}

fn default_target_driver() -> String {
    "vfio-pci".to_string()
}

fn default_passthrough_drivers() -> Vec<String> {
    DEFAULT_PASSTHROUGH_DRIVERS
        .iter()
        .map(|d| d.to_string())
        .collect()
}

fn default_class() -> Option<String> {
    Some("02".to_string())
}

fn default_reserve_leading() -> usize {
    1
}

fn default_page_size_kb() -> u64 {
    2048
}

fn default_count() -> u64 {
    1024
}

fn default_mount_path() -> PathBuf {
    PathBuf::from("/mnt/huge")
}

fn default_lock_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_PATH)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/")
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            target: default_target_driver(),
            passthrough_drivers: default_passthrough_drivers(),
            no_iommu: false,
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            class: default_class(),
            vendor: None,
            device: None,
            reserve_leading: default_reserve_leading(),
        }
    }
}

impl Default for HugepagesConfig {
    fn default() -> Self {
        Self {
            page_size_kb: default_page_size_kb(),
            count: default_count(),
            min_count: None,
            node: None,
            mount_path: default_mount_path(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            state_dir: default_state_dir(),
            timeout_secs: None,
            sysfs_root: default_sysfs_root(),
        }
    }
}

impl NicprepConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> HostPrepResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                HostPrepError::invalid_config(
                    path.display().to_string(),
                    format!("Failed to parse config file: {}", e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(HostPrepError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Device filter from the `[devices]` section
    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            class: self.devices.class.clone(),
            vendor: self.devices.vendor.clone(),
            device: self.devices.device.clone(),
        }
    }

    /// Huge page spec from the `[hugepages]` section
    pub fn hugepage_spec(&self) -> HugepageSpec {
        HugepageSpec {
            page_size_kb: self.hugepages.page_size_kb,
            node: self.hugepages.node,
            count: self.hugepages.count,
            min_count: self.hugepages.min_count,
            mount_path: self.hugepages.mount_path.clone(),
        }
    }

    /// Setup deadline, if configured
    pub fn timeout(&self) -> Option<Duration> {
        self.run.timeout_secs.map(Duration::from_secs)
    }

    /// Orchestrator settings
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            filter: self.device_filter(),
            policy: ReservedDevicePolicy {
                reserve_leading: self.devices.reserve_leading,
            },
            passthrough_drivers: self.driver.passthrough_drivers.clone(),
            timeout: self.timeout(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> HostPrepResult<()> {
        if self.hugepages.page_size_kb == 0 {
            return Err(HostPrepError::invalid_config(
                "hugepages.page_size_kb",
                "must be > 0",
            ));
        }

        if self.hugepages.count == 0 {
            return Err(HostPrepError::invalid_config(
                "hugepages.count",
                "must be > 0",
            ));
        }

        if let Some(min) = self.hugepages.min_count {
            if min > self.hugepages.count {
                return Err(HostPrepError::invalid_config(
                    "hugepages.min_count",
                    format!("{} exceeds count {}", min, self.hugepages.count),
                ));
            }
        }

        if self.driver.target.trim().is_empty() {
            return Err(HostPrepError::invalid_config(
                "driver.target",
                "must not be empty",
            ));
        }

        if !self
            .driver
            .passthrough_drivers
            .iter()
            .any(|d| d == &self.driver.target)
        {
            return Err(HostPrepError::invalid_config(
                "driver.target",
                format!(
                    "'{}' is not listed in driver.passthrough_drivers",
                    self.driver.target
                ),
            ));
        }

        Ok(())
    }
}
