//! Data model shared by the resource store and the reconciliation engine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HostPrepError;

/// `dddd:bb:dd.f` or `bb:dd.f`.
static BUS_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([0-9a-fA-F]{4}):)?([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$")
        .expect("Invalid PCI address regex")
});

/// PCI bus address, the unique identifier of a device.
///
/// Always held in the full lowercase `dddd:bb:dd.f` form; a short
/// `bb:dd.f` address is taken to be in domain `0000`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusAddress(String);

impl BusAddress {
    /// Returns the normalized address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BusAddress {
    type Err = HostPrepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = BUS_ADDRESS_RE.captures(s.trim()).ok_or_else(|| {
            HostPrepError::invalid_config(
                "device",
                format!("Invalid PCI address '{}' (expected 0000:02:02.0)", s),
            )
        })?;
        let domain = caps.get(1).map_or("0000", |m| m.as_str());
        Ok(Self(
            format!("{}:{}:{}.{}", domain, &caps[2], &caps[3], &caps[4]).to_lowercase(),
        ))
    }
}

impl TryFrom<String> for BusAddress {
    type Error = HostPrepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BusAddress> for String {
    fn from(value: BusAddress) -> Self {
        value.0
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kernel module names treat `-` and `_` as the same character;
/// `/sys/module` always shows the underscore form.
pub fn normalize_module_name(name: &str) -> String {
    name.trim().replace('-', "_")
}

/// Module parameters as the kernel reports them. Boolean parameters read
/// back as `Y`/`N` even when loaded with `1`/`0`.
pub fn param_values_match(requested: &str, actual: &str) -> bool {
    fn canonical(v: &str) -> String {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "y" | "yes" | "true" | "on" => "Y".to_string(),
            "0" | "n" | "no" | "false" | "off" => "N".to_string(),
            other => other.to_string(),
        }
    }
    canonical(requested) == canonical(actual)
}

/// Observed state of one kernel module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostModuleState {
    /// Module name, normalized.
    pub name: String,
    /// Whether the module is present in the kernel.
    pub loaded: bool,
    /// Readable parameters of the loaded module.
    pub parameters: BTreeMap<String, String>,
}

impl HostModuleState {
    /// A module that is not loaded.
    pub fn absent(name: &str) -> Self {
        Self {
            name: normalize_module_name(name),
            loaded: false,
            parameters: BTreeMap::new(),
        }
    }
}

/// A module that must be loaded, with the parameters it must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Module name as passed to modprobe.
    pub name: String,
    /// Required parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ModuleSpec {
    /// A module with no required parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Adds a required parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Returns true if `state` is loaded with every required parameter.
    pub fn is_satisfied_by(&self, state: &HostModuleState) -> bool {
        state.loaded
            && self.parameters.iter().all(|(param, value)| {
                state
                    .parameters
                    .get(param)
                    .is_some_and(|actual| param_values_match(value, actual))
            })
    }
}

impl fmt::Display for ModuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.parameters {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

/// Desired huge page reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HugepageSpec {
    /// Page size in kB (2048 for 2 MB pages, 1048576 for 1 GB pages).
    pub page_size_kb: u64,
    /// NUMA node, or `None` for the system-wide pool.
    pub node: Option<u32>,
    /// Count to write to the kernel.
    pub count: u64,
    /// Smallest acceptable grant; defaults to `count`.
    pub min_count: Option<u64>,
    /// Where hugetlbfs must be mounted.
    pub mount_path: PathBuf,
}

impl HugepageSpec {
    /// Minimum number of pages the kernel must grant.
    pub fn required(&self) -> u64 {
        self.min_count.unwrap_or(self.count)
    }

    /// Returns true if a pool holding `count` pages meets this spec: at
    /// least the required count and no more than requested.
    pub fn is_met_by(&self, count: u64) -> bool {
        (self.required()..=self.count).contains(&count)
    }

    /// Human-readable pool location.
    pub fn node_label(&self) -> String {
        node_label(self.node)
    }
}

/// "node<N>" or "all nodes".
pub fn node_label(node: Option<u32>) -> String {
    match node {
        Some(n) => format!("node{}", n),
        None => "all nodes".to_string(),
    }
}

/// A device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// PCI bus address.
    pub address: BusAddress,
    /// Class and subclass code, hex (e.g. `0200` for Ethernet).
    pub class: String,
    /// Vendor id, hex.
    pub vendor: String,
    /// Device id, hex.
    pub device: String,
    /// Driver currently bound, if any.
    pub driver: Option<String>,
}

/// A candidate device tracked by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevice {
    /// PCI bus address.
    pub address: BusAddress,
    /// Class and subclass code, hex.
    pub class: String,
    /// Vendor id, hex.
    pub vendor: String,
    /// Device id, hex.
    pub device: String,
    /// Driver currently bound, if any.
    pub current_driver: Option<String>,
    /// Native driver recorded at the first rebind away from it.
    pub original_driver: Option<String>,
}

impl PciDevice {
    /// Builds a device record from an enumeration result.
    pub fn from_descriptor(desc: DeviceDescriptor, original_driver: Option<String>) -> Self {
        Self {
            address: desc.address,
            class: desc.class,
            vendor: desc.vendor,
            device: desc.device,
            current_driver: desc.driver,
            original_driver,
        }
    }
}

/// Which enumerated devices are candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Class code prefix (`02` matches every network controller).
    pub class: Option<String>,
    /// Vendor id.
    pub vendor: Option<String>,
    /// Device id.
    pub device: Option<String>,
}

fn hex_id(s: &str) -> String {
    s.trim().trim_start_matches("0x").to_ascii_lowercase()
}

impl DeviceFilter {
    /// Network controllers (class `02`).
    pub fn network() -> Self {
        Self {
            class: Some("02".to_string()),
            ..Self::default()
        }
    }

    /// Returns true if the descriptor passes every set criterion.
    pub fn matches(&self, desc: &DeviceDescriptor) -> bool {
        self.class
            .as_deref()
            .map_or(true, |c| hex_id(&desc.class).starts_with(&hex_id(c)))
            && self
                .vendor
                .as_deref()
                .map_or(true, |v| hex_id(&desc.vendor) == hex_id(v))
            && self
                .device
                .as_deref()
                .map_or(true, |d| hex_id(&desc.device) == hex_id(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn descriptor(addr: &str, class: &str, vendor: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            address: addr.parse().unwrap(),
            class: class.to_string(),
            vendor: vendor.to_string(),
            device: "100f".to_string(),
            driver: Some("e1000".to_string()),
        }
    }

    #[test]
    fn test_bus_address_normalization() {
        let short: BusAddress = "02:02.0".parse().unwrap();
        assert_eq!(short.as_str(), "0000:02:02.0");

        let full: BusAddress = "0000:AF:00.1".parse().unwrap();
        assert_eq!(full.to_string(), "0000:af:00.1");

        assert!("02:02".parse::<BusAddress>().is_err());
        assert!("0000:02:02.8".parse::<BusAddress>().is_err());
        assert!("eth0".parse::<BusAddress>().is_err());
    }

    #[test]
    fn test_bus_address_serde() {
        let addr: BusAddress = serde_json::from_str("\"02:02.0\"").unwrap();
        assert_eq!(addr.as_str(), "0000:02:02.0");
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"0000:02:02.0\"");
        assert!(serde_json::from_str::<BusAddress>("\"bogus\"").is_err());
    }

    #[test]
    fn test_module_name_and_params() {
        assert_eq!(normalize_module_name("vfio-pci"), "vfio_pci");
        assert!(param_values_match("1", "Y"));
        assert!(param_values_match("0", "N"));
        assert!(!param_values_match("1", "N"));
        assert!(param_values_match("4096", "4096"));
    }

    #[test]
    fn test_module_spec_satisfied() {
        let spec = ModuleSpec::new("vfio").with_parameter("enable_unsafe_noiommu_mode", "1");
        let mut state = HostModuleState::absent("vfio");
        assert!(!spec.is_satisfied_by(&state));

        state.loaded = true;
        state
            .parameters
            .insert("enable_unsafe_noiommu_mode".to_string(), "N".to_string());
        assert!(!spec.is_satisfied_by(&state));

        state
            .parameters
            .insert("enable_unsafe_noiommu_mode".to_string(), "Y".to_string());
        assert!(spec.is_satisfied_by(&state));
        assert_eq!(spec.to_string(), "vfio enable_unsafe_noiommu_mode=1");
    }

    #[test]
    fn test_hugepage_required() {
        let mut spec = HugepageSpec {
            page_size_kb: 2048,
            node: Some(0),
            count: 1024,
            min_count: None,
            mount_path: PathBuf::from("/mnt/huge"),
        };
        assert_eq!(spec.required(), 1024);
        spec.min_count = Some(512);
        assert_eq!(spec.required(), 512);
        assert_eq!(spec.node_label(), "node0");
    }

    #[test]
    fn test_device_filter() {
        let nic = descriptor("02:02.0", "0200", "8086");
        let gpu = descriptor("01:00.0", "0300", "10de");

        assert!(DeviceFilter::network().matches(&nic));
        assert!(!DeviceFilter::network().matches(&gpu));

        let intel = DeviceFilter {
            vendor: Some("0x8086".to_string()),
            ..DeviceFilter::default()
        };
        assert!(intel.matches(&nic));
        assert!(!intel.matches(&gpu));
        assert!(DeviceFilter::default().matches(&gpu));
    }
}
