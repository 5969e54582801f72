//! In-memory host implementing [`ResourceStore`].
//!
//! `FakeHost` behaves like a small Linux box: devices stay bound until
//! unbound, binding an already-bound device fails, the kernel grants huge
//! pages only up to a pool capacity, and modprobe only finds modules that
//! were declared available. Faults can be injected per module, device and
//! driver to drive the failure paths of the engine.
//!
//! Clones share state, so a test can hand one clone to the engine and keep
//! another to inspect the host afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use nicprep_common::types::normalize_module_name;
use nicprep_common::{
    BusAddress, DeviceDescriptor, DeviceFilter, HostModuleState, HostPrepError, HostPrepResult,
    ModuleSpec, ResourceStore,
};

use crate::verification::HostSnapshot;

type PoolKey = (u64, Option<u32>);

#[derive(Debug, Clone, Copy)]
struct Pool {
    reserved: u64,
    capacity: u64,
}

#[derive(Debug, Default)]
struct Faults {
    module_load: BTreeSet<String>,
    mount: bool,
    unbind: BTreeSet<BusAddress>,
    bind: BTreeSet<(BusAddress, String)>,
    listing: bool,
    pool_reads: bool,
}

#[derive(Debug, Default)]
struct HostState {
    mounts: BTreeSet<PathBuf>,
    pools: BTreeMap<PoolKey, Pool>,
    modules: BTreeMap<String, HostModuleState>,
    available_modules: BTreeSet<String>,
    devices: Vec<DeviceDescriptor>,
    originals: BTreeMap<BusAddress, String>,
    faults: Faults,
    mutations: Vec<String>,
}

impl HostState {
    fn device_mut(&mut self, address: &BusAddress) -> HostPrepResult<&mut DeviceDescriptor> {
        self.devices
            .iter_mut()
            .find(|d| &d.address == address)
            .ok_or_else(|| HostPrepError::device_not_found(address))
    }
}

/// Shared in-memory host.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    /// An empty host: no devices, modules, pools or mounts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device in enumeration order.
    pub fn with_device(
        self,
        address: &str,
        class: &str,
        vendor: &str,
        device: &str,
        driver: Option<&str>,
    ) -> Self {
        let desc = DeviceDescriptor {
            address: parse_address(address),
            class: class.to_string(),
            vendor: vendor.to_string(),
            device: device.to_string(),
            driver: driver.map(str::to_string),
        };
        self.state.lock().devices.push(desc);
        self
    }

    /// Adds an Intel 82545EM Ethernet controller.
    pub fn with_nic(self, address: &str, driver: Option<&str>) -> Self {
        self.with_device(address, "0200", "8086", "100f", driver)
    }

    /// Makes a module loadable.
    pub fn with_available_module(self, name: &str) -> Self {
        self.state
            .lock()
            .available_modules
            .insert(normalize_module_name(name));
        self
    }

    /// Marks a module as already loaded with the given parameters.
    pub fn with_loaded_module(self, name: &str, parameters: &[(&str, &str)]) -> Self {
        let mut module = HostModuleState::absent(name);
        module.loaded = true;
        module.parameters = parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        {
            let mut state = self.state.lock();
            state.available_modules.insert(module.name.clone());
            state.modules.insert(module.name.clone(), module);
        }
        self
    }

    /// Declares a huge page pool with its current reservation and the most
    /// pages the kernel will ever grant.
    pub fn with_pool(
        self,
        page_size_kb: u64,
        node: Option<u32>,
        reserved: u64,
        capacity: u64,
    ) -> Self {
        self.state
            .lock()
            .pools
            .insert((page_size_kb, node), Pool { reserved, capacity });
        self
    }

    /// Marks `path` as an existing hugetlbfs mount.
    pub fn with_mount(self, path: &str) -> Self {
        self.state.lock().mounts.insert(PathBuf::from(path));
        self
    }

    /// Seeds a durable original-driver record, as a previous run would.
    pub fn with_original_driver(self, address: &str, driver: &str) -> Self {
        self.state
            .lock()
            .originals
            .insert(parse_address(address), driver.to_string());
        self
    }

    /// Makes loading `name` fail as if modprobe could not find it.
    pub fn fail_module_load(self, name: &str) -> Self {
        self.state
            .lock()
            .faults
            .module_load
            .insert(normalize_module_name(name));
        self
    }

    /// Makes every hugetlbfs mount attempt fail.
    pub fn fail_mount(self) -> Self {
        self.state.lock().faults.mount = true;
        self
    }

    /// Makes unbinding `address` fail as if the device were busy.
    pub fn fail_unbind(self, address: &str) -> Self {
        self.state
            .lock()
            .faults
            .unbind
            .insert(parse_address(address));
        self
    }

    /// Makes binding `address` to `driver` fail.
    pub fn fail_bind(self, address: &str, driver: &str) -> Self {
        self.state
            .lock()
            .faults
            .bind
            .insert((parse_address(address), driver.to_string()));
        self
    }

    /// Makes device enumeration fail.
    pub fn fail_listing(self) -> Self {
        self.state.lock().faults.listing = true;
        self
    }

    /// Makes every huge page pool read fail.
    pub fn fail_pool_reads(self) -> Self {
        self.state.lock().faults.pool_reads = true;
        self
    }

    /// Rebinds a device behind the engine's back.
    pub fn set_driver(&self, address: &str, driver: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(dev) = state
            .devices
            .iter_mut()
            .find(|d| d.address == parse_address(address))
        {
            dev.driver = driver.map(str::to_string);
        }
    }

    /// Driver currently bound to a device.
    pub fn driver_of(&self, address: &str) -> Option<String> {
        let address = parse_address(address);
        self.state
            .lock()
            .devices
            .iter()
            .find(|d| d.address == address)
            .and_then(|d| d.driver.clone())
    }

    /// Pages currently reserved in a pool.
    pub fn reserved_pages(&self, page_size_kb: u64, node: Option<u32>) -> u64 {
        self.state
            .lock()
            .pools
            .get(&(page_size_kb, node))
            .map_or(0, |p| p.reserved)
    }

    /// Whether hugetlbfs is mounted at `path`.
    pub fn is_mounted(&self, path: &str) -> bool {
        self.state.lock().mounts.contains(Path::new(path))
    }

    /// Whether a module is loaded.
    pub fn is_module_loaded(&self, name: &str) -> bool {
        self.state
            .lock()
            .modules
            .contains_key(&normalize_module_name(name))
    }

    /// Durable original-driver record for a device.
    pub fn recorded_original(&self, address: &str) -> Option<String> {
        self.state
            .lock()
            .originals
            .get(&parse_address(address))
            .cloned()
    }

    /// Every state-changing operation performed so far, in order.
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }

    /// Captures the full host state.
    pub fn snapshot(&self) -> HostSnapshot {
        let state = self.state.lock();
        HostSnapshot {
            mounts: state.mounts.clone(),
            hugepages: state
                .pools
                .iter()
                .map(|(key, pool)| (*key, pool.reserved))
                .collect(),
            modules: state.modules.clone(),
            drivers: state
                .devices
                .iter()
                .map(|d| (d.address.clone(), d.driver.clone()))
                .collect(),
            original_drivers: state.originals.clone(),
        }
    }
}

fn parse_address(address: &str) -> BusAddress {
    address
        .parse()
        .unwrap_or_else(|e| panic!("fixture address '{}': {}", address, e))
}

fn pool_target(page_size_kb: u64, node: Option<u32>) -> String {
    match node {
        Some(n) => format!("node{}/hugepages-{}kB", n, page_size_kb),
        None => format!("hugepages-{}kB", page_size_kb),
    }
}

#[async_trait]
impl ResourceStore for FakeHost {
    async fn is_hugetlbfs_mounted(&self, path: &Path) -> HostPrepResult<bool> {
        Ok(self.state.lock().mounts.contains(path))
    }

    async fn mount_hugetlbfs(&self, path: &Path, page_size_kb: u64) -> HostPrepResult<()> {
        let mut state = self.state.lock();
        if state.faults.mount {
            return Err(HostPrepError::ShellCommandFailed {
                command: format!("mount -t hugetlbfs {}", path.display()),
                exit_code: 32,
                output: "mount: permission denied".to_string(),
            });
        }
        state.mounts.insert(path.to_path_buf());
        state
            .mutations
            .push(format!("mount {} pagesize={}K", path.display(), page_size_kb));
        Ok(())
    }

    async fn unmount_hugetlbfs(&self, path: &Path) -> HostPrepResult<()> {
        let mut state = self.state.lock();
        if !state.mounts.remove(path) {
            return Err(HostPrepError::store(
                "umount",
                path.display().to_string(),
                "not mounted",
            ));
        }
        state.mutations.push(format!("umount {}", path.display()));
        Ok(())
    }

    async fn hugepage_count(&self, page_size_kb: u64, node: Option<u32>) -> HostPrepResult<u64> {
        let state = self.state.lock();
        if state.faults.pool_reads {
            return Err(HostPrepError::store(
                "read",
                pool_target(page_size_kb, node),
                "Input/output error",
            ));
        }
        state
            .pools
            .get(&(page_size_kb, node))
            .map(|p| p.reserved)
            .ok_or_else(|| {
                HostPrepError::store("read", pool_target(page_size_kb, node), "No such file")
            })
    }

    async fn set_hugepage_count(
        &self,
        page_size_kb: u64,
        node: Option<u32>,
        count: u64,
    ) -> HostPrepResult<()> {
        let mut state = self.state.lock();
        let pool = state.pools.get_mut(&(page_size_kb, node)).ok_or_else(|| {
            HostPrepError::store("write", pool_target(page_size_kb, node), "No such file")
        })?;
        pool.reserved = count.min(pool.capacity);
        state
            .mutations
            .push(format!("{}={}", pool_target(page_size_kb, node), count));
        Ok(())
    }

    async fn module_state(&self, name: &str) -> HostPrepResult<HostModuleState> {
        let state = self.state.lock();
        Ok(state
            .modules
            .get(&normalize_module_name(name))
            .cloned()
            .unwrap_or_else(|| HostModuleState::absent(name)))
    }

    async fn load_module(&self, spec: &ModuleSpec) -> HostPrepResult<()> {
        let name = normalize_module_name(&spec.name);
        let mut state = self.state.lock();
        if state.faults.module_load.contains(&name) || !state.available_modules.contains(&name) {
            return Err(HostPrepError::ShellCommandFailed {
                command: format!("modprobe {}", spec),
                exit_code: 1,
                output: format!("modprobe: FATAL: Module {} not found", spec.name),
            });
        }
        let mut module = HostModuleState::absent(&name);
        module.loaded = true;
        module.parameters = spec.parameters.clone();
        state.modules.insert(name, module);
        state.mutations.push(format!("modprobe {}", spec));
        Ok(())
    }

    async fn unload_module(&self, name: &str) -> HostPrepResult<()> {
        let mut state = self.state.lock();
        if state.modules.remove(&normalize_module_name(name)).is_none() {
            return Err(HostPrepError::store("modprobe -r", name, "not loaded"));
        }
        state.mutations.push(format!("modprobe -r {}", name));
        Ok(())
    }

    async fn bound_driver(&self, address: &BusAddress) -> HostPrepResult<Option<String>> {
        let mut state = self.state.lock();
        Ok(state.device_mut(address)?.driver.clone())
    }

    async fn unbind_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()> {
        let mut state = self.state.lock();
        if state.faults.unbind.contains(address) {
            return Err(HostPrepError::store(
                "unbind",
                address.as_str(),
                "Device or resource busy",
            ));
        }
        let dev = state.device_mut(address)?;
        if dev.driver.as_deref() != Some(driver) {
            return Err(HostPrepError::store(
                "unbind",
                address.as_str(),
                format!("not bound to {}", driver),
            ));
        }
        dev.driver = None;
        state.mutations.push(format!("unbind {} {}", address, driver));
        Ok(())
    }

    async fn bind_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()> {
        let mut state = self.state.lock();
        if state
            .faults
            .bind
            .contains(&(address.clone(), driver.to_string()))
        {
            return Err(HostPrepError::store(
                "bind",
                address.as_str(),
                "No such device",
            ));
        }
        let dev = state.device_mut(address)?;
        if dev.driver.is_some() {
            return Err(HostPrepError::store(
                "bind",
                address.as_str(),
                "Device or resource busy",
            ));
        }
        dev.driver = Some(driver.to_string());
        state.mutations.push(format!("bind {} {}", address, driver));
        Ok(())
    }

    async fn list_devices(&self, filter: &DeviceFilter) -> HostPrepResult<Vec<DeviceDescriptor>> {
        let state = self.state.lock();
        if state.faults.listing {
            return Err(HostPrepError::ShellCommandFailed {
                command: "lspci -Dvmmnk".to_string(),
                exit_code: 127,
                output: "lspci: command not found".to_string(),
            });
        }
        Ok(state
            .devices
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn original_driver(&self, address: &BusAddress) -> HostPrepResult<Option<String>> {
        Ok(self.state.lock().originals.get(address).cloned())
    }

    async fn set_original_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()> {
        self.state
            .lock()
            .originals
            .insert(address.clone(), driver.to_string());
        Ok(())
    }

    async fn clear_original_driver(&self, address: &BusAddress) -> HostPrepResult<()> {
        self.state.lock().originals.remove(address);
        Ok(())
    }

    async fn recorded_devices(&self) -> HostPrepResult<BTreeMap<BusAddress, String>> {
        Ok(self.state.lock().originals.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_requires_unbound_device() {
        let host = FakeHost::new().with_nic("02:02.0", Some("e1000"));
        let addr: BusAddress = "02:02.0".parse().unwrap();

        assert!(host.bind_driver(&addr, "vfio-pci").await.is_err());
        host.unbind_driver(&addr, "e1000").await.unwrap();
        host.bind_driver(&addr, "vfio-pci").await.unwrap();
        assert_eq!(host.driver_of("02:02.0").as_deref(), Some("vfio-pci"));
        assert_eq!(
            host.mutations(),
            vec![
                "unbind 0000:02:02.0 e1000".to_string(),
                "bind 0000:02:02.0 vfio-pci".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_pool_capacity_limits_grant() {
        let host = FakeHost::new().with_pool(2048, Some(0), 0, 300);
        host.set_hugepage_count(2048, Some(0), 1024).await.unwrap();
        assert_eq!(host.reserved_pages(2048, Some(0)), 300);
    }

    #[tokio::test]
    async fn test_module_availability() {
        let host = FakeHost::new().with_available_module("vfio-pci");
        assert!(host.load_module(&ModuleSpec::new("vfio")).await.is_err());
        host.load_module(&ModuleSpec::new("vfio-pci")).await.unwrap();
        assert!(host.is_module_loaded("vfio_pci"));
    }
}
