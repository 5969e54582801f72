//! [`ResourceStore`] backed by the kernel's sysfs/procfs interfaces and
//! the usual system tools.
//!
//! All kernel paths are resolved under a configurable root so that the
//! store can be pointed at a scratch tree. Durable device metadata (the
//! original driver of every device moved to a passthrough driver) is kept
//! in a JSON document under the state directory, so teardown can run in a
//! different process invocation than setup.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{HostPrepError, HostPrepResult};
use crate::shell::{self, LSPCI_CMD, MODPROBE_CMD, MOUNT_CMD, UMOUNT_CMD};
use crate::store::ResourceStore;
use crate::types::{
    normalize_module_name, BusAddress, DeviceDescriptor, DeviceFilter, HostModuleState, ModuleSpec,
};

/// Default directory for durable device metadata.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/nicprep";

/// Metadata file name inside the state directory.
pub const METADATA_FILE: &str = "devices.json";

/// Filesystem type of huge page mounts in `/proc/mounts`.
const HUGETLBFS: &str = "hugetlbfs";

/// Durable record for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Driver the device was bound to before it was handed to a
    /// passthrough driver.
    pub original_driver: String,
    /// RFC 3339 timestamp of the first rebind.
    pub recorded_at: String,
}

/// Durable metadata document, keyed by bus address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Per-device records.
    #[serde(default)]
    pub devices: BTreeMap<BusAddress, DeviceRecord>,
}

/// Host-backed resource store.
#[derive(Debug)]
pub struct SysfsStore {
    root: PathBuf,
    metadata_path: PathBuf,
    /// Serializes read-modify-write cycles of the metadata document.
    metadata_lock: Mutex<()>,
}

impl SysfsStore {
    /// Creates a store rooted at `root` (normally `/`), keeping metadata in
    /// `state_dir`.
    pub fn new(root: impl Into<PathBuf>, state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: root.into(),
            metadata_path: state_dir.as_ref().join(METADATA_FILE),
            metadata_lock: Mutex::new(()),
        }
    }

    /// Store for the running host with the default state directory.
    pub fn host() -> Self {
        Self::new("/", DEFAULT_STATE_DIR)
    }

    /// Path of the metadata document.
    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    /// Resets `driver_override` so normal driver matching applies again.
    /// The binding itself is unaffected.
    async fn clear_override(&self, address: &BusAddress) {
        let override_path = self.device_path(address).join("driver_override");
        if let Err(e) = write_value(&override_path, "\n").await {
            warn!(address = %address, error = %e, "Could not clear driver_override");
        }
    }

    fn host_path(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    fn pool_path(&self, page_size_kb: u64, node: Option<u32>) -> PathBuf {
        let pool = format!("hugepages-{}kB", page_size_kb);
        let base = match node {
            Some(n) => self
                .root
                .join(format!("sys/devices/system/node/node{}/hugepages", n)),
            None => self.root.join("sys/kernel/mm/hugepages"),
        };
        base.join(pool).join("nr_hugepages")
    }

    fn device_path(&self, address: &BusAddress) -> PathBuf {
        self.root.join("sys/bus/pci/devices").join(address.as_str())
    }

    fn driver_path(&self, driver: &str) -> PathBuf {
        self.root.join("sys/bus/pci/drivers").join(driver)
    }

    fn module_path(&self, name: &str) -> PathBuf {
        self.root
            .join("sys/module")
            .join(normalize_module_name(name))
    }

    /// Loads the metadata document; a missing file is an empty document.
    pub async fn load_metadata(&self) -> HostPrepResult<DeviceMetadata> {
        match fs::read_to_string(&self.metadata_path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                HostPrepError::store(
                    "parse",
                    self.metadata_path.display().to_string(),
                    e.to_string(),
                )
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeviceMetadata::default()),
            Err(e) => Err(store_io("read", &self.metadata_path, e)),
        }
    }

    async fn save_metadata(&self, metadata: &DeviceMetadata) -> HostPrepResult<()> {
        if let Some(parent) = self.metadata_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| store_io("create", parent, e))?;
        }
        let json = serde_json::to_string_pretty(metadata).map_err(|e| {
            HostPrepError::store(
                "serialize",
                self.metadata_path.display().to_string(),
                e.to_string(),
            )
        })?;

        // Replace atomically so a crash never leaves a truncated document.
        let tmp = self.metadata_path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| store_io("write", &tmp, e))?;
        fs::rename(&tmp, &self.metadata_path)
            .await
            .map_err(|e| store_io("rename", &self.metadata_path, e))
    }
}

fn store_io(operation: &str, path: &Path, e: io::Error) -> HostPrepError {
    HostPrepError::store(operation, path.display().to_string(), e.to_string())
}

async fn read_value(path: &Path) -> HostPrepResult<String> {
    fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| store_io("read", path, e))
}

async fn write_value(path: &Path, value: &str) -> HostPrepResult<()> {
    debug!(path = %path.display(), value = %value, "Writing sysfs attribute");
    fs::write(path, value)
        .await
        .map_err(|e| store_io("write", path, e))
}

/// Extracts hugetlbfs mount points from `/proc/mounts` content.
pub fn parse_hugetlbfs_mounts(mounts: &str) -> Vec<PathBuf> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            (fstype == HUGETLBFS).then(|| PathBuf::from(target.replace("\\040", " ")))
        })
        .collect()
}

/// Parses `lspci -Dvmmnk` output into descriptors, preserving order.
///
/// Records are separated by blank lines; each line is `Key:<tab>Value`.
/// Records without a usable `Slot` are skipped.
pub fn parse_lspci(output: &str) -> Vec<DeviceDescriptor> {
    let mut devices = Vec::new();
    for record in output.split("\n\n") {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for line in record.lines() {
            if let Some((key, value)) = line.split_once(':') {
                fields.entry(key.trim()).or_insert_with(|| value.trim());
            }
        }
        let Some(slot) = fields.get("Slot") else {
            continue;
        };
        let address = match slot.parse::<BusAddress>() {
            Ok(address) => address,
            Err(e) => {
                warn!(slot = %slot, error = %e, "Skipping lspci record");
                continue;
            }
        };
        let field = |key: &str| fields.get(key).map(|v| v.to_string()).unwrap_or_default();
        devices.push(DeviceDescriptor {
            address,
            class: field("Class"),
            vendor: field("Vendor"),
            device: field("Device"),
            driver: fields.get("Driver").map(|v| v.to_string()),
        });
    }
    devices
}

#[async_trait]
impl ResourceStore for SysfsStore {
    async fn is_hugetlbfs_mounted(&self, path: &Path) -> HostPrepResult<bool> {
        let mounts = read_value(&self.root.join("proc/mounts")).await?;
        Ok(parse_hugetlbfs_mounts(&mounts).iter().any(|m| m == path))
    }

    async fn mount_hugetlbfs(&self, path: &Path, page_size_kb: u64) -> HostPrepResult<()> {
        let target = self.host_path(path);
        fs::create_dir_all(&target)
            .await
            .map_err(|e| store_io("create", &target, e))?;
        let cmd = shell::command_line(
            MOUNT_CMD,
            [
                "-t".to_string(),
                HUGETLBFS.to_string(),
                "-o".to_string(),
                format!("pagesize={}K", page_size_kb),
                "nodev".to_string(),
                target.display().to_string(),
            ],
        );
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    async fn unmount_hugetlbfs(&self, path: &Path) -> HostPrepResult<()> {
        let target = self.host_path(path);
        let cmd = shell::command_line(UMOUNT_CMD, [target.display().to_string()]);
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    async fn hugepage_count(&self, page_size_kb: u64, node: Option<u32>) -> HostPrepResult<u64> {
        let path = self.pool_path(page_size_kb, node);
        let raw = read_value(&path).await?;
        raw.parse().map_err(|_| {
            HostPrepError::store(
                "parse",
                path.display().to_string(),
                format!("not a page count: '{}'", raw),
            )
        })
    }

    async fn set_hugepage_count(
        &self,
        page_size_kb: u64,
        node: Option<u32>,
        count: u64,
    ) -> HostPrepResult<()> {
        write_value(&self.pool_path(page_size_kb, node), &count.to_string()).await
    }

    async fn module_state(&self, name: &str) -> HostPrepResult<HostModuleState> {
        let path = self.module_path(name);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(HostModuleState::absent(name)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(HostModuleState::absent(name))
            }
            Err(e) => return Err(store_io("stat", &path, e)),
        }

        let mut state = HostModuleState::absent(name);
        state.loaded = true;

        let params_dir = path.join("parameters");
        let mut entries = match fs::read_dir(&params_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(state),
            Err(e) => return Err(store_io("list", &params_dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_io("list", &params_dir, e))?
        {
            let param = entry.file_name().to_string_lossy().to_string();
            // Some parameters are write-only or root-only.
            match read_value(&entry.path()).await {
                Ok(value) => {
                    state.parameters.insert(param, value);
                }
                Err(e) => debug!(module = %name, parameter = %param, error = %e, "Unreadable"),
            }
        }
        Ok(state)
    }

    async fn load_module(&self, spec: &ModuleSpec) -> HostPrepResult<()> {
        let mut args = vec![spec.name.clone()];
        args.extend(spec.parameters.iter().map(|(k, v)| format!("{}={}", k, v)));
        let cmd = shell::command_line(MODPROBE_CMD, args);
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    async fn unload_module(&self, name: &str) -> HostPrepResult<()> {
        let cmd = shell::command_line(MODPROBE_CMD, ["-r", name]);
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    async fn bound_driver(&self, address: &BusAddress) -> HostPrepResult<Option<String>> {
        let device = self.device_path(address);
        match fs::metadata(&device).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HostPrepError::device_not_found(address))
            }
            Err(e) => return Err(store_io("stat", &device, e)),
        }
        match fs::read_link(device.join("driver")).await {
            Ok(target) => Ok(target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_io("readlink", &device.join("driver"), e)),
        }
    }

    async fn unbind_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()> {
        write_value(&self.driver_path(driver).join("unbind"), address.as_str()).await?;
        // An unbound device with a stale override would be re-claimed by
        // that driver on the next probe.
        self.clear_override(address).await;
        Ok(())
    }

    async fn bind_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()> {
        // driver_override keeps the device from being claimed by any other
        // driver while it is handed over.
        let override_path = self.device_path(address).join("driver_override");
        if let Err(e) = write_value(&override_path, driver).await {
            warn!(address = %address, error = %e, "Could not set driver_override");
        }

        let bind_path = self.driver_path(driver).join("bind");
        let result = match write_value(&bind_path, address.as_str()).await {
            Ok(()) => Ok(()),
            // The override may already have triggered a probe.
            Err(e) => match self.bound_driver(address).await {
                Ok(Some(bound)) if bound == driver => {
                    debug!(address = %address, driver = %driver, "Device auto-bound");
                    Ok(())
                }
                Ok(_) => Err(e),
                Err(probe_err) => Err(probe_err),
            },
        };
        self.clear_override(address).await;
        result
    }

    async fn list_devices(&self, filter: &DeviceFilter) -> HostPrepResult<Vec<DeviceDescriptor>> {
        let output = shell::exec_checked(&shell::command_line(LSPCI_CMD, ["-Dvmmnk"])).await?;
        Ok(parse_lspci(&output)
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect())
    }

    async fn original_driver(&self, address: &BusAddress) -> HostPrepResult<Option<String>> {
        let metadata = self.load_metadata().await?;
        Ok(metadata
            .devices
            .get(address)
            .map(|r| r.original_driver.clone()))
    }

    async fn set_original_driver(&self, address: &BusAddress, driver: &str) -> HostPrepResult<()> {
        let _guard = self.metadata_lock.lock().await;
        let mut metadata = self.load_metadata().await?;
        metadata.devices.insert(
            address.clone(),
            DeviceRecord {
                original_driver: driver.to_string(),
                recorded_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.save_metadata(&metadata).await
    }

    async fn clear_original_driver(&self, address: &BusAddress) -> HostPrepResult<()> {
        let _guard = self.metadata_lock.lock().await;
        let mut metadata = self.load_metadata().await?;
        if metadata.devices.remove(address).is_some() {
            self.save_metadata(&metadata).await?;
        }
        Ok(())
    }

    async fn recorded_devices(&self) -> HostPrepResult<BTreeMap<BusAddress, String>> {
        let metadata = self.load_metadata().await?;
        Ok(metadata
            .devices
            .into_iter()
            .map(|(address, record)| (address, record.original_driver))
            .collect())
    }
}
