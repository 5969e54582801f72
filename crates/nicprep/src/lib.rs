//! Host preparation for kernel-bypass networking.
//!
//! This crate reserves huge page memory and moves NICs from their native
//! kernel drivers to a passthrough driver (and back), reversing partial
//! work when a run fails.
//!
//! # Components
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Resource Probe | [`probe`] | read-only host state |
//! | Device Catalog | [`catalog`] | candidates, safety policy, driver history |
//! | Module Manager | [`module_mgr`] | kernel modules and parameters |
//! | Huge-page Allocator | [`hugepage_mgr`] | hugetlbfs mount and reservation |
//! | Driver Rebinder | [`rebinder`] | unbind/bind |
//! | Orchestrator | [`orchestrator`] | sequencing, journal, rollback |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nicprep::{Orchestrator, OrchestratorConfig, ReconciliationIntent};
//! use nicprep_common::SysfsStore;
//!
//! let mut orch = Orchestrator::new(Arc::new(SysfsStore::host()), OrchestratorConfig::default());
//! let intent = ReconciliationIntent::setup([addr], "vfio-pci", hugepages, false);
//! let outcome = orch.run(&intent).await;
//! std::process::exit(outcome.exit_code().into());
//! ```

pub mod catalog;
pub mod config_file;
pub mod hugepage_mgr;
pub mod intent;
pub mod journal;
pub mod lock;
pub mod module_mgr;
pub mod orchestrator;
pub mod probe;
pub mod rebinder;

pub use catalog::{CatalogEntry, DeviceCatalog, ReservedDevicePolicy};
pub use config_file::NicprepConfig;
pub use hugepage_mgr::HugepageMgr;
pub use intent::ReconciliationIntent;
pub use journal::{ActionKind, JournalEntry, RollbackJournal};
pub use lock::RunLock;
pub use module_mgr::{required_modules, ModuleMgr};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, PlannedStep, RunOutcome, RunState, Step, TeardownReport,
};
pub use probe::{HostState, Observed, ResourceProbe};
pub use rebinder::{DriverRebinder, RebindError};
