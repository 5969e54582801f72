//! Provisioning Orchestrator: sequences the components for one run.
//!
//! Setup walks `Idle -> Probing -> Applying(i of N) -> Committed`; any
//! fatal error while applying moves to `RollingBack`, which replays the
//! journal newest-first and always ends in `Failed`. Teardown restores
//! each device independently and never rolls back.
//!
//! Steps run strictly in order: modules, hugetlbfs mount, huge page
//! reservation, then one rebind per device in address order.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use nicprep_common::{
    BusAddress, DeviceFilter, HostModuleState, HostPrepError, HostPrepResult, HugepageSpec,
    ModuleSpec, PciDevice, ResourceStore,
};

use crate::catalog::{CatalogEntry, DeviceCatalog, ReservedDevicePolicy};
use crate::hugepage_mgr::HugepageMgr;
use crate::intent::ReconciliationIntent;
use crate::journal::{JournalEntry, RollbackJournal};
use crate::module_mgr::ModuleMgr;
use crate::probe::{HostState, Observed, ResourceProbe};
use crate::rebinder::{DriverRebinder, RebindError};

/// Passthrough drivers known by default.
pub const DEFAULT_PASSTHROUGH_DRIVERS: [&str; 3] = ["vfio-pci", "uio_pci_generic", "igb_uio"];

/// Exit status of a committed run or clean teardown.
pub const EXIT_OK: u8 = 0;
/// Exit status of a failure before any step ran.
pub const EXIT_FAILED: u8 = 1;
/// Exit status of a setup that failed and was rolled back.
pub const EXIT_ROLLED_BACK: u8 = 2;
/// Exit status of a teardown that left devices unrestored.
pub const EXIT_PARTIAL_TEARDOWN: u8 = 3;
/// Exit status when another run holds the host lock.
pub const EXIT_CONCURRENT_RUN: u8 = 4;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Probing,
    Applying { step: usize, total: usize },
    Committed,
    RollingBack,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::Probing => f.write_str("probing"),
            RunState::Applying { step, total } => write!(f, "applying({} of {})", step, total),
            RunState::Committed => f.write_str("committed"),
            RunState::RollingBack => f.write_str("rolling-back"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

/// One ordered step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    LoadModule { module: ModuleSpec },
    MountHugetlbfs { hugepages: HugepageSpec },
    ReserveHugepages { hugepages: HugepageSpec },
    Rebind { address: BusAddress, driver: String },
    Restore { address: BusAddress, driver: String },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::LoadModule { module } => write!(f, "load module {}", module),
            Step::MountHugetlbfs { hugepages } => {
                write!(f, "mount hugetlbfs at {}", hugepages.mount_path.display())
            }
            Step::ReserveHugepages { hugepages } => write!(
                f,
                "reserve {} x {}kB pages on {}",
                hugepages.count,
                hugepages.page_size_kb,
                hugepages.node_label()
            ),
            Step::Rebind { address, driver } => write!(f, "bind {} to {}", address, driver),
            Step::Restore { address, driver } => write!(f, "restore {} to {}", address, driver),
        }
    }
}

/// A step and whether the probe shows it already satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    #[serde(flatten)]
    pub step: Step,
    pub satisfied: bool,
}

/// One journal entry rollback could not reverse.
#[derive(Debug)]
pub struct RollbackFailure {
    pub entry: JournalEntry,
    pub error: HostPrepError,
}

/// What rollback achieved.
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Entries reversed.
    pub reverted: usize,
    /// Entries left in place.
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    /// Returns true if every journaled change was reversed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What teardown achieved, per device.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Devices back on their original driver.
    pub restored: Vec<BusAddress>,
    /// Devices with no original driver on record; left alone.
    pub skipped: Vec<BusAddress>,
    /// Devices that could not be restored.
    pub unrestored: Vec<(BusAddress, HostPrepError)>,
}

/// Final result of a run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Setup completed. `journal` lists what this run changed.
    Committed {
        journal: RollbackJournal,
        applied: usize,
        skipped: usize,
    },
    /// Setup failed while applying and was rolled back.
    RolledBack {
        error: HostPrepError,
        rollback: RollbackReport,
    },
    /// The run failed before changing anything.
    Rejected { error: HostPrepError },
    /// Teardown finished, possibly partially.
    TornDown { report: TeardownReport },
}

impl RunOutcome {
    /// Process exit status for the outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Committed { .. } => EXIT_OK,
            RunOutcome::RolledBack { .. } => EXIT_ROLLED_BACK,
            RunOutcome::Rejected {
                error: HostPrepError::ConcurrentRunRejected { .. },
            } => EXIT_CONCURRENT_RUN,
            RunOutcome::Rejected { .. } => EXIT_FAILED,
            RunOutcome::TornDown { report } if report.unrestored.is_empty() => EXIT_OK,
            RunOutcome::TornDown { .. } => EXIT_PARTIAL_TEARDOWN,
        }
    }
}

/// Read-only report of the devices and resources a setup would touch.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub devices: Vec<CatalogEntry>,
    pub hugetlbfs_mounted: Observed<bool>,
    pub hugepages: Observed<u64>,
    pub modules: Vec<(String, Observed<HostModuleState>)>,
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Which enumerated devices are candidates.
    pub filter: DeviceFilter,
    /// Management-device safety policy.
    pub policy: ReservedDevicePolicy,
    /// Drivers that hand a device to user space.
    pub passthrough_drivers: Vec<String>,
    /// Deadline for a setup run, checked between steps.
    pub timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::network(),
            policy: ReservedDevicePolicy::default(),
            passthrough_drivers: DEFAULT_PASSTHROUGH_DRIVERS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            timeout: None,
        }
    }
}

/// Runs setup and teardown intents against one host.
pub struct Orchestrator {
    probe: ResourceProbe,
    modules: ModuleMgr,
    hugepages: HugepageMgr,
    rebinder: DriverRebinder,
    catalog: DeviceCatalog,
    config: OrchestratorConfig,
    state: RunState,
}

impl Orchestrator {
    /// Creates an orchestrator; every component shares `store`.
    pub fn new(store: Arc<dyn ResourceStore>, config: OrchestratorConfig) -> Self {
        Self {
            probe: ResourceProbe::new(store.clone()),
            modules: ModuleMgr::new(store.clone()),
            hugepages: HugepageMgr::new(store.clone()),
            rebinder: DriverRebinder::new(store.clone()),
            catalog: DeviceCatalog::new(
                store,
                config.policy,
                config.passthrough_drivers.iter().cloned(),
            ),
            config,
            state: RunState::Idle,
        }
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The device catalog.
    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    fn transition(&mut self, next: RunState) {
        info!(from = %self.state, to = %next, "Run state");
        self.state = next;
    }

    /// Devices a setup may target, in discovery order.
    pub async fn eligible_devices(&mut self) -> HostPrepResult<Vec<PciDevice>> {
        let filter = self.config.filter.clone();
        self.catalog.discover(&filter).await
    }

    /// Devices with an original driver on record: every matching one plus
    /// any recorded device the filter no longer matches.
    pub async fn recorded_devices(&mut self) -> HostPrepResult<Vec<BusAddress>> {
        let filter = self.config.filter.clone();
        let mut devices: BTreeSet<BusAddress> = self
            .catalog
            .discover_recorded(&filter)
            .await?
            .into_iter()
            .map(|d| d.address)
            .collect();
        for missing in self.catalog.adopt_recorded().await? {
            warn!(address = %missing, "Recorded device is not present on the host");
            devices.insert(missing);
        }
        devices.extend(
            self.catalog
                .devices()
                .filter(|d| d.original_driver.is_some())
                .map(|d| d.address.clone()),
        );
        Ok(devices.into_iter().collect())
    }

    /// Probes the host and lists the steps `intent` needs, marking the
    /// ones already satisfied. Changes nothing.
    pub async fn plan(
        &mut self,
        intent: &ReconciliationIntent,
    ) -> HostPrepResult<Vec<PlannedStep>> {
        let filter = self.config.filter.clone();
        self.catalog.enumerate(&filter).await?;

        match intent {
            ReconciliationIntent::Setup {
                devices,
                target_driver,
                hugepages,
                modules,
            } => {
                for address in devices {
                    if self.catalog.device(address).is_none() {
                        return Err(HostPrepError::device_not_found(address));
                    }
                    if self.catalog.is_reserved(address) {
                        return Err(HostPrepError::ReservedDevice {
                            address: address.to_string(),
                        });
                    }
                }

                let addresses: Vec<BusAddress> = devices.iter().cloned().collect();
                let host = self.probe.probe(modules, Some(hugepages), &addresses).await;
                Ok(setup_plan(
                    &host,
                    modules,
                    hugepages,
                    &addresses,
                    target_driver,
                ))
            }
            ReconciliationIntent::Teardown { devices } => {
                self.catalog.adopt_recorded().await?;
                let addresses: Vec<BusAddress> = devices.iter().cloned().collect();
                let host = self.probe.probe(&[], None, &addresses).await;
                let mut steps = Vec::new();
                for address in devices {
                    if let Some(driver) = self.catalog.original_driver(address).await? {
                        steps.push(PlannedStep {
                            satisfied: host.device_bound_to(address, &driver),
                            step: Step::Restore {
                                address: address.clone(),
                                driver,
                            },
                        });
                    }
                }
                Ok(steps)
            }
        }
    }

    /// Runs `intent` to completion.
    #[instrument(skip_all, fields(devices = intent.devices().len()))]
    pub async fn run(&mut self, intent: &ReconciliationIntent) -> RunOutcome {
        self.state = RunState::Idle;
        let outcome = match intent {
            ReconciliationIntent::Setup { .. } => self.setup(intent).await,
            ReconciliationIntent::Teardown { devices } => self.teardown(devices).await,
        };
        info!(state = %self.state, exit_code = outcome.exit_code(), "Run finished");
        outcome
    }

    async fn setup(&mut self, intent: &ReconciliationIntent) -> RunOutcome {
        let started = Instant::now();

        self.transition(RunState::Probing);
        let steps = match self.plan(intent).await {
            Ok(steps) => steps,
            Err(error) => {
                error!(error = %error, "Setup rejected");
                self.transition(RunState::Failed);
                return RunOutcome::Rejected { error };
            }
        };

        let total = steps.len();
        let mut journal = RollbackJournal::new();
        let mut applied = 0;
        let mut skipped = 0;

        for (index, planned) in steps.into_iter().enumerate() {
            self.transition(RunState::Applying {
                step: index + 1,
                total,
            });

            if index > 0 {
                if let Some(timeout) = self.config.timeout {
                    if started.elapsed() >= timeout {
                        let error = HostPrepError::RunTimedOut {
                            completed_steps: index,
                        };
                        return self.abort(error, journal).await;
                    }
                }
            }

            if planned.satisfied {
                info!(step = %planned.step, "Already satisfied");
                skipped += 1;
                continue;
            }

            match self.apply(&planned.step).await {
                Ok(Some(entry)) => {
                    info!(step = %planned.step, entry = %entry, "Step applied");
                    journal.record(entry);
                    applied += 1;
                }
                Ok(None) => skipped += 1,
                Err(RebindError { error, stranded }) => {
                    error!(step = %planned.step, error = %error, "Step failed");
                    if let Some(entry) = stranded {
                        journal.record(entry);
                    }
                    return self.abort(error, journal).await;
                }
            }
        }

        self.transition(RunState::Committed);
        RunOutcome::Committed {
            journal,
            applied,
            skipped,
        }
    }

    async fn apply(&mut self, step: &Step) -> Result<Option<JournalEntry>, RebindError> {
        match step {
            Step::LoadModule { module } => Ok(self.modules.ensure_loaded(module).await?),
            Step::MountHugetlbfs { hugepages } => {
                Ok(self.hugepages.ensure_mounted(hugepages).await?)
            }
            Step::ReserveHugepages { hugepages } => {
                Ok(self.hugepages.ensure_reserved(hugepages).await?)
            }
            Step::Rebind { address, driver } => {
                self.rebinder.rebind(&mut self.catalog, address, driver).await
            }
            Step::Restore { address, .. } => {
                self.rebinder.restore(&mut self.catalog, address).await?;
                Ok(None)
            }
        }
    }

    async fn abort(&mut self, error: HostPrepError, journal: RollbackJournal) -> RunOutcome {
        self.transition(RunState::RollingBack);
        let rollback = self.rollback(journal).await;
        if rollback.is_complete() {
            info!(reverted = rollback.reverted, "Rollback complete");
        } else {
            error!(
                reverted = rollback.reverted,
                failed = rollback.failures.len(),
                "Rollback incomplete"
            );
        }
        self.transition(RunState::Failed);
        RunOutcome::RolledBack { error, rollback }
    }

    /// Reverses every journaled entry, newest first. Best-effort: a failed
    /// entry is reported and the rest are still attempted.
    async fn rollback(&mut self, mut journal: RollbackJournal) -> RollbackReport {
        let mut report = RollbackReport::default();
        for entry in journal.drain_reverse() {
            match self.revert(&entry).await {
                Ok(()) => report.reverted += 1,
                Err(error) => {
                    warn!(entry = %entry, error = %error, "Rollback step failed");
                    report.failures.push(RollbackFailure { entry, error });
                }
            }
        }
        report
    }

    async fn revert(&mut self, entry: &JournalEntry) -> HostPrepResult<()> {
        match entry {
            JournalEntry::ModuleLoaded { module } => self.modules.unload(module).await,
            JournalEntry::HugetlbfsMounted { path, .. } => self.hugepages.unmount(path).await,
            JournalEntry::HugepagesReserved {
                page_size_kb,
                node,
                previous,
            } => {
                self.hugepages
                    .restore_count(*page_size_kb, *node, *previous)
                    .await
            }
            JournalEntry::DeviceRebound {
                address,
                prior_driver,
                recorded_original,
            }
            | JournalEntry::DeviceStranded {
                address,
                prior_driver,
                recorded_original,
            } => {
                self.rebinder
                    .revert(&mut self.catalog, address, prior_driver.as_deref())
                    .await?;
                if *recorded_original {
                    self.catalog.forget_original(address).await?;
                }
                Ok(())
            }
        }
    }

    async fn teardown(&mut self, devices: &BTreeSet<BusAddress>) -> RunOutcome {
        self.transition(RunState::Probing);
        let filter = self.config.filter.clone();
        if let Err(error) = self.catalog.enumerate(&filter).await {
            warn!(error = %error, "Device enumeration failed; using recorded drivers only");
        }
        if let Err(error) = self.catalog.adopt_recorded().await {
            self.transition(RunState::Failed);
            return RunOutcome::Rejected { error };
        }

        let total = devices.len();
        let mut report = TeardownReport::default();

        for (index, address) in devices.iter().enumerate() {
            self.transition(RunState::Applying {
                step: index + 1,
                total,
            });

            let driver = match self.catalog.original_driver(address).await {
                Ok(Some(driver)) => driver,
                Ok(None) => {
                    if self.catalog.device(address).is_none() {
                        report
                            .unrestored
                            .push((address.clone(), HostPrepError::device_not_found(address)));
                    } else {
                        warn!(address = %address, "No original driver on record; leaving alone");
                        report.skipped.push(address.clone());
                    }
                    continue;
                }
                Err(error) => {
                    report.unrestored.push((address.clone(), error));
                    continue;
                }
            };

            let step = Step::Restore {
                address: address.clone(),
                driver,
            };
            match self.apply(&step).await {
                Ok(_) => {
                    info!(step = %step, "Step applied");
                    report.restored.push(address.clone());
                }
                Err(RebindError { error, .. }) => {
                    error!(step = %step, error = %error, "Restore failed");
                    report.unrestored.push((address.clone(), error));
                }
            }
        }

        if report.unrestored.is_empty() {
            self.transition(RunState::Committed);
        } else {
            self.transition(RunState::Failed);
        }
        RunOutcome::TornDown { report }
    }

    /// Read-only view of the candidate devices and the resources a setup
    /// with `hugepages` and `modules` would touch.
    pub async fn status(
        &mut self,
        hugepages: &HugepageSpec,
        modules: &[ModuleSpec],
    ) -> HostPrepResult<StatusReport> {
        let filter = self.config.filter.clone();
        let devices = self.catalog.enumerate(&filter).await?;
        let mut host = self.probe.probe(modules, Some(hugepages), &[]).await;

        Ok(StatusReport {
            devices,
            hugetlbfs_mounted: host
                .hugetlbfs_mounted
                .remove(&hugepages.mount_path)
                .unwrap_or(Observed::Unknown),
            hugepages: host
                .hugepages
                .remove(&(hugepages.page_size_kb, hugepages.node))
                .unwrap_or(Observed::Unknown),
            modules: host.modules.into_iter().collect(),
        })
    }
}

fn setup_plan(
    host: &HostState,
    modules: &[ModuleSpec],
    hugepages: &HugepageSpec,
    devices: &[BusAddress],
    target_driver: &str,
) -> Vec<PlannedStep> {
    let mut steps: Vec<PlannedStep> = modules
        .iter()
        .map(|module| PlannedStep {
            satisfied: host.module_satisfied(module),
            step: Step::LoadModule {
                module: module.clone(),
            },
        })
        .collect();

    steps.push(PlannedStep {
        satisfied: host.mount_satisfied(hugepages),
        step: Step::MountHugetlbfs {
            hugepages: hugepages.clone(),
        },
    });
    steps.push(PlannedStep {
        satisfied: host.mount_satisfied(hugepages) && host.reservation_satisfied(hugepages),
        step: Step::ReserveHugepages {
            hugepages: hugepages.clone(),
        },
    });

    steps.extend(devices.iter().map(|address| PlannedStep {
        satisfied: host.device_bound_to(address, target_driver),
        step: Step::Rebind {
            address: address.clone(),
            driver: target_driver.to_string(),
        },
    }));

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicprep_test::fixtures::{
        addr, dual_port_host, e1000_host, hugepages_2m, DATA_NIC, MGMT_NIC, SECOND_DATA_NIC,
    };
    use nicprep_test::{FakeHost, HostVerifier};
    use pretty_assertions::assert_eq;

    fn orchestrator(host: &FakeHost) -> Orchestrator {
        Orchestrator::new(Arc::new(host.clone()), OrchestratorConfig::default())
    }

    fn setup_intent(devices: &[&str], pages: u64) -> ReconciliationIntent {
        ReconciliationIntent::setup(
            devices.iter().map(|d| addr(d)),
            "vfio-pci",
            hugepages_2m(pages),
            false,
        )
    }

    #[tokio::test]
    async fn test_setup_commits_in_order() {
        let host = e1000_host();
        let mut orch = orchestrator(&host);

        let outcome = orch.run(&setup_intent(&[DATA_NIC], 512)).await;
        assert_eq!(outcome.exit_code(), EXIT_OK);
        assert_eq!(orch.state(), RunState::Committed);
        assert_eq!(
            host.mutations(),
            vec![
                "modprobe vfio",
                "modprobe vfio-pci",
                "mount /mnt/huge pagesize=2048K",
                "hugepages-2048kB=512",
                "unbind 0000:02:02.0 e1000",
                "bind 0000:02:02.0 vfio-pci",
            ]
        );
        match outcome {
            RunOutcome::Committed {
                journal,
                applied,
                skipped,
            } => {
                assert_eq!(journal.len(), 5);
                assert_eq!((applied, skipped), (5, 0));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plan_marks_satisfied_steps() {
        let host = e1000_host()
            .with_loaded_module("vfio", &[])
            .with_mount("/mnt/huge");
        let mut orch = orchestrator(&host);

        let plan = orch.plan(&setup_intent(&[DATA_NIC], 0)).await.unwrap();
        let satisfied: Vec<(String, bool)> = plan
            .iter()
            .map(|p| (p.step.to_string(), p.satisfied))
            .collect();
        assert_eq!(
            satisfied,
            vec![
                ("load module vfio".to_string(), true),
                ("load module vfio-pci".to_string(), false),
                ("mount hugetlbfs at /mnt/huge".to_string(), true),
                ("reserve 0 x 2048kB pages on all nodes".to_string(), true),
                ("bind 0000:02:02.0 to vfio-pci".to_string(), false),
            ]
        );
        assert!(host.mutations().is_empty());
        assert_eq!(orch.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_reserved_device_is_rejected() {
        let host = e1000_host();
        let before = host.snapshot();
        let mut orch = orchestrator(&host);

        let outcome = orch.run(&setup_intent(&[MGMT_NIC], 64)).await;
        assert!(matches!(
            outcome,
            RunOutcome::Rejected {
                error: HostPrepError::ReservedDevice { .. }
            }
        ));
        assert_eq!(outcome.exit_code(), EXIT_FAILED);
        assert_eq!(orch.state(), RunState::Failed);
        HostVerifier::new(&host).assert_unchanged(&before).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected() {
        let host = e1000_host();
        let mut orch = orchestrator(&host);
        let outcome = orch.run(&setup_intent(&["0000:09:00.0"], 64)).await;
        assert!(matches!(
            outcome,
            RunOutcome::Rejected {
                error: HostPrepError::DeviceNotFound { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_module_failure_rolls_back() {
        let host = e1000_host().fail_module_load("vfio-pci");
        let before = host.snapshot();
        let mut orch = orchestrator(&host);

        let outcome = orch.run(&setup_intent(&[DATA_NIC], 64)).await;
        match &outcome {
            RunOutcome::RolledBack { error, rollback } => {
                assert!(matches!(error, HostPrepError::ModuleLoadFailed { .. }));
                assert_eq!(rollback.reverted, 1);
                assert!(rollback.is_complete());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(outcome.exit_code(), EXIT_ROLLED_BACK);
        HostVerifier::new(&host).assert_unchanged(&before).unwrap();
    }

    #[tokio::test]
    async fn test_timeout_between_steps_rolls_back() {
        let host = e1000_host();
        let before = host.snapshot();
        let mut orch = Orchestrator::new(
            Arc::new(host.clone()),
            OrchestratorConfig {
                timeout: Some(Duration::ZERO),
                ..OrchestratorConfig::default()
            },
        );

        let outcome = orch.run(&setup_intent(&[DATA_NIC], 64)).await;
        match &outcome {
            RunOutcome::RolledBack { error, rollback } => {
                assert!(matches!(
                    error,
                    HostPrepError::RunTimedOut { completed_steps: 1 }
                ));
                assert_eq!(rollback.reverted, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(host.mutations(), vec!["modprobe vfio", "modprobe -r vfio"]);
        HostVerifier::new(&host).assert_unchanged(&before).unwrap();
    }

    #[tokio::test]
    async fn test_teardown_restores_each_device() {
        let host = dual_port_host();
        let mut orch = orchestrator(&host);
        let devices = orch.eligible_devices().await.unwrap();
        assert_eq!(devices.len(), 2);

        let intent = setup_intent(&[DATA_NIC, SECOND_DATA_NIC], 64);
        assert_eq!(orch.run(&intent).await.exit_code(), EXIT_OK);

        let recorded = orch.recorded_devices().await.unwrap();
        assert_eq!(recorded.len(), 2);

        let outcome = orch.run(&ReconciliationIntent::teardown(recorded)).await;
        match &outcome {
            RunOutcome::TornDown { report } => {
                assert_eq!(report.restored.len(), 2);
                assert!(report.unrestored.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(host.driver_of(DATA_NIC).as_deref(), Some("e1000"));
        assert_eq!(host.driver_of(SECOND_DATA_NIC).as_deref(), Some("e1000"));
    }

    #[tokio::test]
    async fn test_status_is_read_only() {
        let host = e1000_host();
        let mut orch = orchestrator(&host);
        let report = orch
            .status(&hugepages_2m(64), &[ModuleSpec::new("vfio")])
            .await
            .unwrap();
        assert_eq!(report.devices.len(), 2);
        assert!(report.devices[0].reserved);
        assert_eq!(report.hugetlbfs_mounted, Observed::Known(false));
        assert_eq!(report.hugepages, Observed::Known(0));
        assert!(host.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_plan_lists_recorded_devices() {
        let host = dual_port_host();
        let setup = setup_intent(&[DATA_NIC, SECOND_DATA_NIC], 64);
        assert_eq!(orchestrator(&host).run(&setup).await.exit_code(), EXIT_OK);
        host.set_driver(SECOND_DATA_NIC, Some("e1000"));
        let mutations = host.mutations().len();

        let mut orch = orchestrator(&host);
        let intent = ReconciliationIntent::teardown([
            addr(DATA_NIC),
            addr(SECOND_DATA_NIC),
            addr(MGMT_NIC),
        ]);
        let plan = orch.plan(&intent).await.unwrap();
        let steps: Vec<(String, bool)> = plan
            .iter()
            .map(|p| (p.step.to_string(), p.satisfied))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("restore 0000:02:02.0 to e1000".to_string(), false),
                ("restore 0000:02:03.0 to e1000".to_string(), true),
            ]
        );
        assert_eq!(host.mutations().len(), mutations);
        assert_eq!(orch.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_teardown_without_enumeration_uses_records() {
        let host = e1000_host();
        let setup = setup_intent(&[DATA_NIC], 64);
        assert_eq!(orchestrator(&host).run(&setup).await.exit_code(), EXIT_OK);

        let host = host.fail_listing();
        let mut orch = orchestrator(&host);
        let outcome = orch
            .run(&ReconciliationIntent::teardown([addr(DATA_NIC)]))
            .await;
        match &outcome {
            RunOutcome::TornDown { report } => {
                assert_eq!(report.restored, vec![addr(DATA_NIC)]);
                assert!(report.unrestored.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(host.driver_of(DATA_NIC).as_deref(), Some("e1000"));
        assert_eq!(host.recorded_original(DATA_NIC), None);
    }
}
