//! nicprep entry point.
//!
//! Loads the configuration, applies command line overrides, takes the
//! host run lock and runs one setup, teardown or status request.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use nicprep::config_file::DEFAULT_CONFIG_PATH;
use nicprep::orchestrator::{EXIT_CONCURRENT_RUN, EXIT_FAILED, EXIT_OK};
use nicprep::{
    required_modules, NicprepConfig, Orchestrator, PlannedStep, ReconciliationIntent, RunLock,
    RunOutcome,
};
use nicprep_common::{BusAddress, HostPrepError, SysfsStore};

/// Prepare NICs and huge pages for kernel-bypass networking
#[derive(Parser, Debug)]
#[command(name = "nicprep")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reserve huge pages and hand devices to a passthrough driver
    Setup(SetupArgs),
    /// Return devices to their original drivers
    Teardown(TeardownArgs),
    /// Show devices, drivers, huge pages and modules
    Status(FilterArgs),
}

#[derive(clap::Args, Debug, Default)]
struct FilterArgs {
    /// PCI class prefix (02 for network controllers)
    #[arg(long)]
    class: Option<String>,

    /// PCI vendor id
    #[arg(long)]
    vendor: Option<String>,
}

#[derive(clap::Args, Debug)]
struct SetupArgs {
    /// Target passthrough driver
    #[arg(long)]
    driver: Option<String>,

    /// Device to set up (repeatable); all eligible devices when omitted
    #[arg(long = "device", value_name = "ADDR")]
    devices: Vec<BusAddress>,

    #[command(flatten)]
    filter: FilterArgs,

    /// Leading matched devices kept for host management
    #[arg(long)]
    reserve_leading: Option<usize>,

    /// Set up at most this many eligible devices
    #[arg(long)]
    max_devices: Option<usize>,

    /// Huge pages to reserve
    #[arg(long)]
    hugepages: Option<u64>,

    /// Smallest acceptable huge page grant
    #[arg(long)]
    min_hugepages: Option<u64>,

    /// Huge page size in kB
    #[arg(long)]
    page_size_kb: Option<u64>,

    /// NUMA node of the huge page pool
    #[arg(long)]
    node: Option<u32>,

    /// hugetlbfs mount point
    #[arg(long)]
    mount: Option<PathBuf>,

    /// Load vfio in unsafe no-IOMMU mode
    #[arg(long)]
    no_iommu: bool,

    /// Abort and roll back if the run exceeds this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Print the plan without changing anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(clap::Args, Debug)]
struct TeardownArgs {
    /// Device to restore (repeatable); every recorded device when omitted
    #[arg(long = "device", value_name = "ADDR")]
    devices: Vec<BusAddress>,

    #[command(flatten)]
    filter: FilterArgs,

    /// Print the plan without changing anything
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(false),
        )
        .init();
}

fn apply_filter(config: &mut NicprepConfig, filter: &FilterArgs) {
    if let Some(class) = &filter.class {
        config.devices.class = Some(class.clone());
    }
    if let Some(vendor) = &filter.vendor {
        config.devices.vendor = Some(vendor.clone());
    }
}

fn apply_setup(config: &mut NicprepConfig, args: &SetupArgs) {
    apply_filter(config, &args.filter);
    if let Some(driver) = &args.driver {
        config.driver.target = driver.clone();
    }
    if let Some(n) = args.reserve_leading {
        config.devices.reserve_leading = n;
    }
    if let Some(count) = args.hugepages {
        config.hugepages.count = count;
    }
    if let Some(min) = args.min_hugepages {
        config.hugepages.min_count = Some(min);
    }
    if let Some(kb) = args.page_size_kb {
        config.hugepages.page_size_kb = kb;
    }
    if let Some(node) = args.node {
        config.hugepages.node = Some(node);
    }
    if let Some(mount) = &args.mount {
        config.hugepages.mount_path = mount.clone();
    }
    if args.no_iommu {
        config.driver.no_iommu = true;
    }
    if let Some(secs) = args.timeout_secs {
        config.run.timeout_secs = Some(secs);
    }
}

fn print_plan(steps: &[PlannedStep], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&json!({ "plan": steps }))?);
        return Ok(());
    }
    for (i, planned) in steps.iter().enumerate() {
        let mark = if planned.satisfied { "done" } else { "todo" };
        println!("{:>2}. [{}] {}", i + 1, mark, planned.step);
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        let report = match outcome {
            RunOutcome::Committed {
                journal,
                applied,
                skipped,
            } => json!({
                "outcome": "committed",
                "applied": applied,
                "skipped": skipped,
                "journal": journal,
            }),
            RunOutcome::RolledBack { error, rollback } => json!({
                "outcome": "rolled_back",
                "error": error.to_string(),
                "entity": error.entity(),
                "reverted": rollback.reverted,
                "rollback_failures": rollback.failures.iter().map(|f| json!({
                    "entry": &f.entry,
                    "error": f.error.to_string(),
                })).collect::<Vec<_>>(),
            }),
            RunOutcome::Rejected { error } => json!({
                "outcome": "rejected",
                "error": error.to_string(),
                "entity": error.entity(),
            }),
            RunOutcome::TornDown { report } => {
                let status = if report.unrestored.is_empty() {
                    "torn_down"
                } else {
                    "partial_teardown"
                };
                json!({
                    "outcome": status,
                    "restored": report.restored,
                    "skipped": report.skipped,
                    "unrestored": report.unrestored.iter().map(|(address, error)| json!({
                        "address": address,
                        "error": error.to_string(),
                    })).collect::<Vec<_>>(),
                })
            }
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match outcome {
        RunOutcome::Committed {
            journal,
            applied,
            skipped,
        } => {
            println!("Committed: {} applied, {} already satisfied", applied, skipped);
            for entry in journal.entries() {
                println!("  {}", entry);
            }
        }
        RunOutcome::RolledBack { error, rollback } => {
            println!("Setup failed: {}", error);
            println!("Rolled back {} change(s)", rollback.reverted);
            for failure in &rollback.failures {
                println!("  not reverted {}: {}", failure.entry, failure.error);
            }
        }
        RunOutcome::Rejected { error } => println!("Rejected: {}", error),
        RunOutcome::TornDown { report } => {
            for address in &report.restored {
                println!("restored   {}", address);
            }
            for address in &report.skipped {
                println!("skipped    {} (no original driver on record)", address);
            }
            for (address, error) in &report.unrestored {
                println!("unrestored {}: {}", address, error);
            }
        }
    }
    Ok(())
}

/// Takes the run lock, reporting contention as a rejected run.
fn lock_or_reject(config: &NicprepConfig, json: bool) -> anyhow::Result<Result<RunLock, u8>> {
    match RunLock::acquire(&config.run.lock_path) {
        Ok(lock) => Ok(Ok(lock)),
        Err(error @ HostPrepError::ConcurrentRunRejected { .. }) => {
            let outcome = RunOutcome::Rejected { error };
            print_outcome(&outcome, json)?;
            Ok(Err(EXIT_CONCURRENT_RUN))
        }
        Err(e) => Err(e).context("Failed to take the run lock"),
    }
}

async fn run(args: Args) -> anyhow::Result<u8> {
    let mut config = NicprepConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    match &args.command {
        Command::Setup(setup) => apply_setup(&mut config, setup),
        Command::Teardown(teardown) => apply_filter(&mut config, &teardown.filter),
        Command::Status(filter) => apply_filter(&mut config, filter),
    }
    config.validate().context("Invalid configuration")?;

    let store = Arc::new(SysfsStore::new(
        &config.run.sysfs_root,
        &config.run.state_dir,
    ));
    let mut orch = Orchestrator::new(store, config.orchestrator_config());
    let hugepages = config.hugepage_spec();
    let modules = required_modules(&config.driver.target, config.driver.no_iommu);

    match args.command {
        Command::Setup(setup) => {
            let _lock = if setup.dry_run {
                None
            } else {
                match lock_or_reject(&config, args.json)? {
                    Ok(lock) => Some(lock),
                    Err(code) => return Ok(code),
                }
            };

            let devices: Vec<BusAddress> = if setup.devices.is_empty() {
                let eligible = orch
                    .eligible_devices()
                    .await
                    .context("Device discovery failed")?;
                eligible
                    .into_iter()
                    .take(setup.max_devices.unwrap_or(usize::MAX))
                    .map(|d| d.address)
                    .collect()
            } else {
                setup.devices
            };
            if devices.is_empty() {
                warn!("No eligible devices; only modules and huge pages will be prepared");
            }

            let intent = ReconciliationIntent::setup(
                devices,
                config.driver.target.clone(),
                hugepages,
                config.driver.no_iommu,
            );

            if setup.dry_run {
                let steps = orch.plan(&intent).await.context("Planning failed")?;
                print_plan(&steps, args.json)?;
                return Ok(EXIT_OK);
            }

            let outcome = orch.run(&intent).await;
            print_outcome(&outcome, args.json)?;
            Ok(outcome.exit_code())
        }
        Command::Teardown(teardown) => {
            let _lock = if teardown.dry_run {
                None
            } else {
                match lock_or_reject(&config, args.json)? {
                    Ok(lock) => Some(lock),
                    Err(code) => return Ok(code),
                }
            };

            let devices = if teardown.devices.is_empty() {
                orch.recorded_devices()
                    .await
                    .context("Failed to read recorded devices")?
            } else {
                teardown.devices
            };
            if devices.is_empty() {
                info!("No devices to restore");
            }

            let intent = ReconciliationIntent::teardown(devices);
            if teardown.dry_run {
                let steps = orch.plan(&intent).await.context("Planning failed")?;
                print_plan(&steps, args.json)?;
                return Ok(EXIT_OK);
            }

            let outcome = orch.run(&intent).await;
            print_outcome(&outcome, args.json)?;
            Ok(outcome.exit_code())
        }
        Command::Status(_) => {
            let report = orch
                .status(&hugepages, &modules)
                .await
                .context("Status probe failed")?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(EXIT_OK);
            }

            for entry in &report.devices {
                let device = &entry.device;
                println!(
                    "{} {} {}:{} driver={} original={}{}",
                    device.address,
                    device.class,
                    device.vendor,
                    device.device,
                    device.current_driver.as_deref().unwrap_or("none"),
                    device.original_driver.as_deref().unwrap_or("-"),
                    if entry.reserved { " (reserved)" } else { "" },
                );
            }
            println!(
                "hugetlbfs {}: {:?}",
                hugepages.mount_path.display(),
                report.hugetlbfs_mounted
            );
            println!(
                "hugepages {}kB on {}: {:?}",
                hugepages.page_size_kb,
                hugepages.node_label(),
                report.hugepages
            );
            for (name, state) in &report.modules {
                let loaded = state.known().map(|m| m.loaded);
                println!("module {}: loaded={:?}", name, loaded);
            }
            Ok(EXIT_OK)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("nicprep: {:#}", e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}
