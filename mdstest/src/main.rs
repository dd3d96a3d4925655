use anyhow::{anyhow, bail, Context, Result};
use backend_client::{BackendClient, CreateRunRequest, TestFilter};
use clap::{ArgAction, Parser, Subcommand};
use device_scan::{Scanner, DEFAULT_CONCURRENCY};
use mds_dispatch::{DispatchOptions, Dispatcher};
use mdstest_core::{Port, PortRange};
use registry_sqlite::DeviceRegistry;
use run_exec::{Device, RunExecutor, RunPlan};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod output;

use config::Config;
use output::{emit, OutputFormat};

#[derive(Debug, Parser)]
#[command(name = "mdstest", version, about = "Discover local biometric device services and run compliance tests against them")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./mdstest.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Probe the local port window for device services and record them
    Scan {
        /// Port window, e.g. 4501-4600 or a single port
        #[arg(long)]
        ports: Option<String>,
        /// Max probes in flight
        #[arg(long)]
        concurrency: Option<usize>,
        /// Timeout per probe in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Cap on probe launches per second; 0 disables pacing
        #[arg(long)]
        qps: Option<u32>,
        /// Fetch device info and decode it through the backend instead of discovery
        #[arg(long, default_value_t = false)]
        info: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List registered devices
    Devices {
        /// Show decoded device info instead of discovery records
        #[arg(long, default_value_t = false)]
        info: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Show everything recorded for one port (JSON)
    Device { port: Port },
    /// Remove one device, or every device with --all
    Forget {
        #[arg(conflicts_with = "all", required_unless_present = "all")]
        port: Option<Port>,
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Fetch the backend's test taxonomy (JSON)
    Masterdata,
    /// List test cases matching a filter
    Tests {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Create a test run and print its id
    CreateRun {
        #[command(flatten)]
        filter: FilterArgs,
        /// Test id to include (repeatable)
        #[arg(long = "test", required = true)]
        tests: Vec<String>,
        #[arg(long)]
        email: String,
    },
    /// List runs created by an email address (JSON)
    Runs { email: String },
    /// Fetch the backend's report for a run (JSON)
    Report { run_id: String },
    /// Execute a run's test cases against one registered device
    Execute {
        run_id: String,
        /// Port of a registered device
        #[arg(long)]
        port: Port,
        /// Test id to execute (repeatable). Defaults to the run's tests on the backend.
        #[arg(long = "test")]
        tests: Vec<String>,
        /// Max test cases in flight; unbounded if omitted
        #[arg(long)]
        max_parallel: Option<usize>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Output file (overwrites)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, clap::Args)]
struct FilterArgs {
    #[arg(long)]
    biometric_type: String,
    #[arg(long)]
    device_type: String,
    #[arg(long)]
    spec_version: String,
    #[arg(long)]
    process: String,
}

impl From<FilterArgs> for TestFilter {
    fn from(a: FilterArgs) -> Self {
        TestFilter {
            biometric_type: a.biometric_type,
            device_type: a.device_type,
            mds_specification_version: a.spec_version,
            process: a.process,
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

/// Token cancelled on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            t.cancel();
        }
    });
    token
}

fn dispatcher(cfg: &Config, timeout_ms: u64) -> Result<Dispatcher> {
    let opts = DispatchOptions { host: cfg.device_host().to_string(), timeout_ms, ..DispatchOptions::default() };
    Ok(Dispatcher::new(opts)?)
}

fn backend(cfg: &Config) -> Result<BackendClient> {
    BackendClient::new(cfg.backend_url(), cfg.backend_timeout_ms())
        .with_context(|| format!("backend client for {}", cfg.backend_url()))
}

fn open_registry(cfg: &Config) -> Result<DeviceRegistry> {
    let path = cfg.registry_path();
    DeviceRegistry::open(&path).with_context(|| format!("opening device registry {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = config::load_config(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, cfg))
}

async fn run(command: Commands, cfg: Config) -> Result<()> {
    match command {
        Commands::Version => {
            println!("mdstest {} (core {})", env!("CARGO_PKG_VERSION"), mdstest_core::version());
        }
        Commands::Scan { ports, concurrency, timeout_ms, qps, info, format } => {
            let range: PortRange = match ports.or_else(|| cfg.scan.ports.clone()) {
                Some(spec) => spec.parse()?,
                None => PortRange::default(),
            };
            let concurrency = concurrency.or(cfg.scan.concurrency).unwrap_or(DEFAULT_CONCURRENCY);
            let timeout_ms = timeout_ms.or(cfg.scan.timeout_ms).unwrap_or_else(|| cfg.device_timeout_ms());
            let qps = qps.or(cfg.scan.qps);

            let registry = open_registry(&cfg)?;
            let transport = Arc::new(dispatcher(&cfg, timeout_ms)?);
            let scanner = Scanner::new(transport, registry.clone()).with_qps(qps);
            let cancel = ctrl_c_token();
            let started = Instant::now();
            let result = if info {
                let decoder = Arc::new(backend(&cfg)?);
                scanner.scan_with_info_and_cancel(decoder, range, concurrency, cancel).await
            } else {
                scanner.scan_with_cancel(range, concurrency, cancel).await
            };
            drop(scanner);
            registry.shutdown().await;
            let summary = result?;
            info!(duration_ms = started.elapsed().as_millis() as u64, found = summary.found, "scan finished");
            emit(None, &output::render_scan(&summary, format)?)?;
        }
        Commands::Devices { info, format } => {
            let registry = open_registry(&cfg)?;
            let rendered = if info {
                output::render_device_infos(&registry.snapshot_info().await?, format)
            } else {
                output::render_devices(&registry.snapshot().await?, format)
            };
            registry.shutdown().await;
            emit(None, &rendered?)?;
        }
        Commands::Device { port } => {
            let registry = open_registry(&cfg)?;
            let discovery = registry.snapshot().await?.remove(&port);
            let info = registry.snapshot_info().await?.remove(&port);
            registry.shutdown().await;
            if discovery.is_none() && info.is_none() {
                bail!("no device recorded on port {port}");
            }
            print_json(&serde_json::json!({ "port": port, "discovery": discovery, "info": info }))?;
        }
        Commands::Forget { port, all } => {
            let registry = open_registry(&cfg)?;
            let result = if all {
                registry.clear().await.map(|_| "registry cleared".to_string())
            } else {
                let port = port.ok_or_else(|| anyhow!("provide a port or --all"))?;
                registry.remove(port).await.map(|removed| {
                    if removed { format!("port {port} forgotten") } else { format!("port {port} was not registered") }
                })
            };
            registry.shutdown().await;
            println!("{}", result?);
        }
        Commands::Masterdata => print_json(&backend(&cfg)?.master_data().await?)?,
        Commands::Tests { filter, format } => {
            let tests = backend(&cfg)?.tests(&filter.into()).await?;
            emit(None, &output::render_tests(&tests, format)?)?;
        }
        Commands::CreateRun { filter, tests, email } => {
            let filter: TestFilter = filter.into();
            let req = CreateRunRequest {
                mds_spec_version: filter.mds_specification_version,
                process: filter.process,
                biometric_type: filter.biometric_type,
                device_type: filter.device_type,
                tests,
                email,
            };
            println!("{}", backend(&cfg)?.create_run(&req).await?);
        }
        Commands::Runs { email } => print_json(&backend(&cfg)?.runs(&email).await?)?,
        Commands::Report { run_id } => print_json(&backend(&cfg)?.report(&run_id).await?)?,
        Commands::Execute { run_id, port, tests, max_parallel, format, out } => {
            let backend = Arc::new(backend(&cfg)?);
            let tests = if tests.is_empty() {
                let run = backend.report(&run_id).await?;
                if run.tests.is_empty() {
                    bail!("run {run_id} has no tests; pass --test <id>");
                }
                run.tests
            } else {
                tests
            };

            let registry = open_registry(&cfg)?;
            let device = Device::from_registry(&registry, port).await;
            registry.shutdown().await;
            let device = device?;

            let transport = Arc::new(dispatcher(&cfg, cfg.device_timeout_ms())?);
            let executor = RunExecutor::new(transport, backend).with_max_parallel(max_parallel);
            let report = executor
                .execute_with_cancel(&RunPlan::new(run_id, tests), &device, ctrl_c_token())
                .await;
            emit(out.as_deref(), &output::render_report(&report, format)?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_execute() {
        let cli = Cli::parse_from([
            "mdstest", "execute", "R1", "--port", "4501", "--test", "T1", "--test", "T2", "--format", "csv",
        ]);
        match cli.command {
            Commands::Execute { run_id, port, tests, max_parallel, format, out } => {
                assert_eq!(run_id, "R1");
                assert_eq!(port, 4501);
                assert_eq!(tests, vec!["T1", "T2"]);
                assert_eq!(max_parallel, None);
                assert_eq!(format, OutputFormat::Csv);
                assert!(out.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn forget_requires_port_or_all() {
        assert!(Cli::try_parse_from(["mdstest", "forget"]).is_err());
        assert!(Cli::try_parse_from(["mdstest", "forget", "4501", "--all"]).is_err());
        assert!(Cli::try_parse_from(["mdstest", "forget", "--all"]).is_ok());
    }

    #[test]
    fn verbosity_is_global() {
        let cli = Cli::parse_from(["mdstest", "devices", "-vv", "--info"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn filter_maps_to_backend_names() {
        let cli = Cli::parse_from([
            "mdstest", "tests", "--biometric-type", "Finger", "--device-type", "Slap", "--spec-version", "0.9.5",
            "--process", "Registration",
        ]);
        let Commands::Tests { filter, .. } = cli.command else { panic!("expected tests") };
        let filter: TestFilter = filter.into();
        assert_eq!(filter.mds_specification_version, "0.9.5");
        assert_eq!(filter.device_type, "Slap");
    }
}
