// `hpcreport` -- collect HPC cluster and lab metrics and ship them to the time-series backends
//
// Run with --help for brief help.  Each subcommand is one collector: it reads its source, folds
// the records into a registry, and delivers the registry to its backend.  Accounting, license,
// lab and filer data go to OpenTSDB as datapoints; cluster statistics and energy readings are
// snapshots and go to the Prometheus push gateway.
//
// Only configuration problems stop the program (exit 1).  A source that cannot be read or a
// backend that rejects the data is logged and the run ends normally.

mod acct;
mod configs;
mod energy;
mod filer;
mod labusage;
mod license;
mod stats;
mod transport;

use hpcmetrics::cluster::CommandSource;
use hpcmetrics::dates::{parse_date, yesterday};
use hpcmetrics::export;
use hpcmetrics::store::CsvStore;
use hpcmetrics::MetricRegistry;

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    global_args: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sum resource use of the jobs that completed on a day
    Acct(AcctArgs),

    /// Count license seats in use
    License,

    /// Snapshot node and queue statistics
    Stats(StatsArgs),

    /// Read PDU energy consumption
    Energy(EnergyArgs),

    /// Report used and free lab time from the booking report
    LabUsage(LabUsageArgs),

    /// Report file server usage
    Filer(FilerArgs),
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Logging level
    #[arg(long, short, value_enum, default_value_t = LogLevel::Info, global = true)]
    loglevel: LogLevel,

    /// Configuration file
    #[arg(long, short, default_value = "/etc/hpcreport/config.json", global = true)]
    config: PathBuf,

    /// Print the data to stdout instead of sending them
    #[arg(long, default_value_t = false, global = true)]
    dry: bool,

    /// Also write the data to this file
    #[arg(long, global = true)]
    export: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Args, Debug)]
pub struct AcctArgs {
    /// The day whose accounting log is read, YYYYMMDD or YYYY-MM-DD [default: yesterday]
    #[arg(long, value_parser = parse_date)]
    date: Option<NaiveDate>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Report nodes that went down since the previous snapshot
    #[arg(long, default_value_t = false)]
    notify: bool,

    /// Push gateway job name
    #[arg(long, default_value = "hpc_metrics")]
    job: String,
}

#[derive(Args, Debug)]
pub struct EnergyArgs {
    /// Push gateway job name
    #[arg(long, default_value = "hpc_energy")]
    job: String,
}

#[derive(Args, Debug)]
pub struct DateRangeArgs {
    /// First day, YYYY-MM-DD [default: yesterday]
    #[arg(long, short, value_parser = parse_date)]
    from: Option<NaiveDate>,

    /// Last day, YYYY-MM-DD [default: yesterday]
    #[arg(long, short, value_parser = parse_date)]
    to: Option<NaiveDate>,
}

impl DateRangeArgs {
    fn resolve(&self) -> Result<(NaiveDate, NaiveDate)> {
        let from = self.from.unwrap_or_else(yesterday);
        let to = self.to.unwrap_or_else(yesterday);
        if from > to {
            bail!("The --from date is after the --to date");
        }
        Ok((from, to))
    }
}

#[derive(Args, Debug)]
pub struct LabUsageArgs {
    #[command(flatten)]
    range: DateRangeArgs,

    /// Metric name for used lab time
    #[arg(long, default_value = "lab.usage")]
    name_used: String,

    /// Metric name for free lab time
    #[arg(long, default_value = "lab.free")]
    name_free: String,
}

#[derive(Args, Debug)]
pub struct FilerArgs {
    #[command(flatten)]
    range: DateRangeArgs,

    /// Metric name
    #[arg(long, default_value = "storage.filer.size")]
    name: String,
}

/// Where a collector's registry goes.

enum Backend {
    OpenTsdb,
    Gateway { job: String },
}

fn main() {
    match hpcreport() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn hpcreport() -> Result<()> {
    let cli = Cli::parse();
    let global = &cli.global_args;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(global.loglevel.directive()))
        .with_writer(io::stderr)
        .without_time()
        .init();

    let config = configs::read_from_json(&global.config)?;
    let client = transport::http_client()?;

    // Resolve everything the collector needs from the configuration before collecting, so that a
    // configuration error is reported without any side effects.

    let (name, collected, backend) = match cli.command {
        Commands::Acct(ref args) => {
            let torque = config.torque()?;
            let date = args.date.unwrap_or_else(yesterday);
            let _span = info_span!("collect", collector = "acct").entered();
            (
                "acct",
                acct::collect(&torque.log_dir, date),
                Backend::OpenTsdb,
            )
        }
        Commands::License => {
            let source = command_source(&config)?;
            let _span = info_span!("collect", collector = "license").entered();
            (
                "license",
                license::collect(&source, Utc::now().timestamp()),
                Backend::OpenTsdb,
            )
        }
        Commands::Stats(ref args) => {
            let source = command_source(&config)?;
            let batch_queues = config.torque()?.batch_queues.clone();
            let _span = info_span!("collect", collector = "stats").entered();
            let collected = stats::collect(&source, &batch_queues);
            if args.notify {
                if let Ok(ref snapshot) = collected {
                    notify_down_nodes(&client, &config.push.gateway_url, &snapshot.nodes_down);
                }
            }
            (
                "stats",
                collected.map(|s| s.registry),
                Backend::Gateway {
                    job: args.job.clone(),
                },
            )
        }
        Commands::Energy(ref args) => {
            let cfg = config.energy()?;
            let source = energy::XymonSource::new(&cfg.xymonq, &cfg.xymonq_cfg);
            let _span = info_span!("collect", collector = "energy").entered();
            (
                "energy",
                Ok(energy::collect(&source, &cfg.pdus)),
                Backend::Gateway {
                    job: args.job.clone(),
                },
            )
        }
        Commands::LabUsage(ref args) => {
            let (from, to) = args.range.resolve()?;
            let lab = config.lab()?;
            let store = csv_store(&config)?;
            let source = labusage::HttpBookingSource {
                client: &client,
                report_url: lab.report_url.clone(),
            };
            let options = labusage::LabUsageOptions {
                used_metric: &args.name_used,
                free_metric: &args.name_free,
                window: lab.window,
                excluded_sources: &lab.excluded_sources,
            };
            let _span = info_span!("collect", collector = "lab-usage").entered();
            (
                "lab-usage",
                Ok(labusage::collect(&source, &store, from, to, &options)),
                Backend::OpenTsdb,
            )
        }
        Commands::Filer(ref args) => {
            let (from, to) = args.range.resolve()?;
            let store = csv_store(&config)?;
            let _span = info_span!("collect", collector = "filer").entered();
            (
                "filer",
                filer::collect(&store, from, to, &args.name),
                Backend::OpenTsdb,
            )
        }
    };

    let _span = info_span!("deliver", collector = name).entered();
    match collected {
        Ok(registry) => deliver(global, &config, &client, &registry, &backend),
        Err(e) => error!("{e}"),
    }
    Ok(())
}

fn command_source(config: &configs::Config) -> Result<CommandSource> {
    let torque = config.torque()?;
    Ok(CommandSource {
        nodes_cmd: torque.nodes_cmd.clone(),
        qstat_cmd: torque.qstat_cmd.clone(),
        license_cmd: torque.license_cmd.clone(),
    })
}

fn csv_store(config: &configs::Config) -> Result<CsvStore> {
    let store = config.store()?;
    Ok(CsvStore {
        projects: store.projects.clone(),
        filer_stats: store.filer_stats.clone(),
    })
}

// Compare with what the gateway holds from the previous run; this must happen before the new
// snapshot is pushed.  Mail delivery is left to whoever watches the log.
fn notify_down_nodes(client: &reqwest::blocking::Client, gateway: &str, nodes_down: &[String]) {
    let previous = match transport::fetch_gateway(client, gateway) {
        Ok(p) => p,
        Err(e) => {
            error!("previous snapshot: {e}");
            return;
        }
    };
    let down = stats::newly_down(&previous, nodes_down);
    info!("notification for nodes that just went down: {} nodes", down.len());
    if !down.is_empty() {
        warn!("compute nodes DOWN: {}", down.join(", "));
    }
}

fn deliver(
    global: &GlobalArgs,
    config: &configs::Config,
    client: &reqwest::blocking::Client,
    registry: &MetricRegistry,
    backend: &Backend,
) {
    if let Some(ref path) = global.export {
        if let Err(e) = export_to_file(path, registry, backend) {
            error!("{}: {e}", path.display());
        }
    }

    let result = if global.dry {
        print_dry(registry, backend)
    } else {
        match backend {
            Backend::OpenTsdb => {
                let points = export::datapoints(registry, Utc::now().timestamp());
                transport::push_datapoints(client, &config.push.opentsdb_url, &points)
            }
            Backend::Gateway { job } => transport::push_gateway(client, &config.push.gateway_url, job, registry),
        }
    };
    if let Err(e) = result {
        error!("{e}");
    }
}

fn export_to_file(path: &Path, registry: &MetricRegistry, backend: &Backend) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    match backend {
        Backend::OpenTsdb => export::write_listing(registry, &mut out)?,
        Backend::Gateway { .. } => export::render_text(registry, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn print_dry(registry: &MetricRegistry, backend: &Backend) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match backend {
        Backend::OpenTsdb => {
            for p in export::datapoints(registry, Utc::now().timestamp()) {
                writeln!(out, "{}", serde_json::to_string(&p)?)?;
            }
        }
        Backend::Gateway { .. } => export::render_text(registry, &mut out)?,
    }
    Ok(())
}

#[test]
fn test_cli_parses() {
    let cli = Cli::try_parse_from(["hpcreport", "-l", "debug", "--dry", "acct", "--date", "20240115"]).unwrap();
    assert!(cli.global_args.loglevel == LogLevel::Debug && cli.global_args.dry);
    match cli.command {
        Commands::Acct(ref a) => assert!(a.date == NaiveDate::from_ymd_opt(2024, 1, 15)),
        _ => panic!("expected acct"),
    }

    let cli = Cli::try_parse_from(["hpcreport", "lab-usage", "-f", "2024-01-10", "--to", "2024-01-12", "-c", "x.json"]).unwrap();
    assert!(cli.global_args.config == PathBuf::from("x.json"));
    match cli.command {
        Commands::LabUsage(ref a) => {
            assert!(a.name_used == "lab.usage" && a.name_free == "lab.free");
            let (from, to) = a.range.resolve().unwrap();
            assert!((to - from).num_days() == 2);
        }
        _ => panic!("expected lab-usage"),
    }

    let cli = Cli::try_parse_from(["hpcreport", "filer", "--from", "2024-01-12", "--to", "2024-01-10"]).unwrap();
    match cli.command {
        Commands::Filer(ref a) => assert!(a.range.resolve().is_err()),
        _ => panic!("expected filer"),
    }

    assert!(Cli::try_parse_from(["hpcreport", "acct", "--date", "yesterday"]).is_err());
    assert!(Cli::try_parse_from(["hpcreport", "-l", "verbose", "license"]).is_err());
}

#[test]
fn test_export_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut r = MetricRegistry::new();
    r.set("hpc_energy_usage", hpcmetrics::TagSet::new().with("pdu", "pdu-a1"), 812.0);

    let prom = dir.path().join("energy.prom");
    export_to_file(&prom, &r, &Backend::Gateway { job: "hpc_energy".to_string() }).unwrap();
    let text = std::fs::read_to_string(&prom).unwrap();
    assert!(text == "# TYPE hpc_energy_usage gauge\nhpc_energy_usage{pdu=\"pdu-a1\"} 812\n");

    let txt = dir.path().join("energy.txt");
    export_to_file(&txt, &r, &Backend::OpenTsdb).unwrap();
    assert!(std::fs::read_to_string(&txt).unwrap() == "hpc_energy_usage {pdu=pdu-a1} 812\n");
}
