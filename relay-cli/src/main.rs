//! ioc-relay CLI
//!
//! Pull vetted indicators from TruSTAR or MISP, write them to a file or push
//! them into security tools.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use relay_core::{
    default_filename, export_reports_to_path, export_to_path, ExportFormat, FieldLevel, TimeWindow,
};
use relay_feeds::{
    collect_report_rows, EnclaveFilter, FeedQuery, IndicatorFeed, V1_MAX_PAGE_SIZE,
    V2_EXPORT_PAGE_SIZE, V2_PUSH_PAGE_SIZE,
};
use relay_runtime::{DestinationKind, DestinationOutcome, Pipeline, RelayConfig, RunReport, SourceKind};

#[derive(Parser)]
#[command(name = "ioc-relay")]
#[command(author, version, about = "ioc-relay: move vetted threat-intel IOCs from feeds into security tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ioc-relay.toml in the working directory or its parent)
    #[arg(long, global = true, env = "IOC_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbosity level (0-3)
    #[arg(short, long, global = true, default_value = "1")]
    verbose: u8,
}

/// Time window and feed filters shared by export and push
#[derive(Args)]
struct FetchArgs {
    /// Indicator source
    #[arg(long, default_value = "trustar2")]
    source: SourceKind,

    /// Comma-separated enclave ids (TruSTAR only)
    #[arg(short, long, value_delimiter = ',')]
    enclaves: Vec<String>,

    /// Start of the window, UTC (YYYY-MM-DD or YYYY-MM-DD_HH:MM:SS)
    #[arg(short, long = "from-time", conflicts_with = "last_days")]
    from_time: Option<String>,

    /// End of the window, UTC (YYYY-MM-DD or YYYY-MM-DD_HH:MM:SS)
    #[arg(short, long = "to-time", conflicts_with = "last_days")]
    to_time: Option<String>,

    /// Window of the last N days ending now
    #[arg(short, long)]
    last_days: Option<u32>,

    /// Comma-separated indicator types (TruSTAR only)
    #[arg(long, value_delimiter = ',')]
    types: Vec<String>,

    /// Skip the ping and enclave checks (TruSTAR 1.3 only)
    #[arg(short, long)]
    min_calls: bool,
}

impl FetchArgs {
    fn query(&self, page_size: usize) -> Result<FeedQuery> {
        let window = TimeWindow::resolve(
            self.from_time.as_deref(),
            self.to_time.as_deref(),
            self.last_days,
            Utc::now(),
        )?;
        Ok(FeedQuery::new(window)
            .with_enclaves(self.enclaves.clone())
            .with_types(self.types.clone())
            .with_page_size(page_size))
    }

    fn describe_window(&self, query: &FeedQuery) {
        println!(
            "🕒 Window: {} -> {}",
            query.window.from_utc().format("%Y-%m-%d %H:%M:%S"),
            query.window.to_utc().format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// Days covered by a report export when no window is given
const REPORT_DAYS: u32 = 7;

/// Window and enclaves of a report export
#[derive(Args)]
struct ReportArgs {
    /// Comma-separated enclave ids
    #[arg(short, long, value_delimiter = ',')]
    enclaves: Vec<String>,

    /// Start of the window, UTC (YYYY-MM-DD or YYYY-MM-DD_HH:MM:SS)
    #[arg(short, long = "from-time", conflicts_with = "last_days")]
    from_time: Option<String>,

    /// End of the window, UTC (YYYY-MM-DD or YYYY-MM-DD_HH:MM:SS)
    #[arg(short, long = "to-time", conflicts_with = "last_days")]
    to_time: Option<String>,

    /// Window of the last N days ending now (default 7)
    #[arg(short, long)]
    last_days: Option<u32>,

    /// Skip the ping and enclave checks
    #[arg(short, long)]
    min_calls: bool,
}

impl ReportArgs {
    fn query(&self) -> Result<FeedQuery> {
        let last_days = match (&self.from_time, &self.to_time, self.last_days) {
            (None, None, None) => Some(REPORT_DAYS),
            (_, _, days) => days,
        };
        let window = TimeWindow::resolve(
            self.from_time.as_deref(),
            self.to_time.as_deref(),
            last_days,
            Utc::now(),
        )?;
        Ok(FeedQuery::new(window)
            .with_enclaves(self.enclaves.clone())
            .with_page_size(V1_MAX_PAGE_SIZE))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Export IOCs to a JSON or CSV file
    Export {
        /// Output file (default: <source>_iocs_<timestamp>.<ext>)
        outfile: Option<PathBuf>,

        #[command(flatten)]
        fetch: FetchArgs,

        /// Include every field the feed returned
        #[arg(short, long)]
        all: bool,

        /// Write CSV instead of JSON
        #[arg(short, long)]
        csv: bool,

        /// One CSV field per tag instead of a |-joined column
        #[arg(short, long, requires = "csv")]
        split_tags: bool,

        /// Only the indicator values
        #[arg(long, conflicts_with_all = ["only_vt", "all"])]
        only_vals: bool,

        /// Only the indicator values and types
        #[arg(long, conflicts_with = "all")]
        only_vt: bool,
    },

    /// Export the indicators of each TruSTAR 1.3 enclave report to CSV
    ExportReports {
        /// Output file (default: trustar_reports_<timestamp>.csv)
        outfile: Option<PathBuf>,

        #[command(flatten)]
        window: ReportArgs,
    },

    /// Fetch IOCs and push them to one or more destinations
    Push {
        #[command(flatten)]
        fetch: FetchArgs,

        /// Destinations (splunk, crowdstrike, microsoft, sentinelone, insightidr, sumologic)
        #[arg(long = "to", required = true, num_args = 1.., value_delimiter = ',')]
        destinations: Vec<DestinationKind>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the TruSTAR enclaves the API user can access
    Enclaves {
        /// Output all fields as a JSON string
        #[arg(short, long, conflicts_with = "pretty")]
        json: bool,

        /// Output all fields as indented JSON
        #[arg(short, long)]
        pretty: bool,

        /// Only enclaves with create permission
        #[arg(short, long, conflicts_with = "no_create")]
        create: bool,

        /// Only enclaves without create permission
        #[arg(short = 'C', long)]
        no_create: bool,

        /// Only enclaves with update permission
        #[arg(short, long, conflicts_with = "no_update")]
        update: bool,

        /// Only enclaves without update permission
        #[arg(short = 'U', long)]
        no_update: bool,

        /// Use the TruSTAR 1.3 API
        #[arg(long)]
        v1: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = RelayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Export {
            outfile,
            fetch,
            all,
            csv,
            split_tags,
            only_vals,
            only_vt,
        } => {
            let level = if only_vals {
                FieldLevel::Values
            } else if only_vt {
                FieldLevel::ValuesAndType
            } else if all {
                FieldLevel::All
            } else {
                FieldLevel::Common
            };
            let format = if csv { ExportFormat::Csv } else { ExportFormat::Json };
            run_export(&config, &fetch, outfile, format, level, split_tags).await?;
        }
        Commands::ExportReports { outfile, window } => {
            run_export_reports(&config, &window, outfile).await?;
        }
        Commands::Push {
            fetch,
            destinations,
            json,
        } => {
            run_push(&config, &fetch, &destinations, json).await?;
        }
        Commands::Enclaves {
            json,
            pretty,
            create,
            no_create,
            update,
            no_update,
            v1,
        } => {
            let filter = EnclaveFilter {
                create: tri_state(create, no_create),
                update: tri_state(update, no_update),
            };
            let output = if pretty {
                EnclaveOutput::Pretty
            } else if json {
                EnclaveOutput::Json
            } else {
                EnclaveOutput::Lines
            };
            list_enclaves(&config, filter, output, v1).await?;
        }
    }

    Ok(())
}

fn tri_state(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn page_size(source: SourceKind, push: bool) -> usize {
    match source {
        SourceKind::Trustar2 if push => V2_PUSH_PAGE_SIZE,
        SourceKind::Trustar2 => V2_EXPORT_PAGE_SIZE,
        SourceKind::Trustar | SourceKind::Misp => V1_MAX_PAGE_SIZE,
    }
}

fn file_prefix(source: SourceKind) -> &'static str {
    match source {
        SourceKind::Trustar2 | SourceKind::Trustar => "trustar_iocs",
        SourceKind::Misp => "misp_iocs",
    }
}

async fn run_export(
    config: &RelayConfig,
    fetch: &FetchArgs,
    outfile: Option<PathBuf>,
    format: ExportFormat,
    level: FieldLevel,
    split_tags: bool,
) -> Result<()> {
    println!("📥 ioc-relay export from {}\n", fetch.source);

    let query = fetch.query(page_size(fetch.source, false))?;
    fetch.describe_window(&query);

    let feed = config.feed(fetch.source, fetch.min_calls)?;
    let mut pipeline = Pipeline::new(feed).with_reclassify(false);
    let report = pipeline
        .collect(&query)
        .await
        .with_context(|| format!("Fetching IOCs from {}", fetch.source))?;

    println!("🔎 Found {} IOCs", report.indicators.len());
    for (reason, count) in report.skip_counts() {
        println!("   Skipped {} ({})", count, reason);
    }
    if report.indicators.is_empty() {
        println!("\nNo IOCs found. Nothing to do.");
        return Ok(());
    }

    let path = outfile.unwrap_or_else(|| {
        PathBuf::from(default_filename(file_prefix(fetch.source), format, Utc::now()))
    });
    export_to_path(&report.indicators, &path, format, level, split_tags)
        .with_context(|| format!("Writing {}", path.display()))?;

    println!("\n✅ Export complete!");
    println!("📄 IOCs saved to: {}", path.display());
    Ok(())
}

async fn run_export_reports(
    config: &RelayConfig,
    args: &ReportArgs,
    outfile: Option<PathBuf>,
) -> Result<()> {
    println!("📥 ioc-relay report export from trustar\n");

    let query = args.query()?;
    println!(
        "🕒 Window: {} -> {}",
        query.window.from_utc().format("%Y-%m-%d %H:%M:%S"),
        query.window.to_utc().format("%Y-%m-%d %H:%M:%S")
    );

    let mut source = config.report_source(args.min_calls)?;
    source
        .authenticate()
        .await
        .context("Failed to access API. Check your config file")?;

    let export = collect_report_rows(&source, &query)
        .await
        .context("Listing TruSTAR reports")?;

    println!("🔎 Found {} reports, {} indicators", export.reports, export.rows.len());
    for id in &export.skipped {
        println!("   Skipped report {}", id);
    }

    let path = outfile.unwrap_or_else(|| {
        PathBuf::from(default_filename("trustar_reports", ExportFormat::Csv, Utc::now()))
    });
    export_reports_to_path(&export.rows, &path)
        .with_context(|| format!("Writing {}", path.display()))?;

    println!("\n✅ Export complete!");
    println!("📄 Report indicators saved to: {}", path.display());
    Ok(())
}

async fn run_push(
    config: &RelayConfig,
    fetch: &FetchArgs,
    destinations: &[DestinationKind],
    json: bool,
) -> Result<()> {
    let names: Vec<&str> = destinations.iter().map(DestinationKind::as_str).collect();
    println!("🚀 ioc-relay push from {} to {}\n", fetch.source, names.join(", "));

    let query = fetch.query(page_size(fetch.source, true))?;
    fetch.describe_window(&query);

    // Build every client up front so a missing section fails before any fetch
    let mut sinks = Vec::with_capacity(destinations.len());
    for kind in destinations {
        sinks.push(config.destination(*kind)?);
    }

    let feed = config.feed(fetch.source, fetch.min_calls)?;
    let mut pipeline = Pipeline::new(feed).with_destinations(sinks);
    let report = pipeline.run(&query).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.all_destinations_failed() {
        bail!(
            "Every destination failed: {}",
            report.failed_destinations().join(", ")
        );
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("🔎 Fetched {} records, {} usable", report.fetched, report.normalized);
    for (reason, count) in &report.skipped {
        println!("   Skipped {} ({})", count, reason);
    }
    if report.normalized == 0 {
        println!("\nNo IOCs found. Nothing to do.");
        return;
    }

    println!();
    for result in &report.destinations {
        match &result.outcome {
            DestinationOutcome::Delivered { report } => {
                let icon = if report.is_success() { "✅" } else { "⚠️ " };
                println!(
                    "{} {}: {} submitted, {} accepted, {} failed",
                    icon, result.destination, report.submitted, report.accepted, report.failed
                );
                for (reason, count) in &report.skipped {
                    println!("   Not sent: {} ({})", count, reason);
                }
            }
            DestinationOutcome::AuthFailed { reason } => {
                println!("❌ {}: authentication failed: {}", result.destination, reason);
            }
            DestinationOutcome::Failed { reason } => {
                println!("❌ {}: {}", result.destination, reason);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum EnclaveOutput {
    Lines,
    Json,
    Pretty,
}

async fn list_enclaves(
    config: &RelayConfig,
    filter: EnclaveFilter,
    output: EnclaveOutput,
    v1: bool,
) -> Result<()> {
    let mut directory = config.enclave_directory(v1)?;
    directory
        .authenticate()
        .await
        .context("Failed to access API. Check your config file")?;

    let enclaves = filter.apply(directory.list_enclaves().await?);

    match output {
        EnclaveOutput::Lines => {
            for enclave in &enclaves {
                println!("{}: {}", enclave.id, enclave.name);
            }
        }
        EnclaveOutput::Json => println!("{}", serde_json::to_string(&enclaves)?),
        EnclaveOutput::Pretty => {
            let mut buf = Vec::new();
            let formatter = serde_json::ser::PrettyFormatter::with_indent(b"   ");
            let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
            enclaves.serialize(&mut ser)?;
            println!("{}", String::from_utf8(buf)?);
        }
    }
    println!();
    Ok(())
}
