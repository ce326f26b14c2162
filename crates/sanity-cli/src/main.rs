//! connector-sanity - Connector UI sanity test harness
//!
//! ## Commands
//!
//! - `run`: wait for services, run every lane, aggregate the verdict
//! - `partition`: show how connectors are split into lanes
//! - `wait`: run only the dependency readiness gate
//! - `scan`: check a results log for the failure marker

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sanity_ci::aggregator::MarkerMatch;
use sanity_ci::config::parse_feature_flag;
use sanity_ci::readiness::ServiceStatus;
use sanity_ci::{
    Harness, HarnessConfig, Matrix, Overrides, PartitionStrategy, ResultAggregator, RunOutcome,
    ServiceHealth, ServiceSpec, TriggerEvent,
};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "connector-sanity")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Connector UI sanity test harness", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// JSON harness file
    #[arg(short, long, global = true, env = "SANITY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connector sanity tests
    Run(RunArgs),

    /// Print the connector matrix
    Partition {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Print the matrix as JSON
        #[arg(long = "json-output")]
        json_output: bool,
    },

    /// Wait for auxiliary services to become healthy
    Wait {
        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Scan a results log for the failure marker
    Scan {
        /// Results log to scan
        log: PathBuf,

        /// Failure marker
        #[arg(long, default_value = sanity_ci::aggregator::DEFAULT_FAILURE_MARKER)]
        marker: String,

        /// Only match the marker at the start of a line
        #[arg(long)]
        line_start: bool,
    },
}

#[derive(Args, Debug, Default)]
struct SelectionArgs {
    /// Connectors to test (comma or space separated)
    #[arg(long, env = "INPUT")]
    connectors: Option<String>,

    /// Number of parallel lanes
    #[arg(short, long, env = "SANITY_LANES")]
    lanes: Option<usize>,

    /// Partition strategy (contiguous, round_robin, balanced)
    #[arg(long)]
    strategy: Option<PartitionStrategy>,
}

#[derive(Args, Debug, Default)]
struct ServiceArgs {
    /// Service to wait for: name=host:port or name=command args
    #[arg(long = "service", value_parser = parse_service)]
    services: Vec<ServiceSpec>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    #[command(flatten)]
    services: ServiceArgs,

    /// Decrypted connector credentials file
    #[arg(long, env = "CONNECTOR_AUTH_FILE_PATH")]
    auth_file: Option<PathBuf>,

    /// Connector test case file
    #[arg(long, env = "CONNECTOR_TESTS_FILE_PATH")]
    tests_file: Option<PathBuf>,

    /// Database connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Extra lane environment variable (KEY=VALUE)
    #[arg(long = "feature", value_parser = parse_feature)]
    features: Vec<(String, String)>,

    /// Per-lane timeout in seconds (0 = none)
    #[arg(long)]
    timeout: Option<u64>,

    /// Directory for per-lane logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Shared results log
    #[arg(long)]
    results_log: Option<PathBuf>,

    /// Write the JSON run report here
    #[arg(long)]
    report: Option<PathBuf>,

    /// Triggering CI event
    #[arg(long, env = "GITHUB_EVENT_NAME", default_value = "workflow_dispatch")]
    event: String,

    /// Review state for pull_request_review events
    #[arg(long, env = "GITHUB_REVIEW_STATE")]
    review_state: Option<String>,

    /// Test command; placeholders {connectors}, {filter} and {lane} are expanded
    #[arg(last = true)]
    command: Vec<String>,
}

fn parse_service(raw: &str) -> Result<ServiceSpec, String> {
    ServiceSpec::parse_inline(raw).map_err(|e| e.to_string())
}

fn parse_feature(raw: &str) -> Result<(String, String), String> {
    parse_feature_flag(raw).map_err(|e| e.to_string())
}

impl SelectionArgs {
    fn into_overrides(self) -> Overrides {
        Overrides {
            connectors: self.connectors,
            lanes: self.lanes,
            strategy: self.strategy,
            ..Overrides::default()
        }
    }
}

impl RunArgs {
    fn into_overrides(self) -> Overrides {
        Overrides {
            services: self.services.services,
            auth_file: self.auth_file,
            tests_file: self.tests_file,
            database_url: self.database_url,
            feature_flags: self.features,
            command: (!self.command.is_empty()).then_some(self.command),
            timeout_secs: self.timeout,
            log_dir: self.log_dir,
            results_log: self.results_log,
            report_path: self.report,
            ..self.selection.into_overrides()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = sanity_ci::telemetry::level_for(cli.verbose, cli.quiet);
    sanity_ci::init_tracing(cli.json, level);

    let mut config = HarnessConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load harness config")?;

    match cli.command {
        Commands::Run(args) => {
            let trigger = TriggerEvent::from_event(&args.event, args.review_state.as_deref());
            config.apply(args.into_overrides());
            cmd_run(config, &trigger).await
        }
        Commands::Partition {
            selection,
            json_output,
        } => {
            config.apply(selection.into_overrides());
            cmd_partition(config, json_output)
        }
        Commands::Wait { services } => {
            config.apply(Overrides {
                services: services.services,
                ..Overrides::default()
            });
            cmd_wait(config).await
        }
        Commands::Scan {
            log,
            marker,
            line_start,
        } => cmd_scan(&log, &marker, line_start).await,
    }
}

/// Run the full harness and map the verdict to the exit code.
async fn cmd_run(config: HarnessConfig, trigger: &TriggerEvent) -> Result<()> {
    let harness = Harness::new(config);
    let outcome = harness
        .run(trigger)
        .await
        .context("Connector sanity run aborted")?;

    let (report, verdict) = match outcome {
        RunOutcome::Skipped { event } => {
            println!("Event '{}' does not trigger a sanity run, nothing to do", event);
            return Ok(());
        }
        RunOutcome::Completed { report, verdict } => (report, verdict),
    };

    println!("Run ID: {}", report.run_id);
    println!("Matrix: {}", &report.matrix_digest[..12]);
    for service in &report.readiness.services {
        println!(
            "  service {} healthy after {} attempt(s)",
            service.name, service.attempts
        );
    }
    println!();

    for lane in &report.lanes {
        let status = if lane.passed() { "✓" } else { "✗" };
        println!(
            "  {} lane {} [{}] ({}ms, exit code: {}, {} passed, {} failed)",
            status,
            lane.lane,
            lane.connectors.join(","),
            lane.duration_ms,
            lane.exit_code,
            lane.passed_count(),
            lane.failed_count()
        );
        for test in lane.failed_tests() {
            println!("      ✗ {}", test.name);
        }
    }

    println!();
    println!(
        "Summary: {} passed, {} failed across {} lane(s) in {}ms",
        report.passed_count(),
        report.failed_count(),
        report.lanes.len(),
        report.total_duration_ms()
    );
    println!("Results log: {}", report.results_log.display());
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });

    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }

    if report.success {
        println!("\n✓ All connector sanity tests passed!");
        Ok(())
    } else {
        Err(sanity_ci::HarnessError::TestFailure {
            failed: report.failed_count(),
            lanes: report.failed_lanes().count(),
        })
        .context("Connector sanity tests failed")
    }
}

fn cmd_partition(config: HarnessConfig, json_output: bool) -> Result<()> {
    let matrix = Harness::new(config)
        .plan()
        .context("Failed to partition connectors")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&matrix)?);
    } else {
        print!("{}", render_matrix(&matrix));
    }
    Ok(())
}

fn render_matrix(matrix: &Matrix) -> String {
    let mut out = format!(
        "{} connector(s) in {} lane(s), strategy {:?}, digest {}\n",
        matrix.connector_count(),
        matrix.lane_count(),
        matrix.strategy,
        &matrix.digest[..12]
    );
    for group in &matrix.groups {
        out.push_str(&format!("  lane {}: {}\n", group.lane, group.connectors().join(", ")));
    }
    out
}

async fn cmd_wait(config: HarnessConfig) -> Result<()> {
    let report = Harness::new(config)
        .check_services()
        .await
        .context("Failed to run readiness gate")?;

    if report.services.is_empty() {
        info!("No services configured");
    }
    for service in &report.services {
        println!("{}", render_service(service));
    }

    report
        .into_result()
        .map(|_| ())
        .context("Dependencies did not become ready")
}

fn render_service(service: &ServiceStatus) -> String {
    match service.health {
        ServiceHealth::Healthy => format!(
            "✓ {} healthy after {} attempt(s) ({}ms)",
            service.name, service.attempts, service.elapsed_ms
        ),
        ServiceHealth::Failed => format!(
            "✗ {} unavailable after {} attempt(s): {}",
            service.name,
            service.attempts,
            service.last_error.as_deref().unwrap_or("unknown error")
        ),
        ServiceHealth::Pending => format!("… {} not checked", service.name),
    }
}

async fn cmd_scan(log: &Path, marker: &str, line_start: bool) -> Result<()> {
    let mode = if line_start {
        MarkerMatch::LineStart
    } else {
        MarkerMatch::Substring
    };
    let verdict = ResultAggregator::new(marker)
        .with_mode(mode)
        .scan_log(log)
        .await
        .with_context(|| format!("Failed to scan {}", log.display()))?;

    if verdict.passed {
        println!("✓ No '{}' found in {}", marker, log.display());
        Ok(())
    } else {
        println!(
            "✗ Found '{}' {} time(s) in {} (lines: {:?})",
            marker,
            verdict.occurrences,
            log.display(),
            verdict.lines
        );
        anyhow::bail!("Failure marker present in results log")
    }
}
