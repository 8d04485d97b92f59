//! poolbench CLI - CRUD throughput with and without connection pooling
//!
//! Runs the same create/read/update/delete workload once over a fresh
//! connection per operation and once over a bounded pool, then prints the
//! per-phase timings and the relative gain.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use poolbench_core::{
    ensure_schema, run_strategies, BenchConfig, Comparison, ComparisonReport, Connector,
    MemoryStore, PgConnector, ReportAggregator, RunNonce, RunReport, StrategyKind,
    WorkloadGenerator,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

use config::{ConnectionArgs, TuningArgs};

#[derive(Parser, Debug)]
#[command(
    name = "poolbench",
    author,
    version,
    about = "Benchmark CRUD throughput with and without connection pooling",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Suppress progress spinners (for script consumption)
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the benchmark (default when no subcommand is given)
    Run(RunArgs),
    /// Create the users table if it does not exist, then exit
    Setup(SetupArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    tuning: TuningArgs,

    /// Which strategies to run
    #[arg(long, value_enum, default_value_t = StrategyChoice::Both)]
    strategy: StrategyChoice,

    /// Store to benchmark against
    #[arg(long, value_enum, default_value_t = Backend::Postgres)]
    backend: Backend,

    /// Simulated connection setup cost for the memory backend
    #[arg(long, value_name = "MS", default_value_t = 5)]
    memory_connect_latency_ms: u64,

    /// Do not create the users table before running
    #[arg(long)]
    skip_setup: bool,

    /// Print the reports as JSON on stdout
    #[arg(long)]
    json: bool,

    /// TOML config file (default: ./poolbench.toml, then ~/.poolbench/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct SetupArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// TOML config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyChoice {
    Both,
    Direct,
    Pooled,
}

impl StrategyChoice {
    fn kinds(self) -> &'static [StrategyKind] {
        match self {
            StrategyChoice::Both => &[StrategyKind::Direct, StrategyKind::Pooled],
            StrategyChoice::Direct => &[StrategyKind::Direct],
            StrategyChoice::Pooled => &[StrategyKind::Pooled],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Postgres,
    Memory,
}

/// Shape of `--json` output
#[derive(Serialize)]
struct JsonOutput<'a> {
    nonce: &'a str,
    config: &'a BenchConfig,
    runs: &'a [RunReport],
    comparison: Option<&'a ComparisonReport>,
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}

#[tokio::main]
async fn main() -> Result<()> {
    // First, so `.env` values feed RUST_LOG and the flag fallbacks
    let env_files = config::load_dotenv();
    init_tracing().ok();
    for path in &env_files {
        info!("Loaded environment from {}", path.display());
    }
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Run(args) => {
            ui::init_quiet_mode(cli.quiet || args.json);
            run_benchmark(args).await
        }
        Commands::Setup(args) => {
            ui::init_quiet_mode(cli.quiet);
            run_setup(args).await
        }
    }
}

async fn run_setup(args: SetupArgs) -> Result<()> {
    let file = config::load_file_config(args.config.as_deref())?;
    let config = config::resolve(file, &args.connection, &TuningArgs::default())?;
    bootstrap_schema(&config).await
}

async fn bootstrap_schema(config: &BenchConfig) -> Result<()> {
    let target = config.connection.display_target();
    ui::with_spinner_async(
        format!("Checking users table on {}", target),
        "Schema ready",
        ensure_schema(&config.connection.connect_options()),
    )
    .await
    .with_context(|| format!("Failed to prepare schema on {}", target))
}

async fn run_benchmark(args: RunArgs) -> Result<()> {
    let file = config::load_file_config(args.config.as_deref())?;
    let config = config::resolve(file, &args.connection, &args.tuning)?;

    let connector: Arc<dyn Connector> = match args.backend {
        Backend::Postgres => {
            if !args.skip_setup {
                bootstrap_schema(&config).await?;
            }
            Arc::new(PgConnector::new(config.connection.connect_options()))
        }
        Backend::Memory => {
            let latency = Duration::from_millis(args.memory_connect_latency_ms);
            Arc::new(MemoryStore::with_latency(latency, Duration::ZERO).connector())
        }
    };

    let generator = WorkloadGenerator::new(RunNonce::generate());
    info!(
        backend = %connector.describe(),
        nonce = %generator.nonce(),
        entities = config.workload.entities,
        concurrency = config.workload.concurrency,
        "starting benchmark"
    );

    let mut runs = Vec::new();
    for &kind in args.strategy.kinds() {
        let pb = ui::spinner(format!("{}: running CRUD phases", kind.label()));
        let mut reports = run_strategies(&config, &generator, connector.clone(), &[kind])
            .await
            .context("Benchmark run failed")?;
        let report = reports
            .pop()
            .ok_or_else(|| anyhow!("no report produced for {} strategy", kind))?;

        match &report.aborted {
            None => ui::finish_success(
                pb,
                format!("{}: {:.2}s", kind.label(), report.total_seconds()),
            ),
            Some(reason) => ui::finish_error(pb, format!("{}: {}", kind.label(), reason)),
        }
        runs.push(report);
    }

    for report in &runs {
        if let Some(reason) = &report.aborted {
            warn!(strategy = %report.strategy, "run aborted: {}", reason);
        }
        if report.orphaned > 0 {
            warn!(
                strategy = %report.strategy,
                orphaned = report.orphaned,
                "rows from this run were left in the users table"
            );
        }
    }

    let comparison = comparison_report(&runs);

    if args.json {
        let output = JsonOutput {
            nonce: generator.nonce().as_str(),
            config: &config,
            runs: &runs,
            comparison: comparison.as_ref(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for report in &runs {
            println!("{}\n", report);
        }
        if let Some(comparison) = &comparison {
            print!("{}", comparison);
        }
    }

    Ok(())
}

/// Present only when both strategies ran.
fn comparison_report(runs: &[RunReport]) -> Option<ComparisonReport> {
    let direct = runs.iter().find(|r| r.strategy == StrategyKind::Direct)?;
    let pooled = runs.iter().find(|r| r.strategy == StrategyKind::Pooled)?;
    Some(ReportAggregator::from_comparison(&Comparison {
        direct: direct.clone(),
        pooled: pooled.clone(),
    }))
}
