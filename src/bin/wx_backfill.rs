use std::env;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wx_backfill::catalog::{CatalogLoader, DEFAULT_CATALOG_PATH};
use wx_backfill::config::{DEFAULT_COMPLETENESS_THRESHOLD, DEFAULT_START_YEAR, RunConfig, parse_seconds};
use wx_backfill::domain::ProviderKind;
use wx_backfill::error::BackfillError;
use wx_backfill::fetch::ReqwestTransport;
use wx_backfill::orchestrator::Orchestrator;
use wx_backfill::output::{JsonOutput, LogSink, OutputMode, TextOutput};
use wx_backfill::providers::{NoaaProvider, OpenMeteoProvider, Provider};
use wx_backfill::rate_limit::ThreadSleeper;
use wx_backfill::store::Store;

const DEFAULT_DB_PATH: &str = "weather.db";
const DB_PATH_ENV: &str = "DB_PATH";
const NOAA_TOKEN_ENV: &str = "NOAA_API_TOKEN";

#[derive(Parser)]
#[command(name = "wx-backfill")]
#[command(about = "Budget-constrained, resumable historical weather backfill")]
#[command(version)]
struct Cli {
    /// Target catalog (JSON).
    #[arg(long, default_value = DEFAULT_CATALOG_PATH)]
    catalog: Utf8PathBuf,

    /// SQLite database; defaults to $DB_PATH, then weather.db.
    #[arg(long)]
    db: Option<Utf8PathBuf>,

    #[arg(long, value_enum, default_value_t = ProviderKind::OpenMeteo)]
    provider: ProviderKind,

    /// Weighted-call cap for this run.
    #[arg(long)]
    budget: Option<f64>,

    /// Minimum seconds between provider calls.
    #[arg(long, value_parser = parse_seconds)]
    rate_limit: Option<Duration>,

    #[arg(long, default_value_t = DEFAULT_START_YEAR)]
    start_year: i32,

    /// Lowest-priority tier to schedule: 1 cold, 2 partial, 3 covered.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=3))]
    max_tier: u8,

    /// Stored rows below which a target counts as partially covered.
    #[arg(long, default_value_t = DEFAULT_COMPLETENESS_THRESHOLD)]
    completeness_threshold: u64,

    /// Print the planned queue and its cost without fetching.
    #[arg(long, conflicts_with = "status")]
    dry_run: bool,

    /// Print progress from the database without fetching.
    #[arg(long)]
    status: bool,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<BackfillError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BackfillError) -> u8 {
    if error.is_startup_error() { 2 } else { 1 }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let mut config = RunConfig::for_provider(cli.provider, Utc::now().date_naive());
    if let Some(budget) = cli.budget {
        config.budget = budget;
    }
    if let Some(rate_limit) = cli.rate_limit {
        config.rate_limit = rate_limit;
    }
    config.start_year = cli.start_year;
    config.max_tier = cli.max_tier;
    config.completeness_threshold = cli.completeness_threshold;
    config.validate()?;

    let catalog = CatalogLoader::resolve(Some(cli.catalog.as_path()))?;
    let provider = build_provider(cli.provider)?;

    let db_path = cli
        .db
        .or_else(|| {
            env::var(DB_PATH_ENV)
                .ok()
                .filter(|value| !value.is_empty())
                .map(Utf8PathBuf::from)
        })
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_DB_PATH));
    let store = Store::open(&db_path)?;
    let transport = ReqwestTransport::new(config.fetch.request_timeout)?;

    let mut orchestrator =
        Orchestrator::new(config, &catalog, store, provider, transport, ThreadSleeper);
    if orchestrator.targets().is_empty() {
        warn!(
            provider = %cli.provider,
            catalog = %cli.catalog,
            "no catalog targets can be served by this provider"
        );
    }

    if cli.status {
        let report = orchestrator.status()?;
        let printed = match output_mode {
            OutputMode::Json => JsonOutput::print_status(&report),
            OutputMode::Text => TextOutput::print_status(&report),
        };
        printed.into_diagnostic()?;
        return Ok(());
    }

    if cli.dry_run {
        let plan = orchestrator.dry_run()?;
        let printed = match output_mode {
            OutputMode::Json => JsonOutput::print_plan(&plan),
            OutputMode::Text => TextOutput::print_plan(&plan),
        };
        printed.into_diagnostic()?;
        return Ok(());
    }

    let cancel = orchestrator.cancel_flag();
    ctrlc::set_handler(move || {
        info!("interrupt received, finishing the current unit");
        cancel.cancel();
    })
    .map_err(|err| BackfillError::Io(format!("cannot install interrupt handler: {err}")))?;

    let summary = match output_mode {
        OutputMode::Json => orchestrator.run(&JsonOutput)?,
        OutputMode::Text => orchestrator.run(&LogSink)?,
    };
    let printed = match output_mode {
        OutputMode::Json => JsonOutput::print_summary(&summary),
        OutputMode::Text => TextOutput::print_summary(&summary),
    };
    printed.into_diagnostic()?;

    if let Some(message) = summary.error {
        return Err(BackfillError::RunAborted(message).into());
    }
    Ok(())
}

fn build_provider(kind: ProviderKind) -> Result<Box<dyn Provider>, BackfillError> {
    match kind {
        ProviderKind::OpenMeteo => Ok(Box::new(OpenMeteoProvider::new())),
        ProviderKind::Noaa => {
            let token = env::var(NOAA_TOKEN_ENV)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    BackfillError::Config(format!(
                        "{NOAA_TOKEN_ENV} must be set to use the noaa provider"
                    ))
                })?;
            Ok(Box::new(NoaaProvider::new(token)))
        }
    }
}
