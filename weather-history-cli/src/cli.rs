use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use weather_history_core::{
    Config, CsvWeatherStore, Enricher, FollowMeeExtractor, LocationExtractor, ProviderId,
    RateController, RawArchive, RunReport, provider::source_from_config,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-history", version, about = "Attach historical weather to tracker locations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name, e.g. "darksky" or "wunderground".
        provider: String,
    },

    /// Enrich every location found in a directory of FollowMee exports.
    Run {
        /// Directory holding the downloaded export files.
        input_dir: PathBuf,

        /// CSV store to read and append to.
        #[arg(long)]
        store: Option<PathBuf>,

        /// Provider to use instead of the configured default.
        #[arg(long)]
        provider: Option<String>,

        /// API key to use instead of the configured one.
        #[arg(long, env = "WEATHER_HISTORY_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Stop after this many provider calls; rerun to continue.
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Keep every raw provider response in this directory.
        #[arg(long)]
        raw_dir: Option<PathBuf>,
    },

    /// Show how many records the store holds.
    Status {
        /// CSV store to inspect.
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure { provider } => configure(&provider)?,
            Command::Run {
                input_dir,
                store,
                provider,
                api_key,
                max_iterations,
                raw_dir,
            } => {
                let mut config = Config::load()?;
                let provider_id = match provider {
                    Some(name) => ProviderId::try_from(name.as_str())?,
                    None => config.default_provider_id()?,
                };
                if let Some(api_key) = api_key {
                    config.upsert_provider_api_key(provider_id, api_key);
                }
                let store_path = store.unwrap_or_else(|| config.store_path());

                let report = enrich(
                    &config,
                    provider_id,
                    &input_dir,
                    store_path,
                    max_iterations,
                    raw_dir,
                )
                .await?;
                print_report(&report);
            }
            Command::Status { store } => {
                let config = Config::load()?;
                let store_path = store.unwrap_or_else(|| config.store_path());
                let store = CsvWeatherStore::open(&store_path)?;

                let (total, partial) = store
                    .records()?
                    .fold((0usize, 0usize), |(total, partial), record| {
                        (total + 1, partial + usize::from(!record.weather.missing_fields().is_empty()))
                    });

                println!("Store: {}", store.path().display());
                println!("Records: {total} ({partial} partial)");
            }
        }

        Ok(())
    }
}

fn configure(provider: &str) -> anyhow::Result<()> {
    let id = ProviderId::try_from(provider)?;
    let mut config = Config::load()?;

    let api_key = inquire::Password::new(&format!("API key for {id}:"))
        .without_confirmation()
        .prompt()
        .context("Failed to read API key")?;
    config.upsert_provider_api_key(id, api_key.trim().to_string());

    let is_default = config.default_provider_id().ok() == Some(id);
    if !is_default {
        let make_default = inquire::Confirm::new(&format!("Use {id} as the default provider?"))
            .with_default(true)
            .prompt()
            .context("Failed to read answer")?;
        if make_default {
            config.set_default_provider(id);
        }
    }

    let path = config.save()?;
    println!("Saved {id} credentials to {}", path.display());
    Ok(())
}

async fn enrich(
    config: &Config,
    provider_id: ProviderId,
    input_dir: &std::path::Path,
    store_path: PathBuf,
    max_iterations: Option<usize>,
    raw_dir: Option<PathBuf>,
) -> anyhow::Result<RunReport> {
    let source = source_from_config(provider_id, config)?;

    let scan = FollowMeeExtractor.scan_dir(input_dir)?;
    println!("Total number of downloaded files: {}", scan.files_found);
    println!("Total number of locations: {}", scan.locations.len());

    let store = CsvWeatherStore::open(&store_path)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current location");
            on_signal.cancel();
        }
    });

    let rate = RateController::new(config.rate_limits.clone()).with_cancellation(cancel);
    let mut enricher = Enricher::new(store, source, rate)
        .with_max_iterations(max_iterations)
        .with_archive(raw_dir.map(RawArchive::new));

    info!(store = %store_path.display(), "enriching");
    enricher.run(&scan.locations).await
}

fn print_report(report: &RunReport) {
    println!("Total number of unprocessed data points: {}", report.pending);
    println!(
        "Enriched {} of {} pending ({} partial, {} failed); {} remaining.",
        report.enriched, report.pending, report.partial, report.failed, report.remaining
    );
    if report.cancelled {
        println!("Run was interrupted; rerun to continue.");
    }
}
