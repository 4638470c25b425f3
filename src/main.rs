use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde_json::json;
use tracing::{info, warn};

use batch_geocoder::{
    default_output_name, init_tracing, AddressTable, AppConfig, Credential, Diagnostics,
    FileQuotaStore, GeocodePipeline, ProgressObserver, QuotaStore, RunJournal, RunProgress,
    SecretVault, Severity, VAULT_SERVICE_NAME,
};

#[derive(Parser, Debug)]
#[command(name = "batch-geocoder")]
#[command(about = "Geocode an address table with LLM address correction and a monthly request quota")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Geocode every row of a CSV file and write it back with latitude/longitude
    Geocode {
        /// CSV file with a header row and an address column
        input: PathBuf,
        /// Output path (default: geocoded_results_<timestamp>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Address column name, overriding ADDRESS_COLUMNS
        #[arg(short, long)]
        column: Option<String>,
    },
    /// Show this month's geocoding request count
    Quota,
    /// Show the effective configuration without secrets
    Config,
    /// Store an API key (read from stdin) in the OS keychain
    StoreKey {
        /// Which key: gemini | google-maps
        credential: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = CliArgs::parse();
    let mut config = AppConfig::from_env();
    let vault = SecretVault::new(VAULT_SERVICE_NAME);

    match args.command {
        Command::Geocode {
            input,
            output,
            column,
        } => {
            if let Some(column) = column {
                config.address_columns = vec![column];
            }
            config.resolve_credentials(&vault);
            geocode(&config, input, output).await
        }
        Command::Quota => {
            let state = FileQuotaStore::new(config.quota_path()).load();
            let report = json!({
                "month": state.month,
                "count": state.count,
                "limit": config.request_limit,
                "remaining": state.remaining(config.request_limit),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Config => {
            config.resolve_credentials(&vault);
            println!("{}", serde_json::to_string_pretty(&config.public_profile())?);
            Ok(())
        }
        Command::StoreKey { credential } => {
            let credential = Credential::parse(&credential)?;
            let mut line = String::new();
            io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read key from stdin")?;
            let secret = SecretString::new(line.trim().to_string().into());
            vault.store(credential, &secret)?;
            println!("stored {}", credential.account());
            Ok(())
        }
    }
}

async fn geocode(
    config: &AppConfig,
    input: PathBuf,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(&input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let table = AddressTable::from_csv_bytes(&bytes, &config.address_columns)
        .with_context(|| format!("failed to load {}", input.display()))?;
    if table.is_empty() {
        bail!("{} has no data rows", input.display());
    }
    info!(
        rows = table.len(),
        column = table.address_header(),
        "loaded address table"
    );

    let diagnostics = build_diagnostics(config);
    let quota_store: Arc<dyn QuotaStore> = Arc::new(FileQuotaStore::new(config.quota_path()));
    let pipeline = GeocodePipeline::from_config(config, quota_store, diagnostics.clone())?;

    let cancel = Arc::new(AtomicBool::new(false));
    tokio::spawn(watch_interrupts(cancel.clone()));

    let observer: ProgressObserver = Arc::new(|progress: RunProgress| {
        info!(
            processed = progress.processed,
            total = progress.total,
            succeeded = progress.succeeded,
            failed = progress.failed,
            "progress"
        );
    });

    let report = pipeline
        .run(&table.records(), Some(observer), Some(cancel))
        .await;

    let annotated = table.annotate(&report.outputs)?;
    let destination = output.unwrap_or_else(|| PathBuf::from(default_output_name()));
    let written = annotated
        .write_csv(&destination)
        .with_context(|| format!("failed to write {}", destination.display()))?;

    let stats = &report.stats;
    println!("wrote {}", written.display());
    println!(
        "succeeded: {}, failed: {}, skipped (quota): {}, interrupted: {}",
        stats.success_count, stats.fail_count, stats.skipped_quota, stats.interrupted
    );
    println!(
        "monthly geocoding requests: {} / {}",
        stats.monthly_count, config.request_limit
    );
    println!("elapsed: {:.2}s", stats.elapsed.as_secs_f64());
    if stats.halted_on_quota {
        println!("monthly request limit reached; remaining rows were not geocoded");
    }
    let warnings = diagnostics.count(Severity::Warning);
    let errors = diagnostics.count(Severity::Error);
    if warnings + errors > 0 {
        println!("diagnostics: {warnings} warning(s), {errors} error(s)");
    }
    Ok(())
}

/// First Ctrl-C stops the run between records; a second one exits immediately.
async fn watch_interrupts(cancel: Arc<AtomicBool>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    if request_stop(&cancel) {
        warn!("interrupt received; stopping after the current record (Ctrl-C again to abort)");
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("aborted");
        std::process::exit(130);
    }
}

/// Sets the cancel flag. Returns true on the first request only.
fn request_stop(cancel: &AtomicBool) -> bool {
    !cancel.swap(true, Ordering::SeqCst)
}

fn build_diagnostics(config: &AppConfig) -> Diagnostics {
    if !config.journal_enabled {
        return Diagnostics::new();
    }
    match RunJournal::new(&config.data_dir, config) {
        Ok(journal) => Diagnostics::with_journal(journal),
        Err(err) => {
            warn!(?err, "run journal unavailable; continuing without it");
            Diagnostics::new()
        }
    }
}
