use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::{de::DeserializeOwned, Serialize};
use solar_forecast_engine::calibration::CalibrationObservation;
use solar_forecast_engine::config::Config;
use solar_forecast_engine::domain::ForecastRequest;
use solar_forecast_engine::repo::{JsonFileStateStore, JsonRecordSource};
use solar_forecast_engine::telemetry::init_tracing;
use solar_forecast_engine::ForecastOrchestrator;
use tracing::info;

#[derive(Parser)]
#[command(name = "solar-forecast")]
#[command(about = "Solar production forecast engine", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Forecast from a JSON request file
    Forecast {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Retrain the learned model now
    Train,
    /// Discard learned weights and profile
    ResetModel,
    /// Normal calibration from a JSON array of observations
    Calibrate {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Rescue calibration from a JSON array of observations
    RescueCalibration {
        #[arg(short, long)]
        input: PathBuf,
        /// End of the lookback window (defaults to today)
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Feed back a finished day's predicted and actual totals
    RecordOutcome {
        #[arg(long)]
        predicted: f64,
        #[arg(long)]
        actual: f64,
    },
    /// Learning-rate / iteration grid search for the gradient-descent model
    Sweep,
    /// Model health
    Status,
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    init_tracing(&cfg.telemetry);

    if let Command::ShowConfig = cli.command {
        println!("{}", toml::to_string_pretty(&cfg).context("serializing configuration")?);
        return Ok(());
    }

    let store = Arc::new(JsonFileStateStore::new(&cfg.storage.data_dir));
    let records = Arc::new(JsonRecordSource::new(cfg.storage.data_dir.join(&cfg.storage.records_file)));
    let engine = ForecastOrchestrator::initialize(cfg, store, records).await?;

    match cli.command {
        Command::Forecast { input } => {
            let request: ForecastRequest = read_json(&input).await?;
            print_json(&engine.forecast(&request))?;
        }
        Command::Train => {
            let result = engine.train().await;
            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::ResetModel => {
            engine.reset_model().await?;
            info!("model reset");
        }
        Command::Calibrate { input } => {
            let observations: Vec<CalibrationObservation> = read_json(&input).await?;
            print_json(&engine.run_calibration(&observations).await)?;
        }
        Command::RescueCalibration { input, today } => {
            let observations: Vec<CalibrationObservation> = read_json(&input).await?;
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            print_json(&engine.rescue_calibration(&observations, today).await)?;
        }
        Command::RecordOutcome { predicted, actual } => {
            let factor = engine.record_daily_outcome(predicted, actual).await?;
            print_json(&serde_json::json!({ "correction_factor": factor }))?;
        }
        Command::Sweep => print_json(&engine.hyperparameter_sweep().await?)?,
        Command::Status => print_json(&engine.status())?,
        Command::ShowConfig => {}
    }

    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
