//! # Threatintel Server
//!
//! Command-line composition root. Cron or an external scheduler runs
//! `threatintel-server tick --name <job>` on each due interval; operators use
//! the remaining subcommands to manage jobs.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use threatintel_core::{JobParameterHandle, RunOutcome, Schedule, UpdateJobRequest};
use threatintel_server::{
    app::build_runner,
    config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, StoreBackend},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "threatintel-server")]
#[command(about = "Threat-intel feed jobs: lease-coordinated refresh and index rotation")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "THREATINTEL_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a job and run its first load
    Create {
        name: String,
        /// Refresh interval in days
        #[arg(long, default_value_t = 1)]
        interval_days: u64,
    },
    /// Change a job's interval or auto-refresh flag
    Update {
        name: String,
        #[arg(long)]
        interval_days: Option<u64>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Remove a job together with its indices
    Delete { name: String },
    /// Rotate a job now, regardless of its schedule
    Refresh { name: String },
    /// Scheduler callback for one due job
    Tick {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
        env: None,
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
    info!(
        lock.duration_secs = config.engine.lock.lock_duration_secs,
        lock.renew_after_secs = config.engine.lock.renew_after_secs,
        rotation.batch_size = config.engine.rotation.batch_size,
        rotation.shard_wait_timeout_ms = config.engine.rotation.shard_wait_timeout_ms,
        runner.max_concurrent_runs = config.engine.runner.max_concurrent_runs,
        memory_store = matches!(config.store, StoreBackend::Memory),
        "engine configuration in effect"
    );

    let runner = build_runner(&config)?;

    match cli.command {
        Command::Create {
            name,
            interval_days,
        } => {
            let handle = runner
                .create_job(&name, Schedule::days(interval_days))
                .await
                .with_context(|| format!("failed to create job {name}"))?;
            info!(job = %name, "job created; waiting for first load");
            report(&name, handle.wait().await)?;
        }
        Command::Update {
            name,
            interval_days,
            enable,
            disable,
        } => {
            let request = UpdateJobRequest {
                schedule: interval_days.map(Schedule::days),
                update_enabled: match (enable, disable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            };
            let record = runner
                .update_job(&name, request)
                .await
                .with_context(|| format!("failed to update job {name}"))?;
            info!(
                job = %name,
                period = record.schedule.period,
                unit = ?record.schedule.unit,
                update_enabled = record.update_enabled,
                "job updated"
            );
        }
        Command::Delete { name } => {
            runner
                .delete_job(&name)
                .await
                .with_context(|| format!("failed to delete job {name}"))?;
            info!(job = %name, "job deleted");
        }
        Command::Refresh { name } => {
            let handle = runner
                .refresh_job(&name)
                .await
                .with_context(|| format!("failed to start refresh of job {name}"))?;
            report(&name, handle.wait().await)?;
        }
        Command::Tick { name } => {
            // Failures are already recorded on the job; the scheduler only
            // needs to know the tick was handled.
            let outcome = runner.run_job(JobParameterHandle::new(name.clone())).wait().await;
            info!(job = %name, ?outcome, "scheduled tick handled");
        }
    }

    Ok(())
}

fn report(job: &str, outcome: RunOutcome) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::Refreshed { index } => {
            info!(job, index = %index, "job is serving the new generation");
            Ok(())
        }
        RunOutcome::Failed(reason) => {
            error!(job, "run failed: {reason}");
            bail!("run of job {job} failed: {reason}")
        }
        other => {
            info!(job, outcome = ?other, "run finished without rotating");
            Ok(())
        }
    }
}
