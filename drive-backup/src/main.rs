//! drive-backup - main entry point
//!
//! Runs a backup once, or keeps running and triggers one every day at the
//! configured time.

use anyhow::{Context, Result};
use clap::Parser;
use drive_backup::archive::ArchiveBuilder;
use drive_backup::config::Config;
use drive_backup::daemon::shutdown::ShutdownCoordinator;
use drive_backup::executor::{BackupJob, Orchestrator};
use drive_backup::notify::WebhookNotifier;
use drive_backup::scheduler::Scheduler;
use drive_backup::store::google_drive::{GoogleDriveStore, ServiceAccountAuth};
use drive_backup::utils;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Google service account credentials (JSON key file)
    #[arg(long, value_name = "FILE")]
    credentials: PathBuf,

    /// Paths to back up (overrides `items` from the config)
    #[arg(short, long = "item", value_name = "PATH", num_args = 1..)]
    items: Vec<PathBuf>,

    /// Run one backup immediately
    #[arg(long)]
    run_now: bool,

    /// Keep running and back up daily at the configured time
    #[arg(long)]
    schedule: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting drive-backup v{} ({})",
        env!("CARGO_PKG_VERSION"),
        config.name
    );

    let schedule = config.schedule_config()?;
    let sources = if args.items.is_empty() {
        config.items.clone()
    } else {
        args.items.clone()
    };

    let http = reqwest::Client::builder()
        .user_agent(concat!("drive-backup/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let auth = ServiceAccountAuth::from_file(&args.credentials)
        .await
        .context("Failed to load Google Drive credentials")?;
    let store = GoogleDriveStore::new(http.clone(), Arc::new(auth));
    let notifier = WebhookNotifier::new(http, config.webhook.clone());
    if !notifier.is_enabled() {
        tracing::info!("No webhook configured, notifications disabled");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        BackupJob {
            name: config.name.clone(),
            container_id: config.google_drive_folder.clone(),
            sources,
            policy: config.retention_policy(),
        },
        ArchiveBuilder::new(config.archive_dir.clone()),
        Arc::new(store),
        Arc::new(notifier),
    ));

    let mut scheduler = Scheduler::new(orchestrator, schedule);

    // One-shot unless the loop was asked for
    if args.run_now || !args.schedule {
        let report = scheduler.run_now().await;
        if !report.outcome.succeeded {
            tracing::error!(
                run_id = %report.run_id,
                error = report.outcome.error_message.as_deref().unwrap_or("unknown"),
                "Backup failed"
            );
        }
    }

    if args.schedule {
        let shutdown = ShutdownCoordinator::new();
        let handle = tokio::spawn(scheduler.run(shutdown.token()));

        shutdown.wait_for_signal().await;

        if let Err(e) = handle.await {
            tracing::error!("Scheduler task panicked: {}", e);
        }
    }

    tracing::info!("drive-backup stopped");
    Ok(())
}
