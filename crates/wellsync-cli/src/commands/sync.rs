use std::time::Duration;

use wellsync_core::models::SyncConfigPatch;
use wellsync_core::{CycleOutcome, SyncCoordinator};

use crate::commands::common::{format_report_lines, format_timestamp};
use crate::error::CliError;

pub async fn run_sync(
    coordinator: &SyncCoordinator,
    as_json: bool,
) -> Result<CycleOutcome, CliError> {
    let outcome = coordinator.run_once().await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(outcome);
    }

    match &outcome {
        CycleOutcome::Offline => println!("Offline; nothing synced"),
        CycleOutcome::AlreadyRunning => println!("A sync cycle is already running"),
        CycleOutcome::Completed(report) => {
            for line in format_report_lines(report) {
                println!("{line}");
            }
        }
    }
    Ok(outcome)
}

/// Run the periodic coordinator until Ctrl-C.
pub async fn run_watch(
    coordinator: &SyncCoordinator,
    interval_ms: Option<u64>,
) -> Result<(), CliError> {
    if let Some(interval_ms) = interval_ms {
        coordinator.update_config(&SyncConfigPatch {
            sync_interval: Some(Duration::from_millis(interval_ms)),
            ..SyncConfigPatch::default()
        });
    }

    // Flush anything queued before the first tick
    let outcome = coordinator.run_once().await;
    if let Some(report) = outcome.report() {
        for line in format_report_lines(report) {
            println!("{line}");
        }
    }

    coordinator.start(None)?;
    println!(
        "Syncing every {:?}; press Ctrl-C to stop",
        coordinator.config().sync_interval
    );

    tokio::signal::ctrl_c().await?;
    coordinator.stop();
    println!(
        "Stopped; {} operation(s) pending",
        coordinator.log().pending_count()
    );
    Ok(())
}

pub fn run_status(coordinator: &SyncCoordinator, as_json: bool) -> Result<(), CliError> {
    let status = coordinator.status();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Health: {:?}", status.health);
    println!("Online: {}", status.online);
    println!("Pending operations: {}", status.pending_operations);
    println!(
        "Last sync: {}",
        status
            .last_sync_at
            .map_or_else(|| "never".to_string(), format_timestamp)
    );
    if let Some(error) = &status.last_error {
        println!("Last error: {error}");
    }
    Ok(())
}
