use wellsync_core::oplog::OperationLog;
use wellsync_core::sync::WriteOutcome;
use wellsync_core::{OperationKind, Priority, SyncCoordinator};

use crate::commands::common::{format_operation_lines, normalize_table, now_ms, parse_payload};
use crate::error::CliError;

pub async fn run_write(
    coordinator: &SyncCoordinator,
    table: &str,
    kind: OperationKind,
    payload: &str,
    priority: Priority,
) -> Result<WriteOutcome, CliError> {
    let table = normalize_table(table)?;
    let payload = parse_payload(payload, kind)?;

    let outcome = coordinator.write(&table, kind, payload, priority).await?;
    match &outcome {
        WriteOutcome::Applied => println!("Applied {kind} on {table}"),
        WriteOutcome::Queued(entry) => println!(
            "Queued {} ({} pending)",
            entry.id,
            coordinator.log().pending_count()
        ),
    }
    Ok(outcome)
}

pub fn run_record(
    log: &OperationLog,
    table: &str,
    kind: OperationKind,
    payload: &str,
) -> Result<(), CliError> {
    let table = normalize_table(table)?;
    let payload = parse_payload(payload, kind)?;
    let entry = log.record(table, payload, kind);
    println!("{}", entry.id);
    Ok(())
}

pub fn run_pending(log: &OperationLog, table: Option<&str>, as_json: bool) -> Result<(), CliError> {
    let entries = match table {
        Some(table) => log.pending_for(&normalize_table(table)?),
        None => log.pending(),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }
    for line in format_operation_lines(&entries, now_ms()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_drain(coordinator: &SyncCoordinator, as_json: bool) -> Result<(), CliError> {
    if !coordinator.is_online() {
        println!(
            "Offline; {} operation(s) left pending",
            coordinator.log().pending_count()
        );
        return Ok(());
    }

    let report = coordinator.log().drain(coordinator.remote().as_ref()).await;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Synced {} of {} operation(s)", report.synced, report.attempted);
    for error in &report.errors {
        println!("  error: {error}");
    }
    Ok(())
}

pub fn run_prune(log: &OperationLog) {
    let removed = log.prune_synced();
    println!("Removed {removed} synced operation(s)");
}
