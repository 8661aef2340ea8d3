//! wellsync CLI - operator tool for the offline-first sync engine
//!
//! Records operations, inspects the cache, and runs sync cycles against the
//! remote store configured in the active profile.

mod cli;
mod commands;
mod config_profiles;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, ConfigCommands};
use crate::commands::cache::run_cache;
use crate::commands::common::{open_engine, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::config::{run_config_init, run_config_set, run_config_show, ProfileInit};
use crate::commands::log::{run_drain, run_pending, run_prune, run_record, run_write};
use crate::commands::sync::{run_status, run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "wellsync=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    // Commands that never touch local state
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }
    if let Commands::Config {
        command:
            ConfigCommands::Init {
                profile,
                rest_url,
                api_key,
                access_token,
                id_column,
                no_activate,
            },
    } = &cli.command
    {
        return run_config_init(
            profile.as_deref().or(cli.profile.as_deref()),
            ProfileInit {
                rest_url: rest_url.clone(),
                api_key: api_key.clone(),
                access_token: access_token.clone(),
                id_column: id_column.clone(),
            },
            *no_activate,
        );
    }

    let db_path = resolve_db_path(cli.db_path);
    let engine = open_engine(&db_path, cli.profile.as_deref(), cli.offline)?;
    let coordinator = &engine.coordinator;

    match cli.command {
        Commands::Write {
            table,
            kind,
            payload,
            priority,
        } => {
            run_write(coordinator, &table, kind.into(), &payload, priority.into()).await?;
        }
        Commands::Record {
            table,
            kind,
            payload,
        } => run_record(coordinator.log(), &table, kind.into(), &payload)?,
        Commands::Pending { table, json } => {
            run_pending(coordinator.log(), table.as_deref(), json)?;
        }
        Commands::Drain { json } => run_drain(engine.require_remote()?, json).await?,
        Commands::Prune => run_prune(coordinator.log()),
        Commands::Cache { command } => run_cache(coordinator, command).await?,
        Commands::Sync { json } => {
            run_sync(engine.require_remote()?, json).await?;
        }
        Commands::Watch { interval_ms } => {
            run_watch(engine.require_remote()?, interval_ms).await?;
        }
        Commands::Status { json } => run_status(coordinator, json)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show { json } => run_config_show(coordinator, json)?,
            ConfigCommands::Set {
                batch_size,
                interval_ms,
                priority_sync,
                conflict_resolution,
            } => {
                run_config_set(
                    coordinator,
                    batch_size,
                    interval_ms,
                    priority_sync,
                    conflict_resolution.map(Into::into),
                )?;
            }
            ConfigCommands::Init { .. } => {}
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}
