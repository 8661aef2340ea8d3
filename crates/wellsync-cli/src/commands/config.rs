use std::time::Duration;

use wellsync_core::models::SyncConfigPatch;
use wellsync_core::util::{is_http_url, is_identifier, normalize_text_option};
use wellsync_core::{ConflictResolution, SyncConfig, SyncCoordinator};

use crate::config_profiles::{CliProfile, CliProfilesConfig};
use crate::error::CliError;

pub fn run_config_show(coordinator: &SyncCoordinator, as_json: bool) -> Result<(), CliError> {
    let config = coordinator.config();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    for line in format_sync_config_lines(&config) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_config_set(
    coordinator: &SyncCoordinator,
    batch_size: Option<usize>,
    interval_ms: Option<u64>,
    priority_sync: Option<bool>,
    conflict_resolution: Option<ConflictResolution>,
) -> Result<SyncConfig, CliError> {
    let patch = SyncConfigPatch {
        batch_size,
        sync_interval: interval_ms.map(Duration::from_millis),
        priority_sync,
        conflict_resolution,
    };
    if patch.is_empty() {
        return Err(CliError::Config(
            "Nothing to update; pass at least one setting".to_string(),
        ));
    }

    let config = coordinator.update_config(&patch);
    for line in format_sync_config_lines(&config) {
        println!("{line}");
    }
    Ok(config)
}

pub fn format_sync_config_lines(config: &SyncConfig) -> Vec<String> {
    vec![
        format!("batch_size: {}", config.batch_size),
        format!("sync_interval_ms: {}", config.sync_interval.as_millis()),
        format!("priority_sync: {}", config.priority_sync),
        format!("conflict_resolution: {}", config.conflict_resolution.as_str()),
    ]
}

pub struct ProfileInit {
    pub rest_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub id_column: Option<String>,
}

pub fn run_config_init(
    profile_name: Option<&str>,
    init: ProfileInit,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load()?;
    let profile_name = config.resolve_profile_name(profile_name);

    apply_profile_init(config.profile_mut_or_default(&profile_name), init)?;
    if !no_activate {
        config.active_profile = Some(profile_name.clone());
    }

    let path = config.save()?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );

    let missing = config
        .profile(&profile_name)
        .map(missing_profile_fields)
        .unwrap_or_default();
    if missing.is_empty() {
        println!("Remote profile '{profile_name}' is ready. Run `wellsync sync`.");
    } else {
        println!(
            "Profile '{}' is missing: {}",
            profile_name,
            missing.join(", ")
        );
    }
    Ok(())
}

/// Merge explicit values into `profile`, keeping stored values otherwise.
pub fn apply_profile_init(profile: &mut CliProfile, init: ProfileInit) -> Result<(), CliError> {
    if let Some(value) = normalize_text_option(init.rest_url) {
        profile.rest_url = Some(value.trim_end_matches('/').to_string());
    }
    if let Some(value) = normalize_text_option(init.api_key) {
        profile.api_key = Some(value);
    }
    if let Some(value) = normalize_text_option(init.access_token) {
        profile.access_token = Some(value);
    }
    if let Some(value) = normalize_text_option(init.id_column) {
        profile.id_column = Some(value);
    }
    validate_profile(profile)
}

fn validate_profile(profile: &CliProfile) -> Result<(), CliError> {
    if let Some(url) = &profile.rest_url {
        if !is_http_url(url) {
            return Err(CliError::Config(
                "rest_url must include http:// or https://".to_string(),
            ));
        }
    }
    if let Some(column) = &profile.id_column {
        if !is_identifier(column) {
            return Err(CliError::Config(format!(
                "id_column '{column}' may only contain letters, digits and '_'"
            )));
        }
    }
    Ok(())
}

pub fn missing_profile_fields(profile: &CliProfile) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if profile.rest_url.is_none() {
        missing.push("rest_url");
    }
    if profile.api_key.is_none() {
        missing.push("api_key");
    }
    missing
}
