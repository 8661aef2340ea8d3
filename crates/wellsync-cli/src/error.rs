use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] wellsync_core::Error),
    #[error(transparent)]
    Remote(#[from] wellsync_core::RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Table name cannot be empty")]
    EmptyTable,
    #[error("Invalid JSON payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Profile(#[from] crate::config_profiles::ProfileError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Remote store is not configured. Run `wellsync config init --rest-url <URL> --api-key <KEY>`, or set WELLSYNC_REST_URL and WELLSYNC_API_KEY."
    )]
    RemoteNotConfigured,
}
