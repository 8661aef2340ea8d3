//! Remote profiles stored under the user config directory.
//!
//! A profile names one hosted backend. `WELLSYNC_*` environment variables
//! override whatever the active profile stores, so CI and `.env` files work
//! without touching the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wellsync_core::remote::RestConfig;
use wellsync_core::util::normalize_text_option;

const PROFILES_FILE: &str = "profiles.json";
const FALLBACK_PROFILE: &str = "default";

pub const ENV_PROFILE: &str = "WELLSYNC_PROFILE";
pub const ENV_REST_URL: &str = "WELLSYNC_REST_URL";
pub const ENV_API_KEY: &str = "WELLSYNC_API_KEY";
pub const ENV_ACCESS_TOKEN: &str = "WELLSYNC_ACCESS_TOKEN";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Failed to read profiles at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write profiles at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Profiles at {path} are not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CliProfilesConfig {
    pub active_profile: Option<String>,
    pub profiles: BTreeMap<String, CliProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CliProfile {
    pub rest_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    /// Primary key column, when the tables do not use `id`
    pub id_column: Option<String>,
}

pub fn profiles_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wellsync")
        .join(PROFILES_FILE)
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, ProfileError> {
        Self::load_from_path(&profiles_path())
    }

    /// A missing file is an empty configuration.
    pub fn load_from_path(path: &Path) -> Result<Self, ProfileError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ProfileError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Self = serde_json::from_str(&raw).map_err(|source| ProfileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config.normalized())
    }

    pub fn save(&self) -> Result<PathBuf, ProfileError> {
        let path = profiles_path();
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ProfileError> {
        let write_error = |source| ProfileError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let serialized = serde_json::to_string_pretty(&self.clone().normalized())
            .map_err(|source| ProfileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        std::fs::write(path, serialized).map_err(write_error)
    }

    /// Explicit flag, then `WELLSYNC_PROFILE`, then the stored active
    /// profile, then `default`.
    pub fn resolve_profile_name(&self, explicit: Option<&str>) -> String {
        self.resolve_profile_name_with(explicit, |name| std::env::var(name).ok())
    }

    pub fn resolve_profile_name_with(
        &self,
        explicit: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> String {
        [
            explicit.map(str::to_string),
            lookup(ENV_PROFILE),
            self.active_profile.clone(),
        ]
        .into_iter()
        .find_map(normalize_text_option)
        .unwrap_or_else(|| FALLBACK_PROFILE.to_string())
    }

    pub fn profile(&self, name: &str) -> Option<&CliProfile> {
        self.profiles.get(name)
    }

    pub fn profile_mut_or_default(&mut self, name: &str) -> &mut CliProfile {
        self.profiles.entry(name.to_string()).or_default()
    }

    fn normalized(mut self) -> Self {
        self.active_profile = normalize_text_option(self.active_profile);
        self.profiles = self
            .profiles
            .into_iter()
            .map(|(name, profile)| (name, profile.normalized()))
            .collect();
        self
    }
}

impl CliProfile {
    /// Remote settings with environment overrides applied. `None` until both
    /// URL and key are known.
    pub fn rest_config(&self) -> Option<RestConfig> {
        self.rest_config_with(|name| std::env::var(name).ok())
    }

    pub fn rest_config_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<RestConfig> {
        let pick = |env_name: &str, stored: &Option<String>| {
            normalize_text_option(lookup(env_name)).or_else(|| stored.clone())
        };

        let mut config = RestConfig::new(
            pick(ENV_REST_URL, &self.rest_url)?,
            pick(ENV_API_KEY, &self.api_key)?,
        );
        if let Some(token) = pick(ENV_ACCESS_TOKEN, &self.access_token) {
            config = config.with_access_token(token);
        }
        if let Some(id_column) = &self.id_column {
            config = config.with_id_column(id_column.clone());
        }
        Some(config)
    }

    fn normalized(self) -> Self {
        Self {
            rest_url: normalize_text_option(self.rest_url)
                .map(|url| url.trim_end_matches('/').to_string()),
            api_key: normalize_text_option(self.api_key),
            access_token: normalize_text_option(self.access_token),
            id_column: normalize_text_option(self.id_column),
        }
    }
}
