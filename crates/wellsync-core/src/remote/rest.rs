//! REST remote store for PostgREST-style backends (`/rest/v1/{table}`).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::models::DEFAULT_ID_COLUMN;
use crate::util::{error_excerpt, is_http_url, is_identifier, normalize_text_option};

use super::{Filter, RemoteError, RemoteResult, RemoteStore};

const REST_PATH: &str = "/rest/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Connection settings for [`RestRemote`]
#[derive(Clone, PartialEq, Eq)]
pub struct RestConfig {
    /// Project base URL, e.g. `https://project.supabase.co`
    pub base_url: String,
    /// Public API key sent as `apikey`
    pub api_key: String,
    /// Optional user access token; the API key is used as bearer otherwise
    pub access_token: Option<String>,
    /// Column used to match rows for update/delete
    pub id_column: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            access_token: None,
            id_column: DEFAULT_ID_COLUMN.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = normalize_text_option(Some(access_token.into()));
        self
    }

    #[must_use]
    pub fn with_id_column(mut self, id_column: impl Into<String>) -> Self {
        self.id_column = id_column.into();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RestConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("id_column", &self.id_column)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Remote store speaking the PostgREST dialect over HTTP
#[derive(Clone)]
pub struct RestRemote {
    rest_url: String,
    api_key: String,
    bearer: String,
    id_column: String,
    client: Client,
}

impl RestRemote {
    pub fn new(config: RestConfig) -> RemoteResult<Self> {
        let base_url = normalize_base_url(&config.base_url)?;
        let api_key = normalize_text_option(Some(config.api_key)).ok_or_else(|| {
            RemoteError::InvalidConfiguration("API key must not be empty".to_string())
        })?;
        validate_identifier(&config.id_column)?;

        Ok(Self {
            rest_url: format!("{base_url}{REST_PATH}"),
            bearer: config.access_token.unwrap_or_else(|| api_key.clone()),
            api_key,
            id_column: config.id_column,
            client: Client::builder().timeout(config.timeout).build()?,
        })
    }

    fn table_url(&self, table: &str) -> RemoteResult<String> {
        validate_identifier(table)?;
        Ok(format!("{}/{table}", self.rest_url))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.bearer)
            .header("Accept", "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<reqwest::Response> {
        let response = self.authorized(request).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api {
            status: status.as_u16(),
            message: parse_api_error(status, &body),
        })
    }
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn fetch(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Value>> {
        let url = self.table_url(table)?;
        let mut query = vec![("select".to_string(), "*".to_string())];
        if let Some(condition) = filter_query(filter)? {
            query.push(condition);
        }

        let response = self.send(self.client.get(url).query(&query)).await?;
        Ok(response.json::<Vec<Value>>().await?)
    }

    async fn insert(&self, table: &str, row: &Value) -> RemoteResult<()> {
        let url = self.table_url(table)?;
        self.send(
            self.client
                .post(url)
                .header("Prefer", "return=minimal")
                .json(row),
        )
        .await?;
        Ok(())
    }

    async fn update(&self, table: &str, row: &Value, match_id: &str) -> RemoteResult<()> {
        let url = self.table_url(table)?;
        self.send(
            self.client
                .patch(url)
                .query(&[(self.id_column.as_str(), format!("eq.{match_id}"))])
                .header("Prefer", "return=minimal")
                .json(row),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> RemoteResult<()> {
        let url = self.table_url(table)?;
        self.send(
            self.client
                .delete(url)
                .query(&[(self.id_column.as_str(), format!("eq.{id}"))]),
        )
        .await?;
        Ok(())
    }
}

/// Translate a filter into a PostgREST query parameter.
fn filter_query(filter: &Filter) -> RemoteResult<Option<(String, String)>> {
    match filter {
        Filter::All => Ok(None),
        Filter::Eq { column, value } => {
            validate_identifier(column)?;
            Ok(Some((column.clone(), format!("eq.{value}"))))
        }
        Filter::In { column, values } => {
            validate_identifier(column)?;
            let quoted = values
                .iter()
                .map(|value| format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(",");
            Ok(Some((column.clone(), format!("in.({quoted})"))))
        }
    }
}

fn validate_identifier(name: &str) -> RemoteResult<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(RemoteError::InvalidConfiguration(format!(
            "'{name}' is not a valid table or column name"
        )))
    }
}

fn normalize_base_url(raw: &str) -> RemoteResult<String> {
    let url = normalize_text_option(Some(raw.to_string())).ok_or_else(|| {
        RemoteError::InvalidConfiguration("base URL must not be empty".to_string())
    })?;
    if !is_http_url(&url) {
        return Err(RemoteError::InvalidConfiguration(
            "base URL must include http:// or https://".to_string(),
        ));
    }
    let url = url.trim_end_matches('/');
    Ok(url.strip_suffix(REST_PATH).unwrap_or(url).to_string())
}

#[derive(Debug, Deserialize)]
struct RestErrorBody {
    message: Option<String>,
    error: Option<String>,
    hint: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<RestErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return match payload.hint {
                Some(hint) => format!("{} (hint: {})", message.trim(), hint.trim()),
                None => message.trim().to_string(),
            };
        }
    }

    let trimmed = error_excerpt(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}
