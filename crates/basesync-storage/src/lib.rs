//! Record transport + state-file storage utilities for basesync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use basesync_core::Record;
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "basesync-storage";

pub const DEFAULT_API_URL: &str = "https://api.airtable.com";

/// One page of records as returned by the remote API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<Record>,
    /// Continuation token; present while more pages remain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("http status {status}: {body}")]
    Status {
        status: u16,
        body: serde_json::Value,
    },
    #[error("invalid request url: {0}")]
    Url(String),
}

impl TransportError {
    pub fn request(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Request(err.into())
    }

    /// Status code of a structured error response, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(Box::new(err))
    }
}

/// Lists one page of a named remote resource.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn list_records(
        &self,
        resource: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<RecordPage, TransportError>;
}

/// Whether a failed send is worth repeating. Status responses never are here;
/// the fetcher decides what a status means.
pub fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Capped exponential backoff between transport-level retries of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retries_so_far + 1`, or `None` once the
    /// request has used up its retries.
    pub fn retry_delay(&self, retries_so_far: usize) -> Option<Duration> {
        if retries_so_far >= self.max_retries {
            return None;
        }
        let doubling = u32::try_from(retries_so_far)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(doubling).min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_url: String,
    pub base_id: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl AirtableConfig {
    pub fn new(base_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            base_id: base_id.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let base_id = std::env::var("AIRTABLE_BASE_ID").context("AIRTABLE_BASE_ID is not set")?;
        let api_key = std::env::var("AIRTABLE_API_KEY").context("AIRTABLE_API_KEY is not set")?;
        let mut config = Self::new(base_id, api_key);
        if let Ok(api_url) = std::env::var("AIRTABLE_API_URL") {
            config.api_url = api_url;
        }
        if let Some(secs) = std::env::var("BASESYNC_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        config.user_agent = std::env::var("BASESYNC_USER_AGENT").ok();
        Ok(config)
    }
}

/// reqwest-backed transport speaking the Airtable list-records API.
#[derive(Debug)]
pub struct AirtableTransport {
    client: reqwest::Client,
    api_url: Url,
    base_id: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl AirtableTransport {
    pub fn new(config: AirtableConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let api_url = Url::parse(&config.api_url)
            .with_context(|| format!("parsing api url {}", config.api_url))?;

        Ok(Self {
            client,
            api_url,
            base_id: config.base_id,
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    /// `{api_url}/v0/{base_id}/{resource}/` with the resource name percent-encoded.
    pub fn resource_url(&self, resource: &str) -> Result<Url, TransportError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Url(self.api_url.to_string()))?
            .pop_if_empty()
            .extend(["v0", self.base_id.as_str(), resource, ""]);
        Ok(url)
    }
}

#[async_trait]
impl Transport for AirtableTransport {
    async fn list_records(
        &self,
        resource: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<RecordPage, TransportError> {
        let url = self.resource_url(resource)?;
        let mut retries = 0usize;

        loop {
            let sent = self
                .client
                .get(url.clone())
                .bearer_auth(&self.api_key)
                .query(query)
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(err) if is_transient(&err) => match self.backoff.retry_delay(retries) {
                    Some(delay) => {
                        debug!(resource, retries, ?delay, error = %err, "retrying request");
                        tokio::time::sleep(delay).await;
                        retries += 1;
                        continue;
                    }
                    None => return Err(err.into()),
                },
                Err(err) => return Err(err.into()),
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp.json::<RecordPage>().await?);
            }

            let text = resp.text().await?;
            let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
    }
}

/// Persists a serializable value as a JSON file, replacing it atomically.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when the file does not exist yet.
    pub async fn load<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(value))
    }

    /// Writes pretty JSON through a temp file and rename.
    pub async fn save<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", self.path.display()))?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp state {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}
