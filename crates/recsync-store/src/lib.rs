//! Durable reconciler-state persistence + shared retrying HTTP plumbing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use recsync_core::{ReconcilerState, TrackedJob};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "recsync-store";

const STATE_FORMAT_VERSION: u32 = 1;

/// On-disk envelope around the tracked-job list. The checksum covers the
/// serialized `jobs` payload so a torn or hand-edited file is detected
/// on load instead of silently driving stop commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEnvelope {
    version: u32,
    saved_at: DateTime<Utc>,
    checksum: String,
    jobs: Vec<TrackedJob>,
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("reading state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("state file {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("state file {path} has unsupported version {found} (expected {expected})")]
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("state file {path} failed checksum verification")]
    Checksum { path: PathBuf },
    #[error("encoding state: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Dumb persistence adapter for [`ReconcilerState`]. Owns no business
/// logic; the reconciler decides what goes in and when.
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

    fn jobs_checksum(jobs_payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(jobs_payload);
        hex::encode(hasher.finalize())
    }

    /// Load the persisted state. A missing file is an empty state, not an
    /// error. A file that fails to decode or verify is an error; callers
    /// decide whether to start fresh.
    pub async fn load(&self) -> Result<ReconcilerState, StateStoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReconcilerState::new());
            }
            Err(err) => {
                return Err(StateStoreError::Read {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };

        let envelope: StateEnvelope =
            serde_json::from_slice(&bytes).map_err(|err| StateStoreError::Decode {
                path: self.path.clone(),
                source: err,
            })?;

        if envelope.version != STATE_FORMAT_VERSION {
            return Err(StateStoreError::Version {
                path: self.path.clone(),
                found: envelope.version,
                expected: STATE_FORMAT_VERSION,
            });
        }

        let jobs_payload = serde_json::to_vec(&envelope.jobs).map_err(StateStoreError::Encode)?;
        if Self::jobs_checksum(&jobs_payload) != envelope.checksum {
            return Err(StateStoreError::Checksum {
                path: self.path.clone(),
            });
        }

        Ok(ReconcilerState::from_jobs(envelope.jobs))
    }

    /// Persist the state atomically: write to a temp file in the same
    /// directory, flush, then rename over the target. An interrupted save
    /// leaves either the old or the new file, never a mixture.
    pub async fn save(&self, state: &ReconcilerState) -> Result<(), StateStoreError> {
        let jobs = state.to_vec();
        let jobs_payload = serde_json::to_vec(&jobs).map_err(StateStoreError::Encode)?;
        let envelope = StateEnvelope {
            version: STATE_FORMAT_VERSION,
            saved_at: Utc::now(),
            checksum: Self::jobs_checksum(&jobs_payload),
            jobs,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(StateStoreError::Encode)?;

        let write_err = |source: std::io::Error| StateStoreError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(write_err)?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(write_err)?;
        if let Err(err) = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await
        {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(write_err(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(write_err(err));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
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
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

impl HttpError {
    /// Disposition of the terminal failure. A terminal `Retryable` means
    /// the retry budget was exhausted, not that another attempt would be
    /// made here.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            HttpError::Transport(err) => classify_reqwest_error(err),
            HttpError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Transport(err) => err.status(),
            HttpError::Status { status, .. } => StatusCode::from_u16(*status).ok(),
        }
    }
}

/// Shared outbound HTTP executor: bounded per-request timeout plus an
/// exponential-backoff retry loop for transient failures. Both the
/// primary and secondary clients route every call through this.
#[derive(Debug)]
pub struct HttpExecutor {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpExecutor {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(
        &self,
        tick_id: Uuid,
        label: &str,
        url: &str,
    ) -> Result<ExecutedResponse, HttpError> {
        self.execute(tick_id, label, Method::GET, url, None).await
    }

    pub async fn put_json(
        &self,
        tick_id: Uuid,
        label: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<ExecutedResponse, HttpError> {
        self.execute(tick_id, label, Method::PUT, url, Some(body))
            .await
    }

    async fn execute(
        &self,
        tick_id: Uuid,
        label: &str,
        method: Method,
        url: &str,
        body: Option<&JsonValue>,
    ) -> Result<ExecutedResponse, HttpError> {
        let span = info_span!("http_call", %tick_id, label, %method, url);
        let _guard = span.enter();

        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(ExecutedResponse { status, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(HttpError::Status {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_transport_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::Transport(err));
                }
            }
        }

        Err(HttpError::Transport(
            last_transport_error.expect("retry loop should capture a request error"),
        ))
    }
}
