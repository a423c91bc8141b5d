//! Typed clients for the primary (ingest) and secondary (DVR) systems,
//! plus the static logical-name mapper.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use recsync_core::{ActiveJobSet, Job, JobKey};
use recsync_store::{ExecutedResponse, HttpError, HttpExecutor, RetryDisposition};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "recsync-clients";

/// Static mapping from logical recorder name ("PCR 1") to the secondary
/// system's source identifier. Pure lookup; a miss is a data condition
/// the caller reports and skips, never a transient failure.
#[derive(Debug, Clone, Default)]
pub struct NameMapper {
    map: BTreeMap<String, String>,
}

impl NameMapper {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self { map }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            map: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn resolve(&self, logical_name: &str) -> Option<&str> {
        self.map.get(logical_name).map(String::as_str)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.map.values().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[derive(Debug, Error)]
pub enum PrimaryError {
    /// Network, timeout, or server-side failure; the retry budget inside
    /// the executor is already spent when this surfaces.
    #[error("fetching active jobs: {0}")]
    Transient(#[source] HttpError),
    /// Schema violation. Not retryable; the tick treats the observation
    /// as unknown rather than as "zero jobs".
    #[error("malformed active-jobs response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait PrimaryClient: Send + Sync {
    /// Fetch the set of capture jobs the ingest system reports as active.
    async fn fetch_active_jobs(&self, tick_id: Uuid) -> Result<ActiveJobSet, PrimaryError>;
}

/// Wire shape of `GET /ingests/activejobsinfo`: one record per ingest,
/// each carrying its currently active jobs.
#[derive(Debug, Deserialize)]
struct IngestRecord {
    #[serde(rename = "ingestId")]
    ingest_id: String,
    #[serde(rename = "logicalName")]
    logical_name: String,
    #[serde(rename = "activeJobsInfo", default)]
    active_jobs: Vec<ActiveJobRecord>,
}

#[derive(Debug, Deserialize)]
struct ActiveJobRecord {
    id: String,
    basename: String,
}

fn parse_active_jobs(body: &[u8]) -> Result<ActiveJobSet, PrimaryError> {
    let records: Vec<IngestRecord> = serde_json::from_slice(body)
        .map_err(|err| PrimaryError::Malformed(err.to_string()))?;

    let mut set = ActiveJobSet::new();
    for record in records {
        for active in record.active_jobs {
            let key = JobKey::new(record.ingest_id.clone(), active.id);
            set.insert(
                key.clone(),
                Job {
                    key,
                    logical_name: record.logical_name.clone(),
                    basename: active.basename,
                },
            );
        }
    }
    Ok(set)
}

pub struct HttpPrimaryClient {
    http: Arc<HttpExecutor>,
    base_url: String,
}

impl HttpPrimaryClient {
    pub fn new(http: Arc<HttpExecutor>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url.into()),
        }
    }
}

#[async_trait]
impl PrimaryClient for HttpPrimaryClient {
    async fn fetch_active_jobs(&self, tick_id: Uuid) -> Result<ActiveJobSet, PrimaryError> {
        let url = format!("{}/ingests/activejobsinfo", self.base_url);
        let response = self
            .http
            .get(tick_id, "primary_active_jobs", &url)
            .await
            .map_err(PrimaryError::Transient)?;
        parse_active_jobs(&response.body)
    }
}

#[derive(Debug, Error)]
pub enum SecondaryError {
    /// The retry budget is already spent when this surfaces; the affected
    /// job is deferred to the next tick.
    #[error("secondary system unavailable during {operation} for source {source_id}: {source}")]
    Unavailable {
        operation: &'static str,
        source_id: String,
        #[source]
        source: HttpError,
    },
    /// Logical rejection (unknown source id, conflicting recording).
    /// Never retried within a tick.
    #[error("secondary system rejected {operation} for source {source_id}: {source}")]
    Rejected {
        operation: &'static str,
        source_id: String,
        #[source]
        source: HttpError,
    },
    #[error("malformed sources response: {0}")]
    Malformed(String),
}

/// One entry of `GET /sources`.
#[derive(Debug, Clone, Deserialize)]
pub struct SecondarySource {
    pub id: String,
    #[serde(default)]
    pub is_recording: bool,
}

#[async_trait]
pub trait SecondaryClient: Send + Sync {
    /// Must complete before `start`; the secondary API models the
    /// recording name as set-once-before-start.
    async fn set_recording_name(
        &self,
        tick_id: Uuid,
        source_id: &str,
        basename: &str,
    ) -> Result<(), SecondaryError>;

    async fn start(&self, tick_id: Uuid, source_id: &str) -> Result<(), SecondaryError>;

    /// Stopping a source that isn't recording is success: intent lives in
    /// the reconciler's state, and the secondary may have converged on
    /// its own.
    async fn stop(&self, tick_id: Uuid, source_id: &str) -> Result<(), SecondaryError>;

    /// Enumerate sources; used by the startup mapping-validation path,
    /// not by the tick loop.
    async fn list_sources(&self, tick_id: Uuid) -> Result<Vec<SecondarySource>, SecondaryError>;
}

fn classify_secondary(operation: &'static str, source_id: &str, err: HttpError) -> SecondaryError {
    match err.disposition() {
        RetryDisposition::Retryable => SecondaryError::Unavailable {
            operation,
            source_id: source_id.to_string(),
            source: err,
        },
        RetryDisposition::NonRetryable => SecondaryError::Rejected {
            operation,
            source_id: source_id.to_string(),
            source: err,
        },
    }
}

pub struct HttpSecondaryClient {
    http: Arc<HttpExecutor>,
    base_url: String,
}

impl HttpSecondaryClient {
    pub fn new(http: Arc<HttpExecutor>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url.into()),
        }
    }
}

#[async_trait]
impl SecondaryClient for HttpSecondaryClient {
    async fn set_recording_name(
        &self,
        tick_id: Uuid,
        source_id: &str,
        basename: &str,
    ) -> Result<(), SecondaryError> {
        let url = format!("{}/sources/{}/recording_name", self.base_url, source_id);
        let body = json!({ "recording_name": basename });
        self.http
            .put_json(tick_id, "secondary_set_name", &url, &body)
            .await
            .map_err(|err| classify_secondary("set_recording_name", source_id, err))?;
        Ok(())
    }

    async fn start(&self, tick_id: Uuid, source_id: &str) -> Result<(), SecondaryError> {
        let url = format!("{}/sources/{}/record", self.base_url, source_id);
        self.http
            .get(tick_id, "secondary_start", &url)
            .await
            .map_err(|err| classify_secondary("start", source_id, err))?;
        Ok(())
    }

    async fn stop(&self, tick_id: Uuid, source_id: &str) -> Result<(), SecondaryError> {
        let url = format!("{}/sources/{}/stop", self.base_url, source_id);
        let result = self.http.get(tick_id, "secondary_stop", &url).await;
        stop_outcome(source_id, result)
    }

    async fn list_sources(&self, tick_id: Uuid) -> Result<Vec<SecondarySource>, SecondaryError> {
        let url = format!("{}/sources", self.base_url);
        let response = self
            .http
            .get(tick_id, "secondary_sources", &url)
            .await
            .map_err(|err| classify_secondary("list_sources", "*", err))?;
        serde_json::from_slice(&response.body)
            .map_err(|err| SecondaryError::Malformed(err.to_string()))
    }
}

/// Outcome mapping for `stop`. A `409 Conflict` means the source had
/// already stopped on its own; that is the state we were converging to,
/// so it counts as success. A `404` stays a rejection: it means an
/// unknown source, not a stopped one.
fn stop_outcome(
    source_id: &str,
    result: Result<ExecutedResponse, HttpError>,
) -> Result<(), SecondaryError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.status() == Some(StatusCode::CONFLICT) => Ok(()),
        Err(err) => Err(classify_secondary("stop", source_id, err)),
    }
}

fn trim_base(base: String) -> String {
    base.trim_end_matches('/').to_string()
}
