//! The reconciliation state machine: poll the primary system, diff against
//! tracked state, drive the secondary system, persist, repeat.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use recsync_clients::{NameMapper, PrimaryClient, SecondaryClient};
use recsync_core::{diff, ReconcilerState, StatusSnapshot, TrackedJob};
use recsync_store::StateStore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recsync-reconciler";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub primary_base_url: String,
    pub secondary_base_url: String,
    pub poll_interval: Duration,
    pub state_file: PathBuf,
    pub mapping_file: PathBuf,
    pub http_timeout_secs: u64,
    pub status_port: u16,
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        Self {
            primary_base_url: std::env::var("RECSYNC_PRIMARY_BASE_URL")
                .unwrap_or_else(|_| "https://127.0.0.1:4230".to_string()),
            secondary_base_url: std::env::var("RECSYNC_SECONDARY_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            poll_interval: Duration::from_secs(
                std::env::var("RECSYNC_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            state_file: std::env::var("RECSYNC_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("state/state.json")),
            mapping_file: std::env::var("RECSYNC_MAPPING_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("mappings.yaml")),
            http_timeout_secs: std::env::var("RECSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            status_port: std::env::var("RECSYNC_STATUS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

const MAPPING_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct MappingFile {
    version: u32,
    #[serde(default)]
    mappings: Vec<MappingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct MappingEntry {
    logical_name: String,
    source_id: String,
}

/// Load the logical-name → source-id mapping from its YAML file.
/// Duplicate logical names are a configuration error, not a warning.
pub async fn load_name_mapper(path: &PathBuf) -> Result<NameMapper> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: MappingFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if file.version != MAPPING_FORMAT_VERSION {
        bail!(
            "{}: unsupported mapping version {} (expected {})",
            path.display(),
            file.version,
            MAPPING_FORMAT_VERSION
        );
    }

    let mut seen = BTreeSet::new();
    for entry in &file.mappings {
        if !seen.insert(entry.logical_name.as_str()) {
            bail!(
                "{}: duplicate mapping for logical name {:?}",
                path.display(),
                entry.logical_name
            );
        }
    }

    Ok(NameMapper::from_pairs(
        file.mappings
            .into_iter()
            .map(|entry| (entry.logical_name, entry.source_id)),
    ))
}

/// Shared read side of the reconciler's state. Writers hold the lock only
/// for the swap; readers get an owned deep copy, never the live value.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.read().await.clone()
    }

    /// Replace the published snapshot. Single writer: the reconciler.
    pub async fn publish(&self, snapshot: StatusSnapshot) {
        *self.inner.write().await = snapshot;
    }
}

/// What one tick did. Counts cover per-job outcomes; `errors` carries the
/// human-readable reports that also land in the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub tick_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub poll_succeeded: bool,
    pub observed_jobs: usize,
    pub started: usize,
    pub stopped: usize,
    pub skipped_unroutable: usize,
    pub failed_starts: usize,
    pub failed_stops: usize,
    pub errors: Vec<String>,
}

pub struct Reconciler {
    primary: Arc<dyn PrimaryClient>,
    secondary: Arc<dyn SecondaryClient>,
    mapper: NameMapper,
    store: StateStore,
    state: ReconcilerState,
    status: StatusHandle,
    last_poll_at: Option<DateTime<Utc>>,
}

impl Reconciler {
    /// Load prior state and build the reconciler. A state file that fails
    /// to decode is reported and discarded; the loop starts fresh and the
    /// next successful tick rewrites it.
    pub async fn bootstrap(
        primary: Arc<dyn PrimaryClient>,
        secondary: Arc<dyn SecondaryClient>,
        mapper: NameMapper,
        store: StateStore,
    ) -> Self {
        let state = match store.load().await {
            Ok(state) => {
                info!(
                    tracked_jobs = state.len(),
                    state_file = %store.path().display(),
                    "loaded reconciler state"
                );
                state
            }
            Err(err) => {
                warn!(
                    state_file = %store.path().display(),
                    error = %err,
                    "unusable state file; starting fresh"
                );
                ReconcilerState::new()
            }
        };

        let status = StatusHandle::new();
        // Surface resumed state immediately; a restart must not report
        // zero tracked jobs while waiting for the first tick.
        status
            .publish(StatusSnapshot {
                tracked_jobs: state.to_vec(),
                last_poll_at: None,
                last_error: None,
            })
            .await;

        Self {
            primary,
            secondary,
            mapper,
            store,
            state,
            status,
            last_poll_at: None,
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn tracked_len(&self) -> usize {
        self.state.len()
    }

    /// One poll–diff–apply–persist cycle. Per-job failures are isolated;
    /// only a failed poll aborts the tick, and then with the prior state
    /// untouched so a fetch outage never looks like "all jobs stopped".
    pub async fn tick(&mut self) -> TickSummary {
        let tick_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut errors = Vec::new();

        let observed = match self.primary.fetch_active_jobs(tick_id).await {
            Ok(observed) => observed,
            Err(err) => {
                error!(%tick_id, error = %err, "poll failed; tick aborted");
                errors.push(format!("poll: {err}"));
                self.publish_status(&errors).await;
                return TickSummary {
                    tick_id,
                    started_at,
                    finished_at: Utc::now(),
                    poll_succeeded: false,
                    observed_jobs: 0,
                    started: 0,
                    stopped: 0,
                    skipped_unroutable: 0,
                    failed_starts: 0,
                    failed_stops: 0,
                    errors,
                };
            }
        };
        self.last_poll_at = Some(Utc::now());

        let plan = diff(&self.state, &observed);
        let mut started = 0usize;
        let mut stopped = 0usize;
        let mut skipped_unroutable = 0usize;
        let mut failed_starts = 0usize;
        let mut failed_stops = 0usize;

        for job in &plan.new_jobs {
            let Some(source_id) = self.mapper.resolve(&job.logical_name) else {
                warn!(
                    %tick_id,
                    key = %job.key,
                    logical_name = %job.logical_name,
                    "no source mapping; job skipped"
                );
                errors.push(format!(
                    "job {}: no source mapping for logical name {:?}",
                    job.key, job.logical_name
                ));
                skipped_unroutable += 1;
                continue;
            };
            let source_id = source_id.to_string();

            if let Err(err) = self
                .secondary
                .set_recording_name(tick_id, &source_id, &job.basename)
                .await
            {
                warn!(%tick_id, key = %job.key, source_id, error = %err, "set_recording_name failed");
                errors.push(format!("job {}: {err}", job.key));
                failed_starts += 1;
                continue;
            }

            match self.secondary.start(tick_id, &source_id).await {
                Ok(()) => {
                    info!(
                        %tick_id,
                        key = %job.key,
                        source_id,
                        basename = %job.basename,
                        "started secondary recording"
                    );
                    self.state.insert(TrackedJob {
                        key: job.key.clone(),
                        logical_name: job.logical_name.clone(),
                        basename: job.basename.clone(),
                        source_id,
                        started_at: Utc::now(),
                    });
                    started += 1;
                }
                Err(err) => {
                    warn!(%tick_id, key = %job.key, source_id, error = %err, "start failed");
                    errors.push(format!("job {}: {err}", job.key));
                    failed_starts += 1;
                }
            }
        }

        for job in &plan.stopped_jobs {
            match self.secondary.stop(tick_id, &job.source_id).await {
                Ok(()) => {
                    info!(
                        %tick_id,
                        key = %job.key,
                        source_id = %job.source_id,
                        "stopped secondary recording"
                    );
                    self.state.remove(&job.key);
                    stopped += 1;
                }
                Err(err) => {
                    // Entry stays tracked; the stop is retried next tick.
                    warn!(%tick_id, key = %job.key, source_id = %job.source_id, error = %err, "stop failed");
                    errors.push(format!("job {}: {err}", job.key));
                    failed_stops += 1;
                }
            }
        }

        if let Err(err) = self.store.save(&self.state).await {
            error!(%tick_id, error = %err, "persisting reconciler state failed");
            errors.push(format!("persist: {err}"));
        }

        self.publish_status(&errors).await;

        TickSummary {
            tick_id,
            started_at,
            finished_at: Utc::now(),
            poll_succeeded: true,
            observed_jobs: observed.len(),
            started,
            stopped,
            skipped_unroutable,
            failed_starts,
            failed_stops,
            errors,
        }
    }

    async fn publish_status(&self, errors: &[String]) {
        let last_error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };
        self.status
            .publish(StatusSnapshot {
                tracked_jobs: self.state.to_vec(),
                last_poll_at: self.last_poll_at,
                last_error,
            })
            .await;
    }

    /// Fixed-interval loop. One tick at a time: an overrunning tick delays
    /// the next instead of stacking. Shutdown is honored between ticks, so
    /// an in-flight tick finishes its secondary commands first.
    pub async fn run<F>(mut self, poll_interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(poll_interval_secs = poll_interval.as_secs(), "reconciliation loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    info!(
                        tick_id = %summary.tick_id,
                        observed = summary.observed_jobs,
                        started = summary.started,
                        stopped = summary.stopped,
                        errors = summary.errors.len(),
                        "tick finished"
                    );
                }
                _ = &mut shutdown => {
                    info!("shutdown requested; reconciliation loop stopping");
                    break;
                }
            }
        }
    }
}

/// Startup check: every configured source id should exist on the secondary
/// system. Returns the ids it does not report; the caller warns and runs
/// anyway, since the secondary may come up later.
pub async fn validate_mapping(
    secondary: &dyn SecondaryClient,
    mapper: &NameMapper,
) -> Result<Vec<String>> {
    let sources = secondary
        .list_sources(Uuid::new_v4())
        .await
        .context("enumerating secondary sources")?;
    let known: BTreeSet<&str> = sources.iter().map(|s| s.id.as_str()).collect();
    Ok(mapper
        .source_ids()
        .filter(|id| !known.contains(id))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recsync_clients::{PrimaryError, SecondaryError, SecondarySource};
    use recsync_core::{ActiveJobSet, Job, JobKey};
    use recsync_store::HttpError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn job(ingest: &str, id: &str, name: &str, basename: &str) -> Job {
        Job {
            key: JobKey::new(ingest, id),
            logical_name: name.to_string(),
            basename: basename.to_string(),
        }
    }

    fn job_set(jobs: &[Job]) -> ActiveJobSet {
        jobs.iter().map(|j| (j.key.clone(), j.clone())).collect()
    }

    fn transient() -> PrimaryError {
        PrimaryError::Transient(HttpError::Status {
            status: 503,
            url: "http://primary/ingests/activejobsinfo".into(),
        })
    }

    fn unavailable(operation: &'static str, source_id: &str) -> SecondaryError {
        SecondaryError::Unavailable {
            operation,
            source_id: source_id.to_string(),
            source: HttpError::Status {
                status: 503,
                url: format!("http://dvr/sources/{source_id}"),
            },
        }
    }

    #[derive(Default)]
    struct ScriptedPrimary {
        polls: Mutex<VecDeque<Result<ActiveJobSet, PrimaryError>>>,
    }

    impl ScriptedPrimary {
        fn push(&self, poll: Result<ActiveJobSet, PrimaryError>) {
            self.polls.lock().unwrap().push_back(poll);
        }
    }

    #[async_trait]
    impl PrimaryClient for ScriptedPrimary {
        async fn fetch_active_jobs(&self, _tick_id: Uuid) -> Result<ActiveJobSet, PrimaryError> {
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ActiveJobSet::new()))
        }
    }

    #[derive(Default)]
    struct RecordingSecondary {
        calls: Mutex<Vec<String>>,
        fail_start_for: Mutex<BTreeSet<String>>,
        fail_stop_for: Mutex<BTreeSet<String>>,
        sources: Vec<SecondarySource>,
    }

    impl RecordingSecondary {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn fail_start(&self, source_id: &str) {
            self.fail_start_for
                .lock()
                .unwrap()
                .insert(source_id.to_string());
        }

        fn fail_stop(&self, source_id: &str, fail: bool) {
            let mut set = self.fail_stop_for.lock().unwrap();
            if fail {
                set.insert(source_id.to_string());
            } else {
                set.remove(source_id);
            }
        }
    }

    #[async_trait]
    impl SecondaryClient for RecordingSecondary {
        async fn set_recording_name(
            &self,
            _tick_id: Uuid,
            source_id: &str,
            basename: &str,
        ) -> Result<(), SecondaryError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("set_name {source_id} {basename}"));
            Ok(())
        }

        async fn start(&self, _tick_id: Uuid, source_id: &str) -> Result<(), SecondaryError> {
            self.calls.lock().unwrap().push(format!("start {source_id}"));
            if self.fail_start_for.lock().unwrap().contains(source_id) {
                return Err(unavailable("start", source_id));
            }
            Ok(())
        }

        async fn stop(&self, _tick_id: Uuid, source_id: &str) -> Result<(), SecondaryError> {
            self.calls.lock().unwrap().push(format!("stop {source_id}"));
            if self.fail_stop_for.lock().unwrap().contains(source_id) {
                return Err(unavailable("stop", source_id));
            }
            Ok(())
        }

        async fn list_sources(&self, _tick_id: Uuid) -> Result<Vec<SecondarySource>, SecondaryError> {
            Ok(self.sources.clone())
        }
    }

    fn mapper() -> NameMapper {
        NameMapper::from_pairs([("PCR 1", "src-7"), ("PCR 2", "src-3"), ("PCR 3", "src-4")])
    }

    async fn reconciler(
        primary: Arc<ScriptedPrimary>,
        secondary: Arc<RecordingSecondary>,
        store: StateStore,
    ) -> Reconciler {
        Reconciler::bootstrap(primary, secondary, mapper(), store).await
    }

    #[tokio::test]
    async fn start_then_stop_through_two_ticks() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let primary = Arc::new(ScriptedPrimary::default());
        let secondary = Arc::new(RecordingSecondary::default());

        primary.push(Ok(job_set(&[job("ingest1", "job1", "PCR 1", "show_2024")])));
        primary.push(Ok(ActiveJobSet::new()));

        let mut rec = reconciler(primary, secondary.clone(), store.clone()).await;

        let first = rec.tick().await;
        assert_eq!(first.started, 1);
        assert!(first.errors.is_empty());
        assert_eq!(
            secondary.calls(),
            vec!["set_name src-7 show_2024".to_string(), "start src-7".to_string()]
        );
        assert!(rec.state.contains(&JobKey::new("ingest1", "job1")));

        secondary.clear_calls();
        let second = rec.tick().await;
        assert_eq!(second.stopped, 1);
        assert_eq!(secondary.calls(), vec!["stop src-7".to_string()]);
        assert!(rec.state.is_empty());

        let persisted = store.load().await.unwrap();
        assert!(persisted.is_empty());
    }

    #[tokio::test]
    async fn unchanged_poll_issues_no_calls() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let primary = Arc::new(ScriptedPrimary::default());
        let secondary = Arc::new(RecordingSecondary::default());

        let jobs = [job("ingest1", "job1", "PCR 1", "show_2024")];
        primary.push(Ok(job_set(&jobs)));
        primary.push(Ok(job_set(&jobs)));

        let mut rec = reconciler(primary, secondary.clone(), store).await;
        rec.tick().await;
        secondary.clear_calls();

        let summary = rec.tick().await;
        assert!(secondary.calls().is_empty());
        assert_eq!(summary.started, 0);
        assert_eq!(summary.stopped, 0);
        assert_eq!(rec.state.len(), 1);
    }

    #[tokio::test]
    async fn one_failing_start_does_not_block_the_others() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let primary = Arc::new(ScriptedPrimary::default());
        let secondary = Arc::new(RecordingSecondary::default());
        secondary.fail_start("src-3");

        primary.push(Ok(job_set(&[
            job("ingest1", "job1", "PCR 1", "a"),
            job("ingest1", "job2", "PCR 2", "b"),
            job("ingest1", "job3", "PCR 3", "c"),
        ])));

        let mut rec = reconciler(primary, secondary, store).await;
        let summary = rec.tick().await;

        assert_eq!(summary.started, 2);
        assert_eq!(summary.failed_starts, 1);
        assert!(rec.state.contains(&JobKey::new("ingest1", "job1")));
        assert!(!rec.state.contains(&JobKey::new("ingest1", "job2")));
        assert!(rec.state.contains(&JobKey::new("ingest1", "job3")));
    }

    #[tokio::test]
    async fn unroutable_job_is_reported_and_reappears_next_tick() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let primary = Arc::new(ScriptedPrimary::default());
        let secondary = Arc::new(RecordingSecondary::default());

        let jobs = [job("ingest9", "job1", "PCR 9", "orphan_2024")];
        primary.push(Ok(job_set(&jobs)));
        primary.push(Ok(job_set(&jobs)));

        let mut rec = reconciler(primary, secondary.clone(), store).await;

        let first = rec.tick().await;
        assert_eq!(first.skipped_unroutable, 1);
        assert!(secondary.calls().is_empty());
        assert!(rec.state.is_empty());
        assert!(first.errors[0].contains("PCR 9"));

        let second = rec.tick().await;
        assert_eq!(second.skipped_unroutable, 1);
        assert!(secondary.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_poll_keeps_prior_state_and_reports() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let primary = Arc::new(ScriptedPrimary::default());
        let secondary = Arc::new(RecordingSecondary::default());

        primary.push(Ok(job_set(&[job("ingest1", "job1", "PCR 1", "show_2024")])));
        primary.push(Err(transient()));

        let mut rec = reconciler(primary, secondary.clone(), store).await;
        rec.tick().await;
        secondary.clear_calls();

        let summary = rec.tick().await;
        assert!(!summary.poll_succeeded);
        assert!(secondary.calls().is_empty(), "no stop cascade on poll failure");
        assert_eq!(rec.state.len(), 1);

        let status = rec.status().snapshot().await;
        assert!(status.last_error.is_some());
        assert_eq!(status.tracked_jobs.len(), 1);
    }

    #[tokio::test]
    async fn malformed_poll_aborts_tick_without_stops() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let primary = Arc::new(ScriptedPrimary::default());
        let secondary = Arc::new(RecordingSecondary::default());

        primary.push(Ok(job_set(&[job("ingest1", "job1", "PCR 1", "show_2024")])));
        primary.push(Err(PrimaryError::Malformed("expected a list".into())));

        let mut rec = reconciler(primary, secondary.clone(), store).await;
        rec.tick().await;
        secondary.clear_calls();

        let summary = rec.tick().await;
        assert!(!summary.poll_succeeded);
        assert!(secondary.calls().is_empty());
        assert_eq!(rec.state.len(), 1);
    }

    #[tokio::test]
    async fn failed_stop_is_retried_on_the_next_tick() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let primary = Arc::new(ScriptedPrimary::default());
        let secondary = Arc::new(RecordingSecondary::default());

        primary.push(Ok(job_set(&[job("ingest1", "job1", "PCR 1", "show_2024")])));
        primary.push(Ok(ActiveJobSet::new()));
        primary.push(Ok(ActiveJobSet::new()));

        let mut rec = reconciler(primary, secondary.clone(), store).await;
        rec.tick().await;

        secondary.fail_stop("src-7", true);
        let failed = rec.tick().await;
        assert_eq!(failed.failed_stops, 1);
        assert_eq!(rec.state.len(), 1, "entry kept for retry");

        secondary.fail_stop("src-7", false);
        secondary.clear_calls();
        let retried = rec.tick().await;
        assert_eq!(retried.stopped, 1);
        assert_eq!(secondary.calls(), vec!["stop src-7".to_string()]);
        assert!(rec.state.is_empty());
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_state() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let jobs = [job("ingest1", "job1", "PCR 1", "show_2024")];

        {
            let primary = Arc::new(ScriptedPrimary::default());
            primary.push(Ok(job_set(&jobs)));
            let secondary = Arc::new(RecordingSecondary::default());
            let mut rec = reconciler(primary, secondary, store.clone()).await;
            rec.tick().await;
        }

        let primary = Arc::new(ScriptedPrimary::default());
        primary.push(Ok(job_set(&jobs)));
        let secondary = Arc::new(RecordingSecondary::default());
        let mut rec = reconciler(primary, secondary.clone(), store).await;
        assert_eq!(rec.tracked_len(), 1);

        let resumed = rec.status().snapshot().await;
        assert_eq!(
            resumed.tracked_jobs.len(),
            1,
            "status must show resumed jobs before the first tick"
        );

        let summary = rec.tick().await;
        assert!(secondary.calls().is_empty(), "restart must not re-start running jobs");
        assert_eq!(summary.started, 0);
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json at all").unwrap();

        let primary = Arc::new(ScriptedPrimary::default());
        let secondary = Arc::new(RecordingSecondary::default());
        let rec = reconciler(primary, secondary, StateStore::new(&path)).await;
        assert_eq!(rec.tracked_len(), 0);
    }

    #[tokio::test]
    async fn mapping_file_loads_and_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mappings.yaml");
        std::fs::write(
            &path,
            "version: 1\nmappings:\n  - logical_name: PCR 1\n    source_id: src-7\n  - logical_name: PCR 2\n    source_id: src-3\n",
        )
        .unwrap();
        let mapper = load_name_mapper(&path).await.unwrap();
        assert_eq!(mapper.resolve("PCR 2"), Some("src-3"));

        std::fs::write(
            &path,
            "version: 1\nmappings:\n  - logical_name: PCR 1\n    source_id: src-7\n  - logical_name: PCR 1\n    source_id: src-3\n",
        )
        .unwrap();
        let err = load_name_mapper(&path).await.unwrap_err();
        assert!(err.to_string().contains("duplicate mapping"));
    }

    #[tokio::test]
    async fn mapping_validation_reports_unknown_sources() {
        let secondary = RecordingSecondary {
            sources: vec![
                SecondarySource {
                    id: "src-7".into(),
                    is_recording: false,
                },
                SecondarySource {
                    id: "src-3".into(),
                    is_recording: true,
                },
            ],
            ..Default::default()
        };

        let missing = validate_mapping(&secondary, &mapper()).await.unwrap();
        assert_eq!(missing, vec!["src-4".to_string()]);
    }
}
