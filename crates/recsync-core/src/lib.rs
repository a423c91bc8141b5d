//! Core domain model for recsync: jobs, tracked state, and the diff.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "recsync-core";

/// Identity of a capture job as reported by the primary system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub ingest_id: String,
    pub job_id: String,
}

impl JobKey {
    pub fn new(ingest_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            ingest_id: ingest_id.into(),
            job_id: job_id.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ingest_id, self.job_id)
    }
}

/// One active capture job observed during a poll of the primary system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    /// Human-readable recorder name, e.g. "PCR 1".
    pub logical_name: String,
    /// Recording file basename, fixed for the job's lifetime.
    pub basename: String,
}

/// Everything the primary system reports as recording at one poll instant.
pub type ActiveJobSet = BTreeMap<JobKey, Job>;

/// A job the reconciler believes is currently started on the secondary system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedJob {
    pub key: JobKey,
    pub logical_name: String,
    pub basename: String,
    /// Secondary-system handle the recording was started on.
    pub source_id: String,
    pub started_at: DateTime<Utc>,
}

/// Durable reconciler state: every entry corresponds to a secondary
/// recording that was successfully started and not yet successfully stopped.
/// Persisted as a flat list of [`TrackedJob`]s, not as this map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerState {
    jobs: BTreeMap<JobKey, TrackedJob>,
}

impl ReconcilerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: impl IntoIterator<Item = TrackedJob>) -> Self {
        Self {
            jobs: jobs.into_iter().map(|job| (job.key.clone(), job)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn get(&self, key: &JobKey) -> Option<&TrackedJob> {
        self.jobs.get(key)
    }

    pub fn insert(&mut self, job: TrackedJob) {
        self.jobs.insert(job.key.clone(), job);
    }

    pub fn remove(&mut self, key: &JobKey) -> Option<TrackedJob> {
        self.jobs.remove(key)
    }

    pub fn tracked_jobs(&self) -> impl Iterator<Item = &TrackedJob> {
        self.jobs.values()
    }

    pub fn to_vec(&self) -> Vec<TrackedJob> {
        self.jobs.values().cloned().collect()
    }
}

/// Outcome of diffing one poll against the previously tracked state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobDiff {
    /// Observed by the primary system but not yet started on the secondary.
    pub new_jobs: Vec<Job>,
    /// Tracked as started but no longer reported by the primary system.
    pub stopped_jobs: Vec<TrackedJob>,
}

impl JobDiff {
    pub fn is_empty(&self) -> bool {
        self.new_jobs.is_empty() && self.stopped_jobs.is_empty()
    }
}

/// Set difference by job identity. Jobs present on both sides are left
/// untouched: the recording name is fixed at start time, so an in-flight
/// basename change does not re-issue any secondary command.
pub fn diff(tracked: &ReconcilerState, observed: &ActiveJobSet) -> JobDiff {
    let new_jobs = observed
        .values()
        .filter(|job| !tracked.contains(&job.key))
        .cloned()
        .collect();
    let stopped_jobs = tracked
        .tracked_jobs()
        .filter(|job| !observed.contains_key(&job.key))
        .cloned()
        .collect();
    JobDiff {
        new_jobs,
        stopped_jobs,
    }
}

/// Point-in-time copy of reconciler state for the status surface.
/// Never aliases the live state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub tracked_jobs: Vec<TrackedJob>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
