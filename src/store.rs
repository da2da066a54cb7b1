//! Idempotent job registry and result cache
//!
//! Jobs are keyed by a stable idempotency key derived from the normalized URL
//! and the serialized audit options, hashed independently so either half of
//! the dedup scope can be widened or narrowed without touching the other.
//! Deduplication is an atomic insert-if-absent on the key index, so two
//! concurrent identical submissions cannot both create a job.

use crate::{AuditError, AuditOptions, AuditReport};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Lifecycle of an audit job. Transitions are monotonic:
/// `Queued -> Running -> {Succeeded, Failed}`; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    fn can_transition(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub job_id: String,
    pub id_key: String,
    pub url: String,
    pub normalized_url: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_details: Option<String>,
}

impl Job {
    fn new(url: &str, normalized_url: &str, id_key: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            id_key: id_key.to_string(),
            url: url.to_string(),
            normalized_url: normalized_url.to_string(),
            status: JobStatus::Queued,
            attempts: 0,
            submitted_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            error_code: None,
            error_details: None,
        }
    }

    fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.submitted_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Immutable stored audit result. `schema_version` increments with every
/// report-shape change so downstream consumers can detect stale payloads.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditResult {
    pub job_id: String,
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub payload: AuditReport,
}

/// Outcome of a submission: either a fresh job or a pointer to an existing
/// one submitted within the idempotency window.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job_id: String,
    pub normalized_url: String,
    pub reused: bool,
}

/// Partial job update applied by `update_job`. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub error_code: Option<String>,
    pub error_details: Option<String>,
}

pub struct JobStore {
    jobs: DashMap<String, Job>,
    results: DashMap<String, AuditResult>,
    dedup_index: DashMap<String, String>,
    schema_version: AtomicU32,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            results: DashMap::new(),
            dedup_index: DashMap::new(),
            schema_version: AtomicU32::new(1),
        }
    }

    /// Registers a job for `(url, options)`, collapsing duplicates.
    ///
    /// The dedup check and the insert happen under one entry lock on the
    /// `id_key` index, so concurrent identical submissions resolve to a
    /// single job. A matching job is reused while it was submitted within
    /// `window` and has not failed; failed jobs never block a resubmission.
    pub fn create_job(
        &self,
        url: &str,
        options: &AuditOptions,
        window: Duration,
    ) -> Result<JobTicket, AuditError> {
        let normalized = normalize_url(url)?;
        let id_key = compute_id_key(&normalized, options)?;

        match self.dedup_index.entry(id_key.clone()) {
            Entry::Occupied(mut entry) => {
                let existing_id = entry.get().clone();
                let reusable = self
                    .jobs
                    .get(&existing_id)
                    .map(|job| job.age() < window && job.status != JobStatus::Failed)
                    .unwrap_or(false);

                if reusable {
                    debug!(job_id = %existing_id, %id_key, "reusing job within idempotency window");
                    return Ok(JobTicket {
                        job_id: existing_id,
                        normalized_url: normalized,
                        reused: true,
                    });
                }

                let job = Job::new(url, &normalized, &id_key);
                let job_id = job.job_id.clone();
                entry.insert(job_id.clone());
                self.jobs.insert(job_id.clone(), job);
                Ok(JobTicket {
                    job_id,
                    normalized_url: normalized,
                    reused: false,
                })
            }
            Entry::Vacant(entry) => {
                let job = Job::new(url, &normalized, &id_key);
                let job_id = job.job_id.clone();
                entry.insert(job_id.clone());
                self.jobs.insert(job_id.clone(), job);
                Ok(JobTicket {
                    job_id,
                    normalized_url: normalized,
                    reused: false,
                })
            }
        }
    }

    pub fn get_job(&self, job_id: &str) -> Option<(Job, Option<AuditResult>)> {
        let job = self.jobs.get(job_id)?.value().clone();
        let result = self.results.get(job_id).map(|r| r.value().clone());
        Some((job, result))
    }

    /// Merges a partial update into the job and stamps `updated_at`.
    /// Returns `false` for unknown jobs or disallowed status transitions.
    pub fn update_job(&self, job_id: &str, patch: JobPatch) -> bool {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return false;
        };

        if let Some(next) = patch.status {
            if !job.status.can_transition(next) {
                debug!(
                    %job_id,
                    from = ?job.status,
                    to = ?next,
                    "rejected status transition"
                );
                return false;
            }
            match next {
                JobStatus::Running => job.started_at = Some(Utc::now()),
                JobStatus::Succeeded | JobStatus::Failed => job.finished_at = Some(Utc::now()),
                JobStatus::Queued => {}
            }
            job.status = next;
        }
        if let Some(attempts) = patch.attempts {
            job.attempts = attempts;
        }
        if let Some(code) = patch.error_code {
            job.error_code = Some(code);
        }
        if let Some(details) = patch.error_details {
            job.error_details = Some(details);
        }
        job.updated_at = Utc::now();
        true
    }

    pub fn mark_running(&self, job_id: &str) -> bool {
        let attempts = self
            .jobs
            .get(job_id)
            .map(|job| job.attempts + 1)
            .unwrap_or(1);
        self.update_job(
            job_id,
            JobPatch {
                status: Some(JobStatus::Running),
                attempts: Some(attempts),
                ..Default::default()
            },
        )
    }

    /// Stores the merged report and transitions the job to `Succeeded`.
    pub fn save_result(&self, job_id: &str, payload: AuditReport) -> bool {
        if !self.update_job(
            job_id,
            JobPatch {
                status: Some(JobStatus::Succeeded),
                ..Default::default()
            },
        ) {
            return false;
        }
        let result = AuditResult {
            job_id: job_id.to_string(),
            schema_version: self.schema_version.load(Ordering::Relaxed),
            saved_at: Utc::now(),
            payload,
        };
        self.results.insert(job_id.to_string(), result);
        true
    }

    /// Transitions the job to `Failed` with diagnostic fields.
    pub fn fail_job(&self, job_id: &str, error_code: &str, error_details: &str) -> bool {
        self.update_job(
            job_id,
            JobPatch {
                status: Some(JobStatus::Failed),
                error_code: Some(error_code.to_string()),
                error_details: Some(error_details.to_string()),
                ..Default::default()
            },
        )
    }

    /// Bumps the result schema version; subsequent saves carry the new value.
    pub fn bump_schema_version(&self) -> u32 {
        self.schema_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Evicts terminal jobs (and their results) older than `retention`.
    /// Registered with the memory monitor as a pressure cleanup; safe to run
    /// repeatedly.
    pub fn sweep_expired(&self, retention: Duration) -> usize {
        let expired: Vec<(String, String)> = self
            .jobs
            .iter()
            .filter(|entry| entry.status.is_terminal() && entry.age() > retention)
            .map(|entry| (entry.job_id.clone(), entry.id_key.clone()))
            .collect();

        for (job_id, id_key) in &expired {
            self.jobs.remove(job_id);
            self.results.remove(job_id);
            self.dedup_index
                .remove_if(id_key, |_, mapped| mapped == job_id);
        }

        if !expired.is_empty() {
            debug!(evicted = expired.len(), "swept expired jobs");
        }
        expired.len()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical URL form used for deduplication: http(s) only, fragment dropped,
/// empty queries removed, host lowercased and default ports elided by the
/// parser.
pub fn normalize_url(raw: &str) -> Result<String, AuditError> {
    let mut parsed = Url::parse(raw)?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AuditError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(AuditError::InvalidUrl("missing host".to_string()));
    }

    parsed.set_fragment(None);
    if parsed.query() == Some("") {
        parsed.set_query(None);
    }

    Ok(parsed.to_string())
}

/// Stable idempotency key: independent short digests of the normalized URL
/// and the canonical options serialization, joined with `:`.
pub fn compute_id_key(normalized_url: &str, options: &AuditOptions) -> Result<String, AuditError> {
    let serialized = serde_json::to_string(options)?;
    Ok(format!(
        "{}:{}",
        short_hash(normalized_url),
        short_hash(&serialized)
    ))
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
