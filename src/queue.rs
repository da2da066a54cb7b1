//! Bounded-concurrency admission control for audit jobs
//!
//! Up to `max_concurrent_audits` jobs run at once; everything else waits in
//! an in-memory FIFO bounded by `max_pending_audits`. One mutex owns both the
//! pending list and the processing set, and admission/slot-freeing are
//! synchronous critical sections, so the concurrency ceiling holds at every
//! instant. Slot release and next-job admission run in a finally-style tail
//! after the pipeline returns, errors out, times out, or panics: a
//! permanently failing job cannot starve the queue.

use crate::{AuditError, AuditOptions, Config, JobStore, Metrics, RenderingPipeline};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a timed-out job may take to observe cancellation before its
/// remote work is abandoned outright.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a submission.
#[derive(Debug, Clone)]
pub enum Admission {
    /// A slot was free; the job is processing now.
    Started { job_id: String },
    /// All slots busy; the job waits at `position` (1-based) in the FIFO.
    Queued {
        job_id: String,
        position: usize,
        estimated_wait: Duration,
    },
    /// An equivalent job inside the idempotency window already exists.
    Duplicate { job_id: String },
}

impl Admission {
    pub fn job_id(&self) -> &str {
        match self {
            Admission::Started { job_id }
            | Admission::Queued { job_id, .. }
            | Admission::Duplicate { job_id } => job_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Admission::Duplicate { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub available_slots: usize,
    pub max_concurrent: usize,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug)]
struct PendingAudit {
    job_id: String,
    url: String,
    options: AuditOptions,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingAudit>,
    processing: HashMap<String, CancellationToken>,
    completed: u64,
    failed: u64,
    total_busy: Duration,
}

struct QueueInner {
    config: Config,
    store: Arc<JobStore>,
    pipeline: Arc<RenderingPipeline>,
    metrics: Arc<Metrics>,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct AuditQueue {
    inner: Arc<QueueInner>,
}

impl AuditQueue {
    pub fn new(
        config: Config,
        store: Arc<JobStore>,
        pipeline: Arc<RenderingPipeline>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                pipeline,
                metrics,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Submits an audit. Must be called from within a tokio runtime; admitted
    /// jobs run as spawned tasks.
    ///
    /// Deduplication runs before the capacity check so an equivalent in-flight
    /// job collapses even when the queue is full. A capacity-rejected job is
    /// terminally failed with code `capacity` so polling explains the
    /// rejection.
    pub fn add_audit(&self, url: &str, options: AuditOptions) -> Result<Admission, AuditError> {
        let ticket =
            self.inner
                .store
                .create_job(url, &options, self.inner.config.idempotency_window)?;

        if ticket.reused {
            debug!(job_id = %ticket.job_id, url, "duplicate submission collapsed");
            return Ok(Admission::Duplicate {
                job_id: ticket.job_id,
            });
        }

        let job_id = ticket.job_id;
        let normalized_url = ticket.normalized_url;
        let max_concurrent = self.inner.config.max_concurrent_audits;
        let max_pending = self.inner.config.max_pending_audits;

        let decision = {
            let mut state = self.inner.state.lock().unwrap();
            if state.processing.len() < max_concurrent {
                let token = CancellationToken::new();
                state.processing.insert(job_id.clone(), token.clone());
                self.inner
                    .metrics
                    .set_active_audits(state.processing.len());
                Some(token)
            } else if state.pending.len() >= max_pending {
                None
            } else {
                state.pending.push_back(PendingAudit {
                    job_id: job_id.clone(),
                    url: normalized_url.clone(),
                    options: options.clone(),
                });
                let position = state.pending.len();
                let estimated_wait = estimate_wait(&state, max_concurrent, position);
                self.inner.metrics.set_queue_depth(state.pending.len());
                return Ok(Admission::Queued {
                    job_id,
                    position,
                    estimated_wait,
                });
            }
        };

        match decision {
            Some(token) => {
                Self::spawn_task(self.inner.clone(), job_id.clone(), normalized_url, options, token);
                Ok(Admission::Started { job_id })
            }
            None => {
                warn!(job_id = %job_id, url, "pending queue full, rejecting submission");
                self.inner
                    .store
                    .fail_job(&job_id, "capacity", "pending queue at limit");
                Err(AuditError::QueueFull {
                    pending: max_pending,
                    limit: max_pending,
                })
            }
        }
    }

    pub fn snapshot(&self) -> QueueStats {
        let state = self.inner.state.lock().unwrap();
        let max_concurrent = self.inner.config.max_concurrent_audits;
        QueueStats {
            pending: state.pending.len(),
            processing: state.processing.len(),
            available_slots: max_concurrent.saturating_sub(state.processing.len()),
            max_concurrent,
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// Runs one admitted job to completion, then frees the slot and admits
    /// the next pending job under the same lock acquisition.
    fn spawn_task(
        inner: Arc<QueueInner>,
        job_id: String,
        url: String,
        options: AuditOptions,
        token: CancellationToken,
    ) {
        inner.store.mark_running(&job_id);

        tokio::spawn(async move {
            let started = Instant::now();
            let job_timeout = inner.config.job_timeout;

            let outcome = {
                let run =
                    AssertUnwindSafe(inner.pipeline.run(&url, &options, &token)).catch_unwind();
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => match result {
                        Ok(report) => report,
                        Err(_) => Err(AuditError::Internal("audit task panicked".to_string())),
                    },
                    _ = tokio::time::sleep(job_timeout) => {
                        // Cancel in-flight fetch/render work, then drain the
                        // pipeline so breaker trials resolve before the slot is
                        // freed. Cancellation points make this near-immediate.
                        token.cancel();
                        let _ = tokio::time::timeout(CANCEL_GRACE, &mut run).await;
                        Err(AuditError::Timeout(job_timeout))
                    }
                }
            };

            let elapsed = started.elapsed();
            let success = match outcome {
                Ok(report) => {
                    inner.store.save_result(&job_id, report);
                    info!(job_id = %job_id, ?elapsed, "audit completed");
                    true
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, ?elapsed, "audit failed");
                    inner.store.fail_job(&job_id, e.error_code(), &e.to_string());
                    false
                }
            };
            inner.metrics.record_audit(elapsed, success);

            Self::finish_job(inner, &job_id, elapsed, success);
        });
    }

    /// The finally-style tail: removes the job from `processing` and, in the
    /// same critical section, promotes the next pending job into the freed
    /// slot so the ceiling can never be overshot between the two steps.
    fn finish_job(inner: Arc<QueueInner>, job_id: &str, elapsed: Duration, success: bool) {
        let next = {
            let mut state = inner.state.lock().unwrap();
            state.processing.remove(job_id);
            state.total_busy += elapsed;
            if success {
                state.completed += 1;
            } else {
                state.failed += 1;
            }

            let promoted = if let Some(pending) = state.pending.pop_front() {
                let token = CancellationToken::new();
                state
                    .processing
                    .insert(pending.job_id.clone(), token.clone());
                Some((pending, token))
            } else {
                None
            };

            inner.metrics.set_queue_depth(state.pending.len());
            inner.metrics.set_active_audits(state.processing.len());
            promoted
        };

        if let Some((pending, token)) = next {
            debug!(job_id = %pending.job_id, "admitting next pending audit");
            Self::spawn_task(inner, pending.job_id, pending.url, pending.options, token);
        }
    }
}

/// Arrival-order estimate from the average duration of finished jobs; falls
/// back to the static budget before any history exists.
fn estimate_wait(state: &QueueState, max_concurrent: usize, position: usize) -> Duration {
    let finished = state.completed + state.failed;
    let average = if finished > 0 {
        state.total_busy / finished as u32
    } else {
        Duration::from_secs(30)
    };
    let rounds = position.div_ceil(max_concurrent.max(1)) as u32;
    average * rounds
}
