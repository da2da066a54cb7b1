//! Service bootstrap and public entry points
//!
//! `AuditService` is constructed once at process startup and passed by
//! reference into request handlers; there is no global instance. It owns the
//! job store, the queue, the memory monitor, and the rendering pipeline, and
//! wires the store's retention sweep into the monitor as a pressure cleanup.

use crate::{
    health, Admission, AuditError, AuditOptions, AuditQueue, AuditResult, Analyzer, Config,
    HealthSnapshot, HttpFetcher, Job, JobStore, LocalBrowser, MemoryMonitor, Metrics,
    RemoteRenderer, RenderingPipeline,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A job and its result (if finished), as returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: Job,
    pub result: Option<AuditResult>,
}

pub struct AuditService {
    config: Config,
    store: Arc<JobStore>,
    queue: AuditQueue,
    monitor: Arc<MemoryMonitor>,
    metrics: Arc<Metrics>,
    local_browser: Option<Arc<LocalBrowser>>,
}

impl AuditService {
    /// Builds and starts the service. Analyzers come from the embedding
    /// application; the engine itself carries no scoring heuristics.
    pub fn new(config: Config, analyzers: Vec<Arc<dyn Analyzer>>) -> Result<Self, AuditError> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(JobStore::new());
        let fetcher = Arc::new(HttpFetcher::new(&config)?);

        let mut pipeline = RenderingPipeline::new(config.clone(), fetcher, analyzers);
        if let Some(endpoint) = &config.remote_renderer_url {
            pipeline =
                pipeline.with_backend(Arc::new(RemoteRenderer::new(endpoint.clone(), &config)?));
            info!(endpoint = %endpoint, "remote renderer registered");
        }
        let local_browser = if config.enable_local_browser {
            let browser = Arc::new(LocalBrowser::new(config.clone()));
            pipeline = pipeline.with_backend(browser.clone());
            Some(browser)
        } else {
            None
        };

        let queue = AuditQueue::new(
            config.clone(),
            store.clone(),
            Arc::new(pipeline),
            metrics.clone(),
        );

        let monitor = Arc::new(MemoryMonitor::new(config.memory.clone(), metrics.clone()));
        {
            let store = store.clone();
            let retention = config.result_retention;
            monitor.register_cleanup("job-store-sweep", move || {
                store.sweep_expired(retention);
            });
        }
        monitor.start();

        info!(
            max_concurrent = config.max_concurrent_audits,
            max_pending = config.max_pending_audits,
            "audit service started"
        );

        Ok(Self {
            config,
            store,
            queue,
            monitor,
            metrics,
            local_browser,
        })
    }

    /// Submits a URL for auditing; deduplicates against recent submissions.
    pub fn submit_audit(
        &self,
        url: &str,
        options: AuditOptions,
    ) -> Result<Admission, AuditError> {
        let admission = self.queue.add_audit(url, options)?;
        if admission.is_duplicate() {
            self.metrics.record_dedup();
        }
        Ok(admission)
    }

    /// Returns the job and, once finished, its result.
    pub fn poll_job(&self, job_id: &str) -> Result<JobView, AuditError> {
        let (job, result) = self
            .store
            .get_job(job_id)
            .ok_or_else(|| AuditError::JobNotFound(job_id.to_string()))?;
        Ok(JobView { job, result })
    }

    /// Polls until the job reaches a terminal state.
    pub async fn wait_for_job(
        &self,
        job_id: &str,
        poll_interval: Duration,
    ) -> Result<JobView, AuditError> {
        loop {
            let view = self.poll_job(job_id)?;
            if view.job.status.is_terminal() {
                return Ok(view);
            }
            debug!(job_id, status = ?view.job.status, "waiting for audit");
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Combined queue + memory view for the external health endpoint.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        health::evaluate(&self.queue.snapshot(), &self.monitor.stats(), &self.config)
    }

    pub fn queue(&self) -> &AuditQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn memory_monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn shutdown(&self) {
        info!("shutting down audit service");
        self.monitor.shutdown();
        if let Some(browser) = &self.local_browser {
            browser.shutdown().await;
        }
        info!("audit service shutdown complete");
    }
}
