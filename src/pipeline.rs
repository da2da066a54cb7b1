//! Two-pass rendering pipeline with circuit-breaker backend fallback
//!
//! Phase 1 fetches raw HTML and runs the registered analyzers against it;
//! structural heuristics then decide whether the page needs JavaScript to be
//! meaningful. Phase 2 re-renders through the backend chain, each backend
//! behind its own breaker, and re-runs the analyzers on the rendered DOM.
//! Phase 1 failure is the only fatal path; a dead Phase 2 degrades the
//! report instead of failing the job.

use crate::{
    AuditError, AuditOptions, CircuitBreaker, CircuitState, Config, FetchedPage, HtmlFetcher,
    RenderBackend,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inputs handed to each analyzer: the document as served (or as rendered)
/// plus request metadata. Analyzers are pure collaborators; the pipeline
/// composes their sub-scores into the report without interpreting them.
#[derive(Debug, Clone)]
pub struct PageContext<'a> {
    pub url: &'a str,
    pub final_url: &'a str,
    pub html: &'a str,
    pub status: u16,
    pub rendered: bool,
}

pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    fn analyze(&self, page: &PageContext<'_>) -> Result<Value, AuditError>;
}

/// Confidence that the page needs JavaScript rendering to show its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JsSignal {
    None,
    Low,
    High,
}

const FRAMEWORK_MARKERS: &[&str] = &[
    "id=\"root\"",
    "id=\"app\"",
    "id=\"__next\"",
    "__NEXT_DATA__",
    "data-reactroot",
    "ng-version",
    "data-v-app",
    "/_next/static/",
    "webpack",
];

/// Threshold below which the visible body text counts as near-empty.
const SPARSE_TEXT_BYTES: usize = 200;

/// Structural heuristic for the JS-rendering signal: a near-empty visible
/// body alongside framework bundle markers means the served HTML is a shell.
/// Only `High` auto-triggers the second phase.
pub fn detect_js_signal(html: &str) -> JsSignal {
    let markers = FRAMEWORK_MARKERS
        .iter()
        .filter(|marker| html.contains(*marker))
        .count();
    let text_len = visible_text_len(html);

    if (text_len < SPARSE_TEXT_BYTES && markers >= 1) || markers >= 2 {
        JsSignal::High
    } else if markers == 1 {
        JsSignal::Low
    } else {
        JsSignal::None
    }
}

/// Rough visible-text length of the body: tags, scripts, and styles
/// stripped, whitespace ignored. Good enough to tell a content page from an
/// empty app shell. Operates on bytes so multi-byte text cannot split a
/// comparison.
fn visible_text_len(html: &str) -> usize {
    let lower = html.to_lowercase();
    let start = lower.find("<body").unwrap_or(0);
    let bytes = &lower.as_bytes()[start..];

    let mut len = 0;
    let mut in_tag = false;
    let mut in_script = false;
    let mut i = 0;
    while i < bytes.len() {
        let rest = &bytes[i..];
        if !in_tag && (rest.starts_with(b"<script") || rest.starts_with(b"<style")) {
            in_script = true;
        }
        if in_script && (rest.starts_with(b"</script") || rest.starts_with(b"</style")) {
            in_script = false;
        }
        match bytes[i] {
            b'<' => in_tag = true,
            b'>' => in_tag = false,
            c if !in_tag && !in_script && !c.is_ascii_whitespace() => len += 1,
            _ => {}
        }
        i += 1;
    }
    len
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum AuditMode {
    #[serde(rename = "static")]
    Static,
    #[serde(rename = "two-pass")]
    TwoPass,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhaseReport {
    pub completed: bool,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseReport {
    fn skipped() -> Self {
        Self {
            completed: false,
            execution_time_ms: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditPhases {
    #[serde(rename = "static")]
    pub static_html: PhaseReport,
    pub javascript: PhaseReport,
}

/// The merged audit report persisted as a job's result payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditReport {
    pub url: String,
    pub final_url: String,
    pub http_status: u16,
    pub mode: AuditMode,
    pub phases: AuditPhases,
    /// Which backend served the JavaScript phase, or `None` in static mode.
    pub js_backend: Option<String>,
    pub js_signal: JsSignal,
    pub scores: BTreeMap<String, Value>,
    pub generated_at: DateTime<Utc>,
}

struct BackendSlot {
    backend: Arc<dyn RenderBackend>,
    breaker: CircuitBreaker,
}

pub struct RenderingPipeline {
    config: Config,
    fetcher: Arc<dyn HtmlFetcher>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    backends: Vec<BackendSlot>,
}

impl RenderingPipeline {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn HtmlFetcher>,
        analyzers: Vec<Arc<dyn Analyzer>>,
    ) -> Self {
        Self {
            config,
            fetcher,
            analyzers,
            backends: Vec::new(),
        }
    }

    /// Appends a rendering backend to the fallback chain, guarded by its own
    /// breaker. Order matters: earlier backends are preferred.
    pub fn with_backend(mut self, backend: Arc<dyn RenderBackend>) -> Self {
        let breaker = CircuitBreaker::new(
            self.config.breaker.failure_threshold,
            self.config.breaker.cooldown,
        );
        self.backends.push(BackendSlot { backend, breaker });
        self
    }

    /// Breaker state per backend, in fallback order.
    pub fn backend_states(&self) -> Vec<(&'static str, CircuitState)> {
        self.backends
            .iter()
            .map(|slot| (slot.backend.name(), slot.breaker.state()))
            .collect()
    }

    /// Runs the full two-pass audit for one URL.
    pub async fn run(
        &self,
        url: &str,
        options: &AuditOptions,
        cancel: &CancellationToken,
    ) -> Result<AuditReport, AuditError> {
        // Phase 1: static fetch. The only fatal phase.
        let static_started = Instant::now();
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(AuditError::Cancelled),
            result = timeout(self.config.static_timeout, self.fetcher.fetch(url, options)) => {
                match result {
                    Ok(page) => page?,
                    Err(_) => return Err(AuditError::Timeout(self.config.static_timeout)),
                }
            }
        };
        let static_elapsed = static_started.elapsed();

        let js_signal = detect_js_signal(&fetched.html);
        let mut scores = self.run_analyzers(url, &fetched, &fetched.html, false);

        let static_phase = PhaseReport {
            completed: true,
            execution_time_ms: static_elapsed.as_millis() as u64,
            error: None,
        };

        // Phase 2: best-effort JavaScript render.
        let wants_js = options.enable_js || js_signal == JsSignal::High;
        let mut javascript = PhaseReport::skipped();
        let mut js_backend = None;
        let mut mode = AuditMode::Static;

        if wants_js {
            let js_started = Instant::now();
            match self.render_with_fallback(url, options, cancel).await {
                Ok(Some((backend_name, rendered))) => {
                    scores = self.run_analyzers(url, &fetched, &rendered.html, true);
                    javascript = PhaseReport {
                        completed: true,
                        execution_time_ms: js_started.elapsed().as_millis() as u64,
                        error: None,
                    };
                    js_backend = Some(backend_name.to_string());
                    mode = AuditMode::TwoPass;
                }
                Ok(None) => {
                    info!(url, "no rendering backend available, degrading to static");
                    javascript = PhaseReport {
                        completed: false,
                        execution_time_ms: js_started.elapsed().as_millis() as u64,
                        error: Some("no rendering backend available".to_string()),
                    };
                }
                // Cancellation is the one Phase 2 error that propagates: the
                // job budget is gone, so there is no report to degrade into.
                Err(e) => return Err(e),
            }
        }

        Ok(AuditReport {
            url: url.to_string(),
            final_url: fetched.final_url.clone(),
            http_status: fetched.status,
            mode,
            phases: AuditPhases {
                static_html: static_phase,
                javascript,
            },
            js_backend,
            js_signal,
            scores,
            generated_at: Utc::now(),
        })
    }

    /// Walks the backend chain: skips open breakers without any network
    /// attempt, records the outcome of each attempted call. `Ok(None)` means
    /// every backend was unavailable or failed.
    async fn render_with_fallback(
        &self,
        url: &str,
        options: &AuditOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<(&'static str, crate::RenderedPage)>, AuditError> {
        for slot in &self.backends {
            let name = slot.backend.name();
            if !slot.breaker.try_acquire() {
                debug!(backend = name, "circuit open, skipping backend");
                continue;
            }

            match slot
                .backend
                .render(url, options, self.config.render_timeout, cancel)
                .await
            {
                Ok(rendered) => {
                    slot.breaker.record_success();
                    debug!(backend = name, elapsed = ?rendered.elapsed, "render succeeded");
                    return Ok(Some((name, rendered)));
                }
                Err(AuditError::Cancelled) => {
                    // Resolve the breaker acquisition, then bail out; an
                    // aborted render says nothing good about the backend but
                    // must not leave a half-open trial dangling.
                    slot.breaker.record_failure();
                    return Err(AuditError::Cancelled);
                }
                Err(e) => {
                    slot.breaker.record_failure();
                    warn!(backend = name, error = %e, "render backend failed, trying next");
                }
            }
        }
        Ok(None)
    }

    fn run_analyzers(
        &self,
        url: &str,
        fetched: &FetchedPage,
        html: &str,
        rendered: bool,
    ) -> BTreeMap<String, Value> {
        let context = PageContext {
            url,
            final_url: &fetched.final_url,
            html,
            status: fetched.status,
            rendered,
        };

        let mut scores = BTreeMap::new();
        for analyzer in &self.analyzers {
            match analyzer.analyze(&context) {
                Ok(value) => {
                    scores.insert(analyzer.name().to_string(), value);
                }
                Err(e) => {
                    // Analyzer faults are the collaborator's problem; the
                    // audit carries on without that sub-score.
                    warn!(analyzer = analyzer.name(), error = %e, "analyzer failed");
                }
            }
        }
        scores
    }
}
