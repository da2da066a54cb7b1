//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the audit engine:
//! queue admission limits, phase timeouts, idempotency and retention windows,
//! memory watchdog thresholds, and circuit-breaker settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the audit engine
///
/// Controls admission limits, per-phase budgets, and the behavior of the
/// memory watchdog and rendering-backend circuit breakers.
///
/// # Examples
///
/// ```rust
/// use audit_engine::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     max_concurrent_audits: 5,
///     max_pending_audits: 50,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Number of audits processed simultaneously (default: 3)
    ///
    /// Everything beyond this ceiling waits in the FIFO pending queue.
    /// Each running audit may hold an HTTP connection and, in two-pass mode,
    /// a rendering-backend session.
    pub max_concurrent_audits: usize,

    /// Maximum length of the pending queue (default: 100)
    ///
    /// Submissions beyond this limit are rejected with a capacity error
    /// instead of growing memory without bound.
    pub max_pending_audits: usize,

    /// Wall-clock budget for a whole audit job (default: 120 seconds)
    ///
    /// Exceeding it cancels in-flight fetch/render calls, marks the job
    /// failed, and frees the slot for the next pending job.
    pub job_timeout: Duration,

    /// Timeout for the static HTML fetch phase (default: 30 seconds)
    pub static_timeout: Duration,

    /// Timeout for each JavaScript rendering attempt (default: 20 seconds)
    ///
    /// Strictly tighter than the static budget; the JS phase is best-effort
    /// and must not starve the rest of the job.
    pub render_timeout: Duration,

    /// Window during which identical submissions collapse into one job
    /// (default: 10 minutes)
    pub idempotency_window: Duration,

    /// How long finished jobs and results are retained before the pressure
    /// sweep may evict them (default: 1 hour)
    pub result_retention: Duration,

    /// Memory watchdog settings
    pub memory: MemorySettings,

    /// Circuit-breaker settings applied to each rendering backend
    pub breaker: BreakerSettings,

    /// Endpoint of the remote headless-browser rendering service
    /// (default: none)
    ///
    /// When unset, the JS phase goes straight to the local browser fallback.
    pub remote_renderer_url: Option<String>,

    /// Whether the local headless-browser fallback may be used (default: true)
    pub enable_local_browser: bool,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for requests (default: engine default)
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_audits: 3,
            max_pending_audits: 100,
            job_timeout: Duration::from_secs(120),
            static_timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(20),
            idempotency_window: Duration::from_secs(600),
            result_retention: Duration::from_secs(3600),
            memory: MemorySettings::default(),
            breaker: BreakerSettings::default(),
            remote_renderer_url: None,
            enable_local_browser: true,
            chrome_path: None,
            user_agent: None,
        }
    }
}

/// Memory watchdog settings
///
/// The monitor samples process memory on an interval and reacts when usage
/// crosses the warning or critical percentage of `max_heap`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemorySettings {
    /// Sampling interval (default: 30 seconds)
    pub sample_interval: Duration,

    /// Memory ceiling the percentages are computed against (default: 512 MB)
    pub max_heap: u64,

    /// Usage percentage that triggers the registered cleanup callbacks
    /// (default: 75.0)
    pub warning_threshold: f64,

    /// Usage percentage that additionally requests a forced collection
    /// (default: 90.0)
    pub critical_threshold: f64,

    /// Number of samples kept for trend reporting (default: 64)
    pub history_size: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(30),
            max_heap: 512 * 1024 * 1024,
            warning_threshold: 75.0,
            critical_threshold: 90.0,
            history_size: 64,
        }
    }
}

/// Circuit-breaker settings for the rendering backends
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerSettings {
    /// Consecutive failures before a backend's breaker trips open (default: 3)
    pub failure_threshold: usize,

    /// How long an open breaker rejects calls before admitting a trial
    /// (default: 30 seconds)
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Per-request audit options
///
/// Serialized canonically (serde_json) as one half of the idempotency key, so
/// two submissions with equal options and equal normalized URLs collapse into
/// the same job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuditOptions {
    /// Force the JavaScript rendering phase regardless of the static-phase
    /// heuristic (default: false)
    pub enable_js: bool,

    /// Extra settle time after navigation before the rendered DOM is read
    pub wait_time: Option<Duration>,

    /// Per-request User-Agent override
    pub user_agent: Option<String>,
}

impl Config {
    /// Sanity-checks the configuration before the service starts.
    pub fn validate(&self) -> Result<(), crate::AuditError> {
        if self.max_concurrent_audits == 0 {
            return Err(crate::AuditError::ConfigurationError(
                "max_concurrent_audits must be greater than 0".to_string(),
            ));
        }
        if self.max_pending_audits == 0 {
            return Err(crate::AuditError::ConfigurationError(
                "max_pending_audits must be greater than 0".to_string(),
            ));
        }
        if self.job_timeout.is_zero() || self.static_timeout.is_zero() {
            return Err(crate::AuditError::ConfigurationError(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if self.render_timeout >= self.job_timeout {
            return Err(crate::AuditError::ConfigurationError(
                "render_timeout must be smaller than job_timeout".to_string(),
            ));
        }
        if self.memory.warning_threshold >= self.memory.critical_threshold {
            return Err(crate::AuditError::ConfigurationError(
                "memory warning threshold must be below the critical threshold".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(crate::AuditError::ConfigurationError(
                "breaker failure_threshold must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
