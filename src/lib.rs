//! # Audit Engine
//!
//! The audit-execution core of a website SEO/AI-readiness auditor: an
//! admission-controlled job queue with request deduplication, a memory
//! watchdog that triggers cleanup under pressure, and a two-pass rendering
//! pipeline that escalates from static HTML analysis to JavaScript rendering
//! across multiple backends with circuit-breaker fallback.
//!
//! ## Architecture
//!
//! | Component | Responsibility |
//! |-----------|----------------|
//! | `JobStore` | Idempotent job registry and result cache keyed by normalized URL + options |
//! | `AuditQueue` | Bounded-concurrency admission control with FIFO overflow |
//! | `MemoryMonitor` | Periodic watchdog firing cleanup callbacks under pressure |
//! | `RenderingPipeline` | Static fetch, JS-need heuristics, breaker-guarded render fallback |
//! | `AuditService` | Bootstrap wiring and the public submit/poll/health surface |
//!
//! Analyzers (SEO, schema, accessibility, AI-readiness scoring) are external
//! collaborators registered through the [`Analyzer`] trait; the engine
//! composes their sub-scores into the report without interpreting them.
//!
//! ## Guarantees
//!
//! - At most `max_concurrent_audits` jobs process simultaneously; overflow
//!   waits in arrival order and is bounded by `max_pending_audits`.
//! - Identical submissions within the idempotency window collapse into one
//!   job and share its result.
//! - A failing or timed-out job always frees its slot; in-flight renders are
//!   cancelled, not abandoned.
//! - JavaScript-phase failures degrade the report to static-only; only a
//!   failed static fetch fails a job.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use audit_engine::{AuditOptions, AuditService, Config};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = AuditService::new(Config::default(), Vec::new())?;
//!
//!     let admission = service.submit_audit("https://example.com", AuditOptions::default())?;
//!     let view = service
//!         .wait_for_job(admission.job_id(), Duration::from_millis(250))
//!         .await?;
//!     println!("audit finished: {:?}", view.job.status);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Single audit
//! ```bash
//! audit-engine audit --url https://example.com --js
//! ```
//!
//! ### Batch processing
//! ```bash
//! audit-engine batch --input urls.txt --output reports/
//! ```

/// Configuration and per-request audit options
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Circuit breakers guarding the rendering backends
pub mod circuit;

/// Idempotent job registry and result cache
pub mod store;

/// Bounded-concurrency admission control
pub mod queue;

/// Memory watchdog with pressure-triggered cleanups
pub mod memory;

/// Static-phase HTML fetching
pub mod fetch;

/// JavaScript rendering backends
pub mod render;

/// Two-pass audit pipeline and analyzer seam
pub mod pipeline;

/// Service bootstrap and public entry points
pub mod service;

/// Health snapshot for the external health endpoint
pub mod health;

/// Performance metrics collection
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

#[cfg(test)]
mod tests;

pub use circuit::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use fetch::*;
pub use health::*;
pub use memory::*;
pub use metrics::*;
pub use pipeline::*;
pub use queue::*;
pub use render::*;
pub use service::*;
pub use store::*;
