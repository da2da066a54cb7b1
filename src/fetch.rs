//! Static-phase HTML fetching
//!
//! The fetcher is the pipeline's first suspension point and its only fatal
//! one: a page that cannot be fetched at all fails the whole job. The trait
//! seam exists so tests and embedders can substitute their own transport.

use crate::{AuditError, AuditOptions, Config};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub elapsed: Duration,
}

#[async_trait]
pub trait HtmlFetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &AuditOptions) -> Result<FetchedPage, AuditError>;
}

/// Production fetcher backed by a shared reqwest client.
///
/// Error HTTP statuses still yield a page (the analyzers see what a crawler
/// would see); only transport-level failures are fetch errors.
pub struct HttpFetcher {
    client: reqwest::Client,
    default_user_agent: String,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self, AuditError> {
        let client = reqwest::Client::builder()
            .timeout(config.static_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| AuditError::ConfigurationError(e.to_string()))?;

        let default_user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("audit-engine/{}", env!("CARGO_PKG_VERSION")));

        Ok(Self {
            client,
            default_user_agent,
        })
    }
}

#[async_trait]
impl HtmlFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, options: &AuditOptions) -> Result<FetchedPage, AuditError> {
        let started = Instant::now();
        let user_agent = options
            .user_agent
            .as_deref()
            .unwrap_or(&self.default_user_agent);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| AuditError::FetchFailed(e.to_string()))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let html = response
            .text()
            .await
            .map_err(|e| AuditError::FetchFailed(e.to_string()))?;

        let elapsed = started.elapsed();
        debug!(url, status, bytes = html.len(), ?elapsed, "fetched page");

        Ok(FetchedPage {
            html,
            status,
            final_url,
            content_type,
            elapsed,
        })
    }
}
