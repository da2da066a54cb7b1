//! JavaScript rendering backends for the second audit phase
//!
//! Two production backends sit behind the `RenderBackend` trait: a remote
//! headless-browser RPC service (preferred, keeps CPU and memory off this
//! process) and a lazily launched local Chrome driven over CDP. Each call
//! carries a cancellation token so a job timeout aborts the render instead
//! of abandoning it.

use crate::{AuditError, AuditOptions, Config};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub final_url: Option<String>,
    pub elapsed: Duration,
}

#[async_trait]
pub trait RenderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Renders the page with JavaScript executed, bounded by `budget` and
    /// abortable through `cancel`.
    async fn render(
        &self,
        url: &str,
        options: &AuditOptions,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<RenderedPage, AuditError>;
}

#[derive(Serialize)]
struct RemoteRenderRequest<'a> {
    url: &'a str,
    wait_ms: u64,
}

#[derive(Deserialize)]
struct RemoteRenderResponse {
    html: String,
    final_url: Option<String>,
}

/// Client for the remote headless-browser rendering service.
pub struct RemoteRenderer {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteRenderer {
    pub fn new(endpoint: String, config: &Config) -> Result<Self, AuditError> {
        let client = reqwest::Client::builder()
            .timeout(config.render_timeout)
            .build()
            .map_err(|e| AuditError::ConfigurationError(e.to_string()))?;

        Ok(Self { client, endpoint })
    }

    async fn call(&self, url: &str, options: &AuditOptions) -> Result<RenderedPage, AuditError> {
        let started = Instant::now();
        let request = RemoteRenderRequest {
            url,
            wait_ms: options.wait_time.map(|d| d.as_millis() as u64).unwrap_or(0),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AuditError::BackendUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuditError::RenderFailed(format!(
                "remote renderer returned {}",
                response.status()
            )));
        }

        let body: RemoteRenderResponse = response
            .json()
            .await
            .map_err(|e| AuditError::RenderFailed(e.to_string()))?;

        Ok(RenderedPage {
            html: body.html,
            final_url: body.final_url,
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl RenderBackend for RemoteRenderer {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn render(
        &self,
        url: &str,
        options: &AuditOptions,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<RenderedPage, AuditError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AuditError::Cancelled),
            result = timeout(budget, self.call(url, options)) => match result {
                Ok(page) => page,
                Err(_) => Err(AuditError::Timeout(budget)),
            },
        }
    }
}

struct LaunchedBrowser {
    browser: Browser,
    handler: tokio::task::JoinHandle<()>,
}

/// Local headless Chrome fallback, launched lazily on first use.
///
/// Launch failure (no Chrome in the runtime) surfaces as
/// `BackendUnavailable`, which the pipeline's circuit breaker absorbs like
/// any other backend failure.
pub struct LocalBrowser {
    config: Config,
    launched: Mutex<Option<LaunchedBrowser>>,
}

impl LocalBrowser {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            launched: Mutex::new(None),
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig, AuditError> {
        let unique_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
        let mut args = vec![
            "--headless".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            "--disable-extensions".to_string(),
            "--disable-default-apps".to_string(),
            "--disable-sync".to_string(),
            "--no-first-run".to_string(),
            "--memory-pressure-off".to_string(),
            format!("--user-data-dir=/tmp/audit-engine-chrome-{unique_id}"),
        ];

        if let Some(user_agent) = &self.config.user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }

        let mut builder = BrowserConfig::builder().args(args);
        if let Some(chrome_path) = &self.config.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }

        builder.build().map_err(AuditError::BrowserLaunchFailed)
    }

    async fn ensure_launched(&self) -> Result<(), AuditError> {
        let mut launched = self.launched.lock().await;
        if let Some(existing) = launched.as_ref() {
            if !existing.handler.is_finished() {
                return Ok(());
            }
            warn!("local browser handler exited, relaunching");
            launched.take();
        }

        let browser_config = self.browser_config()?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| AuditError::BrowserLaunchFailed(e.to_string()))?;

        // The CDP handler is a stream that must be polled for the browser
        // connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("local browser handler error: {e}");
                    break;
                }
            }
            debug!("local browser handler stream ended");
        });

        info!("local browser launched");
        *launched = Some(LaunchedBrowser {
            browser,
            handler: handler_task,
        });
        Ok(())
    }

    async fn render_page(
        &self,
        url: &str,
        options: &AuditOptions,
    ) -> Result<RenderedPage, AuditError> {
        let started = Instant::now();
        self.ensure_launched().await?;

        let launched = self.launched.lock().await;
        let browser = &launched
            .as_ref()
            .ok_or_else(|| AuditError::BackendUnavailable("local browser not running".into()))?
            .browser;

        let page = browser
            .new_page(url)
            .await
            .map_err(|e| AuditError::RenderFailed(e.to_string()))?;

        page.wait_for_navigation()
            .await
            .map_err(|e| AuditError::RenderFailed(e.to_string()))?;

        if let Some(wait) = options.wait_time {
            sleep(wait).await;
        }

        let html = page
            .content()
            .await
            .map_err(|e| AuditError::RenderFailed(e.to_string()))?;
        let final_url = page.url().await.ok().flatten();
        let _ = page.close().await;

        Ok(RenderedPage {
            html,
            final_url,
            elapsed: started.elapsed(),
        })
    }

    pub async fn shutdown(&self) {
        let mut launched = self.launched.lock().await;
        if let Some(mut existing) = launched.take() {
            let _ = existing.browser.close().await;
            existing.handler.abort();
            info!("local browser shut down");
        }
    }
}

#[async_trait]
impl RenderBackend for LocalBrowser {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn render(
        &self,
        url: &str,
        options: &AuditOptions,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<RenderedPage, AuditError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AuditError::Cancelled),
            result = timeout(budget, self.render_page(url, options)) => match result {
                Ok(page) => page,
                Err(_) => Err(AuditError::Timeout(budget)),
            },
        }
    }
}
