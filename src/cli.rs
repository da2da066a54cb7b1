use crate::{AuditOptions, AuditService, Config, JobStatus};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "audit-engine")]
#[command(about = "Concurrency-controlled website audit engine")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Maximum concurrent audits")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "Job timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Remote renderer endpoint URL")]
    pub remote_renderer: Option<String>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Audit a single URL and print the report
    Audit {
        #[arg(short, long, help = "URL to audit")]
        url: String,

        #[arg(long, help = "Force the JavaScript rendering phase")]
        js: bool,

        #[arg(long, help = "Settle time in milliseconds before reading the rendered DOM")]
        wait: Option<u64>,

        #[arg(short, long, help = "Write the report to this file instead of stdout")]
        output: Option<PathBuf>,
    },

    /// Audit URLs from a file (one per line), writing one report per job
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory for report JSON files")]
        output: PathBuf,

        #[arg(long, help = "Force the JavaScript rendering phase")]
        js: bool,
    },

    /// Print a health snapshot of a freshly started service
    Health,

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<AuditService>,
}

impl CliRunner {
    pub fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        // The CLI runs the engine without application analyzers; embedders
        // register their SEO/schema/accessibility scorers through the
        // library API.
        let service = Arc::new(AuditService::new(config.clone(), Vec::new())?);
        Ok(Self { config, service })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Audit {
                url,
                js,
                wait,
                output,
            } => self.run_audit(&url, js, wait, output).await,
            Commands::Batch { input, output, js } => self.run_batch(&input, &output, js).await,
            Commands::Health => self.show_health(),
            Commands::Validate { config } => Self::validate_config(&config).await,
        }
    }

    async fn run_audit(
        &self,
        url: &str,
        js: bool,
        wait: Option<u64>,
        output: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let options = AuditOptions {
            enable_js: js,
            wait_time: wait.map(Duration::from_millis),
            ..Default::default()
        };

        let admission = self.service.submit_audit(url, options)?;
        info!(job_id = %admission.job_id(), "audit submitted");

        let view = self
            .service
            .wait_for_job(admission.job_id(), Duration::from_millis(250))
            .await?;

        match view.job.status {
            JobStatus::Succeeded => {
                let report = serde_json::to_string_pretty(&view.result)?;
                match output {
                    Some(path) => {
                        fs::write(&path, report).await?;
                        info!("report written to {}", path.display());
                    }
                    None => println!("{report}"),
                }
                Ok(())
            }
            _ => {
                error!(
                    code = view.job.error_code.as_deref().unwrap_or("unknown"),
                    "audit failed: {}",
                    view.job.error_details.as_deref().unwrap_or("no details")
                );
                Err("audit failed".into())
            }
        }
    }

    async fn run_batch(
        &self,
        input: &PathBuf,
        output: &PathBuf,
        js: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let urls = Self::read_urls_from_file(input).await?;
        info!("loaded {} URLs from {}", urls.len(), input.display());
        fs::create_dir_all(output).await?;

        let options = AuditOptions {
            enable_js: js,
            ..Default::default()
        };

        let mut job_ids = Vec::new();
        for url in &urls {
            match self.service.submit_audit(url, options.clone()) {
                Ok(admission) => job_ids.push(admission.job_id().to_string()),
                Err(e) => warn!(url = %url, error = %e, "submission rejected"),
            }
        }

        let mut succeeded = 0_usize;
        let mut failed = 0_usize;
        for job_id in &job_ids {
            let view = self
                .service
                .wait_for_job(job_id, Duration::from_millis(250))
                .await?;
            if view.job.status == JobStatus::Succeeded {
                succeeded += 1;
            } else {
                failed += 1;
            }
            let path = output.join(format!("{job_id}.json"));
            fs::write(&path, serde_json::to_string_pretty(&view)?).await?;
        }

        info!(succeeded, failed, "batch complete");
        Ok(())
    }

    fn show_health(&self) -> Result<(), Box<dyn std::error::Error>> {
        let snapshot = self.service.health_snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        Ok(())
    }

    async fn validate_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        info!("configuration {} is valid", path.display());
        Ok(())
    }

    async fn read_urls_from_file(path: &PathBuf) -> Result<Vec<String>, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path).await?;
        Ok(content
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.to_string())
            .collect())
    }
}

/// Initializes the tracing subscriber for the binary.
pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| format!("failed to initialize logging: {e}"))?;

    Ok(())
}
