//! Command-line interface implementation.
//!
//! Grounded on the teacher's `Cli`/`CliRunner` split — argument parsing
//! stays in `Cli`, command dispatch stays in `CliRunner` — with the
//! screenshot batch/single/server commands replaced by the run/retry/health
//! surface a scheduled validator actually needs (spec §2: "no always-on
//! service, no per-URL interactive mode").

use crate::browser_pool::BrowserPool;
use crate::coordinator::RunCoordinator;
use crate::health::SystemHealthChecker;
use crate::metrics::HealthThresholds;
use crate::property_source::SqlitePropertySource;
use crate::retry_queue::RetryQueueProcessor;
use crate::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "analytics-validator")]
#[command(about = "Scheduled analytics/tag-manager validation across a property catalog")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Browser pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one full validation pass over the active property catalog.
    Run,

    /// Process one batch of the retry queue and exit.
    Retry,

    /// Validate a configuration file without starting a run.
    ValidateConfig {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },

    /// Show browser pool and backlog health.
    Health {
        #[arg(long, help = "Show per-instance browser health")]
        detailed: bool,
    },
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub async fn new(mut config: Config, args: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(pool_size) = args.pool_size {
            config.browser_pool_size = pool_size;
        }
        if let Some(chrome_path) = &args.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }

        Ok(Self { config })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Run => self.run_validation().await,
            Commands::Retry => self.run_retry_pass().await,
            Commands::ValidateConfig { config } => self.validate_config_file(config).await,
            Commands::Health { detailed } => self.show_health(detailed).await,
        }
    }

    async fn open_pool(&self) -> Result<sqlx::sqlite::SqlitePool, Box<dyn std::error::Error>> {
        Ok(crate::datastore::init_pool(&self.config.datastore_path).await?)
    }

    pub async fn run_validation(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("starting validation run");
        let pool = self.open_pool().await?;
        let browser_pool = Arc::new(BrowserPool::new(self.config.clone()).await?);
        let source = SqlitePropertySource::new(pool.clone());
        let coordinator = RunCoordinator::new(pool, Arc::clone(&browser_pool), self.config.clone());

        let result = coordinator.execute(&source).await;
        browser_pool.shutdown().await;

        match result {
            Ok(run) => {
                println!("run {} finished: {:?}", run.id, run.status);
                println!(
                    "  total={} completed={} failed={}",
                    run.total_properties, run.completed_count, run.failed_count
                );
                Ok(())
            }
            Err(err) => {
                error!("run failed: {err}");
                Err(Box::new(err))
            }
        }
    }

    pub async fn run_retry_pass(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("processing one retry queue batch");
        let pool = self.open_pool().await?;
        let browser_pool = Arc::new(BrowserPool::new(self.config.clone()).await?);
        let processor = RetryQueueProcessor::new(
            pool,
            Arc::clone(&browser_pool),
            self.config.clone(),
            PathBuf::from(&self.config.object_store_root),
        );

        let result = processor.process_once().await;
        browser_pool.shutdown().await;
        result.map_err(|err| {
            error!("retry queue pass failed: {err}");
            Box::new(err) as Box<dyn std::error::Error>
        })
    }

    pub async fn validate_config_file(&self, config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        println!("Validating configuration: {}", config_path.display());

        let config_content = tokio::fs::read_to_string(&config_path).await?;
        let config: Config = serde_json::from_str(&config_content)?;
        validate_config(&config)?;

        println!("Configuration is valid:");
        println!("  Browser pool size: {}", config.browser_pool_size);
        println!("  Phase 1 timeout: {:?}", config.phase1_timeout);
        println!("  Phase 2 timeout: {:?}", config.phase2_timeout);
        println!("  Viewport: {}x{}", config.viewport.width, config.viewport.height);
        println!("  Datastore: {}", config.datastore_path);

        Ok(())
    }

    pub async fn show_health(&self, detailed: bool) -> Result<(), Box<dyn std::error::Error>> {
        println!("System Health Check");
        println!("==================");

        let pool = self.open_pool().await?;
        let browser_pool = Arc::new(BrowserPool::new(self.config.clone()).await?);
        let checker = SystemHealthChecker::new(Arc::clone(&browser_pool), pool, HealthThresholds::default());
        let status = checker.check_system_health().await;

        println!("Overall: {:?}", status.overall);
        println!("Browser pool: {:?} (available: {})", status.browser_pool, status.available_browsers);
        println!("Resources: {:?} (memory: {} bytes)", status.resources, status.memory_usage_bytes);
        println!("Backlog: {:?} (retry queue depth: {})", status.backlog, status.retry_queue_depth);

        if detailed {
            let health_checks = browser_pool.health_check().await;
            println!("\nDetailed Instance Health:");
            for health in health_checks {
                println!(
                    "  Instance {}: {:?} - Properties processed: {}, Age: {:?}, Idle: {:?}, Failures: {}",
                    health.id, health.status, health.properties_processed, health.age, health.idle_time, health.failure_count
                );
            }
        }

        browser_pool.shutdown().await;
        Ok(())
    }
}

fn validate_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if config.browser_pool_size == 0 {
        return Err("Browser pool size must be greater than 0".into());
    }
    if config.phase1_timeout.as_secs() == 0 {
        return Err("Phase 1 timeout must be greater than 0".into());
    }
    if config.phase2_timeout.as_secs() == 0 {
        return Err("Phase 2 timeout must be greater than 0".into());
    }
    if config.viewport.width == 0 || config.viewport.height == 0 {
        return Err("Viewport dimensions must be greater than 0".into());
    }
    Ok(())
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_config_rejects_zero_pool_size() {
        let mut config = Config::default();
        config.browser_pool_size = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn validate_config_accepts_default() {
        assert!(validate_config(&Config::default()).is_ok());
    }
}
