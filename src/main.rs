use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration_monitor::performance::ResourceSampler;
use migration_monitor::{
    MigrationMonitor, MonitorConfig, MonitoringRepository, PostgresMonitoringRepository,
};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "migration-monitor")]
#[command(about = "Observability and adaptive tuning for long-running data migrations")]
#[command(version)]
struct Cli {
    /// TOML config file; environment variables still apply on top
    #[arg(long, global = true, env = "MIGRATION_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print one system resource snapshot as JSON
    Sample,
    /// Create the monitoring tables
    InitDb,
    /// Run one retention pass against the database
    Retention,
    /// Run the monitor until Ctrl+C, then print the optimization summary
    Run,
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    init_logging(&config, cli.json || config.json_logs);

    match cli.command {
        Commands::Sample => {
            let sampler = ResourceSampler::new(config.sampler.clone());
            let snapshot = sampler.sample().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Commands::InitDb => {
            let repository = connect(&config).await?;
            repository
                .ensure_schema()
                .await
                .context("Failed to create monitoring schema")?;
            info!("Monitoring schema is ready");
            Ok(())
        }
        Commands::Retention => {
            let repository = connect(&config).await?;
            let monitor = MigrationMonitor::start_without_loops(config, repository)?;
            let report = monitor.run_retention().await;
            monitor.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.completed {
                anyhow::bail!("Retention pass did not complete");
            }
            Ok(())
        }
        Commands::Run => run(config).await,
        Commands::ShowConfig => {
            let mut shown = config.clone();
            shown.database_url = config.safe_database_url();
            println!("{}", toml::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<MonitorConfig> {
    let config = match path {
        Some(path) => {
            dotenv::dotenv().ok();
            let mut config = MonitorConfig::from_toml_file(path)?;
            config.apply_env()?;
            config
        }
        None => MonitorConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &MonitorConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect(config: &MonitorConfig) -> Result<Arc<dyn MonitoringRepository>> {
    let url = config.require_database_url()?;
    info!("Connecting to {}", config.safe_database_url());

    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    Ok(Arc::new(PostgresMonitoringRepository::new(Arc::new(pool))))
}

async fn run(config: MonitorConfig) -> Result<()> {
    let repository = connect(&config).await?;
    repository
        .ensure_schema()
        .await
        .context("Failed to create monitoring schema")?;

    let monitor = MigrationMonitor::start(config, repository)?;
    info!("Migration monitor running; press Ctrl+C to stop");

    wait_for_shutdown().await;

    let clean = monitor.shutdown().await;
    if !clean {
        error!("Some queued telemetry was lost during shutdown");
    }

    let summary = monitor.get_optimization_summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate signal handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
