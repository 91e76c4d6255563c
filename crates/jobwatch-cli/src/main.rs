use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_client::{SearchClient, SearchClientConfig};
use jobwatch_core::{AreaDirectory, FilterNormalizer};
use jobwatch_engine::{BotCommands, SchedulerConfig, SchedulerService};
use jobwatch_notify::{ConsoleSink, Dispatcher};
use jobwatch_storage::{Database, SqliteStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Vacancy watch notifier: periodic search with per-user filters")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the notifier until interrupted.
    Run,
    /// Run a single check pass and exit.
    Check,
    /// Apply the database schema and exit.
    Migrate,
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    database_url: String,
    search_api_base: String,
    user_agent: String,
    http_timeout_secs: u64,
    check_interval_minutes: u64,
    areas_file: Option<PathBuf>,
}

impl RuntimeConfig {
    fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://jobwatch.db".to_string()),
            search_api_base: env::var("SEARCH_API_BASE")
                .unwrap_or_else(|_| jobwatch_client::DEFAULT_BASE_URL.to_string()),
            user_agent: env::var("JOBWATCH_USER_AGENT")
                .unwrap_or_else(|_| jobwatch_client::DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env::var("JOBWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            check_interval_minutes: env::var("CHECK_INTERVAL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            areas_file: env::var("JOBWATCH_AREAS_FILE").ok().map(PathBuf::from),
        }
    }
}

async fn build_service(config: &RuntimeConfig) -> Result<Arc<SchedulerService>> {
    let database = Database::connect(&config.database_url).await?;
    database.migrate().await?;
    let store = Arc::new(SqliteStore::new(&database));

    let search = Arc::new(SearchClient::new(SearchClientConfig {
        base_url: config.search_api_base.clone(),
        user_agent: config.user_agent.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?);

    let areas = match &config.areas_file {
        Some(path) => AreaDirectory::from_yaml_file(path)?,
        None => AreaDirectory::default(),
    };

    let service = SchedulerService::new(
        search,
        store.clone(),
        store.clone(),
        store,
        Dispatcher::new(Arc::new(ConsoleSink)),
        FilterNormalizer::new(areas),
        SchedulerConfig::default(),
    )
    .await?;
    Ok(Arc::new(service))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let service = build_service(&config).await?;
            let commands = BotCommands::new(Arc::clone(&service));

            let reply = commands.start(config.check_interval_minutes).await?;
            info!("{reply}");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            service.stop().await?;
            info!("shutdown complete");
        }
        Commands::Check => {
            let service = build_service(&config).await?;
            match service.run_pass().await {
                Some(summary) => println!(
                    "check complete: run_id={} checked={} skipped={} failed={} notified={}",
                    summary.run_id,
                    summary.users_checked,
                    summary.users_skipped,
                    summary.users_failed,
                    summary.notified
                ),
                None => println!("check skipped: another pass already in flight"),
            }
        }
        Commands::Migrate => {
            let database = Database::connect(&config.database_url).await?;
            database.migrate().await?;
            println!("database schema up to date");
        }
    }

    Ok(())
}
