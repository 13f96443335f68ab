use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use phonecheck::config::{CacheBackend, Config};
use phonecheck::models::{JobId, JobStatusView, PhoneNumber, Provider};
use phonecheck::pool::{EndpointPool, TcpProbe};
use phonecheck::repository::{JobRepository, SqliteJobRepository};
use phonecheck::strategy::StrategySelector;
use phonecheck::utils::phone::read_phone_list;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "phonecheck",
    version,
    about = "Phone number verification scheduler: configuration, routing and job tools",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, env = "PHONECHECK_LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// Print Prometheus metrics gathered while the command ran
    #[arg(long, global = true)]
    print_metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print a summary
    CheckConfig,

    /// Show the provider order each number would be tried in
    Route {
        /// Numbers to route
        numbers: Vec<String>,

        /// Read numbers from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Force a single provider
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Print the status of a stored job as JSON
    Job {
        /// Job id
        id: String,

        /// SQLite job database
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Probe every configured endpoint once
    Probe,

    /// Remove every entry from the shared result cache
    FlushCache,

    /// Delete finished jobs older than the given age
    Purge {
        /// SQLite job database
        #[arg(long)]
        db: Option<PathBuf>,

        /// Minimum age in days
        #[arg(long, default_value = "30")]
        older_than_days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    // Initialize tracing/logging
    setup_tracing(&cli.log_format, &config.logging.level, cli.verbose)?;

    if let Err(e) = phonecheck::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    match cli.command {
        Commands::CheckConfig => check_config(&config)?,
        Commands::Route {
            numbers,
            file,
            provider,
        } => route(&config, numbers, file, provider)?,
        Commands::Job { id, db } => job(&config, id, db).await?,
        Commands::Probe => probe(&config).await?,
        Commands::FlushCache => flush_cache(&config).await?,
        Commands::Purge {
            db,
            older_than_days,
        } => purge(&config, db, older_than_days).await?,
    }

    if cli.print_metrics {
        let text = phonecheck::metrics::encode_metrics()
            .map_err(|e| anyhow::anyhow!("failed to encode metrics: {e}"))?;
        print!("{text}");
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env();
            Ok(config)
        }
        None => Ok(Config::from_env()?),
    }
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("phonecheck=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("phonecheck={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    println!("Configuration OK");
    println!("  Endpoints: {}", config.pool.endpoints.len());
    for provider in Provider::all() {
        let count = config
            .pool
            .endpoints
            .iter()
            .filter(|e| e.provider == provider)
            .count();
        if count > 0 {
            println!("    {provider}: {count}");
        }
    }
    println!("  Workers: {}", config.worker_count());
    println!(
        "  Retries: {} attempts, {}ms base, {}ms cap",
        config.scheduler.max_attempts, config.scheduler.base_delay_ms, config.scheduler.max_delay_ms
    );
    println!(
        "  Cache: {}",
        if config.cache.enabled {
            format!("{:?}, ttl {}s", config.cache.backend, config.cache.ttl_secs)
        } else {
            "disabled".to_string()
        }
    );
    println!("  Repository: {:?}", config.repository.backend);
    println!(
        "  Coordinator: {}",
        if config.coordinator.enabled { "redis" } else { "in-process" }
    );
    Ok(())
}

fn route(
    config: &Config,
    mut numbers: Vec<String>,
    file: Option<PathBuf>,
    provider: Option<String>,
) -> Result<()> {
    if let Some(file) = file {
        numbers.extend(read_phone_list(&file)?);
    }
    if numbers.is_empty() {
        anyhow::bail!("no numbers given");
    }

    let forced: Option<Provider> = provider.map(|p| p.parse()).transpose()?;
    let selector = StrategySelector::new(config.routing.clone())?;

    for raw in &numbers {
        match PhoneNumber::parse(raw) {
            Ok(number) => {
                let providers: Vec<String> = selector
                    .select(&number, forced)
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                println!("{number}\t{}", providers.join(" -> "));
            }
            Err(e) => println!("{raw}\tinvalid: {e}"),
        }
    }
    Ok(())
}

fn open_repository(config: &Config, db: Option<PathBuf>) -> Result<SqliteJobRepository> {
    let path = db.unwrap_or_else(|| config.repository.sqlite_path.clone());
    if !path.exists() {
        anyhow::bail!("job database not found: {}", path.display());
    }
    Ok(SqliteJobRepository::new(&path)?)
}

async fn job(config: &Config, id: String, db: Option<PathBuf>) -> Result<()> {
    let repository = open_repository(config, db)?;
    let record = repository.get(&JobId::from(id)).await?;
    println!("{}", serde_json::to_string_pretty(&JobStatusView::from(&record))?);
    Ok(())
}

async fn probe(config: &Config) -> Result<()> {
    let pool = EndpointPool::in_process(
        config.pool_options(),
        Arc::new(TcpProbe::new(Duration::from_millis(config.pool.probe_timeout_ms))),
    );
    for endpoint in &config.pool.endpoints {
        pool.register(endpoint.clone()).await;
    }

    pool.probe_all().await;
    for status in pool.endpoints().await {
        println!(
            "{}\t{}\t{}\t{}",
            status.endpoint.id,
            status.endpoint.provider,
            status.endpoint.address,
            status.health.as_str()
        );
    }

    let stats = pool.stats().await;
    println!(
        "{} healthy, {} unreachable of {}",
        stats.healthy, stats.unreachable, stats.total
    );
    Ok(())
}

async fn flush_cache(config: &Config) -> Result<()> {
    if !config.cache.enabled || config.cache.backend != CacheBackend::Redis {
        println!("No shared cache configured; the in-memory cache lives inside the scheduler process");
        return Ok(());
    }

    let redis = config.connect_redis().await?;
    if let Some(cache) = config.build_cache(redis.as_ref())? {
        let removed = cache.invalidate_all().await?;
        println!("Removed {removed} cache entries");
    }
    Ok(())
}

async fn purge(config: &Config, db: Option<PathBuf>, older_than_days: u32) -> Result<()> {
    let repository = open_repository(config, db)?;
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
    let purged = repository.purge_finished_before(cutoff).await?;
    println!("Purged {purged} finished jobs");
    Ok(())
}
