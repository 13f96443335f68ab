//! Configuration management for phonecheck
//!
//! Configuration comes from a TOML file or from environment variables, then
//! goes through [`Config::validate`] before any component is built. Invalid
//! routing or endpoint bindings are fatal at startup.
//!
//! ```toml
//! [pool]
//! lease_ttl_secs = 300
//!
//! [[pool.endpoints]]
//! id = "kasp-01"
//! address = "10.0.0.5:4723"
//! provider = "kaspersky"
//!
//! [routing]
//! default = ["truecaller", "getcontact"]
//!
//! [[routing.rules]]
//! prefix = "79"
//! providers = ["kaspersky", "getcontact"]
//! ```

use anyhow::Context;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{MemoryCache, RedisCache, ResultCache};
use crate::coordinator::{self, RedisLeaseStore, RedisWorkQueue};
use crate::error::{Error, Result};
use crate::models::Provider;
use crate::pool::{Endpoint, EndpointPool, InProcessLeaseStore, LeaseStore, PoolOptions, TcpProbe};
use crate::repository::{JobRepository, MemoryJobRepository, SqliteJobRepository};
use crate::scheduler::{Components, InProcessQueue, ProviderRegistry, SchedulerOptions, WorkQueue};
use crate::strategy::{RoutingTable, StrategySelector};
use crate::utils::retry::BackoffPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint pool configuration
    pub pool: PoolConfig,

    /// Provider routing table
    pub routing: RoutingTable,

    /// Worker and retry configuration
    pub scheduler: SchedulerConfig,

    /// Result cache configuration
    pub cache: CacheConfig,

    /// Job storage configuration
    pub repository: RepositoryConfig,

    /// Cross-instance coordination
    pub coordinator: CoordinatorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Endpoint pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Endpoints bound to providers
    pub endpoints: Vec<Endpoint>,

    /// Lease lifetime before the sweep reclaims it
    pub lease_ttl_secs: u64,

    /// How long a worker waits for a free endpoint
    pub acquire_timeout_secs: u64,

    /// Interval between health probe rounds
    pub probe_interval_secs: u64,

    /// Interval between expired-lease sweeps
    pub sweep_interval_secs: u64,

    /// TCP connect timeout of one probe
    pub probe_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            lease_ttl_secs: 300,
            acquire_timeout_secs: 30,
            probe_interval_secs: 30,
            sweep_interval_secs: 5,
            probe_timeout_ms: 2000,
        }
    }
}

/// Worker and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker tasks (0 = one per configured endpoint)
    pub workers: usize,

    /// Full provider cycles per number before it errors
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Bound on one provider lookup
    pub lookup_timeout_secs: u64,

    /// Largest accepted batch after deduplication
    pub max_numbers_per_job: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            lookup_timeout_secs: 60,
            max_numbers_per_job: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Entry lifetime in seconds
    pub ttl_secs: u64,

    pub backend: CacheBackend,

    /// Key prefix for the Redis backend
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 86_400,
            backend: CacheBackend::Memory,
            key_prefix: String::from("phone_check"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryBackend {
    Memory,
    Sqlite,
}

/// Job storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub backend: RepositoryBackend,

    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            backend: RepositoryBackend::Sqlite,
            sqlite_path: PathBuf::from("data/jobs.db"),
        }
    }
}

/// Redis coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Share leases and the work queue through Redis
    pub enabled: bool,

    pub redis_url: String,

    /// Maximum Redis connections
    pub pool_size: usize,

    /// Key namespace shared by all instances of one deployment
    pub namespace: String,

    /// How often waiters re-check for endpoints freed by other instances
    pub poll_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: String::from("redis://localhost:6379"),
            pool_size: 16,
            namespace: String::from("phonecheck"),
            poll_interval_ms: 250,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a comma-separated `host:port` list into endpoints named `{provider}-{n}`
pub fn parse_endpoint_list(provider: Provider, value: &str) -> Vec<Endpoint> {
    value
        .split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .enumerate()
        .map(|(i, address)| Endpoint::new(format!("{provider}-{}", i + 1), address, provider))
        .collect()
}

/// `host:port` with a non-empty host and a non-zero port
fn is_valid_address(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty()
                && !host.contains(char::is_whitespace)
                && matches!(port.parse::<u16>(), Ok(p) if p > 0)
        }
        None => false,
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Override values with `PHONECHECK_*` environment variables.
    ///
    /// `PHONECHECK_<PROVIDER>_ENDPOINTS` replaces the endpoints of that provider.
    pub fn apply_env(&mut self) {
        for provider in Provider::all() {
            let name = format!("PHONECHECK_{}_ENDPOINTS", provider.as_str().to_uppercase());
            if let Ok(value) = std::env::var(&name) {
                self.pool.endpoints.retain(|e| e.provider != provider);
                self.pool.endpoints.extend(parse_endpoint_list(provider, &value));
            }
        }

        if let Some(v) = env_parse("PHONECHECK_LEASE_TTL_SECS") {
            self.pool.lease_ttl_secs = v;
        }
        if let Some(v) = env_parse("PHONECHECK_ACQUIRE_TIMEOUT_SECS") {
            self.pool.acquire_timeout_secs = v;
        }
        if let Some(v) = env_parse("PHONECHECK_WORKERS") {
            self.scheduler.workers = v;
        }
        if let Some(v) = env_parse("PHONECHECK_MAX_ATTEMPTS") {
            self.scheduler.max_attempts = v;
        }
        if let Some(v) = env_parse("PHONECHECK_LOOKUP_TIMEOUT_SECS") {
            self.scheduler.lookup_timeout_secs = v;
        }
        if let Some(v) = env_parse("PHONECHECK_CACHE_ENABLED") {
            self.cache.enabled = v;
        }
        if let Some(v) = env_parse("PHONECHECK_CACHE_TTL_SECS") {
            self.cache.ttl_secs = v;
        }
        match std::env::var("PHONECHECK_CACHE_BACKEND").ok().as_deref() {
            Some("redis") => self.cache.backend = CacheBackend::Redis,
            Some("memory") => self.cache.backend = CacheBackend::Memory,
            _ => {}
        }
        if let Ok(path) = std::env::var("PHONECHECK_SQLITE_PATH") {
            self.repository.backend = RepositoryBackend::Sqlite;
            self.repository.sqlite_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("PHONECHECK_REDIS_URL").or_else(|_| std::env::var("REDIS_URL")) {
            self.coordinator.redis_url = url;
        }
        if let Some(v) = env_parse("PHONECHECK_COORDINATOR_ENABLED") {
            self.coordinator.enabled = v;
        }
        if let Ok(level) = std::env::var("PHONECHECK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("PHONECHECK_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.workers == 0 && self.pool.endpoints.is_empty() {
            return Err(Error::config(
                "no endpoints configured and workers = 0; nothing could run",
            ));
        }

        let mut ids = HashSet::new();
        for endpoint in &self.pool.endpoints {
            if !ids.insert(endpoint.id.as_str()) {
                return Err(Error::config(format!("duplicate endpoint id '{}'", endpoint.id)));
            }
            if !is_valid_address(&endpoint.address) {
                return Err(Error::config(format!(
                    "endpoint '{}' has malformed address '{}' (expected host:port)",
                    endpoint.id, endpoint.address
                )));
            }
        }

        self.routing.validate()?;

        if self.scheduler.max_attempts == 0 {
            return Err(Error::config("max_attempts must be greater than 0"));
        }
        if self.scheduler.backoff_multiplier < 1.0 {
            return Err(Error::config("backoff_multiplier must be at least 1.0"));
        }
        if self.scheduler.max_numbers_per_job == 0 {
            return Err(Error::config("max_numbers_per_job must be greater than 0"));
        }
        if self.pool.lease_ttl_secs == 0 {
            return Err(Error::config("lease_ttl_secs must be greater than 0"));
        }
        if self.scheduler.lookup_timeout_secs >= self.pool.lease_ttl_secs {
            return Err(Error::config(format!(
                "lookup_timeout_secs ({}) must be shorter than lease_ttl_secs ({})",
                self.scheduler.lookup_timeout_secs, self.pool.lease_ttl_secs
            )));
        }

        if self.uses_redis() && self.coordinator.redis_url.trim().is_empty() {
            return Err(Error::config("Redis is required but redis_url is empty"));
        }
        if self.coordinator.pool_size == 0 {
            return Err(Error::config("coordinator pool_size must be greater than 0"));
        }

        if self.repository.backend == RepositoryBackend::Sqlite
            && self.repository.sqlite_path.as_os_str().is_empty()
        {
            return Err(Error::config("sqlite_path must be set for the sqlite backend"));
        }

        Ok(())
    }

    /// Whether any component talks to Redis
    pub fn uses_redis(&self) -> bool {
        self.coordinator.enabled || (self.cache.enabled && self.cache.backend == CacheBackend::Redis)
    }

    /// Workers to start; one per endpoint when unset
    pub fn worker_count(&self) -> usize {
        match self.scheduler.workers {
            0 => self.pool.endpoints.len().max(1),
            n => n,
        }
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.scheduler.max_attempts,
            base_delay_ms: self.scheduler.base_delay_ms,
            max_delay_ms: self.scheduler.max_delay_ms,
            multiplier: self.scheduler.backoff_multiplier,
        }
    }

    #[must_use]
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            lease_ttl: Duration::from_secs(self.pool.lease_ttl_secs),
            poll_interval: Duration::from_millis(self.coordinator.poll_interval_ms.max(1)),
        }
    }

    #[must_use]
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            workers: self.worker_count(),
            backoff: self.backoff_policy(),
            acquire_timeout: Duration::from_secs(self.pool.acquire_timeout_secs),
            lookup_timeout: Duration::from_secs(self.scheduler.lookup_timeout_secs),
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            max_numbers_per_job: self.scheduler.max_numbers_per_job,
            poll_interval: Duration::from_millis(self.coordinator.poll_interval_ms.max(1)),
            drain_timeout: Duration::from_secs(self.pool.lease_ttl_secs),
            probe_interval: self.probe_interval(),
            sweep_interval: self.sweep_interval(),
        }
    }

    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.pool.probe_interval_secs.max(1))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pool.sweep_interval_secs.max(1))
    }

    // =========================================================================
    // Component construction
    // =========================================================================

    /// Connect to Redis when any component needs it
    pub async fn connect_redis(&self) -> Result<Option<Pool>> {
        if !self.uses_redis() {
            return Ok(None);
        }
        let pool = coordinator::connect(&self.coordinator.redis_url, self.coordinator.pool_size).await?;
        Ok(Some(pool))
    }

    fn require_redis<'a>(redis: Option<&'a Pool>, what: &str) -> Result<&'a Pool> {
        redis.ok_or_else(|| Error::config(format!("{what} needs a Redis connection")))
    }

    pub fn build_cache(&self, redis: Option<&Pool>) -> Result<Option<Arc<dyn ResultCache>>> {
        if !self.cache.enabled {
            return Ok(None);
        }
        let cache: Arc<dyn ResultCache> = match self.cache.backend {
            CacheBackend::Memory => Arc::new(MemoryCache::new()),
            CacheBackend::Redis => Arc::new(RedisCache::new(
                Self::require_redis(redis, "redis cache")?.clone(),
                self.cache.key_prefix.clone(),
            )),
        };
        Ok(Some(cache))
    }

    pub fn build_repository(&self) -> Result<Arc<dyn JobRepository>> {
        Ok(match self.repository.backend {
            RepositoryBackend::Memory => Arc::new(MemoryJobRepository::new()),
            RepositoryBackend::Sqlite => Arc::new(SqliteJobRepository::new(&self.repository.sqlite_path)?),
        })
    }

    /// Pool with every configured endpoint registered (health still unknown)
    pub async fn build_pool(&self, redis: Option<&Pool>) -> Result<Arc<EndpointPool>> {
        let store: Arc<dyn LeaseStore> = if self.coordinator.enabled {
            Arc::new(RedisLeaseStore::new(
                Self::require_redis(redis, "coordinator")?.clone(),
                self.coordinator.namespace.clone(),
            ))
        } else {
            Arc::new(InProcessLeaseStore::new())
        };
        let probe = Arc::new(TcpProbe::new(Duration::from_millis(self.pool.probe_timeout_ms)));

        let pool = Arc::new(EndpointPool::new(self.pool_options(), store, probe));
        for endpoint in &self.pool.endpoints {
            pool.register(endpoint.clone()).await;
        }
        Ok(pool)
    }

    pub fn build_queue(&self, redis: Option<&Pool>) -> Result<Arc<dyn WorkQueue>> {
        if !self.coordinator.enabled {
            return Ok(Arc::new(InProcessQueue::new()));
        }
        Ok(Arc::new(RedisWorkQueue::new(
            Self::require_redis(redis, "coordinator")?.clone(),
            &self.coordinator.namespace,
            Duration::from_millis(self.coordinator.poll_interval_ms.max(1)),
        )))
    }

    /// Validate, connect and assemble everything the scheduler needs
    pub async fn build_components(&self, registry: ProviderRegistry) -> Result<Components> {
        self.validate()?;
        let redis = self.connect_redis().await?;

        Ok(Components {
            pool: self.build_pool(redis.as_ref()).await?,
            cache: self.build_cache(redis.as_ref())?,
            selector: StrategySelector::new(self.routing.clone())?,
            registry,
            repository: self.build_repository()?,
            queue: self.build_queue(redis.as_ref())?,
        })
    }
}
