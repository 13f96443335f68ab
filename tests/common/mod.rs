//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use phonecheck::cache::{MemoryCache, ResultCache};
use phonecheck::models::{CheckStatus, LookupOutcome, PhoneNumber, Provider};
use phonecheck::pool::{Endpoint, EndpointPool, HealthProbe, HealthState, PoolOptions};
use phonecheck::repository::{JobRepository, MemoryJobRepository};
use phonecheck::scheduler::{
    Components, InProcessQueue, LookupError, LookupProvider, ProviderRegistry, Scheduler,
    SchedulerOptions, WorkQueue,
};
use phonecheck::strategy::{RouteRule, RoutingTable, StrategySelector};
use phonecheck::utils::retry::BackoffPolicy;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Probe that reports a fixed health state
pub struct StaticProbe(pub HealthState);

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn check(&self, _endpoint: &Endpoint) -> HealthState {
        self.0
    }
}

/// One scripted lookup response
#[derive(Debug, Clone)]
pub enum Step {
    Answer(CheckStatus),
    Transient,
    Terminal,
}

/// Lookup driver replaying a script, then repeating a fallback step.
///
/// Also records whether two lookups ever ran on the same endpoint at once.
pub struct ScriptedProvider {
    provider: Provider,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    calls: AtomicUsize,
    in_use: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(provider: Provider, fallback: Step) -> Self {
        Self {
            provider,
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_use: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
        }
    }

    pub fn answering(provider: Provider, status: CheckStatus) -> Self {
        Self::new(provider, Step::Answer(status))
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

struct Occupied<'a> {
    in_use: &'a Mutex<HashSet<String>>,
    endpoint_id: &'a str,
}

impl Drop for Occupied<'_> {
    fn drop(&mut self) {
        self.in_use.lock().unwrap().remove(self.endpoint_id);
    }
}

#[async_trait]
impl LookupProvider for ScriptedProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn lookup(
        &self,
        endpoint: &Endpoint,
        _number: &PhoneNumber,
    ) -> Result<LookupOutcome, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.in_use.lock().unwrap().insert(endpoint.id.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        // Frees the endpoint even when the lookup is cancelled mid-sleep
        let _occupied = Occupied {
            in_use: &self.in_use,
            endpoint_id: &endpoint.id,
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Answer(status) => Ok(LookupOutcome::new(status)),
            Step::Transient => Err(LookupError::transient("automation session crashed")),
            Step::Terminal => Err(LookupError::terminal("number rejected by provider")),
        }
    }
}

/// Timings small enough for tests
pub fn fast_options() -> SchedulerOptions {
    SchedulerOptions {
        workers: 2,
        backoff: BackoffPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 2.0,
        },
        acquire_timeout: Duration::from_millis(50),
        lookup_timeout: Duration::from_secs(1),
        cache_ttl: Duration::from_secs(60),
        max_numbers_per_job: 100,
        poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(1),
        probe_interval: Duration::from_secs(60),
        sweep_interval: Duration::from_millis(20),
    }
}

pub fn fast_pool_options() -> PoolOptions {
    PoolOptions {
        lease_ttl: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
    }
}

/// Every number routed to `providers` in order
pub fn route_all(providers: Vec<Provider>) -> RoutingTable {
    RoutingTable {
        rules: vec![],
        default: providers,
    }
}

/// Domestic numbers to `domestic`, everything else to `international`
pub fn route_domestic(domestic: Vec<Provider>, international: Vec<Provider>) -> RoutingTable {
    RoutingTable {
        rules: vec![RouteRule::new("79", domestic)],
        default: international,
    }
}

pub async fn healthy_pool(endpoints: &[(&str, Provider)]) -> Arc<EndpointPool> {
    healthy_pool_with(fast_pool_options(), endpoints).await
}

pub async fn healthy_pool_with(
    options: PoolOptions,
    endpoints: &[(&str, Provider)],
) -> Arc<EndpointPool> {
    let pool = Arc::new(EndpointPool::in_process(
        options,
        Arc::new(StaticProbe(HealthState::Healthy)),
    ));
    for (i, (id, provider)) in endpoints.iter().enumerate() {
        pool.register(Endpoint::new(*id, format!("127.0.0.1:{}", 4723 + i), *provider))
            .await;
    }
    pool.probe_all().await;
    pool
}

/// A scheduler plus handles on its parts
pub struct Harness {
    pub scheduler: Scheduler,
    pub pool: Arc<EndpointPool>,
    pub cache: Arc<MemoryCache>,
    pub repository: Arc<MemoryJobRepository>,
    pub queue: Arc<InProcessQueue>,
}

pub struct HarnessBuilder {
    endpoints: Vec<(String, Provider)>,
    routing: RoutingTable,
    drivers: Vec<Arc<ScriptedProvider>>,
    options: SchedulerOptions,
    pool_options: PoolOptions,
    repository: Option<Arc<MemoryJobRepository>>,
    wrap_repository: Option<RepositoryWrapper>,
}

type RepositoryWrapper = Box<dyn FnOnce(Arc<MemoryJobRepository>) -> Arc<dyn JobRepository> + Send>;

impl HarnessBuilder {
    pub fn new(routing: RoutingTable) -> Self {
        Self {
            endpoints: Vec::new(),
            routing,
            drivers: Vec::new(),
            options: fast_options(),
            pool_options: fast_pool_options(),
            repository: None,
            wrap_repository: None,
        }
    }

    pub fn endpoint(mut self, id: &str, provider: Provider) -> Self {
        self.endpoints.push((id.to_string(), provider));
        self
    }

    pub fn driver(mut self, driver: Arc<ScriptedProvider>) -> Self {
        self.drivers.push(driver);
        self
    }

    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn repository(mut self, repository: Arc<MemoryJobRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn pool_options(mut self, options: PoolOptions) -> Self {
        self.pool_options = options;
        self
    }

    /// Put a layer between the scheduler and the memory repository
    pub fn wrap_repository(
        mut self,
        wrap: impl FnOnce(Arc<MemoryJobRepository>) -> Arc<dyn JobRepository> + Send + 'static,
    ) -> Self {
        self.wrap_repository = Some(Box::new(wrap));
        self
    }

    pub async fn build(self) -> Harness {
        let endpoints: Vec<(&str, Provider)> =
            self.endpoints.iter().map(|(id, p)| (id.as_str(), *p)).collect();
        let pool = healthy_pool_with(self.pool_options, &endpoints).await;
        let cache = Arc::new(MemoryCache::new());
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(MemoryJobRepository::new()));
        let queue = Arc::new(InProcessQueue::new());
        let store: Arc<dyn JobRepository> = match self.wrap_repository {
            Some(wrap) => wrap(Arc::clone(&repository)),
            None => Arc::clone(&repository) as Arc<dyn JobRepository>,
        };

        let registry = self
            .drivers
            .into_iter()
            .fold(ProviderRegistry::new(), |r, d| r.with(d as Arc<dyn LookupProvider>));

        let components = Components {
            pool: Arc::clone(&pool),
            cache: Some(Arc::clone(&cache) as Arc<dyn ResultCache>),
            selector: StrategySelector::new(self.routing).unwrap(),
            registry,
            repository: store,
            queue: Arc::clone(&queue) as Arc<dyn WorkQueue>,
        };

        Harness {
            scheduler: Scheduler::new(components, self.options).unwrap(),
            pool,
            cache,
            repository,
            queue,
        }
    }
}

pub fn number(raw: &str) -> PhoneNumber {
    PhoneNumber::parse(raw).unwrap()
}
