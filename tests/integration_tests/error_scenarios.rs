//! Error scenario tests
//!
//! Tests failure handling end to end:
//! 1. Every endpoint of the only provider stays leased
//! 2. Transient failures up to the retry ceiling
//! 3. Terminal rejection by every candidate
//! 4. Lookups that never answer
//! 5. Lookups outliving their lease
//! 6. Storage errors in the middle of an item
//! 7. Lease store outages

use crate::common::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use phonecheck::error::{Error, Result};
use phonecheck::models::{
    CheckStatus, FailureKind, JobId, JobRecord, JobState, NumberResult, PhoneNumber, Provider,
    SubmitOptions,
};
use phonecheck::cache::{MemoryCache, ResultCache};
use phonecheck::pool::{Endpoint, EndpointPool, HealthState, LeaseStore, PoolOptions};
use phonecheck::repository::{JobRepository, MemoryJobRepository};
use phonecheck::scheduler::{
    Components, InProcessQueue, LookupProvider, ProviderRegistry, Scheduler, WorkQueue,
};
use phonecheck::strategy::StrategySelector;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Endpoint Exhaustion
// ============================================================================

#[tokio::test]
async fn test_exhausted_endpoints_fail_sole_number() {
    let tbank = Arc::new(ScriptedProvider::answering(Provider::Tbank, CheckStatus::Safe));
    let harness = HarnessBuilder::new(route_all(vec![Provider::Tbank]))
        .endpoint("tbank-01", Provider::Tbank)
        .driver(Arc::clone(&tbank))
        .build()
        .await;

    // Someone else holds the only endpoint for the whole test
    let blocker = harness
        .pool
        .acquire(Provider::Tbank, "blocker", Duration::from_millis(10))
        .await
        .unwrap();
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+79990000000"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert!(status.error.is_some());
    let result = &status.results[0];
    assert_eq!(result.status, CheckStatus::Error);
    assert_eq!(result.source, None);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.failures.len(), 3);
    assert!(result
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::ResourceUnavailable));
    assert_eq!(tbank.calls(), 0);

    harness.pool.release(&blocker).await;
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_provider_does_not_fail_whole_job() {
    let tbank = Arc::new(ScriptedProvider::answering(Provider::Tbank, CheckStatus::Safe));
    let truecaller = Arc::new(ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Safe));
    let harness = HarnessBuilder::new(route_domestic(
        vec![Provider::Tbank],
        vec![Provider::Truecaller],
    ))
    .endpoint("tbank-01", Provider::Tbank)
    .endpoint("tc-01", Provider::Truecaller)
    .driver(Arc::clone(&tbank))
    .driver(Arc::clone(&truecaller))
    .build()
    .await;

    let blocker = harness
        .pool
        .acquire(Provider::Tbank, "blocker", Duration::from_millis(10))
        .await
        .unwrap();
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+79990000000", "+12025550108"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.results[0].status, CheckStatus::Error);
    assert_eq!(status.results[1].status, CheckStatus::Safe);
    assert_eq!(status.results[1].source, Some(Provider::Truecaller));

    harness.pool.release(&blocker).await;
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_released_endpoint_picked_up_on_retry() {
    let tbank = Arc::new(ScriptedProvider::answering(Provider::Tbank, CheckStatus::Safe));
    let mut options = fast_options();
    options.backoff.max_attempts = 10;
    let harness = HarnessBuilder::new(route_all(vec![Provider::Tbank]))
        .endpoint("tbank-01", Provider::Tbank)
        .driver(Arc::clone(&tbank))
        .options(options)
        .build()
        .await;

    let blocker = harness
        .pool
        .acquire(Provider::Tbank, "blocker", Duration::from_millis(10))
        .await
        .unwrap();
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+79990000000"], SubmitOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    harness.pool.release(&blocker).await;

    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    let result = &status.results[0];
    assert_eq!(result.source, Some(Provider::Tbank));
    assert!(result
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::ResourceUnavailable));
    assert_eq!(tbank.calls(), 1);

    harness.scheduler.shutdown().await;
}

// ============================================================================
// Retry Ceiling
// ============================================================================

#[tokio::test]
async fn test_transient_failures_stop_at_retry_ceiling() {
    let truecaller = Arc::new(ScriptedProvider::new(Provider::Truecaller, Step::Transient));
    let mut options = fast_options();
    options.backoff.max_attempts = 4;
    let harness = HarnessBuilder::new(route_all(vec![Provider::Truecaller]))
        .endpoint("tc-01", Provider::Truecaller)
        .driver(Arc::clone(&truecaller))
        .options(options)
        .build()
        .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+12025550108"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    let result = &status.results[0];
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(result.attempts, 4);
    assert_eq!(truecaller.calls(), 4);
    let cycles: Vec<u32> = result.failures.iter().map(|f| f.attempt).collect();
    assert_eq!(cycles, vec![0, 1, 2, 3]);
    assert!(result
        .details
        .as_deref()
        .unwrap()
        .contains("automation session crashed"));

    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_terminal_rejection_everywhere_errors_without_retry() {
    let kaspersky = Arc::new(ScriptedProvider::new(Provider::Kaspersky, Step::Terminal));
    let getcontact = Arc::new(ScriptedProvider::new(Provider::GetContact, Step::Terminal));
    let harness = HarnessBuilder::new(route_all(vec![Provider::Kaspersky, Provider::GetContact]))
        .endpoint("kasp-01", Provider::Kaspersky)
        .endpoint("gc-01", Provider::GetContact)
        .driver(Arc::clone(&kaspersky))
        .driver(Arc::clone(&getcontact))
        .build()
        .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+79990000000"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    let result = &status.results[0];
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(result.attempts, 1);
    assert_eq!(kaspersky.calls(), 1);
    assert_eq!(getcontact.calls(), 1);

    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_terminal_provider_skipped_on_retry() {
    let kaspersky = Arc::new(ScriptedProvider::new(Provider::Kaspersky, Step::Terminal));
    let getcontact = Arc::new(
        ScriptedProvider::answering(Provider::GetContact, CheckStatus::Safe).then(Step::Transient),
    );
    let harness = HarnessBuilder::new(route_all(vec![Provider::Kaspersky, Provider::GetContact]))
        .endpoint("kasp-01", Provider::Kaspersky)
        .endpoint("gc-01", Provider::GetContact)
        .driver(Arc::clone(&kaspersky))
        .driver(Arc::clone(&getcontact))
        .build()
        .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+79990000000"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    let result = &status.results[0];
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(result.source, Some(Provider::GetContact));
    assert_eq!(result.attempts, 2);
    assert_eq!(kaspersky.calls(), 1);
    assert_eq!(getcontact.calls(), 2);

    harness.scheduler.shutdown().await;
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_hung_lookup_times_out_and_releases_lease() {
    let truecaller = Arc::new(
        ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Safe)
            .with_delay(Duration::from_millis(500)),
    );
    let mut options = fast_options();
    options.lookup_timeout = Duration::from_millis(30);
    options.backoff.max_attempts = 2;
    let harness = HarnessBuilder::new(route_all(vec![Provider::Truecaller]))
        .endpoint("tc-01", Provider::Truecaller)
        .driver(Arc::clone(&truecaller))
        .options(options)
        .build()
        .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+12025550108"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    let result = &status.results[0];
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(result.attempts, 2);
    assert!(result.failures.iter().all(|f| f.kind == FailureKind::Transient));
    assert_eq!(harness.pool.active_leases().await, 0);

    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_lookup_never_outlives_its_lease() {
    let truecaller = Arc::new(
        ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Safe)
            .with_delay(Duration::from_millis(600)),
    );
    let mut options = fast_options();
    options.lookup_timeout = Duration::from_secs(1);
    options.probe_interval = Duration::from_millis(20);
    options.sweep_interval = Duration::from_millis(20);
    options.backoff.max_attempts = 2;
    let harness = HarnessBuilder::new(route_all(vec![Provider::Truecaller]))
        .endpoint("tc-01", Provider::Truecaller)
        .driver(Arc::clone(&truecaller))
        .options(options)
        .pool_options(PoolOptions {
            lease_ttl: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        })
        .build()
        .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+12025550108", "+12025550109"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert!(truecaller.calls() >= 2);
    assert_eq!(truecaller.overlaps(), 0);
    assert!(status
        .results
        .iter()
        .flat_map(|r| &r.failures)
        .all(|f| f.kind != FailureKind::Terminal));

    harness.scheduler.shutdown().await;
    assert_eq!(harness.pool.active_leases().await, 0);
}

// ============================================================================
// Storage Faults
// ============================================================================

/// Repository whose first few writes of each kind fail like a locked database
struct FlakyRepository {
    inner: Arc<MemoryJobRepository>,
    result_faults: AtomicUsize,
    final_state_faults: AtomicUsize,
}

impl FlakyRepository {
    fn new(inner: Arc<MemoryJobRepository>) -> Self {
        Self {
            inner,
            result_faults: AtomicUsize::new(0),
            final_state_faults: AtomicUsize::new(0),
        }
    }

    fn failing_results(self, count: usize) -> Self {
        self.result_faults.store(count, Ordering::SeqCst);
        self
    }

    fn failing_final_states(self, count: usize) -> Self {
        self.final_state_faults.store(count, Ordering::SeqCst);
        self
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobRepository for FlakyRepository {
    async fn create(&self, job: &JobRecord) -> Result<()> {
        self.inner.create(job).await
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord> {
        self.inner.get(id).await
    }

    async fn update_result(
        &self,
        id: &JobId,
        number: &PhoneNumber,
        result: NumberResult,
    ) -> Result<JobRecord> {
        if Self::take_fault(&self.result_faults) {
            return Err(Error::Storage("database is locked".into()));
        }
        self.inner.update_result(id, number, result).await
    }

    async fn update_state(&self, id: &JobId, state: JobState, error: Option<String>) -> Result<bool> {
        if state.is_terminal() && Self::take_fault(&self.final_state_faults) {
            return Err(Error::Storage("database is locked".into()));
        }
        self.inner.update_state(id, state, error).await
    }

    async fn list_pending(&self) -> Result<Vec<JobRecord>> {
        self.inner.list_pending().await
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.purge_finished_before(cutoff).await
    }
}

#[tokio::test]
async fn test_failed_result_write_is_retried() {
    let truecaller = Arc::new(ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Spam));
    let harness = HarnessBuilder::new(route_all(vec![Provider::Truecaller]))
        .endpoint("tc-01", Provider::Truecaller)
        .driver(Arc::clone(&truecaller))
        .wrap_repository(|inner| {
            Arc::new(FlakyRepository::new(inner).failing_results(1)) as Arc<dyn JobRepository>
        })
        .build()
        .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+12025550108"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, 1.0);
    assert_eq!(status.results[0].status, CheckStatus::Spam);
    // The rerun may be answered from the cache the first run filled
    assert!(truecaller.calls() >= 1);
    assert_eq!(harness.scheduler.queue_depth().await.unwrap(), 0);

    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_failed_finalize_is_retried() {
    let truecaller = Arc::new(ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Safe));
    let harness = HarnessBuilder::new(route_all(vec![Provider::Truecaller]))
        .endpoint("tc-01", Provider::Truecaller)
        .driver(Arc::clone(&truecaller))
        .wrap_repository(|inner| {
            Arc::new(FlakyRepository::new(inner).failing_final_states(1)) as Arc<dyn JobRepository>
        })
        .build()
        .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+12025550108"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    // The slot was already filled, so the rerun only finalizes
    assert_eq!(truecaller.calls(), 1);
    assert_eq!(harness.repository.get(&job_id).await.unwrap().state, JobState::Completed);

    harness.scheduler.shutdown().await;
}

// ============================================================================
// Lease Store Outages
// ============================================================================

/// Shared lease store that cannot be reached
struct UnreachableStore;

#[async_trait]
impl LeaseStore for UnreachableStore {
    async fn try_claim(&self, _endpoint_id: &str, _token: &str, _ttl: Duration) -> Result<bool> {
        Err(Error::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection reset by peer",
        ))))
    }

    async fn release(&self, _endpoint_id: &str, _token: &str) -> Result<bool> {
        Ok(false)
    }

    fn is_shared(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_store_outage_recorded_as_transient() {
    let truecaller = Arc::new(ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Safe));
    let pool = Arc::new(EndpointPool::new(
        fast_pool_options(),
        Arc::new(UnreachableStore),
        Arc::new(StaticProbe(HealthState::Healthy)),
    ));
    pool.register(Endpoint::new("tc-01", "10.0.0.7:4723", Provider::Truecaller))
        .await;
    pool.probe_all().await;

    let components = Components {
        pool,
        cache: Some(Arc::new(MemoryCache::new()) as Arc<dyn ResultCache>),
        selector: StrategySelector::new(route_all(vec![Provider::Truecaller])).unwrap(),
        registry: ProviderRegistry::new().with(Arc::clone(&truecaller) as Arc<dyn LookupProvider>),
        repository: Arc::new(MemoryJobRepository::new()) as Arc<dyn JobRepository>,
        queue: Arc::new(InProcessQueue::new()) as Arc<dyn WorkQueue>,
    };
    let scheduler = Scheduler::new(components, fast_options()).unwrap();
    scheduler.start().await;

    let job_id = scheduler
        .submit(&["+12025550108"], SubmitOptions::default())
        .await
        .unwrap();
    let status = scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    let result = &status.results[0];
    assert_eq!(result.failures.len(), 3);
    assert!(result.failures.iter().all(|f| f.kind == FailureKind::Transient));
    assert_eq!(truecaller.calls(), 0);

    scheduler.shutdown().await;
}
