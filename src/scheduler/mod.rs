//! Verification scheduler
//!
//! Accepts batches of phone numbers, fans each number out as a [`WorkItem`]
//! on a shared [`WorkQueue`], and runs a fixed pool of workers that resolve
//! items through the result cache and the provider endpoints.
//!
//! # Overview
//!
//! ```text
//!   submit ──► JobRepository (queued)
//!      │
//!      └──► WorkQueue ──► worker 1..N
//!                           │ cache hit? ──► result
//!                           │ StrategySelector ──► [P1, P2, ...]
//!                           │   acquire lease ──► LookupProvider ──► release
//!                           │ all failed ──► push_delayed (capped backoff)
//!                           └──► update_result ──► completed / failed
//! ```
//!
//! Jobs move `queued → in_progress → completed | failed`, or to `cancelled`
//! on request. A job ends `failed` only when none of its numbers got an answer
//! from any provider; individual numbers may still carry `Error` results in a
//! `completed` job.
//!
//! # Quick Start
//!
//! ```ignore
//! use phonecheck::scheduler::{Components, Scheduler, SchedulerOptions};
//!
//! let scheduler = Scheduler::new(components, SchedulerOptions::default())?;
//! scheduler.recover().await?;
//! scheduler.start().await;
//!
//! let job_id = scheduler.submit(&["+79990000000"], SubmitOptions::default()).await?;
//! let status = scheduler.wait_for(&job_id, Duration::from_secs(60)).await?;
//!
//! scheduler.shutdown().await;
//! ```

pub mod error;
pub mod queue;
pub mod registry;
mod worker;

pub use error::LookupError;
pub use queue::{InProcessQueue, WorkQueue};
pub use registry::{LookupProvider, ProviderRegistry};

use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::ResultCache;
use crate::error::{Error, Result};
use crate::models::{
    JobId, JobRecord, JobState, JobStatusView, PhoneNumber, SubmitOptions, WorkItem,
};
use crate::pool::EndpointPool;
use crate::repository::JobRepository;
use crate::strategy::StrategySelector;
use crate::utils::retry::BackoffPolicy;

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Worker tasks; 0 starts one per registered endpoint
    pub workers: usize,
    pub backoff: BackoffPolicy,
    /// Bound on waiting for an endpoint lease
    pub acquire_timeout: Duration,
    /// Bound on one provider lookup
    pub lookup_timeout: Duration,
    pub cache_ttl: Duration,
    pub max_numbers_per_job: usize,
    /// Idle wait between queue polls
    pub poll_interval: Duration,
    /// Bound on waiting for leases to come back during shutdown
    pub drain_timeout: Duration,
    /// Interval between endpoint health probe rounds while running
    pub probe_interval: Duration,
    /// Interval between expired-lease sweeps while running
    pub sweep_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            backoff: BackoffPolicy::default(),
            acquire_timeout: Duration::from_secs(30),
            lookup_timeout: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(86_400),
            max_numbers_per_job: 100,
            poll_interval: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Collaborators the scheduler runs against
pub struct Components {
    pub pool: Arc<EndpointPool>,
    pub cache: Option<Arc<dyn ResultCache>>,
    pub selector: StrategySelector,
    pub registry: ProviderRegistry,
    pub repository: Arc<dyn JobRepository>,
    pub queue: Arc<dyn WorkQueue>,
}

/// State shared by the facade and its workers
struct SchedulerContext {
    pool: Arc<EndpointPool>,
    cache: Option<Arc<dyn ResultCache>>,
    selector: StrategySelector,
    registry: ProviderRegistry,
    repository: Arc<dyn JobRepository>,
    queue: Arc<dyn WorkQueue>,
    options: SchedulerOptions,
    /// Fires whenever a job reaches a terminal state
    job_finished: Notify,
}

/// Job scheduler and worker pool
pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    draining: AtomicBool,
}

impl Scheduler {
    /// Wire up the scheduler.
    ///
    /// Fails with a configuration error when a routed provider has no
    /// registered driver.
    pub fn new(components: Components, options: SchedulerOptions) -> Result<Self> {
        let mut missing: Vec<String> = components
            .selector
            .table()
            .providers()
            .into_iter()
            .filter(|p| !components.registry.contains(*p))
            .map(|p| p.to_string())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(Error::config(format!(
                "no lookup driver registered for routed provider(s): {}",
                missing.join(", ")
            )));
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            ctx: Arc::new(SchedulerContext {
                pool: components.pool,
                cache: components.cache,
                selector: components.selector,
                registry: components.registry,
                repository: components.repository,
                queue: components.queue,
                options,
                job_finished: Notify::new(),
            }),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            maintenance: Mutex::new(None),
            draining: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.ctx.options
    }

    /// Validate and persist a job, then enqueue one item per distinct number
    pub async fn submit<S: AsRef<str>>(&self, numbers: &[S], options: SubmitOptions) -> Result<JobId> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if numbers.is_empty() {
            return Err(Error::invalid_input("no numbers submitted"));
        }
        if let Some(provider) = options.forced_provider {
            if !self.ctx.registry.contains(provider) {
                return Err(Error::invalid_input(format!(
                    "forced provider {provider} has no registered driver"
                )));
            }
        }

        let mut invalid = Vec::new();
        let mut seen = HashSet::new();
        let mut parsed = Vec::new();
        for raw in numbers {
            match PhoneNumber::parse(raw.as_ref()) {
                Ok(number) => {
                    if seen.insert(number.clone()) {
                        parsed.push(number);
                    }
                }
                Err(_) => invalid.push(raw.as_ref().to_string()),
            }
        }
        if !invalid.is_empty() {
            return Err(Error::invalid_input(format!(
                "invalid phone number(s): {}",
                invalid.join(", ")
            )));
        }

        let max = self.ctx.options.max_numbers_per_job;
        if parsed.len() > max {
            return Err(Error::invalid_input(format!(
                "{} numbers submitted, at most {max} allowed per job",
                parsed.len()
            )));
        }

        let job = JobRecord::new(parsed, options);
        self.ctx.repository.create(&job).await?;

        for number in &job.numbers {
            let item = WorkItem::new(job.id.clone(), number.clone(), &job.options);
            if let Err(e) = self.ctx.queue.push(item).await {
                warn!(job_id = %job.id, error = %e, "Failed to enqueue work item");
                self.ctx
                    .repository
                    .update_state(&job.id, JobState::Failed, Some(format!("enqueue failed: {e}")))
                    .await?;
                return Err(e);
            }
        }

        info!(
            job_id = %job.id,
            numbers = job.numbers.len(),
            use_cache = job.options.use_cache,
            forced_provider = ?job.options.forced_provider,
            "Job submitted"
        );
        Ok(job.id)
    }

    /// Current state, progress and partial results of a job
    pub async fn query(&self, job_id: &JobId) -> Result<JobStatusView> {
        let job = self.ctx.repository.get(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Cancel a job; returns false when it had already finished
    pub async fn cancel(&self, job_id: &JobId) -> Result<bool> {
        let cancelled = self
            .ctx
            .repository
            .update_state(job_id, JobState::Cancelled, Some("cancelled by caller".into()))
            .await?;
        if cancelled {
            info!(job_id = %job_id, "Job cancelled");
            self.ctx.job_finished.notify_waiters();
        }
        Ok(cancelled)
    }

    /// Re-enqueue unfinished numbers of every non-terminal job.
    ///
    /// Jobs whose slots are all filled are finalized instead. Returns the
    /// number of items enqueued.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.ctx.repository.list_pending().await?;
        let mut enqueued = 0;

        for job in pending {
            if job.all_finished() {
                let state = job.final_state();
                let reason =
                    (state == JobState::Failed).then(|| "no number could be processed".to_string());
                if self.ctx.repository.update_state(&job.id, state, reason).await? {
                    crate::metrics::record_job_finalized(state.as_str());
                    info!(job_id = %job.id, state = %state, "Finalized recovered job");
                }
                continue;
            }

            for number in job.pending_numbers() {
                let item = WorkItem::new(job.id.clone(), number, &job.options);
                self.ctx.queue.push(item).await?;
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            info!(enqueued, "Recovered unfinished work items");
        }
        Ok(enqueued)
    }

    /// Drop finished jobs not touched for `older_than`
    pub async fn purge_finished(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::invalid_input(format!("retention period too large: {e}")))?;
        self.ctx.repository.purge_finished_before(Utc::now() - age).await
    }

    /// Items waiting in the queue
    pub async fn queue_depth(&self) -> Result<usize> {
        self.ctx.queue.len().await
    }

    /// Spawn the worker pool and pool maintenance. Calling it again while
    /// running is a no-op.
    ///
    /// Returns the number of workers.
    pub async fn start(&self) -> usize {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return workers.len();
        }

        for provider in self.ctx.selector.table().providers() {
            if self.ctx.pool.endpoint_count(provider).await == 0 {
                warn!(provider = %provider, "Routed provider has no endpoints; its lookups will wait out the acquire timeout");
            }
        }

        let count = match self.ctx.options.workers {
            0 => self.ctx.pool.stats().await.total.max(1),
            n => n,
        };
        for worker_id in 0..count {
            workers.push(worker::spawn_worker(
                worker_id,
                Arc::clone(&self.ctx),
                self.shutdown_tx.subscribe(),
            ));
        }
        *self.maintenance.lock().await = Some(Arc::clone(&self.ctx.pool).start_maintenance(
            self.ctx.options.probe_interval,
            self.ctx.options.sweep_interval,
            self.shutdown_tx.subscribe(),
        ));

        info!(workers = count, "Scheduler started");
        count
    }

    /// Stop accepting jobs, stop workers, then wait for leases to come back
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);

        let mut handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        handles.extend(self.maintenance.lock().await.take());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let outstanding = self.ctx.pool.drain(self.ctx.options.drain_timeout).await;
        if outstanding > 0 {
            warn!(outstanding, "Shutdown finished with leases still outstanding");
        } else {
            info!("Scheduler stopped");
        }
    }

    /// Wait until the job is terminal or `timeout` passes, then return its status
    pub async fn wait_for(&self, job_id: &JobId, timeout: Duration) -> Result<JobStatusView> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.ctx.job_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.query(job_id).await?;
            let now = Instant::now();
            if status.state.is_terminal() || now >= deadline {
                return Ok(status);
            }

            // Other instances finish jobs without notifying this one
            let wait = (deadline - now).min(self.ctx.options.poll_interval * 4);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }
}
