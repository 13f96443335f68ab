//! Worker loop and per-item processing

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::SchedulerContext;
use crate::error::{Error, ErrorClass, Result};
use crate::metrics;
use crate::models::{
    CheckStatus, FailureKind, JobId, JobRecord, JobState, NumberResult, Provider, WorkItem,
    WorkItemState,
};

use super::error::LookupError;

/// Spawn one worker task.
///
/// Shutdown is checked between pops rather than raced against them, so an
/// item already taken off a shared queue is always processed.
pub(super) fn spawn_worker(
    worker_id: usize,
    ctx: Arc<SchedulerContext>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(worker_id, "Worker started");

        while !*shutdown.borrow() {
            match ctx.queue.pop(ctx.options.poll_interval).await {
                Ok(Some(item)) => handle_item(worker_id, &ctx, item).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id, error = %e, "Failed to pop work item");
                    tokio::time::sleep(ctx.options.poll_interval).await;
                }
            }
        }

        debug!(worker_id, "Worker shutting down");
    })
}

/// Process one item, putting it back on the queue when a recoverable error
/// interrupts it
async fn handle_item(worker_id: usize, ctx: &SchedulerContext, item: WorkItem) {
    let retry = item.clone();
    let Err(e) = process_item(ctx, item).await else {
        return;
    };

    if !e.is_recoverable() {
        error!(worker_id, job_id = %retry.job_id, error = %e, "Work item processing failed");
        return;
    }

    let delay = ctx.options.backoff.delay_for(retry.attempt + 1);
    warn!(
        worker_id,
        job_id = %retry.job_id,
        number = %retry.number,
        error = %e,
        delay_ms = delay.as_millis() as u64,
        "Work item interrupted, requeueing"
    );
    let job_id = retry.job_id.clone();
    if let Err(e) = ctx.queue.push_delayed(retry, delay).await {
        error!(worker_id, job_id = %job_id, error = %e, "Failed to requeue work item");
    }
}

/// Whether the job is gone or already terminal
async fn job_closed(ctx: &SchedulerContext, job_id: &JobId) -> Result<bool> {
    match ctx.repository.get(job_id).await {
        Ok(job) => Ok(job.state.is_terminal()),
        Err(Error::JobNotFound(_)) => Ok(true),
        Err(e) => Err(e),
    }
}

/// Run one work item through cache, providers and retry policy
pub(super) async fn process_item(ctx: &SchedulerContext, mut item: WorkItem) -> Result<()> {
    let job = match ctx.repository.get(&item.job_id).await {
        Ok(job) => job,
        Err(Error::JobNotFound(_)) => {
            warn!(job_id = %item.job_id, "Dropping work item for unknown job");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if job.state.is_terminal() {
        item.state = WorkItemState::Abandoned;
        debug!(job_id = %item.job_id, number = %item.number, state = %job.state, "Skipping item of closed job");
        return Ok(());
    }

    // Redelivered after recovery but already answered
    let slot_filled = job
        .numbers
        .iter()
        .zip(&job.results)
        .any(|(n, r)| n == &item.number && r.is_some());
    if slot_filled {
        debug!(job_id = %item.job_id, number = %item.number, "Result already recorded");
        // The earlier attempt may have stopped before finalizing
        if job.all_finished() {
            finalize(ctx, &job).await?;
        }
        return Ok(());
    }

    ctx.repository
        .update_state(&item.job_id, JobState::InProgress, None)
        .await?;
    item.state = WorkItemState::Running;

    let candidates: Vec<Provider> = ctx
        .selector
        .select(&item.number, item.forced_provider)
        .into_iter()
        .filter(|p| !item.excluded.contains(p))
        .collect();

    if item.use_cache {
        if let Some(result) = check_cache(ctx, &item, &candidates).await {
            item.state = WorkItemState::Done;
            return finish(ctx, &item, result).await;
        }
    }

    for (index, provider) in candidates.iter().copied().enumerate() {
        if index > 0 && job_closed(ctx, &item.job_id).await? {
            item.state = WorkItemState::Abandoned;
            info!(job_id = %item.job_id, number = %item.number, "Abandoning item of cancelled job");
            return Ok(());
        }

        if let Some(result) = try_provider(ctx, &mut item, provider).await {
            item.state = WorkItemState::Done;
            return finish(ctx, &item, result).await;
        }
    }

    // Every candidate failed this cycle
    item.attempt += 1;
    let remaining = ctx
        .selector
        .select(&item.number, item.forced_provider)
        .into_iter()
        .any(|p| !item.excluded.contains(&p));

    if remaining && ctx.options.backoff.should_retry(item.attempt) {
        if job_closed(ctx, &item.job_id).await? {
            item.state = WorkItemState::Abandoned;
            return Ok(());
        }
        let delay = ctx.options.backoff.delay_for(item.attempt);
        info!(
            job_id = %item.job_id,
            number = %item.number,
            attempt = item.attempt,
            delay_ms = delay.as_millis() as u64,
            "All providers failed, requeueing with backoff"
        );
        item.state = WorkItemState::Pending;
        metrics::record_retry();
        return ctx.queue.push_delayed(item, delay).await;
    }

    item.state = WorkItemState::Errored;
    warn!(
        job_id = %item.job_id,
        number = %item.number,
        attempts = item.attempt,
        "Work item errored"
    );
    let result = NumberResult::errored(item.number.clone(), item.attempt, item.failures.clone());
    finish(ctx, &item, result).await
}

/// First fresh cache entry among the candidates
async fn check_cache(
    ctx: &SchedulerContext,
    item: &WorkItem,
    candidates: &[Provider],
) -> Option<NumberResult> {
    let cache = ctx.cache.as_ref()?;
    for provider in candidates.iter().copied() {
        match cache.get(&item.number, provider).await {
            Ok(Some(outcome)) => {
                metrics::record_cache(true);
                debug!(job_id = %item.job_id, number = %item.number, provider = %provider, "Cache hit");
                return Some(NumberResult::cached(item.number.clone(), provider, outcome));
            }
            Ok(None) => metrics::record_cache(false),
            Err(e) => warn!(provider = %provider, error = %e, "Cache read failed"),
        }
    }
    None
}

/// One lease-lookup-release round against `provider`.
///
/// Failures are recorded on the item; `None` means try the next candidate.
async fn try_provider(
    ctx: &SchedulerContext,
    item: &mut WorkItem,
    provider: Provider,
) -> Option<NumberResult> {
    let Some(driver) = ctx.registry.get(provider) else {
        item.record_failure(provider, FailureKind::Terminal, "no lookup driver registered".into());
        return None;
    };

    let lease = match ctx
        .pool
        .acquire(provider, &item.holder_id(), ctx.options.acquire_timeout)
        .await
    {
        Ok(lease) => lease,
        Err(e) => {
            debug!(job_id = %item.job_id, provider = %provider, error = %e, "Lease not acquired");
            let kind = match &e {
                Error::ResourceUnavailable { .. } => FailureKind::ResourceUnavailable,
                _ => FailureKind::Transient,
            };
            item.record_failure(provider, kind, e.to_string());
            return None;
        }
    };

    // The lookup must end before the lease can expire under it
    let started = Instant::now();
    let budget = ctx
        .options
        .lookup_timeout
        .min(lease.deadline.saturating_duration_since(started));
    let outcome = match tokio::time::timeout(budget, driver.lookup(&lease.endpoint, &item.number)).await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(LookupError::Timeout {
            secs: budget.as_secs(),
        }),
    };
    ctx.pool.release(&lease).await;
    let elapsed = started.elapsed().as_secs_f64();

    match outcome {
        Ok(outcome) if outcome.status == CheckStatus::Error => {
            metrics::record_lookup(provider.as_str(), "transient", elapsed);
            let message = outcome
                .details
                .unwrap_or_else(|| "provider returned an error verdict".into());
            item.record_failure(provider, FailureKind::Transient, message);
            None
        }
        Ok(outcome) => {
            metrics::record_lookup(provider.as_str(), "success", elapsed);
            if let Some(cache) = &ctx.cache {
                if let Err(e) = cache
                    .put(&item.number, provider, &outcome, ctx.options.cache_ttl)
                    .await
                {
                    warn!(provider = %provider, error = %e, "Failed to cache result");
                }
            }
            debug!(job_id = %item.job_id, number = %item.number, provider = %provider, status = %outcome.status, "Lookup succeeded");
            Some(NumberResult::found(
                item.number.clone(),
                provider,
                outcome,
                item.attempt + 1,
                item.failures.clone(),
            ))
        }
        Err(e) => {
            let kind = if e.is_terminal() {
                FailureKind::Terminal
            } else {
                FailureKind::Transient
            };
            metrics::record_lookup(
                provider.as_str(),
                if e.is_terminal() { "terminal" } else { "transient" },
                elapsed,
            );
            debug!(job_id = %item.job_id, provider = %provider, error = %e, "Lookup failed");
            item.record_failure(provider, kind, e.to_string());
            None
        }
    }
}

/// Write the item's result and finalize the job once every slot is filled
async fn finish(ctx: &SchedulerContext, item: &WorkItem, result: NumberResult) -> Result<()> {
    let job = ctx
        .repository
        .update_result(&item.job_id, &item.number, result)
        .await?;

    debug!(
        job_id = %job.id,
        progress = job.progress(),
        "Job progress updated"
    );

    if job.all_finished() {
        finalize(ctx, &job).await?;
    }
    Ok(())
}

/// Move a job whose slots are all filled into its final state
async fn finalize(ctx: &SchedulerContext, job: &JobRecord) -> Result<()> {
    let state = job.final_state();
    let reason = (state == JobState::Failed).then(|| "no number could be processed".to_string());
    if ctx.repository.update_state(&job.id, state, reason).await? {
        metrics::record_job_finalized(state.as_str());
        match state {
            JobState::Failed => error!(job_id = %job.id, numbers = job.numbers.len(), "Job failed"),
            _ => info!(job_id = %job.id, numbers = job.numbers.len(), "Job completed"),
        }
        ctx.job_finished.notify_waiters();
    }
    Ok(())
}
