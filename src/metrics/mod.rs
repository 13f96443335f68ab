//! Prometheus metrics for the endpoint pool and scheduler
//!
//! This module provides metrics tracking for:
//! - Endpoint pool: lease grants, acquisition timeouts, expired leases, active leases
//! - Scheduler: lookups by provider and outcome, cache hits/misses, retries, finalized jobs
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all endpoint pool metrics
struct PoolMetrics {
    leases_granted: CounterVec,
    lease_timeouts: CounterVec,
    leases_expired: CounterVec,
    active_leases: Gauge,
}

/// Container for all scheduler metrics
struct SchedulerMetrics {
    lookups: CounterVec,
    lookup_duration: HistogramVec,
    cache_hits: Counter,
    cache_misses: Counter,
    retries: Counter,
    jobs_finalized: CounterVec,
}

/// Global storage for pool metrics
static POOL_METRICS: OnceLock<PoolMetrics> = OnceLock::new();

/// Global storage for scheduler metrics
static SCHEDULER_METRICS: OnceLock<SchedulerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = phonecheck::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let pool = PoolMetrics {
        leases_granted: register_counter_vec!(
            "phonecheck_pool_leases_granted_total",
            "Endpoint leases granted by provider",
            &["provider"]
        )?,
        lease_timeouts: register_counter_vec!(
            "phonecheck_pool_lease_timeouts_total",
            "Acquisitions that timed out without a free endpoint",
            &["provider"]
        )?,
        leases_expired: register_counter_vec!(
            "phonecheck_pool_leases_expired_total",
            "Leases reclaimed by the sweep because the holder never released them",
            &["provider"]
        )?,
        active_leases: register_gauge!(
            "phonecheck_pool_active_leases",
            "Leases currently held by this instance"
        )?,
    };

    let scheduler = SchedulerMetrics {
        lookups: register_counter_vec!(
            "phonecheck_lookups_total",
            "Lookup calls by provider and outcome",
            &["provider", "outcome"]
        )?,
        lookup_duration: register_histogram_vec!(
            "phonecheck_lookup_duration_seconds",
            "Lookup call duration in seconds",
            &["provider"],
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0]
        )?,
        cache_hits: register_counter!("phonecheck_cache_hits_total", "Result cache hits")?,
        cache_misses: register_counter!("phonecheck_cache_misses_total", "Result cache misses")?,
        retries: register_counter!(
            "phonecheck_work_item_retries_total",
            "Work items requeued with backoff"
        )?,
        jobs_finalized: register_counter_vec!(
            "phonecheck_jobs_finalized_total",
            "Jobs reaching a terminal state",
            &["state"]
        )?,
    };

    POOL_METRICS.set(pool).map_err(|_| "Pool metrics already initialized")?;
    SCHEDULER_METRICS
        .set(scheduler)
        .map_err(|_| "Scheduler metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    POOL_METRICS.get().is_some() && SCHEDULER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a granted lease
pub fn record_lease_granted(provider: &str) {
    if let Some(m) = POOL_METRICS.get() {
        m.leases_granted.with_label_values(&[provider]).inc();
        m.active_leases.inc();
    }
}

/// Record a released lease
pub fn record_lease_released() {
    if let Some(m) = POOL_METRICS.get() {
        m.active_leases.dec();
    }
}

/// Record an acquisition timeout
pub fn record_lease_timeout(provider: &str) {
    if let Some(m) = POOL_METRICS.get() {
        m.lease_timeouts.with_label_values(&[provider]).inc();
    }
}

/// Record a lease reclaimed by the expiry sweep
pub fn record_lease_expired(provider: &str) {
    if let Some(m) = POOL_METRICS.get() {
        m.leases_expired.with_label_values(&[provider]).inc();
        m.active_leases.dec();
    }
}

/// Record a lookup call outcome and its duration
pub fn record_lookup(provider: &str, outcome: &str, duration_secs: f64) {
    let Some(m) = SCHEDULER_METRICS.get() else {
        return;
    };

    m.lookups.with_label_values(&[provider, outcome]).inc();
    m.lookup_duration
        .with_label_values(&[provider])
        .observe(duration_secs);
}

/// Record a cache lookup
pub fn record_cache(hit: bool) {
    let Some(m) = SCHEDULER_METRICS.get() else {
        return;
    };

    if hit {
        m.cache_hits.inc();
    } else {
        m.cache_misses.inc();
    }
}

/// Record a work item requeue
pub fn record_retry() {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.retries.inc();
    }
}

/// Record a job reaching a terminal state
pub fn record_job_finalized(state: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.jobs_finalized.with_label_values(&[state]).inc();
    }
}

// ============================================================================
// Tests
// ============================================================================
