//! Endpoint pool
//!
//! Tracks automation endpoints per provider, their health, and the exclusive
//! leases handed to workers. At most one active lease exists per endpoint at
//! any instant; the [`LeaseStore`] enforces that, either in-process or through
//! a shared store when several instances use the same endpoints.
//!
//! # Selection
//!
//! `acquire` prefers the healthy, unleased endpoint that has been idle the
//! longest. Waiters park on a [`Notify`] that fires on release and on health
//! recovery; with a shared store they also wake every `poll_interval`, since
//! other instances release without notifying this one.

pub mod lease;
pub mod probe;

pub use lease::{InProcessLeaseStore, Lease, LeaseStore};
pub use probe::{HealthProbe, TcpProbe};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::models::Provider;

// ============================================================================
// Endpoint
// ============================================================================

/// One automation target bound to exactly one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    /// `host:port`
    pub address: String,
    pub provider: Provider,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, address: impl Into<String>, provider: Provider) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            provider,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.id, self.address, self.provider)
    }
}

/// Endpoint health as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unreachable,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unreachable => "unreachable",
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Tunables for [`EndpointPool`]
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Lease lifetime before the sweep reclaims it
    pub lease_ttl: Duration,
    /// Upper bound on a waiter's sleep between availability checks
    pub poll_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Lease granted by this process, as tracked locally
#[derive(Debug, Clone)]
struct ActiveLease {
    token: String,
    holder: String,
    deadline: Instant,
}

#[derive(Debug)]
struct Slot {
    endpoint: Endpoint,
    health: HealthState,
    idle_since: Instant,
    lease: Option<ActiveLease>,
}

/// Per-endpoint status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub endpoint: Endpoint,
    pub health: HealthState,
    pub leased_by: Option<String>,
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub unreachable: usize,
    pub unknown: usize,
    pub leased: usize,
}

/// Endpoint pool with exclusive leases
pub struct EndpointPool {
    slots: RwLock<HashMap<String, Slot>>,
    store: Arc<dyn LeaseStore>,
    probe: Arc<dyn HealthProbe>,
    available: Notify,
    options: PoolOptions,
}

impl EndpointPool {
    /// Create an empty pool
    pub fn new(options: PoolOptions, store: Arc<dyn LeaseStore>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store,
            probe,
            available: Notify::new(),
            options,
        }
    }

    /// Pool with an in-process lock table
    pub fn in_process(options: PoolOptions, probe: Arc<dyn HealthProbe>) -> Self {
        Self::new(options, Arc::new(InProcessLeaseStore::new()), probe)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Add an endpoint or update its binding. Idempotent.
    ///
    /// A changed address or provider resets health to `unknown` until the next probe.
    pub async fn register(&self, endpoint: Endpoint) {
        let mut slots = self.slots.write().await;
        match slots.get_mut(&endpoint.id) {
            Some(slot) if slot.endpoint == endpoint => {}
            Some(slot) => {
                info!(endpoint = %endpoint, "Endpoint binding updated");
                slot.endpoint = endpoint;
                slot.health = HealthState::Unknown;
            }
            None => {
                debug!(endpoint = %endpoint, "Endpoint registered");
                slots.insert(
                    endpoint.id.clone(),
                    Slot {
                        endpoint,
                        health: HealthState::Unknown,
                        idle_since: Instant::now(),
                        lease: None,
                    },
                );
            }
        }
    }

    /// Run the health probe for one endpoint and record the result
    pub async fn probe(&self, endpoint_id: &str) -> Result<HealthState> {
        let endpoint = {
            let slots = self.slots.read().await;
            slots
                .get(endpoint_id)
                .map(|s| s.endpoint.clone())
                .ok_or_else(|| Error::invalid_input(format!("unknown endpoint '{endpoint_id}'")))?
        };

        let state = self.probe.check(&endpoint).await;
        self.set_health(endpoint_id, state).await;
        Ok(state)
    }

    /// Probe every endpoint concurrently
    pub async fn probe_all(&self) -> Vec<(String, HealthState)> {
        let ids: Vec<String> = self.slots.read().await.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.probe(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, r)| r.ok().map(|state| (id, state)))
            .collect()
    }

    /// Record a health observation
    pub async fn set_health(&self, endpoint_id: &str, state: HealthState) {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(endpoint_id) else {
            return;
        };
        if slot.health != state {
            match state {
                HealthState::Unreachable => {
                    warn!(endpoint = %slot.endpoint, "Endpoint unreachable")
                }
                _ => info!(endpoint = %slot.endpoint, health = state.as_str(), "Endpoint health changed"),
            }
        }
        slot.health = state;
        drop(slots);

        if state == HealthState::Healthy {
            self.available.notify_waiters();
        }
    }

    /// Lease a healthy endpoint of `provider`, waiting up to `timeout`.
    ///
    /// Fails with [`Error::ResourceUnavailable`] when the deadline passes. Never
    /// retries beyond the timeout; retry policy belongs to the caller.
    pub async fn acquire(&self, provider: Provider, holder: &str, timeout: Duration) -> Result<Lease> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            // Register interest before checking so a release in between is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(provider, holder).await? {
                return Ok(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::record_lease_timeout(provider.as_str());
                let waited_ms = now.duration_since(started).as_millis() as u64;
                debug!(provider = %provider, holder, waited_ms, "No endpoint available");
                return Err(Error::ResourceUnavailable { provider, waited_ms });
            }

            // Other instances release without notifying this one
            let mut wait = deadline - now;
            if self.store.is_shared() {
                wait = wait.min(self.options.poll_interval);
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn try_acquire(&self, provider: Provider, holder: &str) -> Result<Option<Lease>> {
        let mut candidates: Vec<(Instant, String)> = {
            let slots = self.slots.read().await;
            slots
                .values()
                .filter(|s| {
                    s.endpoint.provider == provider
                        && s.health == HealthState::Healthy
                        && s.lease.is_none()
                })
                .map(|s| (s.idle_since, s.endpoint.id.clone()))
                .collect()
        };
        // Longest idle first, id breaks ties
        candidates.sort();

        for (_, endpoint_id) in candidates {
            let token = uuid::Uuid::new_v4().simple().to_string();
            if !self
                .store
                .try_claim(&endpoint_id, &token, self.options.lease_ttl)
                .await?
            {
                continue;
            }

            let mut slots = self.slots.write().await;
            let claimable = slots
                .get(&endpoint_id)
                .is_some_and(|s| s.lease.is_none() && s.health == HealthState::Healthy);
            if !claimable {
                // Went away or changed while we were claiming
                drop(slots);
                self.store.release(&endpoint_id, &token).await?;
                continue;
            }
            let Some(slot) = slots.get_mut(&endpoint_id) else {
                continue;
            };

            let deadline = Instant::now() + self.options.lease_ttl;
            slot.lease = Some(ActiveLease {
                token: token.clone(),
                holder: holder.to_string(),
                deadline,
            });
            let endpoint = slot.endpoint.clone();
            drop(slots);

            metrics::record_lease_granted(provider.as_str());
            debug!(endpoint = %endpoint.id, holder, "Lease granted");
            return Ok(Some(Lease {
                endpoint,
                holder: holder.to_string(),
                acquired_at: Utc::now(),
                deadline,
                token,
            }));
        }

        Ok(None)
    }

    /// Return a lease.
    ///
    /// Releasing twice, or after the sweep reclaimed the lease, is logged and
    /// otherwise ignored.
    pub async fn release(&self, lease: &Lease) {
        let released = {
            let mut slots = self.slots.write().await;
            match slots.get_mut(lease.endpoint_id()) {
                Some(slot) if slot.lease.as_ref().is_some_and(|l| l.token == lease.token) => {
                    slot.lease = None;
                    slot.idle_since = Instant::now();
                    true
                }
                _ => false,
            }
        };

        if !released {
            warn!(
                endpoint = %lease.endpoint.id,
                holder = %lease.holder,
                "Release of a lease that is no longer active"
            );
            return;
        }

        if let Err(e) = self.store.release(lease.endpoint_id(), &lease.token).await {
            // The store entry still expires with its TTL
            warn!(endpoint = %lease.endpoint.id, error = %e, "Failed to clear lease in store");
        }
        metrics::record_lease_released();
        debug!(endpoint = %lease.endpoint.id, holder = %lease.holder, "Lease released");
        self.available.notify_waiters();
    }

    /// Reclaim leases past their deadline and mark their endpoints unreachable.
    ///
    /// Returns the number of reclaimed leases.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(Endpoint, ActiveLease)> = {
            let mut slots = self.slots.write().await;
            slots
                .values_mut()
                .filter(|s| s.lease.as_ref().is_some_and(|l| l.deadline <= now))
                .filter_map(|s| {
                    s.health = HealthState::Unreachable;
                    s.idle_since = now;
                    s.lease.take().map(|l| (s.endpoint.clone(), l))
                })
                .collect()
        };

        for (endpoint, lease) in &expired {
            warn!(
                endpoint = %endpoint,
                holder = %lease.holder,
                "Lease expired without release; marking endpoint unreachable"
            );
            metrics::record_lease_expired(endpoint.provider.as_str());
            if let Err(e) = self.store.release(&endpoint.id, &lease.token).await {
                warn!(endpoint = %endpoint.id, error = %e, "Failed to clear expired lease in store");
            }
        }

        expired.len()
    }

    /// Leases this process currently holds
    pub async fn active_leases(&self) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|s| s.lease.is_some())
            .count()
    }

    /// Wait for in-flight leases to be released or to expire.
    ///
    /// Returns the number of leases still held when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.sweep_expired().await;
            let remaining = self.active_leases().await;
            let now = Instant::now();
            if remaining == 0 || now >= deadline {
                if remaining > 0 {
                    warn!(remaining, "Pool drain timed out with leases outstanding");
                } else {
                    info!("Pool drained");
                }
                return remaining;
            }

            let wait = (deadline - now).min(self.options.poll_interval);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Snapshot of every endpoint
    pub async fn endpoints(&self) -> Vec<EndpointStatus> {
        let slots = self.slots.read().await;
        let mut statuses: Vec<EndpointStatus> = slots
            .values()
            .map(|s| EndpointStatus {
                endpoint: s.endpoint.clone(),
                health: s.health,
                leased_by: s.lease.as_ref().map(|l| l.holder.clone()),
            })
            .collect();
        statuses.sort_by(|a, b| a.endpoint.id.cmp(&b.endpoint.id));
        statuses
    }

    /// Number of endpoints bound to `provider`
    pub async fn endpoint_count(&self, provider: Provider) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|s| s.endpoint.provider == provider)
            .count()
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.read().await;
        let mut stats = PoolStats {
            total: slots.len(),
            ..Default::default()
        };
        for slot in slots.values() {
            match slot.health {
                HealthState::Healthy => stats.healthy += 1,
                HealthState::Unreachable => stats.unreachable += 1,
                HealthState::Unknown => stats.unknown += 1,
            }
            if slot.lease.is_some() {
                stats.leased += 1;
            }
        }
        stats
    }

    /// Start background probing and expiry sweeps until `shutdown` flips to true
    pub fn start_maintenance(
        self: Arc<Self>,
        probe_interval: Duration,
        sweep_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut probe_tick = tokio::time::interval(probe_interval);
            let mut sweep_tick = tokio::time::interval(sweep_interval);

            loop {
                tokio::select! {
                    _ = probe_tick.tick() => {
                        self.probe_all().await;
                    }
                    _ = sweep_tick.tick() => {
                        let reclaimed = self.sweep_expired().await;
                        if reclaimed > 0 {
                            debug!(reclaimed, "Expiry sweep reclaimed leases");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Pool maintenance stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
