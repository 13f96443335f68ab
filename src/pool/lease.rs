//! Lease records and the mutual-exclusion table behind them

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::Endpoint;
use crate::error::Result;

/// Exclusive, time-bounded hold on one endpoint.
///
/// Only [`EndpointPool`](super::EndpointPool) creates leases. Hand it back with
/// [`EndpointPool::release`](super::EndpointPool::release).
#[derive(Debug)]
pub struct Lease {
    pub endpoint: Endpoint,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub deadline: Instant,
    pub(crate) token: String,
}

impl Lease {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Set-if-absent table of endpoint claims.
///
/// A claim is identified by a token unique per grant. Implementations must
/// guarantee that `try_claim` succeeds for at most one token per endpoint until
/// that token is released or its TTL passes.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim `endpoint_id` for `token` unless a live claim exists
    async fn try_claim(&self, endpoint_id: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Drop the claim if `token` still owns it; returns whether it did
    async fn release(&self, endpoint_id: &str, token: &str) -> Result<bool>;

    /// Whether other processes can hold claims in this store
    fn is_shared(&self) -> bool {
        false
    }
}

/// Lock table for a single process
#[derive(Debug, Default)]
pub struct InProcessLeaseStore {
    claims: Mutex<HashMap<String, (String, Instant)>>,
    shared: bool,
}

impl InProcessLeaseStore {
    /// Table owned by one pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Table handed to several pools, which then poll for each other's releases
    pub fn shared() -> Self {
        Self {
            shared: true,
            ..Self::default()
        }
    }

    /// Live claims right now
    pub fn active(&self) -> usize {
        let now = Instant::now();
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.values().filter(|(_, deadline)| *deadline > now).count()
    }
}

#[async_trait]
impl LeaseStore for InProcessLeaseStore {
    async fn try_claim(&self, endpoint_id: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.get(endpoint_id) {
            Some((_, deadline)) if *deadline > now => Ok(false),
            _ => {
                claims.insert(endpoint_id.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, endpoint_id: &str, token: &str) -> Result<bool> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.get(endpoint_id) {
            Some((owner, _)) if owner == token => {
                claims.remove(endpoint_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_shared(&self) -> bool {
        self.shared
    }
}
