//! Endpoint liveness checks

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Endpoint, HealthState};

/// Cheap liveness check for one endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns `Healthy` or `Unreachable`
    async fn check(&self, endpoint: &Endpoint) -> HealthState;
}

/// Healthy when a TCP connection to the endpoint address opens in time
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000))
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self, endpoint: &Endpoint) -> HealthState {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&endpoint.address)).await {
            Ok(Ok(_)) => HealthState::Healthy,
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint.id, address = %endpoint.address, error = %e, "Probe connect failed");
                HealthState::Unreachable
            }
            Err(_) => {
                debug!(endpoint = %endpoint.id, address = %endpoint.address, "Probe timed out");
                HealthState::Unreachable
            }
        }
    }
}
