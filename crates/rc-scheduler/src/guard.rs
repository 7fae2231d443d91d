//! Firing guards
//!
//! A NOT_CONCURRENT job may fire on at most one node per tick. The guard
//! decides whether this node won the firing: the Redis guard takes a
//! short-lived lease with SET NX, the local guard always claims and is the
//! right choice for single-node deployments.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait FiringGuard: Send + Sync {
    /// Claim the right to fire `job_name` now. Returns false when another
    /// node already holds the firing lease.
    async fn try_claim(&self, job_name: &str) -> Result<bool>;
}

/// Always claims. Used when cluster coordination is disabled.
pub struct LocalFiringGuard;

#[async_trait]
impl FiringGuard for LocalFiringGuard {
    async fn try_claim(&self, _job_name: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Cluster-wide firing lease: `SET key instance_id NX PX ttl`. The lease
/// expires on its own, so a crashed node cannot wedge a job forever.
pub struct RedisFiringGuard {
    connection: redis::aio::ConnectionManager,
    instance_id: String,
    firing_ttl: Duration,
}

impl RedisFiringGuard {
    pub fn new(
        connection: redis::aio::ConnectionManager,
        instance_id: String,
        firing_ttl: Duration,
    ) -> Self {
        Self {
            connection,
            instance_id,
            firing_ttl,
        }
    }

    pub async fn connect(
        redis_url: &str,
        instance_id: String,
        firing_ttl: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::new(connection, instance_id, firing_ttl))
    }

    fn lease_key(&self, job_name: &str) -> String {
        format!("relaycore:job:{}:firing", job_name)
    }
}

#[async_trait]
impl FiringGuard for RedisFiringGuard {
    async fn try_claim(&self, job_name: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(self.lease_key(job_name))
            .arg(&self.instance_id)
            .arg("NX")
            .arg("PX")
            .arg(self.firing_ttl.as_millis() as u64)
            .query_async(&mut connection)
            .await?;

        let won = claimed.is_some();
        debug!(job = job_name, instance = %self.instance_id, won, "Firing lease attempt");
        Ok(won)
    }
}
