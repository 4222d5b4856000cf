//! Limiter store backed by Chitchat cluster state.
//!
//! Each node publishes the arrival times it computes under its own node
//! state; reads take the freshest live value any live node has published.
//! Conditional writes are serialized per node by the chitchat lock, and
//! gossip carries them to peers.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tracing::trace;

use crate::error::Result;
use crate::mesh::{Cluster, TatEntry, TatKey};

use super::clock::{Clock, SystemClock};
use super::store::{normalize_ttl, RateLimitStore};

/// A [`RateLimitStore`] shared across the mesh.
pub struct MeshStore {
    /// The cluster for distributed state.
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
}

impl MeshStore {
    /// Create a new mesh store.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self::with_clock(cluster, Arc::new(SystemClock))
    }

    /// Create a new mesh store that expires entries according to `clock`.
    pub fn with_clock(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self { cluster, clock }
    }

    /// The cluster this store publishes to.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    async fn write(
        &self,
        key: &str,
        expect_present: bool,
        timestamp: i64,
        ttl: Duration,
    ) -> Result<bool> {
        let now_ms = self.clock.now_millis();
        let ttl_ms = normalize_ttl(ttl).num_milliseconds().max(1);
        let entry = TatEntry::new(timestamp, now_ms.saturating_add(ttl_ms));

        let written = self
            .cluster
            .write_entry_if(&TatKey::new(key), expect_present, entry, now_ms)
            .await;

        trace!(
            key = %key,
            timestamp,
            expect_present,
            written,
            "Mesh store write"
        );

        Ok(written)
    }
}

#[async_trait]
impl RateLimitStore for MeshStore {
    async fn try_get(&self, key: &str) -> Result<Option<i64>> {
        let now_ms = self.clock.now_millis();
        let entry = self.cluster.read_entry(&TatKey::new(key), now_ms).await;
        Ok(entry.map(|entry| entry.tat))
    }

    async fn add(&self, key: &str, timestamp: i64, ttl: Duration) -> Result<bool> {
        self.write(key, false, timestamp, ttl).await
    }

    async fn update(&self, key: &str, timestamp: i64, ttl: Duration) -> Result<bool> {
        self.write(key, true, timestamp, ttl).await
    }
}
