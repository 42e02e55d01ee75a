//! Bridges a `ConnectionFactory` into a `deadpool::managed::Manager`,
//! generalizing the teacher's `nntp/pool.rs` `NntpConnectionManager`.

use deadpool::managed::{Manager, RecycleResult};

use super::connection::{ConnectionFactory, SegmentFetcher};
use crate::error::FetchError;

pub struct PoolManager<F: ConnectionFactory> {
    factory: F,
}

impl<F: ConnectionFactory> PoolManager<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F: ConnectionFactory> Manager for PoolManager<F> {
    type Type = F::Connection;
    type Error = FetchError;

    async fn create(&self) -> Result<F::Connection, FetchError> {
        self.factory.connect().await.map_err(|e| {
            tracing::error!("failed to create provider connection: {}", e);
            e
        })
    }

    async fn recycle(
        &self,
        conn: &mut F::Connection,
        _metrics: &deadpool::managed::Metrics,
    ) -> RecycleResult<FetchError> {
        if conn.is_healthy().await {
            Ok(())
        } else {
            Err(deadpool::managed::RecycleError::StaticMessage(
                "connection failed health check",
            ))
        }
    }
}
