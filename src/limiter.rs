//! `GlobalOperationLimiter`: admission control by `OperationKind`
//! (spec.md §4.2).
//!
//! The Open Question of whether guarantees should be hard partitions or
//! soft floors over a shared pool is resolved conservatively (SPEC_FULL.md
//! §9): each kind gets its own dedicated semaphore sized to its guarantee,
//! so a burst of queue operations can never starve streaming even
//! partially, at the cost of each kind being unable to borrow another's
//! idle capacity.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::context::{Context, OperationKind};
use crate::error::FetchError;

/// Per-kind admission gate, independent of the connection pools themselves.
/// A caller must hold an `OperationPermit` before acquiring an actual
/// connection lease.
pub struct GlobalOperationLimiter {
    queue: Arc<Semaphore>,
    health_check: Arc<Semaphore>,
    streaming: Arc<Semaphore>,
}

impl GlobalOperationLimiter {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            queue: Arc::new(Semaphore::new(config.queue_guaranteed as usize)),
            health_check: Arc::new(Semaphore::new(config.health_check_guaranteed as usize)),
            streaming: Arc::new(Semaphore::new(config.streaming_guaranteed() as usize)),
        }
    }

    fn semaphore_for(&self, kind: OperationKind) -> &Arc<Semaphore> {
        match kind {
            OperationKind::Queue => &self.queue,
            OperationKind::HealthCheck => &self.health_check,
            OperationKind::Streaming => &self.streaming,
        }
    }

    /// Admits an operation of `ctx`'s kind, or fails on cancellation.
    /// Defaults to `Streaming` when the context carries no explicit kind.
    pub async fn acquire(&self, ctx: &Context) -> Result<OperationPermit, FetchError> {
        let kind = ctx.kind().unwrap_or(OperationKind::Streaming);
        let semaphore = self.semaphore_for(kind).clone();

        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.expect("operation semaphore is never closed"),
            _ = ctx.cancelled() => return Err(FetchError::Cancelled),
        };

        Ok(OperationPermit {
            kind,
            _permit: permit,
        })
    }

    pub fn available(&self, kind: OperationKind) -> usize {
        self.semaphore_for(kind).available_permits()
    }
}

/// A single admitted operation slot. Dropping it releases the slot exactly
/// once; there is no explicit release method because nothing downstream
/// needs to distinguish success from failure at this layer.
pub struct OperationPermit {
    kind: OperationKind,
    _permit: OwnedSemaphorePermit,
}

impl OperationPermit {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}
