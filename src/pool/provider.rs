//! `Provider`, `ConnectionPool` and the system-wide `GlobalConnectionSemaphore`.
//!
//! Grounded on the teacher's `nntp/pool.rs` (`NntpPoolBuilder`/`NntpPoolExt`),
//! generalized so the pool is reusable across providers while a single
//! semaphore caps total physical connections system-wide (spec.md §4.1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{Object, Pool, PoolError, Timeouts};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::connection::ConnectionFactory;
use super::manager::PoolManager;
use crate::context::Context;
use crate::error::FetchError;

/// Descriptor for one upstream article source.
#[derive(Debug, Clone)]
pub struct Provider {
    pub index: usize,
    pub host: String,
    pub max_local_connections: u32,
    /// Lower is tried first when providers are otherwise tied.
    pub priority: u32,
    pub disabled: bool,
}

/// System-wide cap on concurrent physical connections, shared by every
/// provider's `ConnectionPool`. `permits + live connections == total`
/// (spec.md §3 invariant) holds because a permit is acquired strictly
/// before a connection is created or reused, and released strictly after
/// the connection is returned or destroyed.
#[derive(Clone)]
pub struct GlobalConnectionSemaphore {
    semaphore: Arc<Semaphore>,
    total: u32,
}

impl GlobalConnectionSemaphore {
    pub fn new(total: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(total as usize)),
            total,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn acquire_owned(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("global connection semaphore is never closed")
    }
}

/// A leased connection: a global permit plus the pooled object, released
/// together so the conservation invariant can never be violated by one
/// half leaking.
pub struct Lease<F: ConnectionFactory> {
    object: Option<Object<PoolManager<F>>>,
    _global_permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> Lease<F> {
    pub fn connection(&mut self) -> &mut F::Connection {
        self.object.as_mut().expect("lease already released")
    }

    /// Returns the connection to its pool, or destroys it if `faulted`.
    /// The global permit is always released by dropping `self`.
    pub fn release(mut self, faulted: bool) {
        if let Some(object) = self.object.take() {
            if faulted {
                // Consuming the object without returning it drops the
                // underlying connection; deadpool creates a fresh one
                // lazily the next time this pool is under its max size.
                Object::take(object);
            }
            // else: dropping `object` here returns it to the pool normally.
        }
    }
}

/// Bounded pool of connections to one provider, fronted by the global
/// semaphore (spec.md §4.1).
pub struct ConnectionPool<F: ConnectionFactory> {
    provider: Provider,
    pool: Pool<PoolManager<F>>,
    global: GlobalConnectionSemaphore,
    acquires_by_kind: Arc<KindCounters>,
}

#[derive(Default)]
struct KindCounters {
    queue: AtomicU64,
    health_check: AtomicU64,
    streaming: AtomicU64,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(
        provider: Provider,
        factory: F,
        global: GlobalConnectionSemaphore,
        idle_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let manager = PoolManager::new(factory);
        let pool = Pool::builder(manager)
            .max_size(provider.max_local_connections as usize)
            .runtime(deadpool::Runtime::Tokio1)
            .timeouts(Timeouts {
                wait: None,
                create: Some(Duration::from_secs(30)),
                recycle: Some(idle_timeout),
            })
            .build()
            .map_err(|e| FetchError::Protocol(format!("failed to build connection pool: {e}")))?;

        Ok(Self {
            provider,
            pool,
            global,
            acquires_by_kind: Arc::new(KindCounters::default()),
        })
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Acquire a connection: the global permit first, then a local slot.
    /// `Acquire` only fails via context cancellation (spec.md §4.1).
    pub async fn acquire(&self, ctx: &Context) -> Result<Lease<F>, FetchError> {
        let global_permit = tokio::select! {
            permit = self.global.acquire_owned() => permit,
            _ = ctx.cancelled() => return Err(FetchError::Cancelled),
        };

        if let Some(kind) = ctx.kind() {
            self.bump_kind(kind);
        }

        let object = tokio::select! {
            result = self.pool.get() => result.map_err(|e| match e {
                PoolError::Timeout(_) => FetchError::Timeout { seconds: 30 },
                PoolError::Backend(inner) => inner,
                other => FetchError::Protocol(other.to_string()),
            })?,
            _ = ctx.cancelled() => return Err(FetchError::Cancelled),
        };

        Ok(Lease {
            object: Some(object),
            _global_permit: global_permit,
        })
    }

    fn bump_kind(&self, kind: crate::context::OperationKind) {
        use crate::context::OperationKind::*;
        let counter = match kind {
            Queue => &self.acquires_by_kind.queue,
            HealthCheck => &self.acquires_by_kind.health_check,
            Streaming => &self.acquires_by_kind.streaming,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Total connections acquired under the given operation kind since this
    /// pool was created, for `PoolObserver`-style stats surfacing.
    pub fn acquires_for(&self, kind: crate::context::OperationKind) -> u64 {
        use crate::context::OperationKind::*;
        let counter = match kind {
            Queue => &self.acquires_by_kind.queue,
            HealthCheck => &self.acquires_by_kind.health_check,
            Streaming => &self.acquires_by_kind.streaming,
        };
        counter.load(Ordering::Relaxed)
    }

    /// Pre-warm the pool by creating `target` connections up front.
    pub async fn warm_up(&self, target: usize) {
        let mut held = Vec::new();
        for _ in 0..target.min(self.pool.status().max_size) {
            match self.pool.get().await {
                Ok(conn) => held.push(conn),
                Err(e) => {
                    tracing::warn!(provider = %self.provider.host, "failed to pre-warm connection: {}", e);
                    break;
                }
            }
        }
        // Connections return to the pool as `held` drops here.
    }

    pub fn live(&self) -> usize {
        self.pool.status().size
    }

    pub fn idle(&self) -> usize {
        self.pool.status().available.max(0) as usize
    }

    pub fn active(&self) -> usize {
        self.live().saturating_sub(self.idle())
    }

    pub fn local_remaining(&self) -> usize {
        (self.pool.status().max_size).saturating_sub(self.active())
    }
}
