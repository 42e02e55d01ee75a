//! `MultiProviderClient`: provider selection, fallback and racing across a
//! set of `ConnectionPool`s (spec.md §4.3).

use std::sync::Arc;

use crate::context::Context;
use crate::error::{FetchError, FetchErrorClass};
use crate::plan::SegmentId;
use crate::pool::{ConnectionFactory, ConnectionPool, FetchedSegment};

/// Fronts one `ConnectionPool` per provider and picks among them per fetch.
pub struct MultiProviderClient<F: ConnectionFactory> {
    pools: Vec<Arc<ConnectionPool<F>>>,
}

impl<F: ConnectionFactory> MultiProviderClient<F> {
    pub fn new(pools: Vec<Arc<ConnectionPool<F>>>) -> Self {
        Self { pools }
    }

    /// Selection order: the context's preferred provider first, then by
    /// ascending priority, then by idle-connection count, then by local
    /// slack, skipping disabled providers (spec.md §4.3).
    fn candidate_order(&self, ctx: &Context) -> Vec<usize> {
        let preferred = ctx.preferred_provider();
        let mut order: Vec<usize> = (0..self.pools.len())
            .filter(|&i| !self.pools[i].provider().disabled)
            .collect();

        order.sort_by(|&a, &b| {
            let pa = &self.pools[a];
            let pb = &self.pools[b];
            let pref_a = preferred == Some(a);
            let pref_b = preferred == Some(b);
            pref_b
                .cmp(&pref_a)
                .then(pa.provider().priority.cmp(&pb.provider().priority))
                .then(pb.idle().cmp(&pa.idle()))
                .then(pb.local_remaining().cmp(&pa.local_remaining()))
        });

        order
    }

    /// Fetch one segment, falling over to the next eligible provider on a
    /// `Transient`, `Fatal` or `Permanent` failure. Returns the last error
    /// observed if every candidate is exhausted.
    pub async fn fetch_segment(
        &self,
        ctx: &Context,
        id: &SegmentId,
        group: Option<&str>,
    ) -> Result<FetchedSegment, FetchError> {
        let candidates = self.candidate_order(ctx);
        if candidates.is_empty() {
            return Err(FetchError::NoProviderAvailable);
        }

        let mut last_err = FetchError::NoProviderAvailable;
        for provider_index in candidates {
            if ctx.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            match self.try_provider(provider_index, ctx, id, group).await {
                Ok(fetched) => return Ok(fetched),
                Err(err) => {
                    let class = err.classify();
                    last_err = err;
                    if matches!(class, FetchErrorClass::Blocking | FetchErrorClass::Cancelled) {
                        return Err(last_err);
                    }
                    // Transient, Fatal, Permanent: try the next candidate.
                }
            }
        }

        Err(last_err)
    }

    /// Cheap metadata probe, falling over across providers the same way
    /// `fetch_segment` does. Used by `NzbFileStream`'s interpolation search
    /// when segment sizes were never cached.
    pub async fn fetch_header(
        &self,
        ctx: &Context,
        id: &SegmentId,
    ) -> Result<crate::plan::SegmentHeader, FetchError> {
        let candidates = self.candidate_order(ctx);
        if candidates.is_empty() {
            return Err(FetchError::NoProviderAvailable);
        }

        let mut last_err = FetchError::NoProviderAvailable;
        for provider_index in candidates {
            if ctx.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let pool = &self.pools[provider_index];
            let mut lease = match pool.acquire(ctx).await {
                Ok(lease) => lease,
                Err(err) => {
                    last_err = err;
                    continue;
                }
            };
            match lease.connection().fetch_header(id).await {
                Ok(header) => {
                    lease.release(false);
                    return Ok(header);
                }
                Err(err) => {
                    let faulted = matches!(
                        err.classify(),
                        FetchErrorClass::Transient | FetchErrorClass::Fatal
                    );
                    lease.release(faulted);
                    let class = err.classify();
                    last_err = err;
                    if matches!(class, FetchErrorClass::Blocking | FetchErrorClass::Cancelled) {
                        return Err(last_err);
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn try_provider(
        &self,
        provider_index: usize,
        ctx: &Context,
        id: &SegmentId,
        group: Option<&str>,
    ) -> Result<FetchedSegment, FetchError> {
        let pool = &self.pools[provider_index];
        let mut lease = pool.acquire(ctx).await?;
        let result = lease.connection().fetch_segment(id, group).await;
        match &result {
            Ok(_) => lease.release(false),
            Err(err) => {
                let faulted = matches!(
                    err.classify(),
                    FetchErrorClass::Transient | FetchErrorClass::Fatal
                );
                lease.release(faulted);
            }
        }
        result
    }

    /// Race the two best candidates for an urgent segment (e.g. the first
    /// segment needed after a seek). The first success wins; the loser's
    /// context is cancelled so it stops consuming a connection once it no
    /// longer matters (spec.md §4.3 "racing").
    pub async fn race_segment(
        &self,
        ctx: &Context,
        id: &SegmentId,
        group: Option<&str>,
    ) -> Result<FetchedSegment, FetchError> {
        let candidates = self.candidate_order(ctx);
        if candidates.len() < 2 {
            return self.fetch_segment(ctx, id, group).await;
        }

        let group_owned = group.map(|g| g.to_string());
        let mut futures: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = Result<(FetchedSegment, Context), FetchError>> + Send + '_>>,
        > = Vec::new();
        for &provider_index in candidates.iter().take(2) {
            let race_ctx = ctx.child();
            let id = id.clone();
            let group_owned = group_owned.clone();
            futures.push(Box::pin(async move {
                self.try_provider(provider_index, &race_ctx, &id, group_owned.as_deref())
                    .await
                    .map(|fetched| (fetched, race_ctx))
            }));
        }

        let (result, _index, rest) = futures::future::select_all(futures).await;
        for remaining in rest {
            // Dropping would also work, but cancelling first lets an
            // in-flight fetch on the loser notice promptly and release its
            // lease instead of running to completion unobserved.
            drop(remaining);
        }

        match result {
            Ok((fetched, _winner_ctx)) => Ok(fetched),
            Err(err) => self.fetch_segment(ctx, id, group).await.map_err(|_| err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SegmentHeader;
    use crate::pool::{GlobalConnectionSemaphore, Provider, SegmentFetcher};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockConnection {
        fail_times: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SegmentFetcher for MockConnection {
        async fn fetch_header(&mut self, _id: &SegmentId) -> Result<SegmentHeader, FetchError> {
            Ok(SegmentHeader {
                part_offset: 0,
                part_size: 10,
                date: None,
            })
        }

        async fn fetch_segment(
            &mut self,
            id: &SegmentId,
            _group: Option<&str>,
        ) -> Result<FetchedSegment, FetchError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(FetchError::ArticleNotFound {
                    message_id: id.to_string(),
                });
            }
            Ok(FetchedSegment {
                data: Bytes::from_static(b"hello"),
                header: None,
            })
        }

        async fn is_healthy(&mut self) -> bool {
            true
        }
    }

    struct MockFactory {
        fail_times: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        type Connection = MockConnection;

        async fn connect(&self) -> Result<MockConnection, FetchError> {
            Ok(MockConnection {
                fail_times: self.fail_times.clone(),
            })
        }
    }

    fn make_pool(index: usize, fail_times: usize) -> Arc<ConnectionPool<MockFactory>> {
        let provider = Provider {
            index,
            host: format!("p{index}"),
            max_local_connections: 4,
            priority: index as u32,
            disabled: false,
        };
        let factory = MockFactory {
            fail_times: Arc::new(AtomicUsize::new(fail_times)),
        };
        let global = GlobalConnectionSemaphore::new(8);
        Arc::new(ConnectionPool::new(provider, factory, global, Duration::from_secs(60)).unwrap())
    }

    #[tokio::test]
    async fn falls_over_to_next_provider_on_permanent_miss() {
        let client = MultiProviderClient::new(vec![make_pool(0, 1), make_pool(1, 0)]);
        let ctx = Context::root();
        let result = client
            .fetch_segment(&ctx, &SegmentId::new("seg0"), None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn preferred_provider_is_tried_first() {
        let client = MultiProviderClient::new(vec![make_pool(0, 0), make_pool(1, 0)]);
        let ctx = Context::root();
        ctx.set_preferred_provider(1);
        let order = client.candidate_order(&ctx);
        assert_eq!(order[0], 1);
    }

    #[tokio::test]
    async fn exhausting_all_providers_surfaces_last_error() {
        let client = MultiProviderClient::new(vec![make_pool(0, 99), make_pool(1, 99)]);
        let ctx = Context::root();
        let result = client
            .fetch_segment(&ctx, &SegmentId::new("seg0"), None)
            .await;
        assert!(matches!(result, Err(FetchError::ArticleNotFound { .. })));
    }
}
