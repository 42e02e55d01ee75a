//! `SegmentFetcher` and `ConnectionFactory`: the two traits an embedder
//! implements to plug a real article-retrieval wire protocol (NNTP, or
//! anything else) into this streaming core.
//!
//! The shape here is generalized from the teacher's concrete
//! `AsyncNntpConnection` (connect/authenticate/download_segment/is_healthy)
//! into traits, since the wire protocol itself is out of scope for this
//! crate (spec.md §1).

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::FetchError;
use crate::plan::{SegmentHeader, SegmentId};

/// A decoded segment body plus whatever header metadata the provider
/// returned inline with it (spec.md §6.2: `GetSegmentStream`).
#[derive(Debug, Clone)]
pub struct FetchedSegment {
    pub data: Bytes,
    pub header: Option<SegmentHeader>,
}

/// Per-connection capability: given an acquired connection, fetch a
/// segment's header or body. One `SegmentFetcher` instance corresponds to
/// one authenticated session to one provider.
#[async_trait]
pub trait SegmentFetcher: Send {
    /// Cheap metadata probe; must not transfer the segment body
    /// (spec.md §6.2: `GetSegmentHeader`).
    async fn fetch_header(&mut self, id: &SegmentId) -> Result<SegmentHeader, FetchError>;

    /// Fetch and decode the full segment body.
    async fn fetch_segment(&mut self, id: &SegmentId, group: Option<&str>) -> Result<FetchedSegment, FetchError>;

    /// Lightweight liveness probe used by the pool before reusing an idle
    /// connection (spec.md §4.1).
    async fn is_healthy(&mut self) -> bool;
}

/// Per-provider connection factory: creates and authenticates new
/// sessions. Generalizes the teacher's `NntpConnectionManager::create`.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Connection: SegmentFetcher + 'static;

    async fn connect(&self) -> Result<Self::Connection, FetchError>;
}
