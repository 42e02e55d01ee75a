//! Core data model: segment identity, headers, buffered payloads and the
//! ordered fetch plan a `BufferedSegmentStream` is built over.
//!
//! See spec.md §3 for the entity table these types implement.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Opaque identifier for one remote article.
///
/// Cheap to clone (`Arc<str>` internally) since it is threaded through
/// every queue, slot and log line in the streaming pipeline.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SegmentId(Arc<str>);

impl SegmentId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SegmentId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Declared placement of a segment within its enclosing file, as reported
/// by a provider's header metadata (cheap to fetch, no body transfer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub part_offset: i64,
    pub part_size: i64,
    /// Article posting date, Unix seconds, if the provider reports one.
    pub date: Option<i64>,
}

/// A buffered, decoded byte payload for one segment.
///
/// `Segment` owns its bytes until the reader consumes them, at which point
/// `BufferedSegmentStream` releases the underlying buffer back to the pool
/// (see `stream::buffer_pool`).
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: SegmentId,
    pub data: Bytes,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A zero-filled stand-in for a segment that is permanently missing at
    /// every provider (spec.md §4.4.3 graceful degradation).
    pub fn zero_filled(id: SegmentId, len: usize) -> Self {
        Self {
            id,
            data: Bytes::from(vec![0u8; len]),
        }
    }
}

/// An ordered list of segments to stream, with optional per-segment sizes
/// used for seeking and for inferring zero-fill length on degradation.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    segment_ids: Vec<SegmentId>,
    /// Per-segment byte length, parallel to `segment_ids`, when known.
    segment_sizes: Option<Vec<u64>>,
    total_bytes: u64,
    /// The NNTP newsgroup (or equivalent) this plan's segments live in,
    /// threaded through to the fetcher so it can select a group once.
    group: Option<String>,
}

impl FetchPlan {
    /// Build a plan from segment ids with known per-segment sizes summing
    /// to `total_bytes`. Panics (via debug_assert) in test builds if sizes
    /// don't sum to `total_bytes`, since that invariant underwrites seek.
    pub fn new(segment_ids: Vec<SegmentId>, segment_sizes: Vec<u64>, group: Option<String>) -> Self {
        debug_assert_eq!(segment_ids.len(), segment_sizes.len());
        let total_bytes = segment_sizes.iter().sum();
        Self {
            segment_ids,
            segment_sizes: Some(segment_sizes),
            total_bytes,
            group,
        }
    }

    /// Build a plan without cached sizes; seeking will fall back to
    /// interpolation search against live segment headers (spec.md §4.5).
    pub fn without_sizes(segment_ids: Vec<SegmentId>, total_bytes: u64, group: Option<String>) -> Self {
        Self {
            segment_ids,
            segment_sizes: None,
            total_bytes,
            group,
        }
    }

    pub fn len(&self) -> usize {
        self.segment_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segment_ids.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn segment_id(&self, index: usize) -> Option<&SegmentId> {
        self.segment_ids.get(index)
    }

    pub fn segment_ids(&self) -> &[SegmentId] {
        &self.segment_ids
    }

    pub fn segment_size(&self, index: usize) -> Option<u64> {
        self.segment_sizes.as_ref().and_then(|s| s.get(index).copied())
    }

    pub fn segment_sizes(&self) -> Option<&[u64]> {
        self.segment_sizes.as_deref()
    }

    pub fn has_sizes(&self) -> bool {
        self.segment_sizes.is_some()
    }

    /// Construct a sub-plan covering `segment_ids[from..]`, used when
    /// `NzbFileStream::seek` replaces the buffered stream (spec.md §4.5).
    /// `consumed_bytes` is the cumulative offset of segment `from` within
    /// this plan; it is only needed for the no-cached-sizes branch, where
    /// there is no other way to know how much of `total_bytes` precedes it.
    pub fn suffix(&self, from: usize, consumed_bytes: u64) -> FetchPlan {
        let ids = self.segment_ids[from..].to_vec();
        match &self.segment_sizes {
            Some(sizes) => {
                let sizes = sizes[from..].to_vec();
                FetchPlan::new(ids, sizes, self.group.clone())
            }
            None => {
                let remaining = self.total_bytes.saturating_sub(consumed_bytes);
                FetchPlan::without_sizes(ids, remaining, self.group.clone())
            }
        }
    }

    /// Cumulative offset of the start of `index` within the plan, when
    /// sizes are known. Used by the seek binary search.
    pub fn cumulative_offset(&self, index: usize) -> Option<u64> {
        let sizes = self.segment_sizes.as_ref()?;
        Some(sizes[..index].iter().sum())
    }
}
