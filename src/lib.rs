//! nzb-core - streaming core for exposing NZB/Usenet archive content as
//! seekable byte streams.
//!
//! This crate owns ordered, resumable delivery of segment bytes under
//! parallel, out-of-order fetch: connection pooling, provider fallback and
//! racing, quality-of-service admission, and the buffered stream that
//! turns all of that into a single seekable file. Article retrieval
//! itself is out of scope: an embedder implements `SegmentFetcher` and
//! `ConnectionFactory` against whatever wire protocol it speaks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use nzb_core::client::MultiProviderClient;
//! use nzb_core::config::StreamerConfig;
//! use nzb_core::context::Context;
//! use nzb_core::limiter::GlobalOperationLimiter;
//! use nzb_core::nzb_plan::NzbPlanBuilder;
//! use nzb_core::nzb_stream::NzbFileStream;
//!
//! # async fn run<F: nzb_core::pool::ConnectionFactory + 'static>(client: Arc<MultiProviderClient<F>>) -> nzb_core::error::Result<()> {
//! let config = StreamerConfig::default();
//! let entries = NzbPlanBuilder::from_file("archive.nzb")?;
//! let limiter = Arc::new(GlobalOperationLimiter::new(&config.pool));
//! let ctx = Context::root();
//! let mut stream = NzbFileStream::new(entries[0].plan.clone(), client, limiter, config.stream, &ctx);
//! let mut buf = vec![0u8; 64 * 1024];
//! let _n = stream.read(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod nzb_plan;
pub mod nzb_stream;
pub mod plan;
pub mod pool;
pub mod stream;

/// Mock `SegmentFetcher`/`ConnectionFactory` implementations for this
/// crate's own tests and for embedders' integration tests.
pub mod testing;

pub use client::MultiProviderClient;
pub use config::StreamerConfig;
pub use context::{Context, OperationKind};
pub use error::{Result, StreamError};
pub use limiter::{GlobalOperationLimiter, OperationPermit};
pub use logging::init_tracing;
pub use nzb_plan::{NzbFileEntry, NzbPlanBuilder};
pub use nzb_stream::NzbFileStream;
pub use plan::{FetchPlan, Segment, SegmentHeader, SegmentId};
pub use stream::BufferedSegmentStream;
