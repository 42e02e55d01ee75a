//! The ordered-delivery core (spec.md §4.4): pooled scratch buffers, the
//! out-of-order slot table, and `BufferedSegmentStream` itself.

mod buffer_pool;
mod buffered;
mod slots;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use buffered::BufferedSegmentStream;
pub use slots::{SlotState, SlotTable};
