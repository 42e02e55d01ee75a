//! `NzbFileStream`: a seekable view over a `FetchPlan`, built on top of
//! `BufferedSegmentStream` (spec.md §4.5).

use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::client::MultiProviderClient;
use crate::config::StreamTuning;
use crate::context::Context;
use crate::error::StreamError;
use crate::limiter::GlobalOperationLimiter;
use crate::plan::FetchPlan;
use crate::pool::ConnectionFactory;
use crate::stream::BufferedSegmentStream;

/// Seekable byte stream over one NZB file's segments.
///
/// `read` drains the current inner `BufferedSegmentStream` in order; `seek`
/// locates the segment containing the target offset (binary search when
/// sizes are cached, interpolation search against live headers otherwise)
/// and replaces the inner stream with one built over the plan's suffix
/// from that segment, discarding the intra-segment prefix before the
/// target byte.
pub struct NzbFileStream<F: ConnectionFactory> {
    plan: FetchPlan,
    client: Arc<MultiProviderClient<F>>,
    limiter: Arc<GlobalOperationLimiter>,
    tuning: StreamTuning,
    ctx: Context,
    inner: Option<BufferedSegmentStream>,
    /// Absolute offset of the first unconsumed byte of `leftover`.
    leftover: Option<Bytes>,
    position: u64,
    /// Sizes discovered via header probes when the plan has none cached,
    /// indexed the same as `plan.segment_ids()`.
    probed_sizes: Vec<Option<u64>>,
    last_seek_offset: Option<u64>,
    repeated_seeks: u32,
}

impl<F: ConnectionFactory + 'static> NzbFileStream<F> {
    pub fn new(
        plan: FetchPlan,
        client: Arc<MultiProviderClient<F>>,
        limiter: Arc<GlobalOperationLimiter>,
        tuning: StreamTuning,
        parent_ctx: &Context,
    ) -> Self {
        let probed_sizes = vec![None; plan.len()];
        let ctx = parent_ctx.child();
        let inner = Some(BufferedSegmentStream::new(
            plan.clone(),
            client.clone(),
            limiter.clone(),
            tuning.clone(),
            &ctx,
        ));
        Self {
            plan,
            client,
            limiter,
            tuning,
            ctx,
            inner,
            leftover: None,
            position: 0,
            probed_sizes,
            last_seek_offset: None,
            repeated_seeks: 0,
        }
    }

    pub fn length(&self) -> u64 {
        self.plan.total_bytes()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read up to `buf.len()` bytes, returning `0` at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.repeated_seeks = 0;

        if buf.is_empty() {
            return Ok(0);
        }

        if self.leftover.as_ref().map(|b| b.is_empty()).unwrap_or(true) {
            let Some(inner) = self.inner.as_mut() else {
                return Ok(0);
            };
            match inner.recv().await {
                Some(Ok(bytes)) => self.leftover = Some(bytes),
                Some(Err(err)) => return Err(err),
                None => {
                    self.inner = None;
                    return Ok(0);
                }
            }
        }

        let chunk = self.leftover.as_mut().expect("just populated");
        let to_copy = buf.len().min(chunk.len());
        chunk.copy_to_slice(&mut buf[..to_copy]);
        self.position += to_copy as u64;
        if chunk.is_empty() {
            self.leftover = None;
        }
        Ok(to_copy)
    }

    /// Seek to an absolute byte offset, rebuilding the inner stream from
    /// the segment containing it. Forward and backward seeks are both
    /// supported by discarding the current stream and replanning; there is
    /// no incremental backward-seek optimization (spec.md §5 Non-goals).
    pub async fn seek(&mut self, offset: u64) -> Result<(), StreamError> {
        if offset > self.length() {
            return Err(StreamError::InvalidState(format!(
                "seek offset {offset} past end of stream (length {})",
                self.length()
            )));
        }

        if self.last_seek_offset == Some(offset) {
            self.repeated_seeks += 1;
            if self.repeated_seeks > self.tuning.seek_loop_guard {
                return Err(StreamError::InvalidState(format!(
                    "seek loop guard tripped: offset {offset} seeked {} times without an intervening read",
                    self.repeated_seeks
                )));
            }
        } else {
            self.last_seek_offset = Some(offset);
            self.repeated_seeks = 1;
        }

        if offset == self.position {
            return Ok(());
        }

        let (segment_index, segment_start) = if self.plan.has_sizes() {
            self.locate_by_binary_search(offset)
        } else {
            self.locate_by_interpolation_search(offset).await?
        };

        let suffix = self.plan.suffix(segment_index, segment_start);
        self.ctx.cancel();
        self.ctx = self.ctx.child();
        self.inner = Some(BufferedSegmentStream::new(
            suffix,
            self.client.clone(),
            self.limiter.clone(),
            self.tuning.clone(),
            &self.ctx,
        ));
        self.leftover = None;
        self.position = segment_start;

        let prefix = offset - segment_start;
        if prefix > 0 {
            // `discard` reads through `self.read`, which resets the seek-loop
            // counter on every call (a real read unsticks the loop guard);
            // save and restore it so seeking to the same mid-segment offset
            // repeatedly still trips the guard instead of being silently
            // reset by this internal prefix read.
            let guard_state = (self.last_seek_offset, self.repeated_seeks);
            self.discard(prefix).await?;
            (self.last_seek_offset, self.repeated_seeks) = guard_state;
        }

        Ok(())
    }

    async fn discard(&mut self, mut count: u64) -> Result<(), StreamError> {
        let mut scratch = vec![0u8; 64 * 1024];
        while count > 0 {
            let want = count.min(scratch.len() as u64) as usize;
            let read = self.read(&mut scratch[..want]).await?;
            if read == 0 {
                return Err(StreamError::InvalidState(
                    "stream ended while discarding seek prefix".to_string(),
                ));
            }
            count -= read as u64;
        }
        Ok(())
    }

    /// Largest index whose cumulative offset is `<= offset`.
    fn locate_by_binary_search(&self, offset: u64) -> (usize, u64) {
        let mut low = 0usize;
        let mut high = self.plan.len().saturating_sub(1);
        while low < high {
            let mid = low + (high - low + 1) / 2;
            let mid_offset = self.plan.cumulative_offset(mid).unwrap_or(0);
            if mid_offset <= offset {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        (low, self.plan.cumulative_offset(low).unwrap_or(0))
    }

    /// Interpolation search against live header probes when segment sizes
    /// were never cached: estimate the target index from the average size
    /// of segments probed so far, probe its header, and narrow the range.
    async fn locate_by_interpolation_search(&mut self, offset: u64) -> Result<(usize, u64), StreamError> {
        let len = self.plan.len();
        if len == 0 {
            return Ok((0, 0));
        }

        let mut low = 0usize;
        let mut low_cum = 0u64;
        let mut high = len - 1;

        loop {
            let guess = self.estimate_index(low, low_cum, high, offset);
            let size = self.probe_size(guess).await?;
            let guess_start = self.cumulative_probed(low, low_cum, guess);

            if offset < guess_start {
                if guess == low {
                    return Ok((low, low_cum));
                }
                high = guess.saturating_sub(1).max(low);
                continue;
            }

            let guess_end = guess_start + size;
            if offset < guess_end {
                return Ok((guess, guess_start));
            }

            if guess >= high {
                return Ok((high, self.cumulative_probed(low, low_cum, high)));
            }
            low = guess + 1;
            low_cum = guess_end;
        }
    }

    fn estimate_index(&self, low: usize, low_cum: u64, high: usize, offset: u64) -> usize {
        let known_avg = {
            let known: Vec<u64> = self.probed_sizes.iter().filter_map(|s| *s).collect();
            if known.is_empty() {
                None
            } else {
                Some(known.iter().sum::<u64>() / known.len() as u64)
            }
        };
        let Some(avg) = known_avg.filter(|&a| a > 0) else {
            return low + (high - low) / 2;
        };
        let span = (offset.saturating_sub(low_cum)) / avg;
        (low + span as usize).min(high)
    }

    fn cumulative_probed(&self, low: usize, low_cum: u64, upto: usize) -> u64 {
        let mut total = low_cum;
        for size in self.probed_sizes.iter().take(upto).skip(low) {
            total += size.unwrap_or(0);
        }
        total
    }

    async fn probe_size(&mut self, index: usize) -> Result<u64, StreamError> {
        if let Some(size) = self.probed_sizes[index] {
            return Ok(size);
        }
        let id = self.plan.segment_id(index).expect("index within plan").clone();
        let probe_ctx = self.ctx.child();
        // A header probe is admitted before a provider is ever chosen
        // (spec.md §4.2), the same as a streaming job's permit in
        // `fetch_with_retries`; it defaults to the `Streaming` kind like
        // any other per-segment operation on this stream.
        let _permit = self
            .limiter
            .acquire(&probe_ctx)
            .await
            .map_err(|e| StreamError::InvalidData(format!("header probe admission failed: {e}")))?;
        // Header probes run against whichever provider is preferred; the
        // client's normal fallback order applies if it is unavailable.
        let header = self
            .client
            .fetch_header(&probe_ctx, &id)
            .await
            .map_err(|e| StreamError::InvalidData(format!("header probe failed: {e}")))?;
        let size = header.part_size.max(0) as u64;
        self.probed_sizes[index] = Some(size);
        Ok(size)
    }

    pub async fn close(mut self) {
        self.inner.take();
        self.ctx.cancel();
    }
}
