//! `BufferedSegmentStream`: the ordered-delivery engine at the center of
//! the crate (spec.md §4.4). A pool of workers fetches segments out of
//! order and in parallel; a delivery task hands them to the caller
//! strictly in order; a straggler monitor finds a victim assignment to
//! preempt (or, failing that, races the straggler itself) without ever
//! growing the worker count past `connections_per_stream`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::client::MultiProviderClient;
use crate::config::StreamTuning;
use crate::context::{Context, OperationKind};
use crate::error::{FetchError, FetchErrorClass, StreamError};
use crate::limiter::GlobalOperationLimiter;
use crate::plan::{FetchPlan, Segment};
use crate::pool::ConnectionFactory;

use super::buffer_pool::BufferPool;
use super::slots::SlotTable;

const RETRY_BACKOFF: [u64; 3] = [0, 1, 2];

/// A live, ordered byte stream over a `FetchPlan`. Consume it with `recv`;
/// dropping it (or calling `close`) tears down every background task.
pub struct BufferedSegmentStream {
    receiver: mpsc::Receiver<Result<Bytes, StreamError>>,
    ctx: Context,
    tasks: Vec<JoinHandle<()>>,
    #[cfg(test)]
    slots: Arc<SlotTable>,
}

impl BufferedSegmentStream {
    pub fn new<F>(
        plan: FetchPlan,
        client: Arc<MultiProviderClient<F>>,
        limiter: Arc<GlobalOperationLimiter>,
        tuning: StreamTuning,
        parent_ctx: &Context,
    ) -> Self
    where
        F: ConnectionFactory + 'static,
    {
        let ctx = parent_ctx.child().with_kind(OperationKind::Streaming);
        let plan = Arc::new(plan);
        let slots = Arc::new(SlotTable::new(plan.len()));
        let queue = Arc::new(WorkQueue::new(plan.len()));
        let active: Arc<Vec<Mutex<Option<Assignment>>>> =
            Arc::new((0..plan.len()).map(|_| Mutex::new(None)).collect());
        let deliver_cursor = Arc::new(AtomicUsize::new(0));
        let buffer_pool = BufferPool::new();
        let capacity = tuning.buffer_segment_count.max(tuning.connections_per_stream * 5);
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let worker_count = tuning.connections_per_stream.min(plan.len().max(1));
        let mut tasks = Vec::with_capacity(worker_count + 2);

        for _ in 0..worker_count {
            tasks.push(tokio::spawn(run_worker(
                ctx.child(),
                plan.clone(),
                slots.clone(),
                client.clone(),
                limiter.clone(),
                buffer_pool.clone(),
                queue.clone(),
                active.clone(),
                deliver_cursor.clone(),
                tuning.clone(),
            )));
        }

        tasks.push(tokio::spawn(run_straggler_monitor(
            ctx.child(),
            plan.clone(),
            slots.clone(),
            queue.clone(),
            active.clone(),
            deliver_cursor.clone(),
            tuning.clone(),
        )));

        #[cfg(test)]
        let slots_for_test = slots.clone();

        tasks.push(tokio::spawn(run_delivery(ctx.child(), plan, slots, tx, deliver_cursor)));

        Self {
            receiver: rx,
            ctx,
            tasks,
            #[cfg(test)]
            slots: slots_for_test,
        }
    }

    /// Receive the next segment's bytes in order, or `None` once the plan
    /// is exhausted.
    pub async fn recv(&mut self) -> Option<Result<Bytes, StreamError>> {
        self.receiver.recv().await
    }

    pub fn close(self) {
        // Drop performs the teardown.
    }
}

impl Drop for BufferedSegmentStream {
    fn drop(&mut self) {
        self.ctx.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// The `standardQueue`/`urgentQueue` pair spec.md §4.4 and §9 describe:
/// workers prefer `urgent`, else claim the next index in plan order, gated
/// so they cannot race more than `buffer_segment_count` ahead of delivery
/// (the read-ahead backpressure spec.md §9 requires).
struct WorkQueue {
    next: AtomicUsize,
    len: usize,
    urgent: Mutex<VecDeque<usize>>,
    notify: Notify,
}

impl WorkQueue {
    fn new(len: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            len,
            urgent: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Re-enqueues `index` ahead of any standard work, waking a waiting
    /// worker.
    fn push_urgent(&self, index: usize) {
        self.urgent.lock().unwrap().push_back(index);
        self.notify.notify_waiters();
    }

    /// Claims the next job: urgent work first, then the next standard
    /// index, refusing to hand out a standard index more than
    /// `buffer_capacity` ahead of `deliver_cursor`. Returns `None` if
    /// nothing is claimable right now (either the plan is exhausted, or
    /// the standard queue is backpressured).
    fn try_claim(&self, deliver_cursor: usize, buffer_capacity: usize) -> Option<usize> {
        if let Some(index) = self.urgent.lock().unwrap().pop_front() {
            return Some(index);
        }
        loop {
            let current = self.next.load(Ordering::SeqCst);
            if current >= self.len {
                return None;
            }
            if current.saturating_sub(deliver_cursor) >= buffer_capacity {
                return None;
            }
            if self
                .next
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(current);
            }
        }
    }
}

/// One worker's current job, recorded so the straggler monitor can find a
/// victim to preempt and cancel its specific attempt without disturbing
/// any other in-flight fetch (spec.md §4.4's `activeAssignments` map).
struct Assignment {
    job_ctx: Context,
    started: Instant,
}

/// A single segment fetch attempt, including retries with backoff and
/// size validation. Acquires one `OperationPermit(Streaming)` for the
/// whole job, held across every retry (spec.md §4.2/§4.4.1). Returns
/// `Ok(Segment)` on success, or the final error once retries (or the
/// permit wait) are exhausted/cancelled.
async fn fetch_with_retries<F: ConnectionFactory>(
    ctx: &Context,
    plan: &FetchPlan,
    client: &MultiProviderClient<F>,
    limiter: &GlobalOperationLimiter,
    buffer_pool: &BufferPool,
    index: usize,
    tuning: &StreamTuning,
) -> Result<Segment, FetchError> {
    let id = plan.segment_id(index).expect("index within plan").clone();
    let _permit = limiter.acquire(ctx).await?;
    let mut last_err = FetchError::NoProviderAvailable;

    for attempt in 0..=tuning.max_per_segment_retries {
        if ctx.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let fetch_result = tokio::select! {
            result = client.fetch_segment(ctx, &id, plan.group()) => result,
            _ = ctx.cancelled() => Err(FetchError::Cancelled),
        };

        match fetch_result {
            Ok(fetched) => {
                if let Some(declared) = plan.segment_size(index) {
                    let got = fetched.data.len() as u64;
                    if (got as f64) < (declared as f64) * tuning.incomplete_size_fraction {
                        last_err = FetchError::IncompleteSegment { got, declared };
                        tracing::warn!(%id, got, declared, "segment undersized, retrying");
                        sleep_backoff(attempt).await;
                        continue;
                    }
                }
                // Copy into a pooled scratch buffer (growing by doubling
                // if undersized) before freezing, per spec.md §4.4.1; the
                // buffer returns to the pool as soon as `buf` drops here.
                let mut buf = buffer_pool.acquire(fetched.data.len());
                buf.extend_from_slice(&fetched.data);
                let data = Bytes::copy_from_slice(&buf);
                return Ok(Segment { id, data });
            }
            Err(err) => {
                let class = err.classify();
                last_err = err;
                if matches!(class, FetchErrorClass::Cancelled) {
                    return Err(last_err);
                }
                tracing::debug!(%id, attempt, "segment fetch attempt failed: {}", last_err);
                sleep_backoff(attempt).await;
            }
        }
    }

    Err(last_err)
}

async fn sleep_backoff(attempt: u8) {
    let secs = RETRY_BACKOFF
        .get(attempt as usize)
        .copied()
        .unwrap_or(*RETRY_BACKOFF.last().unwrap());
    if secs > 0 {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<F: ConnectionFactory>(
    ctx: Context,
    plan: Arc<FetchPlan>,
    slots: Arc<SlotTable>,
    client: Arc<MultiProviderClient<F>>,
    limiter: Arc<GlobalOperationLimiter>,
    buffer_pool: BufferPool,
    queue: Arc<WorkQueue>,
    active: Arc<Vec<Mutex<Option<Assignment>>>>,
    deliver_cursor: Arc<AtomicUsize>,
    tuning: StreamTuning,
) {
    loop {
        if ctx.is_cancelled() {
            return;
        }

        let index = match queue.try_claim(deliver_cursor.load(Ordering::SeqCst), tuning.buffer_segment_count) {
            Some(index) => index,
            None => {
                // Nothing claimable right now: either every index is
                // settled/in-flight, or the backpressure gate is holding
                // back standard work. Either way a worker must stay
                // parked rather than exit — the straggler monitor may
                // push an urgent re-fetch at any time and needs a worker
                // available to pick it up.
                tokio::select! {
                    _ = queue.notify.notified() => continue,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => continue,
                    _ = ctx.cancelled() => return,
                }
            }
        };

        if slots.is_settled(index) {
            // Race already won by another worker; drop this job
            // (spec.md §4.4.1: "a worker drops a job whose slot is
            // already filled").
            continue;
        }

        let job_ctx = ctx.child();
        slots.mark_in_flight(index);
        *active[index].lock().unwrap() = Some(Assignment { job_ctx: job_ctx.clone(), started: Instant::now() });

        let outcome = fetch_with_retries(&job_ctx, &plan, &client, &limiter, &buffer_pool, index, &tuning).await;
        *active[index].lock().unwrap() = None;

        match outcome {
            Ok(segment) => {
                slots.complete(index, segment);
            }
            Err(FetchError::Cancelled) => {
                if ctx.is_cancelled() {
                    return;
                }
                // This job's own assignment was preempted by the straggler
                // monitor (victim or self-cancel): the slot was already
                // reset to `Pending` and re-enqueued, so just loop and
                // claim the next job instead of tearing the worker down.
                continue;
            }
            Err(err) => {
                let id = plan.segment_id(index).expect("index within plan").clone();
                // Only a content-level miss (ArticleNotFound) degrades to
                // zero-fill; exhausting every provider on a connectivity
                // error (AuthFailed/Timeout/IO) surfaces as a distinct
                // SegmentMissing instead (spec.md §7's error table).
                let declared_size = (err.classify() == FetchErrorClass::Permanent)
                    .then(|| plan.segment_size(index))
                    .flatten();

                match declared_size {
                    Some(declared) => {
                        tracing::error!(
                            index,
                            declared,
                            "segment permanently unavailable, degrading to zero-fill: {}",
                            err
                        );
                        slots.complete_zero_filled(index, Segment::zero_filled(id, declared as usize));
                    }
                    None => {
                        // Either the size is unknown (can't safely zero-fill,
                        // spec.md §8 P5) or every provider was exhausted on a
                        // connectivity error rather than a content miss.
                        tracing::error!(index, %id, "segment unreachable at every provider: {}", err);
                        slots.complete_errored(index, err);
                    }
                }
            }
        }
    }
}

/// Runs every ~100ms (spec.md §4.4.2). If the segment the delivery task is
/// blocked on (`nextIndexToRead`) has been in flight past
/// `straggler_threshold_ms`: find the highest still-active index above it
/// and preempt that assignment (cancel it, reset its slot, re-enqueue it
/// urgently) to free a worker for a second attempt at the straggler; if no
/// such victim exists, cancel the straggler's own assignment instead (the
/// same worker loops straight back onto it via the urgent queue). Either
/// way the straggler itself is re-enqueued once, marked as racing.
async fn run_straggler_monitor(
    ctx: Context,
    plan: Arc<FetchPlan>,
    slots: Arc<SlotTable>,
    queue: Arc<WorkQueue>,
    active: Arc<Vec<Mutex<Option<Assignment>>>>,
    deliver_cursor: Arc<AtomicUsize>,
    tuning: StreamTuning,
) {
    let threshold = Duration::from_millis(tuning.straggler_threshold_ms);
    let poll_interval = Duration::from_millis((tuning.straggler_threshold_ms / 3).max(50));
    let mut racing = vec![false; plan.len()];

    loop {
        if ctx.is_cancelled() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = ctx.cancelled() => return,
        }

        let lead = deliver_cursor.load(Ordering::SeqCst);
        if lead >= plan.len() {
            continue;
        }
        if racing[lead] || slots.is_settled(lead) {
            continue;
        }
        let Some(lead_started) = active[lead].lock().unwrap().as_ref().map(|a| a.started) else {
            continue;
        };
        if lead_started.elapsed() < threshold {
            continue;
        }

        // Highest active index strictly above the lead (spec.md §4.4.2).
        let victim = ((lead + 1)..plan.len()).rev().find(|&i| active[i].lock().unwrap().is_some());

        if let Some(victim) = victim {
            // Preempt the victim: cancel its in-flight fetch, free its
            // slot for re-claiming, and push it back onto the urgent
            // queue so it is not lost.
            if let Some(assignment) = active[victim].lock().unwrap().take() {
                assignment.job_ctx.cancel();
            }
            slots.reset_to_pending(victim);
            tracing::info!(lead, victim, "straggler monitor: preempting victim to race the lead");
            queue.push_urgent(victim);
        } else {
            tracing::info!(lead, "straggler monitor: no victim available, racing the lead itself");
        }
        // Either way, give the lead a second, concurrent attempt from a
        // freed-up worker; the original in-flight fetch keeps running and
        // first-writer-wins decides which one fills the slot.
        queue.push_urgent(lead);
        racing[lead] = true;
    }
}

async fn run_delivery(
    ctx: Context,
    plan: Arc<FetchPlan>,
    slots: Arc<SlotTable>,
    tx: mpsc::Sender<Result<Bytes, StreamError>>,
    deliver_cursor: Arc<AtomicUsize>,
) {
    let mut cursor = 0usize;
    while cursor < plan.len() {
        if ctx.is_cancelled() {
            return;
        }

        if !slots.is_settled(cursor) {
            // Register for the notification before re-checking, so a
            // `notify_waiters` that fires between the check above and the
            // `await` below is not missed.
            let notified = slots.changed.notified();
            if !slots.is_settled(cursor) {
                tokio::select! {
                    _ = notified => {},
                    _ = ctx.cancelled() => return,
                }
                continue;
            }
        }

        let outcome = match slots.take_outcome(cursor) {
            Some(outcome) => outcome,
            None => continue,
        };
        let index = cursor;
        cursor += 1;
        deliver_cursor.store(cursor, Ordering::SeqCst);
        match outcome {
            Ok(segment) => {
                if tx.send(Ok(segment.data)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                // A content miss with no cached size to zero-fill against
                // is InvalidData (spec.md §8 P5); exhausting every provider
                // on a connectivity error is SegmentMissing instead
                // (spec.md §7's error table).
                let stream_err = if err.classify() == FetchErrorClass::Permanent {
                    StreamError::InvalidData(format!(
                        "segment {index} unavailable with no cached size to zero-fill: {err}"
                    ))
                } else {
                    StreamError::SegmentMissing {
                        id: plan.segment_id(index).map(|i| i.to_string()).unwrap_or_default(),
                    }
                };
                let _ = tx.send(Err(stream_err)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::plan::{SegmentHeader, SegmentId};
    use crate::pool::{ConnectionPool, FetchedSegment, GlobalConnectionSemaphore, Provider, SegmentFetcher};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct ScriptedConnection {
        delays_ms: Arc<HashMap<String, u64>>,
        fail_ids: Arc<HashMap<String, u32>>,
        io_fail_ids: Arc<std::collections::HashSet<String>>,
        timeout_fail_ids: Arc<HashMap<String, u32>>,
        attempts: Arc<Mutex<HashMap<String, u32>>>,
        calls: Arc<Mutex<HashMap<String, u32>>>,
    }

    #[async_trait]
    impl SegmentFetcher for ScriptedConnection {
        async fn fetch_header(&mut self, _id: &SegmentId) -> Result<SegmentHeader, FetchError> {
            Ok(SegmentHeader { part_offset: 0, part_size: 5, date: None })
        }

        async fn fetch_segment(
            &mut self,
            id: &SegmentId,
            _group: Option<&str>,
        ) -> Result<FetchedSegment, FetchError> {
            let key = id.to_string();
            *self.calls.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
            if let Some(&delay) = self.delays_ms.get(&key) {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.io_fail_ids.contains(&key) {
                return Err(FetchError::Io(format!("connection reset fetching {key}")));
            }
            if let Some(&allowed_failures) = self.timeout_fail_ids.get(&key) {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(format!("{key}:timeout")).or_insert(0);
                if *count < allowed_failures {
                    *count += 1;
                    return Err(FetchError::Timeout { seconds: 30 });
                }
            }
            if let Some(&allowed_failures) = self.fail_ids.get(&key) {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(key.clone()).or_insert(0);
                if *count < allowed_failures {
                    *count += 1;
                    return Err(FetchError::ArticleNotFound { message_id: key });
                }
            }
            Ok(FetchedSegment {
                data: Bytes::from(key.into_bytes()),
                header: None,
            })
        }

        async fn is_healthy(&mut self) -> bool {
            true
        }
    }

    struct ScriptedFactory {
        delays_ms: Arc<HashMap<String, u64>>,
        fail_ids: Arc<HashMap<String, u32>>,
        io_fail_ids: Arc<std::collections::HashSet<String>>,
        timeout_fail_ids: Arc<HashMap<String, u32>>,
        attempts: Arc<Mutex<HashMap<String, u32>>>,
        calls: Arc<Mutex<HashMap<String, u32>>>,
    }

    #[async_trait]
    impl ConnectionFactory for ScriptedFactory {
        type Connection = ScriptedConnection;

        async fn connect(&self) -> Result<ScriptedConnection, FetchError> {
            Ok(ScriptedConnection {
                delays_ms: self.delays_ms.clone(),
                fail_ids: self.fail_ids.clone(),
                io_fail_ids: self.io_fail_ids.clone(),
                timeout_fail_ids: self.timeout_fail_ids.clone(),
                attempts: self.attempts.clone(),
                calls: self.calls.clone(),
            })
        }
    }

    fn client_with(
        delays_ms: HashMap<String, u64>,
        fail_ids: HashMap<String, u32>,
    ) -> Arc<MultiProviderClient<ScriptedFactory>> {
        client_with_calls(delays_ms, fail_ids).0
    }

    fn client_with_calls(
        delays_ms: HashMap<String, u64>,
        fail_ids: HashMap<String, u32>,
    ) -> (Arc<MultiProviderClient<ScriptedFactory>>, Arc<Mutex<HashMap<String, u32>>>) {
        client_with_io_fails(delays_ms, fail_ids, std::collections::HashSet::new())
    }

    fn client_with_io_fails(
        delays_ms: HashMap<String, u64>,
        fail_ids: HashMap<String, u32>,
        io_fail_ids: std::collections::HashSet<String>,
    ) -> (Arc<MultiProviderClient<ScriptedFactory>>, Arc<Mutex<HashMap<String, u32>>>) {
        client_with_timeout_fails(delays_ms, fail_ids, io_fail_ids, HashMap::new())
    }

    fn client_with_timeout_fails(
        delays_ms: HashMap<String, u64>,
        fail_ids: HashMap<String, u32>,
        io_fail_ids: std::collections::HashSet<String>,
        timeout_fail_ids: HashMap<String, u32>,
    ) -> (Arc<MultiProviderClient<ScriptedFactory>>, Arc<Mutex<HashMap<String, u32>>>) {
        let calls = Arc::new(Mutex::new(HashMap::new()));
        let factory = ScriptedFactory {
            delays_ms: Arc::new(delays_ms),
            fail_ids: Arc::new(fail_ids),
            io_fail_ids: Arc::new(io_fail_ids),
            timeout_fail_ids: Arc::new(timeout_fail_ids),
            attempts: Arc::new(Mutex::new(HashMap::new())),
            calls: calls.clone(),
        };
        let provider = Provider {
            index: 0,
            host: "p0".into(),
            max_local_connections: 16,
            priority: 0,
            disabled: false,
        };
        let global = GlobalConnectionSemaphore::new(16);
        let pool = ConnectionPool::new(provider, factory, global, Duration::from_secs(60)).unwrap();
        (Arc::new(MultiProviderClient::new(vec![Arc::new(pool)])), calls)
    }

    fn tuning() -> StreamTuning {
        StreamTuning {
            connections_per_stream: 4,
            buffer_segment_count: 10,
            straggler_threshold_ms: 100,
            max_per_segment_retries: 2,
            incomplete_size_fraction: 0.9,
            seek_loop_guard: 100,
        }
    }

    /// A limiter generous enough that it never gates admission in tests
    /// that aren't specifically exercising P7/P8 contention.
    fn unbounded_limiter() -> Arc<GlobalOperationLimiter> {
        Arc::new(GlobalOperationLimiter::new(&PoolConfig {
            total_connections: 256,
            queue_guaranteed: 64,
            health_check_guaranteed: 64,
            idle_timeout_secs: 60,
            connect_retry_attempts: 3,
        }))
    }

    #[tokio::test]
    async fn delivers_segments_in_order_despite_out_of_order_completion() {
        let ids: Vec<SegmentId> = (0..5).map(|i| SegmentId::new(format!("s{i}"))).collect();
        let plan = FetchPlan::without_sizes(ids.clone(), 0, None);
        let mut delays = HashMap::new();
        delays.insert("s0".to_string(), 40);
        delays.insert("s1".to_string(), 5);
        let client = client_with(delays, HashMap::new());
        let ctx = Context::root();
        let mut stream = BufferedSegmentStream::new(plan, client, unbounded_limiter(), tuning(), &ctx);

        let mut collected = Vec::new();
        while let Some(chunk) = stream.recv().await {
            collected.push(chunk.unwrap());
        }
        let joined: Vec<String> = collected
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert_eq!(joined, vec!["s0", "s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn retries_then_succeeds_on_transient_failure() {
        let ids: Vec<SegmentId> = (0..2).map(|i| SegmentId::new(format!("r{i}"))).collect();
        let plan = FetchPlan::without_sizes(ids, 0, None);
        let mut fails = HashMap::new();
        fails.insert("r0".to_string(), 1);
        let client = client_with(HashMap::new(), fails);
        let ctx = Context::root();
        let mut stream = BufferedSegmentStream::new(plan, client, unbounded_limiter(), tuning(), &ctx);

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"r0"));
    }

    #[tokio::test]
    async fn retries_exactly_three_times_on_repeated_timeout_then_succeeds() {
        let ids: Vec<SegmentId> = (0..3).map(|i| SegmentId::new(format!("s{i}"))).collect();
        let plan = FetchPlan::without_sizes(ids, 0, None);
        let mut timeouts = HashMap::new();
        timeouts.insert("s1".to_string(), 2);
        let (client, calls) = client_with_timeout_fails(
            HashMap::new(),
            HashMap::new(),
            std::collections::HashSet::new(),
            timeouts,
        );
        let ctx = Context::root();
        let mut stream = BufferedSegmentStream::new(plan, client, unbounded_limiter(), tuning(), &ctx);

        let mut collected = Vec::new();
        while let Some(chunk) = stream.recv().await {
            collected.push(chunk.unwrap());
        }
        let joined: Vec<String> = collected
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert_eq!(joined, vec!["s0", "s1", "s2"]);

        let s1_calls = *calls.lock().unwrap().get("s1").unwrap_or(&0);
        assert_eq!(s1_calls, 3, "expected exactly 3 fetch attempts for s1, got {s1_calls}");
    }

    #[tokio::test]
    async fn degrades_to_zero_fill_on_permanent_miss() {
        let ids: Vec<SegmentId> = (0..2).map(|i| SegmentId::new(format!("m{i}"))).collect();
        let plan = FetchPlan::new(ids, vec![4, 4], None);
        let mut fails = HashMap::new();
        fails.insert("m0".to_string(), 100);
        let client = client_with(HashMap::new(), fails);
        let ctx = Context::root();
        let mut stream = BufferedSegmentStream::new(plan, client, unbounded_limiter(), tuning(), &ctx);

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn straggler_monitor_preempts_a_victim_to_race_the_lead() {
        let ids: Vec<SegmentId> = (0..4).map(|i| SegmentId::new(format!("w{i}"))).collect();
        let plan = FetchPlan::without_sizes(ids, 0, None);
        let mut delays = HashMap::new();
        delays.insert("w0".to_string(), 500);
        for i in 1..4 {
            delays.insert(format!("w{i}"), 500);
        }
        let (client, calls) = client_with_calls(delays, HashMap::new());
        let mut tuning = tuning();
        tuning.straggler_threshold_ms = 50;
        tuning.connections_per_stream = 4;
        let ctx = Context::root();
        let mut stream = BufferedSegmentStream::new(plan, client, unbounded_limiter(), tuning, &ctx);

        let mut collected = Vec::new();
        while let Some(chunk) = stream.recv().await {
            collected.push(chunk.unwrap());
        }
        let joined: Vec<String> = collected
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert_eq!(joined, vec!["w0", "w1", "w2", "w3"]);

        // With all four workers pinned on long-delay fetches, the monitor
        // must have preempted a higher-index victim to free a worker to
        // race the lead: either the lead or its victim was attempted more
        // than once.
        let total_calls: u32 = calls.lock().unwrap().values().sum();
        assert!(
            total_calls > 4,
            "expected at least one preemption-driven re-fetch, saw {total_calls} total calls across 4 segments"
        );
    }

    #[tokio::test]
    async fn workers_do_not_claim_more_than_buffer_capacity_ahead_of_delivery() {
        // A stalled reader (nobody calling recv) should not let every
        // worker race ahead and fetch the whole plan at once.
        let ids: Vec<SegmentId> = (0..20).map(|i| SegmentId::new(format!("b{i}"))).collect();
        let plan = FetchPlan::without_sizes(ids, 0, None);
        let mut delays = HashMap::new();
        for i in 0..20 {
            delays.insert(format!("b{i}"), 40);
        }
        let client = client_with(delays, HashMap::new());
        let mut tuning = tuning();
        tuning.buffer_segment_count = 3;
        tuning.connections_per_stream = 8;
        let ctx = Context::root();
        let stream = BufferedSegmentStream::new(plan, client, unbounded_limiter(), tuning, &ctx);

        // Give the worker pool a moment to race ahead as far as it's
        // willing to, without ever calling `recv`.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let claimed = stream.slots.claimed_count();
        assert!(
            claimed <= 3 + 8,
            "expected claims gated near buffer_segment_count(3) + in-flight workers, got {claimed}"
        );
        assert!(claimed < 20, "workers raced ahead and claimed the entire plan: {claimed}/20");
        drop(stream);
    }

    #[tokio::test]
    async fn unknown_size_permanent_miss_fails_the_stream_instead_of_guessing_a_length() {
        let ids: Vec<SegmentId> = (0..3).map(|i| SegmentId::new(format!("u{i}"))).collect();
        let plan = FetchPlan::without_sizes(ids, 0, None);
        let mut fails = HashMap::new();
        fails.insert("u1".to_string(), 100);
        let client = client_with(HashMap::new(), fails);
        let ctx = Context::root();
        let mut stream = BufferedSegmentStream::new(plan, client, unbounded_limiter(), tuning(), &ctx);

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"u0"));

        let second = stream.recv().await.unwrap();
        assert!(matches!(second, Err(StreamError::InvalidData(_))));

        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn connectivity_exhaustion_surfaces_segment_missing_even_with_known_size() {
        let ids: Vec<SegmentId> = (0..2).map(|i| SegmentId::new(format!("c{i}"))).collect();
        let plan = FetchPlan::new(ids, vec![4, 4], None);
        let mut io_fails = std::collections::HashSet::new();
        io_fails.insert("c0".to_string());
        let (client, _) = client_with_io_fails(HashMap::new(), HashMap::new(), io_fails);
        let ctx = Context::root();
        let mut stream = BufferedSegmentStream::new(plan, client, unbounded_limiter(), tuning(), &ctx);

        let first = stream.recv().await.unwrap();
        assert!(matches!(first, Err(StreamError::SegmentMissing { ref id }) if id == "c0"));
    }
}
