//! Process-local write buffer and flush pipeline.
//!
//! Every appender in a process shares one [`WriteBuffer`]. Events queue in
//! FIFO order, are partitioned by stream on flush, and committed to the
//! backend one partition at a time. A partition that fails with a
//! retriable error is reinserted at the head of the buffer, preserving
//! intra-stream order; a partition that fails permanently is dropped and
//! its callers are notified.
//!
//! The buffer is generic over [`StreamWriter`] so this algorithm is
//! implemented exactly once and shared by both the in-memory and SQL
//! backends, each of which only needs to provide its own
//! `write_stream_events`.

use crate::event::Event;
use crate::event_store::{BoxFuture, EventStoreError};
use crate::stream::{StreamId, Version};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, instrument, warn};

/// The minimal capability the write buffer needs from a backend to flush
/// a partition.
///
/// Backends implement this — typically by delegating straight to their own
/// `write_stream_events` — so the flush/retry algorithm below is written
/// once and reused by every backend.
pub trait StreamWriter: Send + Sync {
    /// Commit `events` for `stream_id` atomically. See
    /// [`crate::event_store::EventStoreBackend::write_stream_events`].
    fn write_stream_events(
        &self,
        stream_id: StreamId,
        events: Vec<Event>,
    ) -> BoxFuture<'_, Result<Version, EventStoreError>>;
}

/// Governs how many times the flush pipeline retries a transiently-failed
/// partition before giving up and escalating to a permanent failure.
///
/// The spec leaves buffer-full/advisory-lock-timeout retriability as an
/// explicit policy decision rather than a hardcoded constant; this struct
/// is that policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum reinsert attempts for one partition before escalating to a
    /// permanent failure. `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry a bounded number of times before escalating to permanent.
    #[must_use]
    pub const fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    /// Retry indefinitely; a transient error never escalates to permanent.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    const fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(5)
    }
}

struct BufferEntry {
    event: Event,
    attempts: u32,
    ack: oneshot::Sender<Result<Version, EventStoreError>>,
}

impl BufferEntry {
    fn fail_with_shutdown(self) {
        let _unreceived = self.ack.send(Err(EventStoreError::ShutdownError));
    }
}

struct BufferState {
    entries: VecDeque<BufferEntry>,
    total_bytes: usize,
}

impl BufferState {
    const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
        }
    }
}

fn estimate_size(event: &Event) -> usize {
    serde_json::to_vec(event).map_or(0, |bytes| bytes.len())
}

/// The process-local ordered queue of events awaiting commit, shared by
/// every producer in a process.
///
/// Model this as an owned object held by the backend instance (one per
/// backend), not a module-level singleton — producers reach it through the
/// backend's own `append_event`.
pub struct WriteBuffer<W> {
    writer: Arc<W>,
    state: Mutex<BufferState>,
    max_entries: usize,
    max_bytes: usize,
    append_timeout: Duration,
    retry_policy: RetryPolicy,
    flush_notify: Notify,
    space_freed: Notify,
    flush_count: AtomicU64,
    flush_retries: AtomicU64,
}

impl<W: StreamWriter> WriteBuffer<W> {
    /// Construct a new buffer bound to `writer`, with the given capacity
    /// limits, bounded-wait timeout, and retry policy.
    #[must_use]
    pub fn new(
        writer: Arc<W>,
        max_entries: usize,
        max_bytes: usize,
        append_timeout: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            writer,
            state: Mutex::new(BufferState::new()),
            max_entries,
            max_bytes,
            append_timeout,
            retry_policy,
            flush_notify: Notify::new(),
            space_freed: Notify::new(),
            flush_count: AtomicU64::new(0),
            flush_retries: AtomicU64::new(0),
        }
    }

    /// The number of events currently sitting in the buffer.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// A best-effort, non-blocking snapshot of the buffer depth, for
    /// synchronous metrics reporting. Returns `0` if the buffer is
    /// momentarily locked rather than blocking the caller.
    #[must_use]
    pub fn try_depth(&self) -> usize {
        self.state.try_lock().map_or(0, |state| state.entries.len())
    }

    /// Total flush cycles executed so far.
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    /// Total partitions reinserted after a transient failure so far.
    pub fn flush_retries(&self) -> u64 {
        self.flush_retries.load(Ordering::Relaxed)
    }

    /// Enqueue `event` at the tail of the buffer and wait for its eventual
    /// commit outcome.
    ///
    /// Never blocks on backend I/O. If the buffer is at its entry or byte
    /// ceiling, this suspends the caller — waiting for a flush to free space
    /// — up to the configured `append_timeout`, then fails with
    /// [`EventStoreError::BufferFullError`] if no space opened up in time.
    /// Once enqueued, this suspends again on the ack channel a later flush
    /// resolves.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::BufferFullError`] if the buffer is still at
    /// its entry or byte ceiling after `append_timeout` elapses. Otherwise
    /// returns whatever the eventual flush resolves to, or
    /// [`EventStoreError::ShutdownError`] if the buffer was torn down before
    /// this event could be acknowledged.
    #[instrument(skip(self, event), fields(stream_id = %event.stream_id()))]
    pub async fn append(&self, event: Event) -> Result<Version, EventStoreError> {
        let (ack, ack_rx) = oneshot::channel();
        let deadline = std::time::Instant::now() + self.append_timeout;

        let should_flush_eagerly = loop {
            // Registered before the capacity check so a flush's
            // `notify_waiters` occurring between the check and the wait
            // below is never missed.
            let freed = self.space_freed.notified();

            {
                let mut state = self.state.lock().await;
                if state.entries.len() < self.max_entries {
                    let size = estimate_size(&event);
                    state.entries.push_back(BufferEntry { event, attempts: 0, ack });
                    state.total_bytes += size;
                    break state.entries.len() >= self.max_entries || state.total_bytes >= self.max_bytes;
                }
            }

            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, freed).await.is_err() {
                return Err(EventStoreError::BufferFullError);
            }
        };

        if should_flush_eagerly {
            self.flush_notify.notify_one();
        }

        ack_rx.await.unwrap_or(Err(EventStoreError::ShutdownError))
    }

    /// Resolves the next time the buffer wants an eager flush (an entry or
    /// byte high-water mark was crossed). Paired with a timer and a
    /// shutdown signal by [`WriteBuffer::run_flush_worker`].
    async fn wait_for_high_water_mark(&self) {
        self.flush_notify.notified().await;
    }

    /// Drain the entire buffer and commit every partition.
    ///
    /// Partitions that fail transiently are reinserted at the buffer head
    /// in original order (see module docs); partitions that fail
    /// permanently surface the error to each entry's caller.
    #[instrument(skip(self))]
    pub async fn flush(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.total_bytes = 0;
            std::mem::take(&mut state.entries)
        };
        if snapshot.is_empty() {
            return;
        }
        // The whole buffer was just drained, so any appender waiting on
        // space under `append`'s bounded wait can retry immediately.
        self.space_freed.notify_waiters();

        let mut partitions: HashMap<StreamId, Vec<BufferEntry>> = HashMap::new();
        let mut order: Vec<StreamId> = Vec::new();
        for entry in snapshot {
            let stream_id = entry.event.stream_id().clone();
            if !partitions.contains_key(&stream_id) {
                order.push(stream_id.clone());
            }
            partitions.entry(stream_id).or_default().push(entry);
        }

        self.flush_count.fetch_add(1, Ordering::Relaxed);

        for stream_id in order {
            if let Some(partition) = partitions.remove(&stream_id) {
                self.flush_partition(stream_id, partition).await;
            }
        }
    }

    async fn flush_partition(&self, stream_id: StreamId, partition: Vec<BufferEntry>) {
        let events: Vec<Event> = partition.iter().map(|entry| entry.event.clone()).collect();
        match self.writer.write_stream_events(stream_id.clone(), events).await {
            Ok(_committed_version) => {
                for entry in partition {
                    let version = entry.event.version();
                    let _unreceived = entry.ack.send(Ok(version));
                }
            }
            Err(error) if error.is_retriable() => {
                self.flush_retries.fetch_add(1, Ordering::Relaxed);
                warn!(%stream_id, %error, "transient flush failure, reinserting partition");
                self.reinsert_or_escalate(partition, &error).await;
            }
            Err(error) => {
                debug!(%stream_id, %error, "permanent flush failure, dropping partition");
                for entry in partition {
                    let _unreceived = entry.ack.send(Err(error.clone()));
                }
            }
        }
    }

    /// Reinsert `partition` at the buffer head, preserving original
    /// relative order: iterate in reverse and push each entry to the front.
    /// Entries whose retry budget is exhausted escalate to a permanent
    /// error instead of being reinserted.
    async fn reinsert_or_escalate(&self, mut partition: Vec<BufferEntry>, transient_error: &EventStoreError) {
        let mut state = self.state.lock().await;
        while let Some(mut entry) = partition.pop() {
            entry.attempts += 1;
            if self.retry_policy.exhausted(entry.attempts) {
                let permanent = EventStoreError::PermanentBackendError(format!(
                    "retry budget exhausted after {} attempts: {transient_error}",
                    entry.attempts
                ));
                let _unreceived = entry.ack.send(Err(permanent));
            } else {
                state.total_bytes += estimate_size(&entry.event);
                state.entries.push_front(entry);
            }
        }
    }

    /// Drain every entry still sitting in the buffer and fail its caller
    /// with [`EventStoreError::ShutdownError`].
    ///
    /// Called when `close()` gives up waiting for the flush worker to drain
    /// naturally and aborts it instead — entries the worker never got to
    /// would otherwise hang their caller's `append` forever.
    pub async fn fail_remaining_with_shutdown(&self) {
        let remaining = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.entries)
        };
        for entry in remaining {
            entry.fail_with_shutdown();
        }
    }

    /// Run the background flush worker until `shutdown` reports `true`.
    ///
    /// Selects between the periodic timer, high-water-mark notifications,
    /// and the shutdown signal — the coroutine-control-flow pattern the
    /// store's design calls for. Performs one final flush after the
    /// shutdown signal fires, so no accepted event is silently lost.
    pub async fn run_flush_worker(self: Arc<Self>, flush_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                () = self.wait_for_high_water_mark() => {
                    self.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.flush().await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Version as V;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct RecordingWriter {
        calls: StdMutex<Vec<(StreamId, usize)>>,
        fail_first_n: AtomicUsize,
        fail_permanently: bool,
    }

    impl RecordingWriter {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_first_n: AtomicUsize::new(0),
                fail_permanently: false,
            }
        }

        fn failing_transiently(times: usize) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_first_n: AtomicUsize::new(times),
                fail_permanently: false,
            }
        }

        fn failing_permanently() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_first_n: AtomicUsize::new(usize::MAX),
                fail_permanently: true,
            }
        }
    }

    impl StreamWriter for RecordingWriter {
        fn write_stream_events(
            &self,
            stream_id: StreamId,
            events: Vec<Event>,
        ) -> BoxFuture<'_, Result<Version, EventStoreError>> {
            Box::pin(async move {
                let remaining = self.fail_first_n.load(Ordering::Relaxed);
                if remaining > 0 {
                    self.fail_first_n.fetch_sub(1, Ordering::Relaxed);
                    return if self.fail_permanently {
                        Err(EventStoreError::PermanentBackendError("nope".to_string()))
                    } else {
                        Err(EventStoreError::TransientBackendError("timeout".to_string()))
                    };
                }
                let count = events.len();
                let version = events.last().map_or(V::new(0), Event::version);
                self.calls.lock().unwrap().push((stream_id, count));
                Ok(version)
            })
        }
    }

    fn event(stream: &str, version: u64, tag: &str) -> Event {
        Event::new(
            StreamId::new(stream),
            "Tagged".to_string(),
            json!({ "tag": tag }),
            V::new(version),
            None,
        )
    }

    #[tokio::test]
    async fn append_then_flush_acknowledges_success() {
        let writer = Arc::new(RecordingWriter::new());
        let buffer = Arc::new(WriteBuffer::new(
            writer.clone(),
            100,
            1_000_000,
            Duration::from_secs(1),
            RetryPolicy::default(),
        ));

        let append_buffer = buffer.clone();
        let append_task = tokio::spawn(async move { append_buffer.append(event("s", 0, "A")).await });

        // give the append a chance to land in the queue
        tokio::task::yield_now().await;
        buffer.flush().await;

        let result = append_task.await.unwrap();
        assert_eq!(result, Ok(V::new(0)));
        assert_eq!(writer.calls.lock().unwrap().as_slice(), &[(StreamId::new("s"), 1)]);
    }

    #[tokio::test]
    async fn buffer_full_rejects_further_appends() {
        let writer = Arc::new(RecordingWriter::new());
        let buffer = WriteBuffer::new(writer, 1, 1_000_000, Duration::from_millis(20), RetryPolicy::default());

        let (tx, _rx) = oneshot::channel();
        drop(tx);
        let first = buffer.append(event("s", 0, "A"));
        tokio::pin!(first);
        // poll once to enqueue without waiting for ack
        let _ = futures::poll!(&mut first);

        let second = buffer.append(event("s", 1, "B")).await;
        assert!(matches!(second, Err(EventStoreError::BufferFullError)));
    }

    #[tokio::test]
    async fn append_succeeds_once_flush_frees_space_within_timeout() {
        let writer = Arc::new(RecordingWriter::new());
        let buffer = Arc::new(WriteBuffer::new(
            writer.clone(),
            1,
            1_000_000,
            Duration::from_secs(1),
            RetryPolicy::default(),
        ));

        let first = buffer.append(event("s", 0, "A"));
        tokio::pin!(first);
        let _ = futures::poll!(&mut first); // lands in the one free slot

        let waiting_buffer = buffer.clone();
        let second_task =
            tokio::spawn(async move { waiting_buffer.append(event("s", 1, "B")).await });

        // give the second append a chance to register on `space_freed` before
        // the slot is freed, otherwise the notification could race ahead of it
        tokio::task::yield_now().await;
        buffer.flush().await; // drains the buffer, including the still-polling `first`

        let second_result = second_task.await.unwrap();
        assert_eq!(second_result, Ok(V::new(1)));
    }

    #[tokio::test]
    async fn transient_failure_is_reinserted_and_succeeds_on_retry() {
        let writer = Arc::new(RecordingWriter::failing_transiently(1));
        let buffer = Arc::new(WriteBuffer::new(
            writer.clone(),
            100,
            1_000_000,
            Duration::from_secs(1),
            RetryPolicy::bounded(3),
        ));

        let append_buffer = buffer.clone();
        let append_task = tokio::spawn(async move { append_buffer.append(event("s", 0, "A")).await });

        tokio::task::yield_now().await;
        buffer.flush().await; // fails transiently, reinserts
        buffer.flush().await; // succeeds

        let result = append_task.await.unwrap();
        assert_eq!(result, Ok(V::new(0)));
        assert_eq!(buffer.flush_retries(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_surfaces_to_the_caller() {
        let writer = Arc::new(RecordingWriter::failing_permanently());
        let buffer = Arc::new(WriteBuffer::new(
            writer,
            100,
            1_000_000,
            Duration::from_secs(1),
            RetryPolicy::default(),
        ));

        let append_buffer = buffer.clone();
        let append_task = tokio::spawn(async move { append_buffer.append(event("s", 0, "A")).await });

        tokio::task::yield_now().await;
        buffer.flush().await;

        let result = append_task.await.unwrap();
        assert!(matches!(result, Err(EventStoreError::PermanentBackendError(_))));
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_escalates_to_permanent() {
        let writer = Arc::new(RecordingWriter::failing_transiently(10));
        let buffer = Arc::new(WriteBuffer::new(
            writer,
            100,
            1_000_000,
            Duration::from_secs(1),
            RetryPolicy::bounded(2),
        ));

        let append_buffer = buffer.clone();
        let append_task = tokio::spawn(async move { append_buffer.append(event("s", 0, "A")).await });

        tokio::task::yield_now().await;
        buffer.flush().await;
        buffer.flush().await;

        let result = append_task.await.unwrap();
        assert!(matches!(result, Err(EventStoreError::PermanentBackendError(_))));
    }
}
