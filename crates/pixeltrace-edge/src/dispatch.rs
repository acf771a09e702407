use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use pixeltrace_core::record::TrackingRecord;

use crate::failover::FailoverLog;
use crate::pipe::PipeClient;

/// Queue fill fraction above which records go straight to the failover log
/// instead of the pipe.
const HIGH_WATER_NUM: usize = 9;
const HIGH_WATER_DEN: usize = 10;

/// Bounded dispatch queue between request handlers and the pipe writer.
///
/// Enqueue never blocks: at capacity the oldest record is dropped and the
/// drop counter ticks. The single drain task serializes records to JSON
/// lines and writes them to the pipe, failing over to the durable log when
/// the pipe is down or the queue is past its high-water mark.
///
/// Accounting invariant: `enqueued − written − failover − dropped` equals
/// the current queue depth.
pub struct Dispatcher {
    queue: Mutex<VecDeque<TrackingRecord>>,
    notify: Notify,
    capacity: usize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failover_written: AtomicU64,
    pipe_connected: AtomicBool,
    reset_requested: AtomicBool,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            written: AtomicU64::new(0),
            failover_written: AtomicU64::new(0),
            pipe_connected: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
        }
    }

    /// Non-blocking enqueue with drop-oldest overflow.
    pub fn enqueue(&self, rec: TrackingRecord) {
        {
            let Ok(mut queue) = self.queue.lock() else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(rec);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn enqueued_total(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn written_total(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failover_total(&self) -> u64 {
        self.failover_written.load(Ordering::Relaxed)
    }

    pub fn pipe_connected(&self) -> bool {
        self.pipe_connected.load(Ordering::Relaxed)
    }

    /// Ask the drain task to drop its connection state and reconnect
    /// immediately. Wired to `POST /internal/circuit-reset`.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<TrackingRecord> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn over_high_water(&self) -> bool {
        self.depth() * HIGH_WATER_DEN >= self.capacity * HIGH_WATER_NUM
    }
}

/// The single drain loop. Runs until the shutdown signal fires, then keeps
/// draining until the queue is empty or the graceful window lapses; records
/// still queued at the deadline are flushed to the failover log so nothing
/// is silently lost.
pub async fn run_drain(
    dispatcher: std::sync::Arc<Dispatcher>,
    mut pipe: PipeClient,
    mut failover: FailoverLog,
    mut shutdown: watch::Receiver<bool>,
    graceful: std::time::Duration,
) {
    let mut next_connect = Instant::now();

    loop {
        if dispatcher.reset_requested.swap(false, Ordering::Relaxed) {
            pipe.reset();
            next_connect = Instant::now();
        }

        let Some(rec) = dispatcher.pop() else {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = dispatcher.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };

        let line = match rec.to_wire_line() {
            Ok(line) => line,
            Err(e) => {
                // A record that cannot serialize is unrepresentable on the
                // wire; count it as a drop rather than wedging the queue.
                error!(error = %e, "record serialization failed");
                dispatcher.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        if !pipe.is_connected() && Instant::now() >= next_connect {
            if !pipe.try_connect().await {
                next_connect = Instant::now() + pipe.next_backoff();
            } else {
                // Fresh connection: the failover file in progress is done
                // growing and may be claimed by the replayer.
                if let Err(e) = failover.close_current().await {
                    warn!(error = %e, "failover close failed");
                }
            }
        }
        dispatcher
            .pipe_connected
            .store(pipe.is_connected(), Ordering::Relaxed);

        let use_pipe = pipe.is_connected() && !dispatcher.over_high_water();
        if use_pipe {
            match pipe.write_line(&line).await {
                Ok(()) => {
                    dispatcher.written.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "pipe write failed; failing over");
                    dispatcher.pipe_connected.store(false, Ordering::Relaxed);
                    next_connect = Instant::now() + pipe.next_backoff();
                }
            }
        }

        match failover.append(&line).await {
            Ok(()) => {
                dispatcher.failover_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(error = %e, "failover append failed; record lost");
                dispatcher.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // Graceful drain: push whatever is still queued to durable storage
    // within the shutdown window.
    let deadline = Instant::now() + graceful;
    while let Some(rec) = dispatcher.pop() {
        if Instant::now() >= deadline {
            warn!(remaining = dispatcher.depth() + 1, "shutdown window lapsed; flushing to failover");
        }
        if let Ok(line) = rec.to_wire_line() {
            let delivered = pipe.is_connected()
                && Instant::now() < deadline
                && pipe.write_line(&line).await.is_ok();
            if delivered {
                dispatcher.written.fetch_add(1, Ordering::Relaxed);
            } else if failover.append(&line).await.is_ok() {
                dispatcher.failover_written.fetch_add(1, Ordering::Relaxed);
            } else {
                dispatcher.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    if let Err(e) = failover.close_current().await {
        warn!(error = %e, "failover close failed at shutdown");
    }
    info!("dispatcher drained");
}
