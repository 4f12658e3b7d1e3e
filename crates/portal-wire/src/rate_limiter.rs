//! Byte-rate limiting for the outbound bus.
//!
//! Some buses sit behind an external throughput ceiling. [`RateLimitedSink`]
//! wraps another [`BusSink`] with a GCRA token bucket: each `DATA_*` message
//! costs its payload length in tokens, refilled at `bytes_per_sec` up to
//! `burst_bytes`. Costed messages wait in a FIFO worker so they leave in the
//! order they were submitted. Zero-cost control messages skip the queue; the
//! receiving reassembler restores channel order.

use crate::error::WireResult;
use crate::message::ChannelMessage;
use crate::sink::BusSink;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Direct (unkeyed) GCRA limiter counting bytes.
pub type ByteRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Outbound byte-rate cap.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained rate in bytes per second. `0` disables limiting.
    pub bytes_per_sec: u32,
    /// Bucket size in bytes. `0` means one second worth of `bytes_per_sec`.
    pub burst_bytes: u32,
}

impl RateLimitConfig {
    /// A config with the given rate and the default burst.
    pub fn per_second(bytes_per_sec: u32) -> Self {
        Self {
            bytes_per_sec,
            burst_bytes: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bytes_per_sec > 0
    }

    /// Quota for the limiter, or `None` when limiting is disabled.
    fn quota(&self) -> Option<(Quota, NonZeroU32)> {
        let rate = NonZeroU32::new(self.bytes_per_sec)?;
        let burst = NonZeroU32::new(self.burst_bytes).unwrap_or(rate);
        Some((Quota::per_second(rate).allow_burst(burst), burst))
    }
}

/// A [`BusSink`] that holds `DATA_*` traffic to a byte budget.
pub struct RateLimitedSink {
    inner: Arc<dyn BusSink>,
    queue: Option<mpsc::UnboundedSender<ChannelMessage>>,
    pending: Arc<AtomicUsize>,
}

impl RateLimitedSink {
    /// Wrap `inner`. Spawns the queue worker when limiting is enabled, so
    /// this must be called inside a tokio runtime.
    pub fn new(inner: Arc<dyn BusSink>, config: &RateLimitConfig) -> Self {
        let pending = Arc::new(AtomicUsize::new(0));
        let queue = config.quota().map(|(quota, burst)| {
            let (tx, rx) = mpsc::unbounded_channel();
            let limiter = Arc::new(RateLimiter::direct(quota));
            tokio::spawn(run_queue(
                limiter,
                burst,
                Arc::clone(&inner),
                rx,
                Arc::clone(&pending),
            ));
            tx
        });
        Self {
            inner,
            queue,
            pending,
        }
    }

    /// Messages waiting for budget.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl BusSink for RateLimitedSink {
    fn deliver(&self, msg: ChannelMessage) -> WireResult<()> {
        let queue = match &self.queue {
            Some(queue) if msg.effective_len() > 0 => queue,
            _ => return self.inner.deliver(msg),
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = queue.send(msg) {
            // Worker gone (runtime shutting down). Send unmetered.
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return self.inner.deliver(e.0);
        }
        Ok(())
    }
}

async fn run_queue(
    limiter: Arc<ByteRateLimiter>,
    burst: NonZeroU32,
    inner: Arc<dyn BusSink>,
    mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(msg) = rx.recv().await {
        let mut remaining = u32::try_from(msg.effective_len()).unwrap_or(u32::MAX);
        while let Some(cost) = NonZeroU32::new(remaining.min(burst.get())) {
            if let Err(e) = limiter.until_n_ready(cost).await {
                warn!(cost = cost.get(), error = %e, "Rate limiter refused a chunk");
                break;
            }
            remaining -= cost.get();
        }
        pending.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = inner.deliver(msg) {
            debug!(error = %e, "Dropping rate-limited message, bus is gone");
        }
    }
}
