//! In-process broadcast bus between the frontend relay and outlet sockets.
//!
//! Two broadcast directions carry decoded channel messages: `to_outlet`
//! (frontend relay and arbitration probes → every attached `/ws_out` socket)
//! and `from_outlet` (outlet sockets → frontend relay and probes). A receiver
//! that lags has lost messages, which the protocol cannot recover from, so
//! lag is handled as a medium break.

use portal_wire::{BusSink, ChannelMessage, RateLimitConfig, RateLimitedSink, Relay};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Both directions of the frontend's bus.
pub struct BroadcastBus {
    to_outlet: broadcast::Sender<ChannelMessage>,
    from_outlet: broadcast::Sender<ChannelMessage>,
    outlet: AtomicBool,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (to_outlet, _) = broadcast::channel(capacity);
        let (from_outlet, _) = broadcast::channel(capacity);
        Self {
            to_outlet,
            from_outlet,
            outlet: AtomicBool::new(false),
        }
    }

    /// Sender towards outlets.
    pub fn to_outlet(&self) -> &broadcast::Sender<ChannelMessage> {
        &self.to_outlet
    }

    /// Sender for messages arriving from outlets.
    pub fn from_outlet(&self) -> &broadcast::Sender<ChannelMessage> {
        &self.from_outlet
    }

    pub fn subscribe_to_outlet(&self) -> broadcast::Receiver<ChannelMessage> {
        self.to_outlet.subscribe()
    }

    pub fn subscribe_from_outlet(&self) -> broadcast::Receiver<ChannelMessage> {
        self.from_outlet.subscribe()
    }

    /// Publish a message received from an outlet socket.
    pub fn publish_from_outlet(&self, msg: ChannelMessage) {
        if self.from_outlet.send(msg).is_err() {
            debug!("No subscriber for outlet traffic");
        }
    }

    /// Claim the bus for one outlet. Returns `None` while another claim is
    /// held; the claim is released when the returned guard drops.
    pub fn claim_outlet(self: &Arc<Self>) -> Option<OutletClaim> {
        self.outlet
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| OutletClaim {
                bus: Arc::clone(self),
            })
    }

    /// Whether an outlet currently holds the bus.
    pub fn has_outlet(&self) -> bool {
        self.outlet.load(Ordering::Acquire)
    }

    /// Feed everything outlets publish into `relay`. Runs until the bus is
    /// dropped.
    ///
    /// On lag the outlet is sent a `MEDIUM_BREAK` before the local channels
    /// are broken, so both sides drop the same channels.
    pub fn spawn_dispatch(&self, relay: Arc<Relay>) -> JoinHandle<()> {
        let mut rx = self.subscribe_from_outlet();
        let to_outlet = self.to_outlet.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => relay.handle_message(msg),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Frontend relay lagged behind the bus, breaking channels");
                        if to_outlet.send(ChannelMessage::medium_break()).is_err() {
                            debug!("No outlet to notify of the medium break");
                        }
                        relay.bus_closed();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Exclusive hold on the bus by one outlet socket.
pub struct OutletClaim {
    bus: Arc<BroadcastBus>,
}

impl Drop for OutletClaim {
    fn drop(&mut self) {
        self.bus.outlet.store(false, Ordering::Release);
    }
}

/// Wrap `inner` with the configured rate limit, if any.
pub fn outbound_sink(inner: Arc<dyn BusSink>, limit: &RateLimitConfig) -> Arc<dyn BusSink> {
    if limit.is_enabled() {
        Arc::new(RateLimitedSink::new(inner, limit))
    } else {
        inner
    }
}
