//! Relay endpoints: the per-side context tying bus, registry and channels.
//!
//! A [`Relay`] is created per bus attachment. The frontend relay opens
//! initiator channels for incoming clients; the outlet relay answers `PING`s
//! and turns every new `OPEN` into an acceptor channel, handed out through
//! the [`AcceptedChannel`] stream. Both sides route inbound traffic by channel
//! id and fan a `MEDIUM_BREAK` out to every channel they hold.

use crate::channel::{ChannelConfig, ChannelEvents, LogicalChannel};
use crate::error::{WireError, WireResult};
use crate::heartbeat;
use crate::message::{decode_message, ChannelMessage, MessageKind, CLOSE_MEDIUM_BROKEN};
use crate::registry::ChannelRegistry;
use crate::sink::BusSink;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Which side of the bus a relay sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Frontend,
    Outlet,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Outlet => "outlet",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A channel the outlet accepted, ready to be bridged to its destination.
#[derive(Debug)]
pub struct AcceptedChannel {
    pub channel: LogicalChannel,
    /// Already holds the `Open` event.
    pub events: ChannelEvents,
    /// Destination requested by the client, possibly empty.
    pub destination: String,
}

/// One side's channel-multiplexing context.
pub struct Relay {
    endpoint: Endpoint,
    instance_id: Uuid,
    registry: Arc<ChannelRegistry>,
    sink: Arc<dyn BusSink>,
    config: ChannelConfig,
    accepted: Option<mpsc::UnboundedSender<AcceptedChannel>>,
}

impl Relay {
    /// Relay for the public-facing side.
    pub fn frontend(config: ChannelConfig, sink: Arc<dyn BusSink>) -> Self {
        Self::new(Endpoint::Frontend, config, sink, None)
    }

    /// Relay for the outlet side, plus the stream of accepted channels.
    pub fn outlet(
        config: ChannelConfig,
        sink: Arc<dyn BusSink>,
    ) -> (Self, mpsc::UnboundedReceiver<AcceptedChannel>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Endpoint::Outlet, config, sink, Some(tx)), rx)
    }

    fn new(
        endpoint: Endpoint,
        config: ChannelConfig,
        sink: Arc<dyn BusSink>,
        accepted: Option<mpsc::UnboundedSender<AcceptedChannel>>,
    ) -> Self {
        let instance_id = Uuid::new_v4();
        info!(endpoint = %endpoint, instance = %instance_id, "Relay started");
        Self {
            endpoint,
            instance_id,
            registry: ChannelRegistry::new(),
            sink,
            config,
            accepted,
        }
    }

    /// Open a channel to `destination` for a newly connected client.
    pub fn open_channel(
        &self,
        destination: impl Into<String>,
    ) -> WireResult<(LogicalChannel, ChannelEvents)> {
        if self.endpoint != Endpoint::Frontend {
            return Err(WireError::WrongEndpoint {
                operation: "open_channel",
                endpoint: self.endpoint.name(),
            });
        }
        let (channel, events) =
            LogicalChannel::initiator(destination, Arc::clone(&self.sink), self.config.clone());
        // Register before OPEN goes out so CREATED always finds the channel.
        self.registry.insert(channel.clone());
        channel.start();
        debug!(channel = %channel.id(), channels = self.registry.len(), "Channel initiated");
        Ok((channel, events))
    }

    /// Decode one frame from the bus and dispatch it. Malformed frames are
    /// logged and dropped.
    pub fn handle_frame(&self, frame: &[u8]) {
        match decode_message(frame) {
            Ok(msg) => self.handle_message(msg),
            Err(e) => warn!(
                endpoint = %self.endpoint,
                len = frame.len(),
                error = %e,
                "Dropping malformed frame"
            ),
        }
    }

    /// Dispatch one decoded message.
    pub fn handle_message(&self, msg: ChannelMessage) {
        trace!(endpoint = %self.endpoint, message = %msg, "Inbound");
        match msg.kind {
            MessageKind::Ping => {
                if self.endpoint == Endpoint::Outlet {
                    if let Some(pong) = heartbeat::pong_for(&msg, self.instance_id) {
                        if let Err(e) = self.sink.deliver(pong) {
                            debug!(error = %e, "PONG not delivered");
                        }
                    }
                }
            }
            // Arbitration listens for these on its own subscription.
            MessageKind::Pong => {}
            MessageKind::MediumBreak => {
                self.bus_closed();
            }
            _ => self.route(msg),
        }
    }

    fn route(&self, msg: ChannelMessage) {
        if let Some(channel) = self.registry.get(&msg.channel_id) {
            channel.receive(msg);
            return;
        }

        if msg.kind == MessageKind::Open && self.endpoint == Endpoint::Outlet {
            self.accept(msg);
            return;
        }

        debug!(
            endpoint = %self.endpoint,
            channel = %msg.channel_id,
            kind = %msg.kind,
            "Dropping message for unknown channel"
        );
    }

    fn accept(&self, open: ChannelMessage) {
        let id = open.channel_id;
        if self.registry.was_closed(&id) {
            debug!(channel = %id, "Ignoring duplicate OPEN for a closed channel");
            return;
        }
        let Some(accepted) = &self.accepted else {
            return;
        };

        let (channel, events) =
            LogicalChannel::accept(id, Arc::clone(&self.sink), self.config.clone());
        if !self.registry.insert(channel.clone()) {
            // Lost a race with a duplicate OPEN; the winner handles it.
            if let Some(existing) = self.registry.get(&id) {
                existing.receive(open);
            }
            return;
        }
        channel.receive(open);

        let destination = channel.destination().unwrap_or_default();
        let handoff = AcceptedChannel {
            channel: channel.clone(),
            events,
            destination,
        };
        if accepted.send(handoff).is_err() {
            warn!(channel = %id, "Outlet is not taking channels, closing");
            channel.close(CLOSE_MEDIUM_BROKEN, "outlet is not accepting channels");
        }
    }

    /// The bus went away: break every channel and empty the registry.
    /// Returns how many channels were broken.
    pub fn bus_closed(&self) -> usize {
        let broken = self.registry.medium_break_all();
        if broken > 0 {
            info!(
                endpoint = %self.endpoint,
                channels = broken,
                "Medium break, all channels closed"
            );
        }
        broken
    }

    /// Number of live channels on this side.
    pub fn channel_count(&self) -> usize {
        self.registry.len()
    }

    /// Id of this relay instance, sent in `PONG` replies.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }
}
