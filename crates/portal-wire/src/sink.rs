//! Outbound bus sinks.
//!
//! Channels and relays never touch a socket. They hand finished messages to a
//! [`BusSink`], and whoever owns the physical bus drains the other end.

use crate::error::{WireError, WireResult};
use crate::message::ChannelMessage;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Something that accepts outbound channel messages for the bus.
pub trait BusSink: Send + Sync {
    /// Queue one message for the bus. Fails only when the bus side is gone.
    fn deliver(&self, msg: ChannelMessage) -> WireResult<()>;
}

impl BusSink for mpsc::UnboundedSender<ChannelMessage> {
    fn deliver(&self, msg: ChannelMessage) -> WireResult<()> {
        self.send(msg).map_err(|_| WireError::ConnectionClosed)
    }
}

impl BusSink for broadcast::Sender<ChannelMessage> {
    fn deliver(&self, msg: ChannelMessage) -> WireResult<()> {
        self.send(msg)
            .map(|_| ())
            .map_err(|_| WireError::ConnectionClosed)
    }
}

impl<S: BusSink + ?Sized> BusSink for Arc<S> {
    fn deliver(&self, msg: ChannelMessage) -> WireResult<()> {
        (**self).deliver(msg)
    }
}
