//! Error taxonomy for the channel protocol.
//!
//! Nothing in here is fatal to the process. Codec and sequencing errors mean
//! "drop this message and carry on"; timeout and medium-break variants describe
//! why a single channel was finalized; `BusConflict` is the only error that
//! surfaces past the relay, as a refused outlet attach.

use crate::message::ChannelId;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Truncated frame, unknown kind byte, or invalid UTF-8.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A sequence id that is already waiting in the reorder buffer.
    #[error("Duplicate sequence id {seq} (expecting {expected})")]
    DuplicateSequence { seq: u16, expected: u16 },

    /// A sequence id that was already delivered.
    #[error("Stale sequence id {seq} (expecting {expected})")]
    StaleSequence { seq: u16, expected: u16 },

    /// A message routed to a channel that does not own it.
    #[error("Message for channel {got} routed to channel {owner}")]
    ForeignChannel { owner: ChannelId, got: ChannelId },

    /// `send` was called before the channel reached `Open`.
    #[error("Channel {0} is not open yet")]
    NotOpen(ChannelId),

    /// The peer never answered `OPEN` with `CREATED`.
    #[error("Channel establish timed out")]
    EstablishTimeout,

    /// The peer never acknowledged a local close.
    #[error("Close acknowledgement timed out")]
    CloseAckTimeout,

    /// The shared bus itself went away.
    #[error("Underlying bus is broken")]
    MediumBreak,

    /// The receiving half of an outbound sink is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Another outlet answered the arbitration ping.
    #[error("Another outlet is already attached to the bus")]
    BusConflict,

    /// The operation is only meaningful on the other endpoint side.
    #[error("Operation '{operation}' is not supported on the {endpoint} endpoint")]
    WrongEndpoint {
        operation: &'static str,
        endpoint: &'static str,
    },
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
