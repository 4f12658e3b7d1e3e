//! Portal channel protocol: many reliable, ordered connections over one bus.
//!
//! A public frontend and an unreachable outlet share a single message bus
//! that may reorder or duplicate messages. This crate multiplexes logical
//! channels over that bus and keeps each one behaving like a direct socket.
//!
//! ## Architecture
//!
//! - **message**: the binary channel control message codec
//! - **ordered**: per-direction sequencing and reorder buffering
//! - **channel**: the initiator/acceptor state machine and its timers
//! - **registry**: live channels per endpoint, self-cleaning on close
//! - **relay**: the per-side context that routes bus traffic to channels
//! - **heartbeat**: `PING`/`PONG` arbitration so only one outlet attaches
//! - **rate_limiter**: byte-rate cap on outbound `DATA_*` traffic
//!
//! No sockets live here; see `portal-bridge` for the HTTP and WebSocket side.

pub mod channel;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod ordered;
pub mod rate_limiter;
pub mod registry;
pub mod relay;
pub mod sink;

pub use channel::{
    ChannelConfig, ChannelEvent, ChannelEvents, ChannelState, CloseInfo, LogicalChannel, Role,
};
pub use error::{WireError, WireResult};
pub use message::{
    decode_message, encode_message, ChannelId, ChannelMessage, CloseFrame, MessageBody, MessageKind,
    Payload, CLOSE_ESTABLISH_TIMEOUT, CLOSE_MEDIUM_BROKEN, CLOSE_NORMAL,
};
pub use rate_limiter::{RateLimitConfig, RateLimitedSink};
pub use registry::ChannelRegistry;
pub use relay::{AcceptedChannel, Endpoint, Relay};
pub use sink::BusSink;
