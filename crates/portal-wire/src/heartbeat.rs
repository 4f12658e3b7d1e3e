//! Bus arbitration: at most one outlet per bus.
//!
//! A would-be outlet first sends `PING` with a fresh instance id and listens
//! for `PONG`. Silence for the probe timeout means the bus is free. Every
//! attached outlet answers every `PING` immediately, which is what makes the
//! probe reliable.

use crate::error::{WireError, WireResult};
use crate::message::{ChannelMessage, MessageKind};
use crate::sink::BusSink;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time to wait for a `PONG`.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Probe the bus for an existing outlet.
///
/// Sends `PING` through `sink` and waits up to `timeout` for a `PONG` on
/// `replies`. Subscribe `replies` before calling so no answer is missed.
/// Returns [`WireError::BusConflict`] when another outlet answers.
pub async fn probe(
    sink: &dyn BusSink,
    replies: &mut broadcast::Receiver<ChannelMessage>,
    instance_id: Uuid,
    timeout: Duration,
) -> WireResult<()> {
    if sink.deliver(ChannelMessage::ping(instance_id)).is_err() {
        debug!(instance = %instance_id, "Nobody is listening on the bus, it is free");
        return Ok(());
    }

    match tokio::time::timeout(timeout, wait_for_pong(replies)).await {
        Ok(Some(responder)) => {
            warn!(
                instance = %instance_id,
                responder = %responder,
                "Another outlet is already attached"
            );
            Err(WireError::BusConflict)
        }
        Ok(None) | Err(_) => {
            info!(instance = %instance_id, "No outlet answered, bus is free");
            Ok(())
        }
    }
}

async fn wait_for_pong(replies: &mut broadcast::Receiver<ChannelMessage>) -> Option<Uuid> {
    loop {
        match replies.recv().await {
            Ok(msg) if msg.kind == MessageKind::Pong => return Some(msg.channel_id),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "Probe receiver lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// The reply an attached outlet owes to `msg`, if it is a `PING`.
pub fn pong_for(msg: &ChannelMessage, instance_id: Uuid) -> Option<ChannelMessage> {
    (msg.kind == MessageKind::Ping).then(|| ChannelMessage::pong(instance_id))
}
