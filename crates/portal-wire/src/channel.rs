//! Logical channels: one multiplexed connection over the shared bus.
//!
//! A [`LogicalChannel`] plays one of two roles. The [`Role::Initiator`] lives
//! next to a real client socket and opens the channel by sending `OPEN`. The
//! [`Role::Acceptor`] is created by the outlet on first sight of that `OPEN`
//! and answers with `CREATED`. Both share one state machine:
//!
//! ```text
//! Connecting ──CREATED/OPEN──▶ Open ──close()──▶ Closing ──ACK / timeout──▶ Closed
//!      │                        │                                             ▲
//!      └── establish timeout ───┴──── remote CLOSE / medium break ────────────┘
//! ```
//!
//! Everything the owning socket needs to know arrives as [`ChannelEvent`]s on
//! the receiver returned by the constructor. Each channel serializes its own
//! transitions behind a mutex; different channels never share a lock.

use crate::error::{WireError, WireResult};
use crate::message::{
    ChannelId, ChannelMessage, CloseFrame, MessageBody, MessageKind, Payload,
    CLOSE_ESTABLISH_TIMEOUT, CLOSE_MEDIUM_BROKEN, CLOSE_NORMAL,
};
use crate::ordered::{Reassembler, Sequencer};
use crate::sink::BusSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Reason attached to medium-break closes.
pub const MEDIUM_BROKEN_REASON: &str = "underlying bus is broken";
/// Reason attached to establish-timeout closes.
pub const ESTABLISH_TIMEOUT_REASON: &str = "CONNECTING timeout";

/// Which end of the channel this instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Frontend side, next to the real client.
    Initiator,
    /// Outlet side, next to the real destination.
    Acceptor,
}

impl Role {
    fn data_kind(self) -> MessageKind {
        match self {
            Self::Initiator => MessageKind::DataFromClient,
            Self::Acceptor => MessageKind::DataFromDest,
        }
    }

    fn close_kind(self) -> MessageKind {
        match self {
            Self::Initiator => MessageKind::CloseFromClient,
            Self::Acceptor => MessageKind::CloseFromDest,
        }
    }

    fn close_ack_kind(self) -> MessageKind {
        match self {
            Self::Initiator => MessageKind::CloseAckFromClient,
            Self::Acceptor => MessageKind::CloseAckFromDest,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// How a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Code from the close frame that ended the channel.
    pub code: u16,
    /// Reason from the same frame.
    pub reason: String,
    /// False for establish timeouts and medium breaks.
    pub was_clean: bool,
}

impl CloseInfo {
    fn clean(frame: CloseFrame) -> Self {
        Self {
            code: frame.code,
            reason: frame.reason,
            was_clean: true,
        }
    }

    fn unclean(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
            was_clean: false,
        }
    }
}

/// Notifications delivered to the socket that owns a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel reached `Open`. Sent at most once.
    Open,
    /// Data from the other side, in order.
    Message(Payload),
    /// Emitted right before a non-clean `Close`.
    Error(String),
    /// The channel reached `Closed`. Always the last event.
    Close(CloseInfo),
}

/// Receiver half of a channel's event stream.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Callback run once when a channel reaches `Closed`.
pub type CloseHook = Box<dyn FnOnce(ChannelId) + Send>;

/// Channel timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// How long an initiator waits for `CREATED`.
    pub establish_timeout_ms: u64,
    /// How long a local close waits for the peer's acknowledgement.
    pub close_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            establish_timeout_ms: 1000,
            close_timeout_ms: 1000,
        }
    }
}

impl ChannelConfig {
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_millis(self.establish_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Establish,
    CloseAck,
}

struct Timer {
    epoch: u64,
    handle: JoinHandle<()>,
}

struct ChannelCore {
    state: ChannelState,
    destination: Option<String>,
    sequencer: Sequencer,
    reassembler: Reassembler,
    pending_close: Option<CloseFrame>,
    establish_timer: Option<Timer>,
    close_timer: Option<Timer>,
    next_epoch: u64,
    close_hooks: Vec<CloseHook>,
}

impl ChannelCore {
    fn timer_slot(&mut self, kind: TimerKind) -> &mut Option<Timer> {
        match kind {
            TimerKind::Establish => &mut self.establish_timer,
            TimerKind::CloseAck => &mut self.close_timer,
        }
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.timer_slot(kind).take() {
            timer.handle.abort();
        }
    }
}

struct ChannelShared {
    id: ChannelId,
    role: Role,
    config: ChannelConfig,
    sink: Arc<dyn BusSink>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    core: Mutex<ChannelCore>,
}

/// Inbound message, interpreted relative to this channel's role.
enum Inbound {
    OpenRequest(String),
    Created,
    Data(Payload),
    Close(CloseFrame),
    CloseAck,
    Unexpected(MessageKind),
}

fn classify(role: Role, msg: ChannelMessage) -> Inbound {
    use MessageKind::*;
    match (role, msg.kind) {
        (Role::Acceptor, Open) => {
            let destination = match msg.body {
                MessageBody::Data(Payload::Text(text)) => text,
                MessageBody::Data(Payload::Binary(bytes)) => {
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                _ => String::new(),
            };
            Inbound::OpenRequest(destination)
        }
        (Role::Initiator, Created) => Inbound::Created,
        (Role::Initiator, DataFromDest) | (Role::Acceptor, DataFromClient) => match msg.body {
            MessageBody::Data(payload) => Inbound::Data(payload),
            _ => Inbound::Unexpected(msg.kind),
        },
        (Role::Initiator, CloseFromDest) | (Role::Acceptor, CloseFromClient) => {
            let frame = match msg.body {
                MessageBody::Close(frame) => frame,
                _ => CloseFrame {
                    code: CLOSE_NORMAL,
                    reason: String::new(),
                },
            };
            Inbound::Close(frame)
        }
        (Role::Initiator, CloseAckFromDest) | (Role::Acceptor, CloseAckFromClient) => {
            Inbound::CloseAck
        }
        (_, kind) => Inbound::Unexpected(kind),
    }
}

/// Handle to one logical channel. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LogicalChannel {
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for LogicalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalChannel")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

impl LogicalChannel {
    /// Open a new channel towards `destination`: sends `OPEN` and arms the
    /// establish timer. Must be called inside a tokio runtime.
    pub fn initiate(
        destination: impl Into<String>,
        sink: Arc<dyn BusSink>,
        config: ChannelConfig,
    ) -> (Self, ChannelEvents) {
        let (channel, events) = Self::initiator(destination, sink, config);
        channel.start();
        (channel, events)
    }

    /// Build an initiator without sending anything yet, so the caller can
    /// register it before the peer's reply can arrive.
    pub(crate) fn initiator(
        destination: impl Into<String>,
        sink: Arc<dyn BusSink>,
        config: ChannelConfig,
    ) -> (Self, ChannelEvents) {
        Self::build(
            Uuid::new_v4(),
            Role::Initiator,
            Some(destination.into()),
            sink,
            config,
        )
    }

    /// Send `OPEN` and arm the establish timer.
    pub(crate) fn start(&self) {
        let mut core = self.lock();
        if core.state != ChannelState::Connecting || core.sequencer.peek() != 0 {
            return;
        }
        let destination = core.destination.clone().unwrap_or_default();
        if let Err(e) = self.transmit(
            &mut core,
            MessageKind::Open,
            MessageBody::Data(Payload::Text(destination)),
        ) {
            warn!(channel = %self.id(), error = %e, "Failed to send OPEN");
        }
        self.arm(&mut core, TimerKind::Establish);
    }

    /// Create the acceptor half for an `OPEN` seen on the bus. The channel
    /// stays `Connecting` until that `OPEN` is fed through [`receive`].
    ///
    /// [`receive`]: LogicalChannel::receive
    pub fn accept(
        id: ChannelId,
        sink: Arc<dyn BusSink>,
        config: ChannelConfig,
    ) -> (Self, ChannelEvents) {
        Self::build(id, Role::Acceptor, None, sink, config)
    }

    fn build(
        id: ChannelId,
        role: Role,
        destination: Option<String>,
        sink: Arc<dyn BusSink>,
        config: ChannelConfig,
    ) -> (Self, ChannelEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let core = ChannelCore {
            state: ChannelState::Connecting,
            destination,
            sequencer: Sequencer::new(),
            reassembler: Reassembler::new(id),
            pending_close: None,
            establish_timer: None,
            close_timer: None,
            next_epoch: 0,
            close_hooks: Vec::new(),
        };
        let shared = ChannelShared {
            id,
            role,
            config,
            sink,
            events,
            core: Mutex::new(core),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Channel id shared by both ends.
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Destination address. Known from construction on the initiator, and
    /// once `OPEN` has been processed on the acceptor.
    pub fn destination(&self) -> Option<String> {
        self.lock().destination.clone()
    }

    /// Send data to the other side.
    ///
    /// Fails with [`WireError::NotOpen`] while connecting; nothing is sent and
    /// the caller should retry after [`ChannelEvent::Open`]. After a close it
    /// silently does nothing.
    pub fn send(&self, payload: impl Into<Payload>) -> WireResult<()> {
        let mut core = self.lock();
        match core.state {
            ChannelState::Connecting => Err(WireError::NotOpen(self.id())),
            ChannelState::Open => {
                let kind = self.role().data_kind();
                self.transmit(&mut core, kind, MessageBody::Data(payload.into()))
            }
            ChannelState::Closing | ChannelState::Closed => Ok(()),
        }
    }

    /// Start the close handshake. Only the first call has any effect.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let mut core = self.lock();
        if !matches!(core.state, ChannelState::Connecting | ChannelState::Open) {
            return;
        }
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        debug!(channel = %self.id(), code, reason = %frame.reason, "Closing channel");
        let kind = self.role().close_kind();
        if let Err(e) = self.transmit(&mut core, kind, MessageBody::Close(frame.clone())) {
            debug!(channel = %self.id(), error = %e, "Close not delivered");
        }
        core.pending_close = Some(frame);
        core.state = ChannelState::Closing;
        core.cancel(TimerKind::Establish);
        self.arm(&mut core, TimerKind::CloseAck);
    }

    /// Force the channel closed because the bus itself failed. No handshake.
    pub fn medium_break(&self) {
        let hooks = {
            let mut core = self.lock();
            if core.state == ChannelState::Closed {
                return;
            }
            self.finalize(
                &mut core,
                CloseInfo::unclean(CLOSE_MEDIUM_BROKEN, MEDIUM_BROKEN_REASON),
                Some(WireError::MediumBreak.to_string()),
            )
        };
        self.run_hooks(hooks);
    }

    /// Register a hook run once the channel is `Closed`. Runs immediately if
    /// it already is.
    pub fn on_closed(&self, hook: impl FnOnce(ChannelId) + Send + 'static) {
        {
            let mut core = self.lock();
            if core.state != ChannelState::Closed {
                core.close_hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self.id());
    }

    /// Feed one inbound message for this channel.
    pub fn receive(&self, msg: ChannelMessage) {
        let hooks = {
            let mut core = self.lock();
            if core.state == ChannelState::Closed {
                trace!(
                    channel = %self.id(),
                    kind = %msg.kind,
                    "Dropping message for closed channel"
                );
                return;
            }
            let batch = match core.reassembler.push(msg) {
                Ok(batch) => batch,
                Err(e @ WireError::ForeignChannel { .. }) => {
                    warn!(channel = %self.id(), error = %e, "Misrouted message");
                    return;
                }
                Err(e) => {
                    debug!(channel = %self.id(), error = %e, "Discarding out-of-window message");
                    return;
                }
            };

            let mut hooks = Vec::new();
            for msg in batch {
                hooks = self.apply(&mut core, msg);
                if core.state == ChannelState::Closed {
                    break;
                }
            }
            hooks
        };
        self.run_hooks(hooks);
    }

    /// Apply one in-order message. Returns close hooks to run after unlock.
    fn apply(&self, core: &mut ChannelCore, msg: ChannelMessage) -> Vec<CloseHook> {
        let id = self.id();
        match classify(self.role(), msg) {
            Inbound::OpenRequest(destination) => {
                if core.state != ChannelState::Connecting {
                    debug!(channel = %id, "Ignoring repeated OPEN");
                    return Vec::new();
                }
                info!(channel = %id, destination = %destination, "Channel accepted");
                core.destination = Some(destination);
                if let Err(e) = self.transmit(core, MessageKind::Created, MessageBody::Empty) {
                    debug!(channel = %id, error = %e, "CREATED not delivered");
                }
                core.state = ChannelState::Open;
                self.emit(ChannelEvent::Open);
            }
            Inbound::Created => {
                if core.state != ChannelState::Connecting {
                    debug!(channel = %id, state = ?core.state, "Ignoring late CREATED");
                    return Vec::new();
                }
                core.cancel(TimerKind::Establish);
                core.state = ChannelState::Open;
                info!(channel = %id, "Channel open");
                self.emit(ChannelEvent::Open);
            }
            Inbound::Data(payload) => {
                if core.state == ChannelState::Open {
                    self.emit(ChannelEvent::Message(payload));
                } else {
                    debug!(channel = %id, state = ?core.state, "Dropping data outside Open");
                }
            }
            Inbound::Close(frame) => {
                let kind = self.role().close_ack_kind();
                if let Err(e) = self.transmit(core, kind, MessageBody::Empty) {
                    debug!(channel = %id, error = %e, "Close ack not delivered");
                }
                return self.finalize(core, CloseInfo::clean(frame), None);
            }
            Inbound::CloseAck => match core.pending_close.take() {
                Some(frame) => return self.finalize(core, CloseInfo::clean(frame), None),
                None => debug!(channel = %id, "Ignoring unsolicited close ack"),
            },
            Inbound::Unexpected(kind) => {
                debug!(
                    channel = %id,
                    role = %self.role(),
                    kind = %kind,
                    "Ignoring message not meant for this role"
                );
            }
        }
        Vec::new()
    }

    /// Move to `Closed` and emit the final events. Idempotent.
    fn finalize(
        &self,
        core: &mut ChannelCore,
        info: CloseInfo,
        error: Option<String>,
    ) -> Vec<CloseHook> {
        if core.state == ChannelState::Closed {
            return Vec::new();
        }
        core.state = ChannelState::Closed;
        core.pending_close = None;
        core.cancel(TimerKind::Establish);
        core.cancel(TimerKind::CloseAck);
        info!(
            channel = %self.id(),
            code = info.code,
            reason = %info.reason,
            clean = info.was_clean,
            "Channel closed"
        );
        if let Some(error) = error {
            self.emit(ChannelEvent::Error(error));
        }
        self.emit(ChannelEvent::Close(info));
        std::mem::take(&mut core.close_hooks)
    }

    fn arm(&self, core: &mut ChannelCore, kind: TimerKind) {
        core.cancel(kind);
        let epoch = core.next_epoch;
        core.next_epoch += 1;
        let delay = match kind {
            TimerKind::Establish => self.shared.config.establish_timeout(),
            TimerKind::CloseAck => self.shared.config.close_timeout(),
        };
        let weak: Weak<ChannelShared> = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                LogicalChannel { shared }.fire(kind, epoch);
            }
        });
        *core.timer_slot(kind) = Some(Timer { epoch, handle });
    }

    fn fire(&self, kind: TimerKind, epoch: u64) {
        let hooks = {
            let mut core = self.lock();
            let slot = core.timer_slot(kind);
            if slot.as_ref().map(|t| t.epoch) != Some(epoch) {
                return;
            }
            // Drop without aborting: this is the running task.
            slot.take();

            match (kind, core.state) {
                (TimerKind::Establish, ChannelState::Connecting) => {
                    warn!(channel = %self.id(), "Channel establish timed out");
                    let frame = CloseFrame {
                        code: CLOSE_ESTABLISH_TIMEOUT,
                        reason: ESTABLISH_TIMEOUT_REASON.to_string(),
                    };
                    let close_kind = self.role().close_kind();
                    let body = MessageBody::Close(frame);
                    if let Err(e) = self.transmit(&mut core, close_kind, body) {
                        debug!(channel = %self.id(), error = %e, "Timeout close not delivered");
                    }
                    self.finalize(
                        &mut core,
                        CloseInfo::unclean(CLOSE_ESTABLISH_TIMEOUT, ESTABLISH_TIMEOUT_REASON),
                        Some(WireError::EstablishTimeout.to_string()),
                    )
                }
                (TimerKind::CloseAck, ChannelState::Closing) => {
                    debug!(
                        channel = %self.id(),
                        error = %WireError::CloseAckTimeout,
                        "Finalizing with the local close frame"
                    );
                    let frame = core.pending_close.take().unwrap_or(CloseFrame {
                        code: CLOSE_NORMAL,
                        reason: String::new(),
                    });
                    self.finalize(&mut core, CloseInfo::clean(frame), None)
                }
                _ => Vec::new(),
            }
        };
        self.run_hooks(hooks);
    }

    /// Stamp and hand one sequenced message to the bus.
    fn transmit(
        &self,
        core: &mut ChannelCore,
        kind: MessageKind,
        body: MessageBody,
    ) -> WireResult<()> {
        let msg = core.sequencer.stamp(ChannelMessage {
            kind,
            sequence_id: 0,
            channel_id: self.id(),
            body,
        });
        trace!(message = %msg, "Outbound");
        self.shared.sink.deliver(msg)
    }

    fn emit(&self, event: ChannelEvent) {
        // The owning socket may already be gone; nothing left to notify.
        let _ = self.shared.events.send(event);
    }

    fn run_hooks(&self, hooks: Vec<CloseHook>) {
        for hook in hooks {
            hook(self.id());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelCore> {
        self.shared.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}
