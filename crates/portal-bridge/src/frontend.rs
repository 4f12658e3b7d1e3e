//! Public frontend: HTTP and WebSocket server.
//!
//! Routes:
//! - `GET /ws_in?dest=<url>` upgrades a client and bridges it over a new
//!   initiator channel.
//! - `GET /ws_out` attaches an outlet to the bus after arbitration, or
//!   answers `409 Conflict` if another outlet already holds it.
//! - `GET /` and `GET /health` for liveness checks.

use crate::bus::{outbound_sink, BroadcastBus, OutletClaim};
use crate::config::{FrontendConfig, PortalConfig};
use crate::error::BridgeResult;
use crate::socket::{self, Inbound};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use portal_wire::heartbeat;
use portal_wire::{
    decode_message, encode_message, ChannelEvent, ChannelEvents, ChannelMessage, LogicalChannel,
    Relay, WireError, CLOSE_NORMAL,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared state behind every route.
pub struct FrontendState {
    /// Frontend relay holding every client channel.
    pub relay: Arc<Relay>,
    /// Bus between the relay and the attached outlet.
    pub bus: Arc<BroadcastBus>,
    /// Settings the server was started with.
    pub config: FrontendConfig,
}

/// A running frontend server.
pub struct FrontendServer {
    state: Arc<FrontendState>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl FrontendServer {
    /// Bind the listener and start serving.
    ///
    /// Returns the server handle and the task driving it. The task ends after
    /// [`FrontendServer::shutdown`].
    pub async fn start(
        config: &PortalConfig,
    ) -> BridgeResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(&config.frontend.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let bus = Arc::new(BroadcastBus::new(config.frontend.bus_capacity));
        let sink = outbound_sink(Arc::new(bus.to_outlet().clone()), &config.rate_limit);
        let relay = Arc::new(Relay::frontend(config.channel.clone(), sink));
        let dispatch = bus.spawn_dispatch(Arc::clone(&relay));

        let state = Arc::new(FrontendState {
            relay,
            bus,
            config: config.frontend.clone(),
        });
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = Arc::new(Self {
            state: Arc::clone(&state),
            local_addr,
            shutdown_tx,
        });

        info!(addr = %local_addr, "Portal frontend listening");

        let app = router(state);
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "Frontend server error");
            }
            dispatch.abort();
            info!("Portal frontend stopped");
        });

        Ok((server, handle))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// State shared with the route handlers.
    pub fn state(&self) -> &Arc<FrontendState> {
        &self.state
    }

    /// Whether an outlet is attached right now.
    pub fn outlet_attached(&self) -> bool {
        self.state.bus.has_outlet()
    }

    /// Number of open client channels.
    pub fn channel_count(&self) -> usize {
        self.state.relay.channel_count()
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Build the router for `state`.
pub fn router(state: Arc<FrontendState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ws_in", get(ws_in))
        .route("/ws_out", get(ws_out))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> &'static str {
    "portal frontend"
}

async fn health(State(state): State<Arc<FrontendState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "instance_id": state.relay.instance_id().to_string(),
        "channels": state.relay.channel_count(),
        "outlet_attached": state.bus.has_outlet(),
    }))
}

// ---------------------------------------------------------------------------
// Outlet attachment
// ---------------------------------------------------------------------------

async fn ws_out(ws: WebSocketUpgrade, State(state): State<Arc<FrontendState>>) -> Response {
    // Claim first so concurrent attach attempts cannot both pass the probe.
    let Some(claim) = state.bus.claim_outlet() else {
        warn!("Refusing outlet: the bus is already claimed");
        return (StatusCode::CONFLICT, "another outlet is already attached").into_response();
    };

    let mut replies = state.bus.subscribe_from_outlet();
    let probe = heartbeat::probe(
        state.bus.to_outlet(),
        &mut replies,
        Uuid::new_v4(),
        state.config.arbitration_timeout(),
    )
    .await;
    drop(replies);

    if let Err(WireError::BusConflict) = probe {
        warn!("Refusing outlet: another outlet is attached");
        return (StatusCode::CONFLICT, "another outlet is already attached").into_response();
    }

    ws.on_upgrade(move |socket| outlet_session(socket, state, claim))
}

/// Forward the bus to one outlet socket until either side fails. The claim
/// is held for the whole session.
async fn outlet_session(socket: WebSocket, state: Arc<FrontendState>, claim: OutletClaim) {
    let (ws_tx, ws_rx) = socket.split();
    let outbound = state.bus.subscribe_to_outlet();
    info!("Outlet online");

    tokio::select! {
        result = forward_to_outlet(outbound, ws_tx) => {
            if let Err(e) = result {
                debug!(error = %e, "Outlet write side ended");
            }
        }
        result = forward_from_outlet(ws_rx, &state.bus) => {
            if let Err(e) = result {
                debug!(error = %e, "Outlet read side ended");
            }
        }
    }

    state.bus.publish_from_outlet(ChannelMessage::medium_break());
    drop(claim);
    info!("Outlet offline");
}

async fn forward_to_outlet(
    mut outbound: broadcast::Receiver<ChannelMessage>,
    mut ws_tx: SplitSink<WebSocket, Message>,
) -> BridgeResult<()> {
    loop {
        match outbound.recv().await {
            Ok(msg) => {
                ws_tx
                    .send(Message::Binary(encode_message(&msg).into()))
                    .await?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Outlet socket lagged behind the bus, detaching");
                return Ok(());
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn forward_from_outlet(
    mut ws_rx: SplitStream<WebSocket>,
    bus: &BroadcastBus,
) -> BridgeResult<()> {
    while let Some(frame) = ws_rx.next().await {
        match frame? {
            Message::Binary(bytes) => match decode_message(&bytes) {
                Ok(msg) => bus.publish_from_outlet(msg),
                Err(e) => warn!(len = bytes.len(), error = %e, "Dropping malformed outlet frame"),
            },
            Message::Close(_) => break,
            Message::Text(_) => debug!("Ignoring text frame from outlet"),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client connections
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsInQuery {
    #[serde(default)]
    dest: String,
}

async fn ws_in(
    ws: WebSocketUpgrade,
    Query(query): Query<WsInQuery>,
    State(state): State<Arc<FrontendState>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = client_session(socket, state, query.dest).await {
            debug!(error = %e, "Client session ended with error");
        }
    })
}

/// Bridge one client socket over a fresh channel.
async fn client_session(
    socket: WebSocket,
    state: Arc<FrontendState>,
    destination: String,
) -> BridgeResult<()> {
    let (channel, mut events) = state.relay.open_channel(destination.as_str())?;
    let (mut ws_tx, mut ws_rx) = socket.split();
    debug!(channel = %channel.id(), destination = %destination, "Client connected");

    // Client frames stay unread in the socket until the channel is open.
    if !wait_for_open(&mut events, &mut ws_tx).await {
        return Ok(());
    }

    let mut client_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Message(payload)) => {
                    if ws_tx.send(socket::to_client(payload)).await.is_err() {
                        channel.close(CLOSE_NORMAL, "client went away");
                        client_open = false;
                    }
                }
                Some(ChannelEvent::Close(info)) => {
                    let _ = ws_tx.send(socket::client_close(info.code, &info.reason)).await;
                    break;
                }
                Some(ChannelEvent::Error(e)) => {
                    debug!(channel = %channel.id(), error = %e, "Channel error")
                }
                Some(ChannelEvent::Open) => {}
                None => break,
            },
            frame = ws_rx.next(), if client_open => {
                client_open = pump_client_frame(&channel, frame);
            }
        }
    }
    Ok(())
}

/// Wait for `Open`. Returns false if the channel closed first.
async fn wait_for_open(
    events: &mut ChannelEvents,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => return true,
            ChannelEvent::Close(info) => {
                let _ = ws_tx.send(socket::client_close(info.code, &info.reason)).await;
                return false;
            }
            ChannelEvent::Error(e) => debug!(error = %e, "Channel failed to open"),
            ChannelEvent::Message(_) => {}
        }
    }
    false
}

/// Apply one client frame to the channel. Returns whether the client socket
/// is still readable.
fn pump_client_frame(
    channel: &LogicalChannel,
    frame: Option<Result<Message, axum::Error>>,
) -> bool {
    let msg = match frame {
        Some(Ok(msg)) => msg,
        Some(Err(e)) => {
            debug!(channel = %channel.id(), error = %e, "Client socket error");
            channel.close(CLOSE_NORMAL, "client socket error");
            return false;
        }
        None => {
            channel.close(CLOSE_NORMAL, "");
            return false;
        }
    };
    match socket::from_client(msg) {
        Inbound::Data(payload) => {
            if let Err(e) = channel.send(payload) {
                debug!(channel = %channel.id(), error = %e, "Client data not sent");
            }
            true
        }
        Inbound::Close { code, reason } => {
            channel.close(code, reason);
            false
        }
        Inbound::Ignore => true,
    }
}
