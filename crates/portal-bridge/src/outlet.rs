//! Outlet client: attaches to a frontend's `/ws_out` and dials destinations.
//!
//! The outlet keeps one bus socket open to the frontend, reconnecting after
//! drops. Each bus session gets a fresh outlet [`Relay`]; every channel it
//! accepts is bridged to a real WebSocket destination in its own task.

use crate::bus::outbound_sink;
use crate::config::{OutletConfig, PortalConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::socket::{self, Inbound};
use futures::{SinkExt, StreamExt};
use portal_wire::{
    encode_message, AcceptedChannel, BusSink, ChannelEvent, ChannelMessage, LogicalChannel, Relay,
    CLOSE_MEDIUM_BROKEN, CLOSE_NORMAL,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

type BusSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Why a bus session ended.
enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// A running outlet.
pub struct Outlet {
    config: PortalConfig,
    online: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Outlet {
    /// Start the connect loop in the background.
    pub fn start(config: PortalConfig) -> (Arc<Self>, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let outlet = Arc::new(Self {
            config,
            online: AtomicBool::new(false),
            shutdown_tx,
        });
        let handle = tokio::spawn(Arc::clone(&outlet).run(shutdown_rx));
        (outlet, handle)
    }

    /// Whether a bus session is currently up.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Close the bus socket and stop reconnecting.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.outlet.reconnect_interval();
        let max_backoff = self.config.outlet.max_backoff();
        let url = self.config.outlet.agent_url.clone();
        let mut backoff = interval;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            info!(url = %url, "Connecting outlet to frontend");
            let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((socket, _)) => socket,
                Err(e) => {
                    warn!(
                        url = %url,
                        error = %e,
                        "Outlet connection failed, retrying in {backoff:?}"
                    );
                    if sleep_or_shutdown(backoff, &mut shutdown_rx).await {
                        break;
                    }
                    backoff = (backoff * 2).min(max_backoff);
                    continue;
                }
            };
            backoff = interval;

            self.online.store(true, Ordering::Release);
            let end = self.session(socket, &mut shutdown_rx).await;
            self.online.store(false, Ordering::Release);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Disconnected => {
                    info!("Outlet offline, reconnecting in {interval:?}");
                    if sleep_or_shutdown(interval, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        info!("Outlet stopped");
    }

    /// Drive one bus connection until it drops or shutdown is requested.
    async fn session(
        &self,
        socket: BusSocket,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ChannelMessage>();
        let sink: Arc<dyn BusSink> = outbound_sink(Arc::new(out_tx), &self.config.rate_limit);
        let (relay, mut accepted) = Relay::outlet(self.config.channel.clone(), sink);
        let (mut ws_tx, mut ws_rx) = socket.split();
        info!(instance = %relay.instance_id(), "Outlet online");

        let end = loop {
            tokio::select! {
                Some(msg) = out_rx.recv() => {
                    if let Err(e) = ws_tx.send(WsMessage::Binary(encode_message(&msg))).await {
                        warn!(error = %e, "Bus write failed");
                        break SessionEnd::Disconnected;
                    }
                }
                frame = ws_rx.next() => match frame {
                    Some(Ok(WsMessage::Binary(bytes))) => relay.handle_frame(&bytes),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Frontend closed the bus");
                        break SessionEnd::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Bus read failed");
                        break SessionEnd::Disconnected;
                    }
                },
                Some(channel) = accepted.recv() => {
                    let outlet = self.config.outlet.clone();
                    let dial_timeout = self.config.channel.establish_timeout();
                    tokio::spawn(bridge_destination(channel, outlet, dial_timeout));
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = ws_tx.close().await;
                        break SessionEnd::Shutdown;
                    }
                }
            }
        };

        relay.bus_closed();
        end
    }
}

/// Sleep for `delay`; returns true if shutdown was requested meanwhile.
async fn sleep_or_shutdown(
    delay: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
        _ = shutdown_rx.changed() => true,
    }
}

/// Dial the channel's destination and pump frames both ways.
async fn bridge_destination(
    accepted: AcceptedChannel,
    outlet: OutletConfig,
    dial_timeout: Duration,
) {
    let AcceptedChannel {
        channel,
        mut events,
        destination,
    } = accepted;

    let target = outlet.resolve_destination(&destination);
    let socket = match dial(&target, dial_timeout).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(
                channel = %channel.id(),
                destination = %target,
                error = %e,
                "Destination dial failed"
            );
            channel.close(CLOSE_MEDIUM_BROKEN, e.to_string());
            return;
        }
    };
    info!(channel = %channel.id(), destination = %target, "Destination connected");

    let (mut dest_tx, mut dest_rx) = socket.split();
    let mut dest_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Message(payload)) => {
                    if let Err(e) = dest_tx.send(socket::to_destination(payload)).await {
                        debug!(channel = %channel.id(), error = %e, "Destination write failed");
                        channel.close(CLOSE_MEDIUM_BROKEN, "destination write failed");
                        dest_open = false;
                    }
                }
                Some(ChannelEvent::Close(info)) => {
                    let _ = dest_tx.send(socket::destination_close(info.code, &info.reason)).await;
                    break;
                }
                Some(ChannelEvent::Open) | Some(ChannelEvent::Error(_)) => {}
                None => break,
            },
            frame = dest_rx.next(), if dest_open => {
                dest_open = pump_destination_frame(&channel, frame);
            }
        }
    }
    debug!(channel = %channel.id(), "Destination bridge finished");
}

async fn dial(target: &str, timeout: Duration) -> BridgeResult<BusSocket> {
    if target.is_empty() {
        return Err(BridgeError::NoDestination);
    }
    let url = url::Url::parse(target)?;
    let connect = tokio_tungstenite::connect_async(url.as_str());
    let (socket, _) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| BridgeError::DialTimeout(timeout))??;
    Ok(socket)
}

/// Apply one destination frame to the channel. Returns whether the
/// destination is still readable.
fn pump_destination_frame(
    channel: &LogicalChannel,
    frame: Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
) -> bool {
    let msg = match frame {
        Some(Ok(msg)) => msg,
        Some(Err(e)) => {
            debug!(channel = %channel.id(), error = %e, "Destination socket error");
            channel.close(CLOSE_MEDIUM_BROKEN, e.to_string());
            return false;
        }
        None => {
            channel.close(CLOSE_NORMAL, "");
            return false;
        }
    };
    match socket::from_destination(msg) {
        Inbound::Data(payload) => {
            if let Err(e) = channel.send(payload) {
                debug!(channel = %channel.id(), error = %e, "Destination data not sent");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_rejects_empty_and_invalid() {
        let timeout = Duration::from_secs(1);
        assert!(matches!(dial("", timeout).await, Err(BridgeError::NoDestination)));
        assert!(matches!(
            dial("not a url", timeout).await,
            Err(BridgeError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_times_out_on_silent_destination() {
        // Accepts TCP but never answers the WebSocket handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let started = std::time::Instant::now();
        let result = dial(&format!("ws://{addr}/"), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(BridgeError::DialTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_outlet_retries_until_shutdown() {
        let mut config = PortalConfig::default();
        // Nothing listens on port 9 of localhost in the test environment.
        config.outlet.agent_url = "ws://127.0.0.1:9/ws_out".into();
        config.outlet.reconnect_interval_ms = 10;
        config.outlet.max_backoff_ms = 40;

        let (outlet, handle) = Outlet::start(config);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!outlet.is_online());
        outlet.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
