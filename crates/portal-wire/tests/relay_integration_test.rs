//! End-to-end tests wiring a frontend relay to an outlet relay.
//!
//! The two relays talk through an in-memory bus that encodes every message,
//! reverses each batch it forwards and duplicates every third sequenced
//! message, so ordering and duplicate handling are exercised on every path.
//! No sockets are involved.

use portal_wire::heartbeat::{self, DEFAULT_PROBE_TIMEOUT};
use portal_wire::{
    encode_message, AcceptedChannel, BusSink, ChannelConfig, ChannelEvent, ChannelEvents,
    ChannelMessage, ChannelState, CloseInfo, LogicalChannel, Payload, RateLimitConfig,
    RateLimitedSink, Relay, WireError, CLOSE_MEDIUM_BROKEN,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scrambling bus
// ---------------------------------------------------------------------------

/// Forward everything from `rx` into `target`, reversed per batch and with
/// duplicates.
fn scrambling_pump(
    mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
    target: Arc<Relay>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            tokio::task::yield_now().await;
            while let Ok(msg) = rx.try_recv() {
                batch.push(msg);
            }
            batch.reverse();
            for msg in batch {
                let frame = encode_message(&msg);
                target.handle_frame(&frame);
                if !msg.is_low_level() && msg.sequence_id % 3 == 0 {
                    target.handle_frame(&frame);
                }
            }
        }
    })
}

struct Harness {
    frontend: Arc<Relay>,
    outlet: Arc<Relay>,
    accepted: mpsc::UnboundedReceiver<AcceptedChannel>,
    pumps: Vec<JoinHandle<()>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_outlet_limit(RateLimitConfig::default())
    }

    fn with_outlet_limit(limit: RateLimitConfig) -> Self {
        let (to_outlet_tx, to_outlet_rx) = mpsc::unbounded_channel();
        let (from_outlet_tx, from_outlet_rx) = mpsc::unbounded_channel();

        let frontend = Arc::new(Relay::frontend(
            ChannelConfig::default(),
            Arc::new(to_outlet_tx),
        ));
        let outlet_sink: Arc<dyn BusSink> =
            Arc::new(RateLimitedSink::new(Arc::new(from_outlet_tx), &limit));
        let (outlet, accepted) = Relay::outlet(ChannelConfig::default(), outlet_sink);
        let outlet = Arc::new(outlet);

        let pumps = vec![
            scrambling_pump(to_outlet_rx, Arc::clone(&outlet)),
            scrambling_pump(from_outlet_rx, Arc::clone(&frontend)),
        ];
        Self {
            frontend,
            outlet,
            accepted,
            pumps,
        }
    }

    async fn next_accepted(&mut self) -> AcceptedChannel {
        tokio::time::timeout(Duration::from_secs(5), self.accepted.recv())
            .await
            .expect("no channel accepted in time")
            .expect("accept stream closed")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

async fn next_event(events: &mut ChannelEvents) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event in time")
        .expect("event stream closed")
}

/// Echo every message back until the channel closes; returns the close info.
fn spawn_echo(channel: LogicalChannel, mut events: ChannelEvents) -> JoinHandle<CloseInfo> {
    tokio::spawn(async move {
        loop {
            match next_event(&mut events).await {
                ChannelEvent::Open | ChannelEvent::Error(_) => {}
                ChannelEvent::Message(payload) => {
                    channel.send(payload).expect("echo send");
                }
                ChannelEvent::Close(info) => return info,
            }
        }
    })
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_open_echo_close_roundtrip() {
    let mut h = Harness::new();
    let (client, mut client_events) = h.frontend.open_channel("ws://echo.test").unwrap();

    let accepted = h.next_accepted().await;
    assert_eq!(accepted.destination, "ws://echo.test");
    assert_eq!(accepted.channel.id(), client.id());
    let echo = spawn_echo(accepted.channel, accepted.events);

    assert_eq!(next_event(&mut client_events).await, ChannelEvent::Open);
    assert_eq!(client.state(), ChannelState::Open);

    for i in 0..20 {
        client.send(format!("msg-{i}")).unwrap();
    }
    client
        .send(Payload::Binary(bytes::Bytes::from_static(&[0, 1, 2, 255])))
        .unwrap();

    for i in 0..20 {
        assert_eq!(
            next_event(&mut client_events).await,
            ChannelEvent::Message(Payload::Text(format!("msg-{i}")))
        );
    }
    assert_eq!(
        next_event(&mut client_events).await,
        ChannelEvent::Message(Payload::Binary(bytes::Bytes::from_static(&[0, 1, 2, 255])))
    );

    client.close(1000, "bye");
    let remote = echo.await.unwrap();
    assert_eq!(remote.code, 1000);
    assert_eq!(remote.reason, "bye");
    assert!(remote.was_clean);

    assert_eq!(
        next_event(&mut client_events).await,
        ChannelEvent::Close(CloseInfo {
            code: 1000,
            reason: "bye".into(),
            was_clean: true,
        })
    );

    let (frontend, outlet) = (Arc::clone(&h.frontend), Arc::clone(&h.outlet));
    wait_until(|| frontend.channel_count() == 0 && outlet.channel_count() == 0).await;
}

#[tokio::test]
async fn test_outlet_side_close_reaches_client() {
    let mut h = Harness::new();
    let (_client, mut client_events) = h.frontend.open_channel("ws://dest").unwrap();
    let accepted = h.next_accepted().await;
    assert_eq!(next_event(&mut client_events).await, ChannelEvent::Open);

    accepted.channel.close(4000, "done");
    assert_eq!(
        next_event(&mut client_events).await,
        ChannelEvent::Close(CloseInfo {
            code: 4000,
            reason: "done".into(),
            was_clean: true,
        })
    );

    let channel = accepted.channel.clone();
    wait_until(move || channel.is_closed()).await;
    let (frontend, outlet) = (Arc::clone(&h.frontend), Arc::clone(&h.outlet));
    wait_until(|| frontend.channel_count() == 0 && outlet.channel_count() == 0).await;
}

#[tokio::test]
async fn test_many_channels_stay_independent() {
    let mut h = Harness::new();
    let mut clients = Vec::new();
    for n in 0..8 {
        clients.push(h.frontend.open_channel(format!("ws://dest/{n}")).unwrap());
    }
    for _ in 0..8 {
        let accepted = h.next_accepted().await;
        spawn_echo(accepted.channel, accepted.events);
    }

    for (client, events) in clients.iter_mut() {
        assert_eq!(next_event(events).await, ChannelEvent::Open);
        client.send(format!("hello from {}", client.id())).unwrap();
    }
    for (client, events) in clients.iter_mut() {
        assert_eq!(
            next_event(events).await,
            ChannelEvent::Message(Payload::Text(format!("hello from {}", client.id())))
        );
    }
    assert_eq!(h.outlet.channel_count(), 8);
}

#[tokio::test]
async fn test_medium_break_closes_everything() {
    let mut h = Harness::new();
    let mut client_streams = Vec::new();
    let mut outlet_streams = Vec::new();
    for _ in 0..4 {
        let (_client, mut events) = h.frontend.open_channel("ws://dest").unwrap();
        let accepted = h.next_accepted().await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Open);
        client_streams.push(events);
        outlet_streams.push(accepted.events);
    }

    // The frontend loses the bus; the outlet hears about it separately.
    assert_eq!(h.frontend.bus_closed(), 4);
    h.outlet.handle_message(ChannelMessage::medium_break());

    for mut events in client_streams.into_iter().chain(outlet_streams) {
        let mut closes = Vec::new();
        while let Ok(Some(ev)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            if let ChannelEvent::Close(info) = ev {
                closes.push(info);
            }
        }
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].code, CLOSE_MEDIUM_BROKEN);
        assert!(!closes[0].was_clean);
    }
    assert_eq!(h.frontend.channel_count(), 0);
    assert_eq!(h.outlet.channel_count(), 0);
}

#[tokio::test]
async fn test_rate_limited_outlet_keeps_order() {
    let mut h = Harness::with_outlet_limit(RateLimitConfig {
        bytes_per_sec: 20_000,
        burst_bytes: 1_000,
    });
    let (client, mut events) = h.frontend.open_channel("ws://dest").unwrap();
    let accepted = h.next_accepted().await;
    spawn_echo(accepted.channel, accepted.events);
    assert_eq!(next_event(&mut events).await, ChannelEvent::Open);

    let chunks: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 700]).collect();
    for chunk in &chunks {
        client.send(chunk.clone()).unwrap();
    }
    for chunk in chunks {
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Message(Payload::Binary(chunk.into()))
        );
    }

    client.close(1000, "");
    loop {
        if let ChannelEvent::Close(info) = next_event(&mut events).await {
            assert_eq!(info.code, 1000);
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Arbitration over a broadcast bus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_outlet_is_refused() {
    let (to_outlet, _keep) = broadcast::channel::<ChannelMessage>(64);
    let (from_outlet, _keep_from) = broadcast::channel::<ChannelMessage>(64);

    // Nobody attached yet: the first probe succeeds.
    let mut replies = from_outlet.subscribe();
    heartbeat::probe(&to_outlet, &mut replies, Uuid::new_v4(), Duration::from_millis(200))
        .await
        .unwrap();

    // Attach an outlet relay that listens on to_outlet and answers on from_outlet.
    let (outlet, _accepted) =
        Relay::outlet(ChannelConfig::default(), Arc::new(from_outlet.clone()));
    let outlet = Arc::new(outlet);
    let mut inbound = to_outlet.subscribe();
    let listener = {
        let outlet = Arc::clone(&outlet);
        tokio::spawn(async move {
            while let Ok(msg) = inbound.recv().await {
                outlet.handle_message(msg);
            }
        })
    };

    let mut replies = from_outlet.subscribe();
    let result =
        heartbeat::probe(&to_outlet, &mut replies, Uuid::new_v4(), DEFAULT_PROBE_TIMEOUT).await;
    assert_eq!(result, Err(WireError::BusConflict));

    listener.abort();
}
