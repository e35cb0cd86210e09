//! Broker connection lifecycle.
//!
//! One background task owns the rumqttc event loop and turns everything it
//! sees into [`ConnectionEvent`]s on a single ordered channel.  Consumers fold
//! those events into a [`ConnectionState`]:
//!
//! ```text
//! Connecting ──[ConnAck]──▶ Connected ──[error / disconnect]──▶ Offline
//!                              ▲                                  │
//!                              └──[ConnAck]── Reconnecting ◀──[retry interval]
//! ```
//!
//! Subscriptions are (re)issued on every ConnAck before `Connected` is
//! emitted, so anything reacting to `Connected` sees a subscribed session.

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    Transport,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BrokerEndpoint, TransportKind};
use crate::topics::Topics;

/// Outstanding request capacity of the rumqttc client.
const REQUEST_CAPACITY: usize = 20;

/// Buffered lifecycle/message events between the poll task and the engine.
const EVENT_BUFFER: usize = 256;

/// How long shutdown waits for a queued DISCONNECT to reach the socket.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Events and state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Error(String),
    Offline,
    Reconnecting,
    Message { topic: String, payload: Vec<u8> },
}

impl ConnectionState {
    pub fn next(self, event: &ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::Connecting => Self::Connecting,
            ConnectionEvent::Connected => Self::Connected,
            ConnectionEvent::Error(_) | ConnectionEvent::Offline => Self::Offline,
            ConnectionEvent::Reconnecting => Self::Reconnecting,
            ConnectionEvent::Message { .. } => self,
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// `"<prefix>-<9 random lowercase alphanumerics>"`, unique per process.
pub fn client_id(prefix: &str) -> String {
    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
        .take(9)
        .collect();
    format!("{prefix}-{}", suffix.to_ascii_lowercase())
}

pub fn mqtt_options(endpoint: &BrokerEndpoint, client_id: &str, keep_alive: Duration) -> MqttOptions {
    let mut options = match endpoint.transport {
        TransportKind::Tcp => MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port),
        TransportKind::Tls => {
            let mut o = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
            o.set_transport(Transport::tls_with_default_config());
            o
        }
        TransportKind::Ws => {
            let mut o = MqttOptions::new(client_id, endpoint.url.clone(), endpoint.port);
            o.set_transport(Transport::Ws);
            o
        }
        TransportKind::Wss => {
            let mut o = MqttOptions::new(client_id, endpoint.url.clone(), endpoint.port);
            o.set_transport(Transport::wss_with_default_config());
            o
        }
    };
    options.set_keep_alive(keep_alive);
    options.set_clean_session(true);
    options
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

pub struct Connection {
    client: AsyncClient,
    client_id: String,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Start the event loop task.  The returned receiver yields events in
    /// arrival order until [`Connection::disconnect`] is called.
    pub fn open(
        options: MqttOptions,
        topics: Topics,
        reconnect: Duration,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let client_id = options.client_id();
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(client_id = %client_id, "mqtt connecting");
        let task = tokio::spawn(run(
            eventloop,
            client.clone(),
            topics,
            reconnect,
            tx,
            shutdown_rx,
        ));

        let conn = Self {
            client,
            client_id,
            shutdown,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        };
        (conn, rx)
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Stop the event loop and drop the transport.  Safe to call repeatedly;
    /// only the first call does anything.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!("mqtt disconnect request not queued: {e}");
        }
        let _ = self.shutdown.send(true);

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("mqtt task ended abnormally: {e}");
            }
        }
        info!(client_id = %self.client_id, "mqtt disconnected");
    }
}

// ---------------------------------------------------------------------------
// Event loop task
// ---------------------------------------------------------------------------

async fn run(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    reconnect: Duration,
    events: mpsc::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    if events.send(ConnectionEvent::Connecting).await.is_err() {
        return;
    }

    let mut connected = false;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = eventloop.poll() => polled,
        };

        let mut out = Vec::new();
        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected = true;
                subscribe_all(&client, &topics);
                info!("mqtt connected");
                out.push(ConnectionEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                out.push(ConnectionEvent::Message {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let failed = ack
                    .return_codes
                    .iter()
                    .filter(|c| matches!(c, SubscribeReasonCode::Failure))
                    .count();
                if failed > 0 {
                    warn!(pkid = ack.pkid, failed, "broker rejected subscription");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected by broker");
                connected = false;
                out.push(ConnectionEvent::Offline);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected = false;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                connected = false;
                warn!("mqtt error: {e}. reconnecting...");
                let _ = events.send(ConnectionEvent::Error(e.to_string())).await;
                let _ = events.send(ConnectionEvent::Offline).await;

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(reconnect) => {}
                }
                out.push(ConnectionEvent::Reconnecting);
            }
        }

        for event in out {
            if events.send(event).await.is_err() {
                debug!("event receiver dropped; stopping mqtt task");
                return;
            }
        }
    }
    if connected {
        flush_disconnect(&mut eventloop).await;
    }
    debug!("mqtt task stopped");
}

/// Keep polling until the queued DISCONNECT has been written, so the broker
/// sees a clean close instead of a dropped socket.
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(e) => {
                    debug!("mqtt error while disconnecting: {e}");
                    return false;
                }
            }
        }
    })
    .await;
    match drained {
        Ok(true) => debug!("mqtt disconnect sent"),
        Ok(false) => {}
        Err(_) => debug!("mqtt disconnect not sent within {DISCONNECT_GRACE:?}"),
    }
}

/// Queue subscriptions for every inbound topic.  Failures are logged and the
/// connection is still treated as usable.
fn subscribe_all(client: &AsyncClient, topics: &Topics) {
    for topic in topics.subscriptions() {
        match client.try_subscribe(topic, QoS::AtMostOnce) {
            Ok(()) => info!(topic, "subscribed"),
            Err(e) => warn!(topic, "subscribe failed: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
