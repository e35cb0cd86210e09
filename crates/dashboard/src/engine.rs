//! Process-scoped engine: one connection, one state snapshot, one command
//! publisher and one advisory coordinator, built on start and torn down
//! once on shutdown.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::advisory::{AdvisoryCoordinator, AdvisorySource};
use crate::config::Config;
use crate::connection::{self, Connection, ConnectionEvent};
use crate::publisher::CommandPublisher;
use crate::router;
use crate::state::{DashboardState, SharedState};
use crate::topics::Topics;

pub struct Engine {
    shared: SharedState,
    topics: Topics,
    connection: Connection,
    publisher: CommandPublisher,
    advisory: Arc<AdvisoryCoordinator>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open the broker connection and start applying its events.  Must be
    /// called from within a tokio runtime.
    pub fn start(config: &Config, source: Arc<dyn AdvisorySource>) -> Result<Arc<Self>> {
        let endpoint = config.endpoint()?;
        let shared = DashboardState::shared(config.engine.log_capacity, config.recency_window());
        let topics = Topics::new(&config.broker.topic_prefix);

        let client_id = connection::client_id(&config.broker.client_id_prefix);
        let options = connection::mqtt_options(
            &endpoint,
            &client_id,
            Duration::from_secs(config.broker.keep_alive_secs),
        );
        info!(url = %endpoint.url, %client_id, "starting engine");
        let (connection, events) =
            Connection::open(options, topics.clone(), config.reconnect_interval());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let publisher = CommandPublisher::new(
            connection.client().clone(),
            shared.clone(),
            topics.pump_command.clone(),
        );
        let advisory = Arc::new(AdvisoryCoordinator::new(
            source,
            shared.clone(),
            config.debounce_window(),
            shutdown_rx.clone(),
        ));

        let dispatcher = tokio::spawn(dispatch(
            events,
            shared.clone(),
            topics.clone(),
            shutdown_rx,
        ));

        Ok(Arc::new(Self {
            shared,
            topics,
            connection,
            publisher,
            advisory,
            shutdown,
            stopped: AtomicBool::new(false),
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    pub fn state(&self) -> &SharedState {
        &self.shared
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn publisher(&self) -> &CommandPublisher {
        &self.publisher
    }

    pub fn advisory(&self) -> &Arc<AdvisoryCoordinator> {
        &self.advisory
    }

    pub fn client_id(&self) -> &str {
        self.connection.client_id()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop routing, discard pending advisory results and drop the
    /// transport.  Only the first call has any effect.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutting down");
        let _ = self.shutdown.send(true);

        self.connection.disconnect().await;

        let task = self.dispatcher.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("dispatcher ended abnormally: {e}");
            }
        }
        info!("engine stopped");
    }
}

/// Apply connection events to the state strictly in arrival order.
async fn dispatch(
    mut events: mpsc::Receiver<ConnectionEvent>,
    shared: SharedState,
    topics: Topics,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let mut st = shared.write().await;
        if *shutdown.borrow() {
            break;
        }
        apply_event(&mut st, &topics, event, Instant::now());
    }
    debug!("dispatcher stopped");
}

pub fn apply_event(state: &mut DashboardState, topics: &Topics, event: ConnectionEvent, now: Instant) {
    let next = state.connection.next(&event);
    if next != state.connection {
        info!(from = ?state.connection, to = ?next, "connection state");
        state.connection = next;
    }

    match event {
        ConnectionEvent::Connected => state.last_error = None,
        ConnectionEvent::Error(reason) => state.last_error = Some(reason),
        ConnectionEvent::Message { topic, payload } => {
            router::route(state, topics, &topic, &payload, now);
        }
        ConnectionEvent::Connecting | ConnectionEvent::Offline | ConnectionEvent::Reconnecting => {}
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::AdvisoryFuture;
    use crate::connection::ConnectionState;
    use crate::error::{AdvisoryError, CommandError};
    use crate::model::fixtures::SENSOR_JSON;
    use crate::model::SensorReading;
    use crate::state::{AdvisoryState, DEFAULT_LOG_CAPACITY};
    use tokio::sync::Notify;

    fn state() -> DashboardState {
        DashboardState::new(DEFAULT_LOG_CAPACITY, Duration::from_millis(1500))
    }

    fn msg(topic: &str, payload: &str) -> ConnectionEvent {
        ConnectionEvent::Message {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    // -- apply_event --------------------------------------------------------

    #[tokio::test]
    async fn lifecycle_events_drive_state_and_error() {
        let mut st = state();
        let t = Topics::new("agrohygra");
        let now = Instant::now();

        apply_event(&mut st, &t, ConnectionEvent::Error("connection refused".into()), now);
        assert_eq!(st.connection, ConnectionState::Offline);
        assert_eq!(st.last_error.as_deref(), Some("connection refused"));

        apply_event(&mut st, &t, ConnectionEvent::Reconnecting, now);
        assert_eq!(st.connection, ConnectionState::Reconnecting);
        assert!(st.last_error.is_some());

        apply_event(&mut st, &t, ConnectionEvent::Connected, now);
        assert!(st.is_connected());
        assert!(st.last_error.is_none());
    }

    #[tokio::test]
    async fn messages_are_routed_in_order() {
        let mut st = state();
        let t = Topics::new("agrohygra");
        let now = Instant::now();
        apply_event(&mut st, &t, ConnectionEvent::Connected, now);

        apply_event(&mut st, &t, msg("agrohygra/pump/status", "ON"), now);
        apply_event(&mut st, &t, msg("agrohygra/logs", "first"), now);
        apply_event(&mut st, &t, msg("agrohygra/pump/status", "OFF"), now);
        apply_event(&mut st, &t, msg("agrohygra/logs", "second"), now);

        assert!(!st.pump_on);
        let texts: Vec<_> = st.logs().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["first", "second"]);
        assert_eq!(st.connection, ConnectionState::Connected);
    }

    // -- Live engine against an unreachable broker --------------------------

    /// Resolves only when notified, so tests control when a fetch completes.
    struct GatedSource {
        gate: Notify,
    }

    impl AdvisorySource for GatedSource {
        fn recommend<'a>(&'a self, _reading: &'a SensorReading) -> AdvisoryFuture<'a> {
            Box::pin(async move {
                self.gate.notified().await;
                Ok::<_, AdvisoryError>("<p>late</p>".to_string())
            })
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.broker.url = "mqtt://127.0.0.1:1".into();
        cfg.broker.reconnect_ms = 50;
        cfg
    }

    async fn wait_for<F: Fn(&DashboardState) -> bool>(shared: &SharedState, f: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if f(&*shared.read().await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn unreachable_broker_reports_error() {
        let source = Arc::new(GatedSource { gate: Notify::new() });
        let engine = Engine::start(&test_config(), source).unwrap();
        assert!(engine.client_id().starts_with("agrohygra-web-"));

        wait_for(engine.state(), |st| st.last_error.is_some()).await;
        assert!(!engine.state().read().await.is_connected());

        assert_eq!(
            engine.publisher().publish(true).await,
            Err(CommandError::NotConnected)
        );

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let source = Arc::new(GatedSource { gate: Notify::new() });
        let engine = Engine::start(&test_config(), source).unwrap();

        engine.shutdown().await;
        engine.shutdown().await;
        assert!(engine.is_stopped());
    }

    #[tokio::test]
    async fn pending_advisory_discarded_after_shutdown() {
        let source = Arc::new(GatedSource { gate: Notify::new() });
        let engine = Engine::start(&test_config(), source.clone()).unwrap();

        let reading: SensorReading = serde_json::from_str(SENSOR_JSON).unwrap();
        let task = engine.advisory().request(reading.clone()).await.unwrap();
        assert_eq!(engine.state().read().await.advisory, AdvisoryState::Pending);

        engine.shutdown().await;
        source.gate.notify_one();
        task.await.unwrap();

        assert_eq!(engine.state().read().await.advisory, AdvisoryState::Pending);
        assert!(engine.advisory().request(reading).await.is_none());
    }

    #[tokio::test]
    async fn invalid_broker_url_fails_start() {
        let mut cfg = test_config();
        cfg.broker.url = "http://example.com".into();
        let source = Arc::new(GatedSource { gate: Notify::new() });
        assert!(Engine::start(&cfg, source).is_err());
    }
}
