use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::info;

use crate::advisory::AdvisoryCoordinator;
use crate::engine::Engine;
use crate::error::CommandError;
use crate::publisher::CommandPublisher;
use crate::state::SharedState;

const INDEX_HTML: &str = include_str!("ui/index.html");

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub publisher: CommandPublisher,
    pub advisory: Arc<AdvisoryCoordinator>,
}

impl AppState {
    pub fn from_engine(engine: &Engine) -> Self {
        Self {
            shared: engine.state().clone(),
            publisher: engine.publisher().clone(),
            advisory: Arc::clone(engine.advisory()),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

enum ApiError {
    Command(CommandError),
    Conflict(&'static str),
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Command(e @ CommandError::NotConnected) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            Self::Command(e @ CommandError::Publish(_)) => (StatusCode::BAD_GATEWAY, e.to_string()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/pump", post(api_pump))
        .route("/api/pump/emergency-stop", post(api_emergency_stop))
        .route("/api/advisory", post(api_advisory).delete(api_clear_advisory))
        .route("/api/logs", axum::routing::delete(api_clear_logs))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status(Instant::now()))
}

#[derive(Deserialize)]
struct PumpRequest {
    on: bool,
}

async fn api_pump(
    State(state): State<AppState>,
    Json(req): Json<PumpRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.publisher.publish(req.on).await?;
    Ok(Json(json!({ "sent": if req.on { "ON" } else { "OFF" } })))
}

async fn api_emergency_stop(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.publisher.emergency_stop().await?;
    Ok(Json(json!({ "sent": "OFF" })))
}

/// Refused unless there is a reading to advise on and the broker is live.
async fn api_advisory(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let reading = {
        let st = state.shared.read().await;
        if !st.is_connected() {
            return Err(ApiError::Conflict("Not connected to MQTT broker"));
        }
        st.sensor
            .clone()
            .ok_or(ApiError::Conflict("No sensor reading available"))?
    };
    let accepted = state.advisory.request(reading).await.is_some();
    Ok(Json(json!({ "accepted": accepted })))
}

async fn api_clear_advisory(State(state): State<AppState>) -> StatusCode {
    state.advisory.clear().await;
    StatusCode::NO_CONTENT
}

async fn api_clear_logs(State(state): State<AppState>) -> StatusCode {
    state.shared.write().await.clear_logs();
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::{AdvisoryFuture, AdvisorySource, DEFAULT_DEBOUNCE};
    use crate::connection::ConnectionState;
    use crate::error::AdvisoryError;
    use crate::model::fixtures::SENSOR_JSON;
    use crate::model::SensorReading;
    use crate::state::{AdvisoryState, DashboardState, DEFAULT_LOG_CAPACITY};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    struct InstantSource;

    impl AdvisorySource for InstantSource {
        fn recommend<'a>(&'a self, _reading: &'a SensorReading) -> AdvisoryFuture<'a> {
            Box::pin(async { Ok::<_, AdvisoryError>("<p>ok</p>".to_string()) })
        }
    }

    /// Keeps the unpolled event loop and the shutdown sender alive.
    struct Harness {
        state: AppState,
        _eventloop: Option<rumqttc::EventLoop>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(connection: ConnectionState, live_transport: bool) -> Harness {
        let shared = DashboardState::shared(DEFAULT_LOG_CAPACITY, Duration::from_millis(1500));
        shared.try_write().unwrap().connection = connection;

        let opts = rumqttc::MqttOptions::new("test-web", "127.0.0.1", 1883);
        let (client, eventloop) = rumqttc::AsyncClient::new(opts, 10);
        let (tx, rx) = watch::channel(false);

        let state = AppState {
            shared: shared.clone(),
            publisher: CommandPublisher::new(client, shared.clone(), "agrohygra/pump/command"),
            advisory: Arc::new(AdvisoryCoordinator::new(
                Arc::new(InstantSource),
                shared,
                DEFAULT_DEBOUNCE,
                rx,
            )),
        };
        Harness {
            state,
            _eventloop: live_transport.then_some(eventloop),
            _shutdown: tx,
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if body.is_some() {
            req = req.header(header::CONTENT_TYPE, "application/json");
        }
        let req = req
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();

        let resp = router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn put_reading(state: &AppState) {
        let reading: SensorReading = serde_json::from_str(SENSOR_JSON).unwrap();
        state.shared.write().await.record_sensor(reading);
    }

    // -- Page & status ------------------------------------------------------

    #[tokio::test]
    async fn index_serves_html() {
        let h = harness(ConnectionState::Connecting, true);
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = router(h.state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn status_reports_snapshot() {
        let h = harness(ConnectionState::Connected, true);
        put_reading(&h.state).await;

        let (status, v) = call(&h.state, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["connection"], "connected");
        assert_eq!(v["connected"], true);
        assert_eq!(v["pump_on"], true);
        assert_eq!(v["sensor"]["device"], "agrohygra-01");
        assert_eq!(v["advisory"]["state"], "idle");
    }

    // -- Pump commands ------------------------------------------------------

    #[tokio::test]
    async fn pump_when_offline_is_unavailable() {
        let h = harness(ConnectionState::Offline, true);
        let (status, v) = call(&h.state, "POST", "/api/pump", Some(r#"{"on":true}"#)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(v["error"], "Not connected to MQTT broker");

        let (_, v) = call(&h.state, "GET", "/api/status", None).await;
        assert_eq!(v["last_error"], "Not connected to MQTT broker");
    }

    #[tokio::test]
    async fn pump_when_connected_sends() {
        let h = harness(ConnectionState::Connected, true);
        let (status, v) = call(&h.state, "POST", "/api/pump", Some(r#"{"on":false}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["sent"], "OFF");
    }

    #[tokio::test]
    async fn pump_transport_failure_is_bad_gateway() {
        let h = harness(ConnectionState::Connected, false);
        let (status, v) = call(&h.state, "POST", "/api/pump", Some(r#"{"on":true}"#)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(v["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to send pump command: "));
    }

    #[tokio::test]
    async fn emergency_stop_sends_off() {
        let h = harness(ConnectionState::Connected, true);
        let (status, v) = call(&h.state, "POST", "/api/pump/emergency-stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["sent"], "OFF");
    }

    // -- Advisory -----------------------------------------------------------

    #[tokio::test]
    async fn advisory_needs_reading_and_connection() {
        let h = harness(ConnectionState::Connected, true);
        let (status, v) = call(&h.state, "POST", "/api/advisory", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(v["error"], "No sensor reading available");

        let h = harness(ConnectionState::Reconnecting, true);
        put_reading(&h.state).await;
        let (status, _) = call(&h.state, "POST", "/api/advisory", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn advisory_request_is_debounced() {
        let h = harness(ConnectionState::Connected, true);
        put_reading(&h.state).await;

        let (status, v) = call(&h.state, "POST", "/api/advisory", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["accepted"], true);

        let (_, v) = call(&h.state, "POST", "/api/advisory", None).await;
        assert_eq!(v["accepted"], false);
    }

    #[tokio::test]
    async fn clear_advisory_returns_to_idle() {
        let h = harness(ConnectionState::Connected, true);
        h.state.shared.write().await.advisory = AdvisoryState::Failed("boom".into());

        let (status, _) = call(&h.state, "DELETE", "/api/advisory", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(h.state.shared.read().await.advisory, AdvisoryState::Idle);
    }

    // -- Logs ---------------------------------------------------------------

    #[tokio::test]
    async fn clear_logs_empties_ring() {
        let h = harness(ConnectionState::Connected, true);
        h.state.shared.write().await.record_log("hello".into());

        let (status, _) = call(&h.state, "DELETE", "/api/logs", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, v) = call(&h.state, "GET", "/api/status", None).await;
        assert_eq!(v["logs"], serde_json::json!([]));
    }
}
