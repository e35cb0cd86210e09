use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::connection::ConnectionState;
use crate::format::{self, MoistureLevel};
use crate::model::{SensorReading, StatusColor, SystemStatus};
use crate::recency::Recency;
use crate::render::{self, Node};

/// Default number of log lines retained in the ring buffer.
pub const DEFAULT_LOG_CAPACITY: usize = 50;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<DashboardState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Latest known device state.  Written only by the engine's dispatcher, the
/// command publisher and the advisory coordinator.
pub struct DashboardState {
    pub connection: ConnectionState,
    pub last_error: Option<String>,
    pub sensor: Option<SensorReading>,
    /// Last writer wins between `pump/status` and the sensor `pump` field;
    /// the source is deliberately not tracked.
    pub pump_on: bool,
    pub system: Option<SystemStatus>,
    pub recency: Recency,
    pub advisory: AdvisoryState,
    logs: VecDeque<LogEntry>,
    log_capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub text: String,
}

impl LogEntry {
    /// "14:03:27: pump started"
    pub fn line(&self) -> String {
        format!(
            "{}: {}",
            self.ts.with_timezone(&Local).format("%H:%M:%S"),
            self.text
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum AdvisoryState {
    #[default]
    Idle,
    Pending,
    Fulfilled(String),
    Failed(String),
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub connection: ConnectionState,
    pub connected: bool,
    pub last_error: Option<String>,
    pub sensor: Option<SensorView>,
    pub pump_on: bool,
    pub system: Option<SystemView>,
    pub logs: Vec<String>,
    pub recency: RecencyView,
    pub advisory: AdvisoryView,
}

#[derive(Serialize)]
pub struct SensorView {
    #[serde(flatten)]
    pub reading: SensorReading,
    pub moisture_level: MoistureLevel,
    pub uptime_text: String,
}

#[derive(Serialize)]
pub struct SystemView {
    #[serde(flatten)]
    pub status: SystemStatus,
    pub color: StatusColor,
}

#[derive(Serialize)]
pub struct RecencyView {
    pub last_received: Option<DateTime<Utc>>,
    pub just_received: bool,
    pub ago: String,
}

#[derive(Serialize)]
pub struct AdvisoryView {
    pub state: &'static str,
    pub error: Option<String>,
    pub nodes: Vec<Node>,
    pub html: Option<String>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl DashboardState {
    pub fn new(log_capacity: usize, recency_window: Duration) -> Self {
        Self {
            connection: ConnectionState::Connecting,
            last_error: None,
            sensor: None,
            pump_on: false,
            system: None,
            recency: Recency::new(recency_window),
            advisory: AdvisoryState::Idle,
            logs: VecDeque::with_capacity(log_capacity),
            log_capacity,
        }
    }

    pub fn shared(log_capacity: usize, recency_window: Duration) -> SharedState {
        Arc::new(RwLock::new(Self::new(log_capacity, recency_window)))
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Replace the sensor snapshot and take the pump state from it.
    pub fn record_sensor(&mut self, reading: SensorReading) {
        self.pump_on = reading.pump;
        self.sensor = Some(reading);
    }

    pub fn record_pump(&mut self, on: bool) {
        self.pump_on = on;
    }

    pub fn record_system(&mut self, status: SystemStatus) {
        self.system = Some(status);
    }

    /// Append a receive-time-stamped line, evicting the oldest past capacity.
    pub fn record_log(&mut self, text: String) {
        if self.log_capacity == 0 {
            return;
        }
        while self.logs.len() >= self.log_capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            ts: Utc::now(),
            text,
        });
    }

    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }

    /// Oldest first.
    pub fn logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter()
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, now: Instant) -> StatusResponse {
        let last_received = self.recency.last_received();
        let ago_ms = last_received.map(|t| (Utc::now() - t).num_milliseconds());

        StatusResponse {
            connection: self.connection,
            connected: self.is_connected(),
            last_error: self.last_error.clone(),
            sensor: self.sensor.clone().map(|reading| SensorView {
                moisture_level: format::moisture_level(reading.soil),
                uptime_text: format::uptime(reading.uptime),
                reading,
            }),
            pump_on: self.pump_on,
            system: self.system.clone().map(|status| SystemView {
                color: status.color(),
                status,
            }),
            logs: self.logs.iter().map(LogEntry::line).collect(),
            recency: RecencyView {
                last_received,
                just_received: self.recency.just_received(now),
                ago: format::time_ago(ago_ms),
            },
            advisory: self.advisory_view(),
        }
    }

    fn advisory_view(&self) -> AdvisoryView {
        match &self.advisory {
            AdvisoryState::Idle => AdvisoryView {
                state: "idle",
                error: None,
                nodes: Vec::new(),
                html: None,
            },
            AdvisoryState::Pending => AdvisoryView {
                state: "pending",
                error: None,
                nodes: Vec::new(),
                html: None,
            },
            AdvisoryState::Fulfilled(text) => {
                let nodes = render::render(text);
                AdvisoryView {
                    state: "fulfilled",
                    error: None,
                    html: Some(render::to_html(&nodes)),
                    nodes,
                }
            }
            AdvisoryState::Failed(reason) => AdvisoryView {
                state: "failed",
                error: Some(reason.clone()),
                nodes: Vec::new(),
                html: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::SENSOR_JSON;

    fn state() -> DashboardState {
        DashboardState::new(DEFAULT_LOG_CAPACITY, Duration::from_millis(1500))
    }

    #[test]
    fn new_state_is_empty() {
        let st = state();
        assert_eq!(st.connection, ConnectionState::Connecting);
        assert!(!st.is_connected());
        assert!(st.sensor.is_none());
        assert!(!st.pump_on);
        assert_eq!(st.logs().count(), 0);
        assert_eq!(st.advisory, AdvisoryState::Idle);
    }

    #[test]
    fn log_ring_keeps_most_recent_fifty() {
        let mut st = state();
        for i in 0..120 {
            st.record_log(format!("line {i}"));
            assert!(st.logs().count() <= DEFAULT_LOG_CAPACITY);
        }
        let texts: Vec<&str> = st.logs().map(|e| e.text.as_str()).collect();
        assert_eq!(texts.len(), 50);
        assert_eq!(texts[0], "line 70");
        assert_eq!(texts[49], "line 119");
    }

    #[test]
    fn clear_logs_empties_ring() {
        let mut st = state();
        st.record_log("a".into());
        st.clear_logs();
        assert_eq!(st.logs().count(), 0);
    }

    #[test]
    fn log_line_is_time_prefixed() {
        let mut st = state();
        st.record_log("pump started".into());
        let line = st.logs().next().unwrap().line();
        assert!(line.ends_with(": pump started"), "got {line}");
        // HH:MM:SS prefix
        assert_eq!(line.as_bytes()[2], b':');
        assert_eq!(line.as_bytes()[5], b':');
    }

    #[test]
    fn sensor_record_sets_pump() {
        let mut st = state();
        let reading: SensorReading = serde_json::from_str(SENSOR_JSON).unwrap();
        st.record_sensor(reading);
        assert!(st.pump_on);
    }

    #[tokio::test]
    async fn status_snapshot_includes_views() {
        let mut st = state();
        st.record_sensor(serde_json::from_str(SENSOR_JSON).unwrap());
        st.advisory = AdvisoryState::Fulfilled("<p onclick='x()'>Water <b>now</b></p>".into());

        let v = serde_json::to_value(st.to_status(Instant::now())).unwrap();
        assert_eq!(v["connection"], "connecting");
        assert_eq!(v["connected"], false);
        assert_eq!(v["sensor"]["moisture_level"], "moderate");
        assert_eq!(v["sensor"]["uptime_text"], "24h 0m 0s");
        assert_eq!(v["sensor"]["airRaw"], 1320.0);
        assert_eq!(v["recency"]["ago"], "never");
        assert_eq!(v["advisory"]["state"], "fulfilled");
        assert_eq!(v["advisory"]["html"], "<p>Water <strong>now</strong></p>");
    }

    #[tokio::test]
    async fn failed_advisory_exposes_error() {
        let mut st = state();
        st.advisory = AdvisoryState::Failed("boom".into());
        let v = serde_json::to_value(st.to_status(Instant::now())).unwrap();
        assert_eq!(v["advisory"]["state"], "failed");
        assert_eq!(v["advisory"]["error"], "boom");
        assert!(v["advisory"]["html"].is_null());
    }
}
