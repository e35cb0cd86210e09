//! Topic router: folds one inbound (topic, payload) pair into the dashboard
//! state.  Never fails; parse problems become log entries and leave the
//! affected slice untouched.

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::model::{SensorReading, SystemStatus};
use crate::state::DashboardState;
use crate::topics::{parse_pump_status, TopicKind, Topics};

pub fn route(state: &mut DashboardState, topics: &Topics, topic: &str, payload: &[u8], now: Instant) {
    // Recency reflects any traffic, parsed or not.
    state.recency.mark(Utc::now(), now);

    match topics.classify(topic) {
        Some(TopicKind::Sensors) => match serde_json::from_slice::<SensorReading>(payload) {
            Ok(reading) => {
                debug!(device = %reading.device, soil = reading.soil, pump = reading.pump, "sensor reading");
                state.record_sensor(reading);
            }
            Err(e) => {
                warn!(topic, "bad sensor json: {e}");
                state.record_log(format!("bad sensor json: {e}"));
            }
        },
        Some(TopicKind::PumpStatus) => match parse_pump_status(payload) {
            Ok(on) => {
                debug!(on, "pump status");
                state.record_pump(on);
            }
            Err(msg) => warn!(topic, "{msg}"),
        },
        Some(TopicKind::SystemStatus) => match serde_json::from_slice::<SystemStatus>(payload) {
            Ok(status) => {
                debug!(device = %status.device, status = %status.status, "system status");
                state.record_system(status);
            }
            Err(e) => {
                warn!(topic, "bad system status json: {e}");
                state.record_log(format!("bad system status json: {e}"));
            }
        },
        Some(TopicKind::Logs) => {
            state.record_log(String::from_utf8_lossy(payload).into_owned());
        }
        None => {
            debug!(topic, "unhandled topic");
            state.record_log(format!("unknown topic {topic}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
