// ---------------------------------------------------------------------------
// Topic table
// ---------------------------------------------------------------------------

/// Which logical stream an inbound topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Sensors,
    PumpStatus,
    SystemStatus,
    Logs,
}

/// Concrete topic names derived from a single prefix (e.g. "agrohygra").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub sensors: String,
    pub pump_status: String,
    pub system_status: String,
    pub logs: String,
    pub pump_command: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            sensors: format!("{prefix}/sensors"),
            pump_status: format!("{prefix}/pump/status"),
            system_status: format!("{prefix}/system/status"),
            logs: format!("{prefix}/logs"),
            pump_command: format!("{prefix}/pump/command"),
        }
    }

    /// The fixed set re-subscribed on every (re)connect.
    pub fn subscriptions(&self) -> [&str; 4] {
        [
            self.sensors.as_str(),
            self.pump_status.as_str(),
            self.system_status.as_str(),
            self.logs.as_str(),
        ]
    }

    /// Exact-match classification; wildcards are never subscribed.
    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.sensors {
            Some(TopicKind::Sensors)
        } else if topic == self.pump_status {
            Some(TopicKind::PumpStatus)
        } else if topic == self.system_status {
            Some(TopicKind::SystemStatus)
        } else if topic == self.logs {
            Some(TopicKind::Logs)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Parse a `pump/status` payload.  Exactly "ON" in any case means on; any
/// other text, padded variants included, means off.  Only non-UTF-8 bytes fail.
pub fn parse_pump_status(payload: &[u8]) -> Result<bool, String> {
    let s = std::str::from_utf8(payload).map_err(|e| format!("pump status is not utf-8: {e}"))?;
    Ok(s.eq_ignore_ascii_case("ON"))
}

/// Encode a pump command for the command topic.
pub fn encode_pump_command(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ===========================================================================
// Tests
// ===========================================================================
