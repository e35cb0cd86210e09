use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire payloads (device → dashboard)
// ---------------------------------------------------------------------------

/// One telemetry sample from the `sensors` topic.  Replaced wholesale on every
/// message; nothing is merged with the previous sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub device: String,
    /// Device epoch seconds.
    pub time: i64,
    /// Soil moisture (%).
    pub soil: f64,
    /// Air temperature (°C).
    pub temp: f64,
    /// Relative humidity (%).
    pub hum: f64,
    pub air: f64,
    pub air_raw: f64,
    pub air_good: bool,
    pub ppm: f64,
    pub pump: bool,
    /// Lifetime pump activations.
    pub count: u64,
    /// Cumulative watering time (seconds).
    pub wtime: u64,
    /// Device uptime (seconds).
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tds_raw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npk: Option<NutrientReading>,
}

/// Soil probe block nested inside [`SensorReading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NutrientReading {
    /// Nitrogen (mg/kg).
    pub n: f64,
    /// Phosphorus (mg/kg).
    pub p: f64,
    /// Potassium (mg/kg).
    pub k: f64,
    pub ph: f64,
    /// Electrical conductivity (mS/cm).
    pub ec: f64,
    pub soil_temp: f64,
    #[serde(default)]
    pub soil_moisture: f64,
}

/// Retained device heartbeat from the `system/status` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub device: String,
    pub status: String,
    /// Epoch seconds.
    pub last_seen: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    Online,
    Offline,
    Other,
}

impl SystemStatus {
    /// Map the free-form status label to a display bucket (case-insensitive).
    pub fn color(&self) -> StatusColor {
        let s = self.status.trim();
        if s.eq_ignore_ascii_case("online") {
            StatusColor::Online
        } else if s.eq_ignore_ascii_case("offline") {
            StatusColor::Offline
        } else {
            StatusColor::Other
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const SENSOR_JSON: &str = r#"{
        "device":"agrohygra-01","time":1760000000,"soil":42.5,"temp":24.1,
        "hum":61.0,"air":87.0,"airRaw":1320,"airGood":true,"ppm":412.0,
        "pump":true,"count":7,"wtime":315,"uptime":86400,
        "npk":{"n":38,"p":12,"k":140,"ph":6.4,"ec":0.812,"soilTemp":19.5,"soilMoisture":40.2}
    }"#;

    pub const STATUS_JSON: &str =
        r#"{"device":"agrohygra-01","status":"online","lastSeen":1760000000}"#;
}
