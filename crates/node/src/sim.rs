//! Stateful AgroHygra station simulator for local development.
//!
//! Models the station's sensors closely enough to exercise the dashboard:
//! - Soil moisture as a random walk with mean reversion and drying drift
//! - Closed-loop watering response while the pump runs
//! - Diurnal air temperature with humidity moving against it
//! - Air-quality ADC, TDS and a slowly wandering NPK/pH/EC probe
//! - Pump activation counter, cumulative watering time and uptime

use serde::Serialize;
use std::fmt;

/// Soil moisture at which a running pump is switched off by the station.
pub const SATURATION_CUTOFF: f64 = 90.0;

/// Air ADC values below this count as good air.
const AIR_GOOD_BELOW: f64 = 1500.0;

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 approximates N(0,1).
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// Noisy sensors; stresses the dashboard's display of jumpy values.
    Flaky,
    /// Starts near saturation and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub device: String,
    pub time: i64,
    pub soil: f64,
    pub temp: f64,
    pub hum: f64,
    pub air: f64,
    pub air_raw: f64,
    pub air_good: bool,
    pub ppm: f64,
    pub pump: bool,
    pub count: u64,
    pub wtime: u64,
    pub uptime: u64,
    pub tds_raw: f64,
    pub tds: f64,
    pub npk: Npk,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Npk {
    pub n: f64,
    pub p: f64,
    pub k: f64,
    pub ph: f64,
    pub ec: f64,
    pub soil_temp: f64,
    pub soil_moisture: f64,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct StationSim {
    // Soil moisture random walk (percent)
    soil: f64,
    center: f64,
    drift_per_s: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    wet_rate_per_s: f64,

    // Air
    air_raw: f64,
    tds_raw: f64,
    n: f64,
    p: f64,
    k: f64,
    ph: f64,
    ec: f64,

    // Diurnal cycle
    diurnal_period_s: f64,

    // Pump and counters
    pump: bool,
    count: u64,
    wtime_s: f64,
    uptime_s: f64,
}

/// Result of one simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Normal,
    /// The station stopped the pump because the soil is saturated.
    AutoOff,
}

impl StationSim {
    /// `diurnal_period_s` sets the day/night cycle length: 600 for fast
    /// iteration, 86400 for real time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (start, drift, walk_sigma, mean_rev, noise_sigma) = match scenario {
            Scenario::Drying => (55.0, -0.05, 0.4, 0.002, 0.5),
            Scenario::Stable => (50.0, -0.005, 0.15, 0.01, 0.2),
            Scenario::Flaky => (50.0, -0.03, 0.8, 0.002, 3.0),
            Scenario::Wet => (82.0, -0.01, 0.2, 0.001, 0.4),
        };

        Self {
            soil: start + gaussian(0.0, 2.0),
            center: 50.0,
            drift_per_s: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            noise_sigma,
            wet_rate_per_s: 1.5,
            air_raw: 1200.0 + gaussian(0.0, 100.0),
            tds_raw: 900.0 + gaussian(0.0, 50.0),
            n: 40.0,
            p: 15.0,
            k: 120.0,
            ph: 6.5,
            ec: 0.8,
            diurnal_period_s,
            pump: false,
            count: 0,
            wtime_s: 0.0,
            uptime_s: 0.0,
        }
    }

    pub fn pump(&self) -> bool {
        self.pump
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Switch the pump.  Returns `true` when the state actually changed;
    /// each off→on transition counts as one activation.
    pub fn set_pump(&mut self, on: bool) -> bool {
        if self.pump == on {
            return false;
        }
        self.pump = on;
        if on {
            self.count += 1;
        }
        true
    }

    /// Advance the model by `dt_s` seconds.
    pub fn step(&mut self, dt_s: f64) -> Tick {
        self.uptime_s += dt_s;

        let pull = self.mean_reversion * (self.center - self.soil) * dt_s;
        let walk = gaussian(0.0, self.walk_sigma * dt_s.sqrt());
        let drift = self.drift_per_s * dt_s;
        let wet = if self.pump {
            self.wtime_s += dt_s;
            self.wet_rate_per_s * dt_s
        } else {
            0.0
        };
        self.soil = (self.soil + pull + walk + drift + wet).clamp(0.0, 100.0);

        self.air_raw = (self.air_raw + gaussian(0.0, 15.0)).clamp(300.0, 4095.0);
        self.tds_raw = (self.tds_raw + gaussian(0.0, 5.0)).clamp(0.0, 4095.0);
        self.n = (self.n + gaussian(0.0, 0.2)).clamp(0.0, 200.0);
        self.p = (self.p + gaussian(0.0, 0.1)).clamp(0.0, 200.0);
        self.k = (self.k + gaussian(0.0, 0.5)).clamp(0.0, 400.0);
        self.ph = (self.ph + gaussian(0.0, 0.01)).clamp(3.5, 9.5);
        self.ec = (self.ec + gaussian(0.0, 0.005)).clamp(0.0, 5.0);

        if self.pump && self.soil >= SATURATION_CUTOFF {
            self.pump = false;
            return Tick::AutoOff;
        }
        Tick::Normal
    }

    /// Snapshot the current state as a wire payload.
    pub fn telemetry(&self, device: &str, time: i64) -> Telemetry {
        let phase = 2.0 * std::f64::consts::PI * (time as f64) / self.diurnal_period_s;
        let temp = 24.0 + 6.0 * phase.sin() + gaussian(0.0, 0.2);
        let hum = (60.0 - 12.0 * phase.sin() + gaussian(0.0, 0.8)).clamp(0.0, 100.0);
        let soil = (self.soil + gaussian(0.0, self.noise_sigma)).clamp(0.0, 100.0);

        Telemetry {
            device: device.to_string(),
            time,
            soil: round1(soil),
            temp: round1(temp),
            hum: round1(hum),
            air: round1(100.0 - self.air_raw / 4095.0 * 100.0),
            air_raw: self.air_raw.round(),
            air_good: self.air_raw < AIR_GOOD_BELOW,
            ppm: (self.air_raw * 0.3).round(),
            pump: self.pump,
            count: self.count,
            wtime: self.wtime_s as u64,
            uptime: self.uptime_s as u64,
            tds_raw: self.tds_raw.round(),
            tds: (self.tds_raw * 0.5).round(),
            npk: Npk {
                n: self.n.round(),
                p: self.p.round(),
                k: self.k.round(),
                ph: round1(self.ph),
                ec: (self.ec * 1000.0).round() / 1000.0,
                soil_temp: round1(temp - 3.0),
                soil_moisture: round1(soil),
            },
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
