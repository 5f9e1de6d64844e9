//! Sensor channel and reading types shared by ingestion, storage and aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =====================
// Identifiers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =====================
// Channels
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Temperature,
    Humidity,
    Light,
    SoilMoisture,
    Tds,
    Ph,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Temperature,
        Channel::Humidity,
        Channel::Light,
        Channel::SoilMoisture,
        Channel::Tds,
        Channel::Ph,
    ];

    /// Storage and wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Temperature => "temperature",
            Channel::Humidity => "humidity",
            Channel::Light => "light",
            Channel::SoilMoisture => "soil_moisture",
            Channel::Tds => "tds",
            Channel::Ph => "ph",
        }
    }

    /// Human-facing name used in prompts and fallback messages.
    pub fn label(self) -> &'static str {
        match self {
            Channel::Temperature => "temperature",
            Channel::Humidity => "humidity",
            Channel::Light => "light",
            Channel::SoilMoisture => "soil moisture",
            Channel::Tds => "nutrient level (TDS)",
            Channel::Ph => "pH",
        }
    }

    pub fn canonical_unit(self) -> &'static str {
        match self {
            Channel::Temperature => "°C",
            Channel::Humidity => "%",
            Channel::Light => "lux",
            Channel::SoilMoisture => "%",
            Channel::Tds => "ppm",
            Channel::Ph => "",
        }
    }

    /// Converts a value reported in `unit` to the canonical unit. `None` when the
    /// channel cannot be measured in that unit.
    pub fn to_canonical(self, value: f64, unit: &str) -> Option<f64> {
        let unit = unit.trim().to_lowercase();
        match (self, unit.as_str()) {
            (Channel::Temperature, "°c" | "c" | "degc" | "celsius") => Some(value),
            (Channel::Temperature, "°f" | "f" | "degf" | "fahrenheit") => Some((value - 32.0) * 5.0 / 9.0),
            (Channel::Temperature, "k" | "kelvin") => Some(value - 273.15),
            (Channel::Humidity | Channel::SoilMoisture, "%" | "percent") => Some(value),
            (Channel::Light, "lux" | "lx") => Some(value),
            (Channel::Tds, "ppm" | "mg/l") => Some(value),
            (Channel::Ph, "" | "ph") => Some(value),
            _ => None,
        }
    }

    /// Inclusive range a working sensor can physically report. Anything outside
    /// is treated as a broken or forged reading.
    pub fn plausible_range(self) -> (f64, f64) {
        match self {
            Channel::Temperature => (-40.0, 85.0),
            Channel::Humidity => (0.0, 100.0),
            Channel::Light => (0.0, 200_000.0),
            Channel::SoilMoisture => (0.0, 100.0),
            Channel::Tds => (0.0, 5_000.0),
            Channel::Ph => (0.0, 14.0),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =====================
// Readings
// =====================

/// One accepted measurement. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: DeviceId,
    pub channel: Channel,
    pub value: f64,
    pub unit: String,
    pub observed_at: DateTime<Utc>,
}

/// Status a device may attach to a reading. `Error` marks a sensor fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Low,
    Normal,
    High,
    Error,
}

/// A single-channel payload: `{"channel": "ph", "value": 6.4, "observed_at": 1738000000}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelPayload {
    pub channel: Channel,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    /// Unix seconds.
    pub observed_at: i64,
    #[serde(default)]
    pub status: Option<DeviceStatus>,
}

/// A full device frame carrying several channels sampled at the same instant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FramePayload {
    /// Unix seconds.
    pub timestamp: i64,
    pub sensors: std::collections::BTreeMap<Channel, FrameValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameValue {
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub status: Option<DeviceStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorPayload {
    Single(ChannelPayload),
    Frame(FramePayload),
}
