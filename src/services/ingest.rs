//! Reading validator and ingestion surface.
//!
//! A payload is either a single channel reading or a full device frame. Frames
//! are accepted all-or-nothing and written in one statement, so a device that
//! resends after a `StoreUnavailable` never produces half a frame.

use crate::models::reading::{
    Channel, ChannelPayload, DeviceId, DeviceStatus, FramePayload, SensorPayload, SensorReading,
};
use crate::store::{StoreError, TimeSeriesStore};
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::sync::Arc;

/// How far ahead of the server clock a device timestamp may be.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug)]
pub enum IngestError {
    UnauthorizedDevice(String),
    MalformedPayload(String),
    StoreUnavailable(StoreError),
}

impl core::fmt::Display for IngestError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IngestError::UnauthorizedDevice(d) => write!(f, "device {} not authorized", d),
            IngestError::MalformedPayload(s) => write!(f, "malformed payload: {}", s),
            IngestError::StoreUnavailable(e) => write!(f, "reading not stored, resend later: {}", e),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::StoreUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(value: StoreError) -> Self {
        IngestError::StoreUnavailable(value)
    }
}

impl IngestError {
    /// Short machine-readable code for acknowledgements.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::UnauthorizedDevice(_) => "unauthorized_device",
            IngestError::MalformedPayload(_) => "malformed_payload",
            IngestError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestAck {
    pub device_id: DeviceId,
    pub accepted: usize,
    /// Rows that were new to the store; resent readings count as accepted but not stored.
    pub stored: usize,
    pub observed_at: DateTime<Utc>,
}

/// Parses a JSON body, reporting the offending field path on failure.
pub fn parse_payload(body: &str) -> Result<SensorPayload, IngestError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| IngestError::MalformedPayload(format!("invalid json: {}", e)))?;
    payload_from_value(value)
}

pub fn payload_from_value(value: serde_json::Value) -> Result<SensorPayload, IngestError> {
    let is_frame = value.get("sensors").is_some();
    let path_error = |e: serde_path_to_error::Error<serde_json::Error>| {
        IngestError::MalformedPayload(format!("{}: {}", e.path(), e.inner()))
    };
    if is_frame {
        let frame: FramePayload = serde_path_to_error::deserialize(value).map_err(path_error)?;
        Ok(SensorPayload::Frame(frame))
    } else {
        let single: ChannelPayload = serde_path_to_error::deserialize(value).map_err(path_error)?;
        Ok(SensorPayload::Single(single))
    }
}

pub struct Ingestor {
    allowed: HashSet<String>,
    store: Arc<dyn TimeSeriesStore>,
}

impl Ingestor {
    pub fn new(allowed_devices: &[String], store: Arc<dyn TimeSeriesStore>) -> Self {
        Ingestor {
            allowed: allowed_devices.iter().cloned().collect(),
            store,
        }
    }

    pub fn authorize(&self, device_id: &str) -> Result<DeviceId, IngestError> {
        if self.allowed.contains(device_id) {
            Ok(DeviceId(device_id.to_string()))
        } else {
            Err(IngestError::UnauthorizedDevice(device_id.to_string()))
        }
    }

    /// Checks authorization, schema and physical plausibility. Never touches the store.
    pub fn validate(
        &self,
        device_id: &str,
        payload: &SensorPayload,
        now: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, IngestError> {
        let device = self.authorize(device_id)?;

        match payload {
            SensorPayload::Single(p) => {
                let observed_at = parse_timestamp(p.observed_at, now, "observed_at")?;
                let reading = check_value(&device, p.channel, p.value, p.unit.as_deref(), p.status, observed_at)?;
                Ok(vec![reading])
            }
            SensorPayload::Frame(frame) => {
                if frame.sensors.is_empty() {
                    return Err(IngestError::MalformedPayload("sensors: frame carries no readings".into()));
                }
                let observed_at = parse_timestamp(frame.timestamp, now, "timestamp")?;
                frame
                    .sensors
                    .iter()
                    .map(|(channel, v)| check_value(&device, *channel, v.value, v.unit.as_deref(), v.status, observed_at))
                    .collect()
            }
        }
    }

    /// Validates and durably writes a payload. No retry: a failed write is returned for the device to resend.
    pub fn ingest(&self, device_id: &str, payload: &SensorPayload, now: DateTime<Utc>) -> Result<IngestAck, IngestError> {
        let readings = match self.validate(device_id, payload, now) {
            Ok(r) => r,
            Err(e) => {
                warn!("Rejected reading from {}: {}", device_id, e);
                return Err(e);
            }
        };
        let stored = self.store.write(&readings)?;
        debug!("Stored {}/{} reading(s) from {}", stored, readings.len(), device_id);
        Ok(IngestAck {
            device_id: DeviceId(device_id.to_string()),
            accepted: readings.len(),
            stored,
            observed_at: readings.first().map_or(now, |r| r.observed_at),
        })
    }
}

fn parse_timestamp(secs: i64, now: DateTime<Utc>, field: &str) -> Result<DateTime<Utc>, IngestError> {
    if secs <= 0 {
        return Err(IngestError::MalformedPayload(format!("{}: must be a positive unix timestamp", field)));
    }
    let ts = DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| IngestError::MalformedPayload(format!("{}: out of range", field)))?;
    if ts > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(IngestError::MalformedPayload(format!("{}: {} is in the future", field, ts)));
    }
    Ok(ts)
}

fn check_value(
    device: &DeviceId,
    channel: Channel,
    value: f64,
    unit: Option<&str>,
    status: Option<DeviceStatus>,
    observed_at: DateTime<Utc>,
) -> Result<SensorReading, IngestError> {
    if status == Some(DeviceStatus::Error) {
        return Err(IngestError::MalformedPayload(format!("{}: device reported a sensor fault", channel)));
    }
    // a missing unit means the canonical one
    let value = match unit {
        Some(u) => channel.to_canonical(value, u).ok_or_else(|| {
            IngestError::MalformedPayload(format!(
                "{}: unit {:?} cannot be converted to {:?}",
                channel,
                u,
                channel.canonical_unit()
            ))
        })?,
        None => value,
    };
    let (min, max) = channel.plausible_range();
    if !value.is_finite() || value < min || value > max {
        return Err(IngestError::MalformedPayload(format!(
            "{}: value {} outside plausible range [{}, {}]",
            channel, value, min, max
        )));
    }
    Ok(SensorReading {
        device_id: device.clone(),
        channel,
        value,
        unit: channel.canonical_unit().to_string(),
        observed_at,
    })
}

// =====================
// Line-oriented ingestion
// =====================

#[derive(Debug, Deserialize)]
struct Envelope {
    device_id: String,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum LineReply {
    Accepted(IngestAck),
    Rejected { code: &'static str, message: String },
}

fn handle_line(ingestor: &Ingestor, line: &str, now: DateTime<Utc>) -> LineReply {
    let result = serde_json::from_str::<Envelope>(line)
        .map_err(|e| IngestError::MalformedPayload(format!("invalid envelope: {}", e)))
        .and_then(|env| {
            // unknown devices are turned away before their payload is looked at
            ingestor.authorize(&env.device_id)?;
            let payload = payload_from_value(env.payload)?;
            ingestor.ingest(&env.device_id, &payload, now)
        });
    match result {
        Ok(ack) => LineReply::Accepted(ack),
        Err(e) => LineReply::Rejected {
            code: e.code(),
            message: e.to_string(),
        },
    }
}

/// Reads `{"device_id": .., "payload": {..}}` envelopes, one per line, and writes one
/// JSON reply per non-empty line. A line that is not UTF-8 is answered as malformed;
/// only an I/O error on either side ends the loop.
pub fn serve_lines<R: BufRead, W: Write>(ingestor: &Ingestor, mut reader: R, mut writer: W) -> std::io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let reply = match std::str::from_utf8(&buf) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(ingestor, line.trim(), Utc::now()),
            Err(e) => {
                let err = IngestError::MalformedPayload(format!("line is not valid UTF-8: {}", e));
                warn!("Rejected ingestion line: {}", err);
                LineReply::Rejected {
                    code: err.code(),
                    message: err.to_string(),
                }
            }
        };
        let encoded = serde_json::to_string(&reply).map_err(std::io::Error::other)?;
        writeln!(writer, "{}", encoded)?;
        writer.flush()?;
    }
}
