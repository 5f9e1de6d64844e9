//! Diesel row structs for the time-series tables.
//!
//! Both `sensor_readings` and `message_events` are TimescaleDB hypertables,
//! created by the embedded migrations.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;

use crate::db::schema;
use crate::models::message::{LatestState, Trigger};
use crate::models::reading::SensorReading;

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::sensor_readings)]
pub struct NewSensorReading {
    pub device_id: String,
    pub channel: String,
    pub value: f64,
    pub unit: String,
    pub observed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl NewSensorReading {
    pub fn from_reading(reading: &SensorReading, received_at: DateTime<Utc>) -> Self {
        NewSensorReading {
            device_id: reading.device_id.0.clone(),
            channel: reading.channel.as_str().to_string(),
            value: reading.value,
            unit: reading.unit.clone(),
            observed_at: reading.observed_at,
            received_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::message_events)]
pub struct NewMessageEvent {
    pub generated_at: DateTime<Utc>,
    pub event_id: String,
    pub trigger: String,
    pub phase_date: Option<NaiveDate>,
    pub slot: Option<i32>,
    pub tone: String,
    pub text: String,
    pub text_source: String,
    pub audio_ref: Option<String>,
    pub outcome: String,
    pub snapshot: serde_json::Value,
}

impl NewMessageEvent {
    pub fn from_state(state: &LatestState) -> Result<Self, serde_json::Error> {
        let event = &state.event;
        let (phase_date, slot) = match event.trigger {
            Trigger::Scheduled(key) => (Some(key.date), Some(key.slot as i32)),
            Trigger::Manual => (None, None),
        };
        Ok(NewMessageEvent {
            generated_at: event.generated_at,
            event_id: event.id.clone(),
            trigger: event.trigger.marker().to_string(),
            phase_date,
            slot,
            tone: event.tone.as_str().to_string(),
            text: event.text.clone(),
            text_source: event.text_source.as_str().to_string(),
            audio_ref: event.audio.as_ref().map(|a| a.0.clone()),
            outcome: event.outcome.as_str().to_string(),
            snapshot: serde_json::to_value(&state.snapshot)?,
        })
    }
}

/// Columns needed to rebuild the scheduler's dedup ledger after a restart.
#[derive(Debug, Clone, Queryable)]
pub struct RecordedPhase {
    pub trigger: String,
    pub phase_date: Option<NaiveDate>,
    pub slot: Option<i32>,
}
