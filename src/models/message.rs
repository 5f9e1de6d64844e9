//! Schedule, snapshot and message types that flow from the scheduler to the dashboard.

use crate::models::reading::{Channel, DeviceId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =====================
// Schedule phases
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulePhase {
    Wake,
    Report,
    Goodnight,
    Sleep,
}

impl SchedulePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulePhase::Wake => "wake",
            SchedulePhase::Report => "report",
            SchedulePhase::Goodnight => "goodnight",
            SchedulePhase::Sleep => "sleep",
        }
    }

    pub fn parse(name: &str) -> Option<SchedulePhase> {
        match name {
            "wake" => Some(SchedulePhase::Wake),
            "report" => Some(SchedulePhase::Report),
            "goodnight" => Some(SchedulePhase::Goodnight),
            "sleep" => Some(SchedulePhase::Sleep),
            _ => None,
        }
    }
}

impl fmt::Display for SchedulePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one concrete occurrence of a trigger window, e.g. today's 10:00 report.
/// `slot` is 0 for the single wake and goodnight windows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseKey {
    pub date: NaiveDate,
    pub phase: SchedulePhase,
    pub slot: u32,
}

impl fmt::Display for PhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.date, self.phase, self.slot)
    }
}

/// What started a generation cycle. Manual cycles never touch the natural schedule's keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Scheduled(PhaseKey),
    Manual,
}

impl Trigger {
    pub fn phase_key(&self) -> Option<PhaseKey> {
        match self {
            Trigger::Scheduled(key) => Some(*key),
            Trigger::Manual => None,
        }
    }

    /// Marker stored with recorded events.
    pub fn marker(&self) -> &'static str {
        match self {
            Trigger::Scheduled(key) => key.phase.as_str(),
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled(key) => write!(f, "scheduled {}", key),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

// =====================
// Snapshots
// =====================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

impl WindowStats {
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Option<WindowStats> {
        let mut samples = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            samples += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (samples > 0).then(|| WindowStats {
            mean: sum / samples as f64,
            min,
            max,
            samples,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub latest: f64,
    pub latest_at: DateTime<Utc>,
    pub unit: String,
    /// Statistics over the short aggregation window; absent when the window holds no samples.
    pub window: Option<WindowStats>,
}

/// Aggregated view of one device used as input for one generation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSnapshot {
    pub device_id: DeviceId,
    pub channels: BTreeMap<Channel, ChannelSummary>,
    pub computed_at: DateTime<Utc>,
}

impl AggregatedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

// =====================
// Message events
// =====================

/// Tri-state result of a generation cycle. `Failed` cycles never produce a `MessageEvent`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationOutcome {
    Success,
    Degraded,
    Failed,
}

impl GenerationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationOutcome::Success => "success",
            GenerationOutcome::Degraded => "degraded",
            GenerationOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    Model,
    Fallback,
}

impl TextSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TextSource::Model => "model",
            TextSource::Fallback => "fallback",
        }
    }
}

/// File name of a synthesized clip inside the audio directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioRef(pub String);

/// Result of one completed generation cycle. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: String,
    pub trigger: Trigger,
    /// Phase whose tone the text was written in.
    pub tone: SchedulePhase,
    pub snapshot_at: DateTime<Utc>,
    pub text: String,
    pub text_source: TextSource,
    pub audio: Option<AudioRef>,
    pub generated_at: DateTime<Utc>,
    pub outcome: GenerationOutcome,
}

/// The single slot the dashboard reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestState {
    pub event: MessageEvent,
    pub snapshot: AggregatedSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_stats_over_values() {
        let stats = WindowStats::from_values([20.0, 22.0, 27.0]).unwrap();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.min, 20.0);
        assert_eq!(stats.max, 27.0);
        assert!((stats.mean - 23.0).abs() < 1e-9);
        assert!(WindowStats::from_values([]).is_none());
    }

    #[test]
    fn manual_trigger_has_no_phase_key() {
        assert_eq!(Trigger::Manual.phase_key(), None);
        assert_eq!(Trigger::Manual.marker(), "manual");
        let key = PhaseKey {
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            phase: SchedulePhase::Report,
            slot: 2,
        };
        assert_eq!(Trigger::Scheduled(key).phase_key(), Some(key));
        assert_eq!(Trigger::Scheduled(key).marker(), "report");
    }

    #[test]
    fn trigger_serializes_with_kind_tag() {
        let json = serde_json::to_value(Trigger::Manual).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "manual"}));
    }
}
