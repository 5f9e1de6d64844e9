//! Read surface for the dashboard: status, sensors, latest message, history and
//! the manual trigger.
//!
//! Reads never wait on a running generation cycle. When providers are down the
//! dashboard simply keeps showing the last published message.

use crate::models::message::{GenerationOutcome, LatestState, SchedulePhase};
use crate::models::reading::{Channel, DeviceId};
use crate::services::aggregate::{Aggregator, History};
use crate::services::assess::{self, Assessment, GrowthStage, Severity};
use crate::services::cache::LatestStateCache;
use crate::services::schedule::{Scheduler, TriggerError};
use crate::store::StoreError;
use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub phase: SchedulePhase,
    pub is_sleeping: bool,
    /// Local `HH:MM` of the next trigger point.
    pub next_update: String,
    pub device_id: DeviceId,
    pub device_connected: bool,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub has_message: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_outcome: Option<GenerationOutcome>,
    pub in_flight: bool,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorView {
    pub value: f64,
    pub unit: String,
    pub observed_at: DateTime<Utc>,
    pub assessment: Assessment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentSensors {
    pub device_id: DeviceId,
    /// Stage the assessments were graded against.
    pub growth_stage: GrowthStage,
    pub sensors: BTreeMap<Channel, SensorView>,
    pub overall: Severity,
    pub computed_at: DateTime<Utc>,
}

pub struct Dashboard {
    aggregator: Arc<Aggregator>,
    cache: Arc<LatestStateCache>,
    scheduler: Arc<Scheduler>,
    stale_after: Duration,
    stage: GrowthStage,
}

impl Dashboard {
    pub fn new(
        aggregator: Arc<Aggregator>,
        cache: Arc<LatestStateCache>,
        scheduler: Arc<Scheduler>,
        stale_after: Duration,
        stage: GrowthStage,
    ) -> Self {
        Dashboard {
            aggregator,
            cache,
            scheduler,
            stale_after,
            stage,
        }
    }

    /// Always answers; an unreachable store reads as a disconnected device.
    pub fn status(&self, now: DateTime<Utc>) -> StatusReport {
        let schedule = self.scheduler.config();
        let phase = schedule.phase(now).phase;
        let last_reading_at = self.aggregator.last_seen().unwrap_or_else(|e| {
            warn!("Status without device freshness: {}", e);
            None
        });
        let latest = self.cache.read();
        StatusReport {
            phase,
            is_sleeping: schedule.is_sleeping(now),
            next_update: schedule.next_update(now),
            device_id: self.aggregator.device().clone(),
            device_connected: last_reading_at.is_some_and(|at| now - at <= self.stale_after),
            last_reading_at,
            has_message: latest.is_some(),
            last_message_time: latest.as_ref().map(|s| s.event.generated_at),
            last_outcome: latest.as_ref().map(|s| s.event.outcome),
            in_flight: self.scheduler.in_flight(),
            server_time: now,
        }
    }

    pub fn current_sensors(&self, now: DateTime<Utc>) -> Result<CurrentSensors, StoreError> {
        let snapshot = self.aggregator.snapshot(now)?;
        let assessments = assess::assess_snapshot(self.stage, &snapshot);
        let overall = assess::overall_severity(assessments.values());
        let sensors = snapshot
            .channels
            .into_iter()
            .filter_map(|(channel, summary)| {
                let assessment = *assessments.get(&channel)?;
                Some((
                    channel,
                    SensorView {
                        value: summary.latest,
                        unit: summary.unit,
                        observed_at: summary.latest_at,
                        assessment,
                    },
                ))
            })
            .collect();
        Ok(CurrentSensors {
            device_id: snapshot.device_id,
            growth_stage: self.stage,
            sensors,
            overall,
            computed_at: snapshot.computed_at,
        })
    }

    pub fn latest_message(&self) -> Option<Arc<LatestState>> {
        self.cache.read()
    }

    pub fn history(&self, hours: i64, now: DateTime<Utc>) -> Result<History, StoreError> {
        self.aggregator.history(hours, now)
    }

    /// Runs a manual cycle in the given tone and waits for it.
    pub fn trigger_now(&self, now: DateTime<Utc>, tone: SchedulePhase) -> Result<Arc<LatestState>, TriggerError> {
        let report = self.scheduler.trigger_now(now, tone)?.join();
        report.event.ok_or_else(|| {
            TriggerError::NothingPublished(report.reason.unwrap_or_else(|| "no reason given".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Trigger;
    use crate::services::schedule::{ScheduleConfig, TickOutcome};
    use crate::services::testing::{self, FakeModel, FakeVoice};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn dashboard(store: Arc<MemoryStore>, model: Arc<FakeModel>) -> (Dashboard, Arc<Scheduler>, testing::Rig) {
        let rig = testing::rig(store, model, FakeVoice::failing());
        let scheduler = Arc::new(Scheduler::new(ScheduleConfig::default(), rig.pipeline.clone()));
        let dash = Dashboard::new(
            rig.aggregator.clone(),
            rig.cache.clone(),
            scheduler.clone(),
            Duration::minutes(15),
            GrowthStage::Vegetative,
        );
        (dash, scheduler, rig)
    }

    #[test]
    fn status_before_any_message() {
        let now = testing::now();
        let (dash, _, rig) = dashboard(testing::store_with_readings(now), FakeModel::replying("hi"));
        let status = dash.status(now);
        assert_eq!(status.phase, SchedulePhase::Report);
        assert!(!status.is_sleeping);
        assert_eq!(status.next_update, "12:00");
        assert!(status.device_connected);
        assert!(!status.has_message);
        assert_eq!(status.last_message_time, None);
        assert!(!status.in_flight);
        rig.cleanup();
    }

    #[test]
    fn status_survives_offline_store() {
        let now = testing::now();
        let store = testing::store_with_readings(now);
        let (dash, _, rig) = dashboard(store.clone(), FakeModel::replying("hi"));
        store.set_available(false);
        let status = dash.status(now);
        assert!(!status.device_connected);
        assert_eq!(status.last_reading_at, None);
        assert!(dash.current_sensors(now).is_err());
        rig.cleanup();
    }

    #[test]
    fn stale_device_reads_as_disconnected() {
        let now = testing::now();
        let (dash, _, rig) = dashboard(
            testing::store_with_readings(now - Duration::hours(1)),
            FakeModel::replying("hi"),
        );
        assert!(!dash.status(now).device_connected);
        rig.cleanup();
    }

    #[test]
    fn current_sensors_carry_assessments() {
        let now = testing::now();
        let store = testing::store_with_readings(now);
        testing::write(&store, Channel::Humidity, 95.0, now - Duration::minutes(1));
        let (dash, _, rig) = dashboard(store, FakeModel::replying("hi"));
        let view = dash.current_sensors(now).unwrap();
        assert_eq!(view.sensors.len(), 4);
        assert_eq!(view.growth_stage, GrowthStage::Vegetative);
        assert_eq!(view.sensors[&Channel::Humidity].assessment.severity, Severity::Critical);
        assert_eq!(view.overall, Severity::Critical);
        rig.cleanup();
    }

    #[test]
    fn manual_trigger_publishes_degraded_text_when_voice_is_down() {
        let now = testing::now();
        let (dash, _, rig) = dashboard(testing::store_with_readings(now), FakeModel::replying("I am thirsty."));
        let state = dash.trigger_now(now, SchedulePhase::Wake).unwrap();
        assert_eq!(state.event.trigger, Trigger::Manual);
        assert_eq!(state.event.tone, SchedulePhase::Wake);
        assert_eq!(state.event.outcome, GenerationOutcome::Degraded);
        assert_eq!(state.event.audio, None);
        assert_eq!(dash.latest_message().unwrap().event.text, "I am thirsty.");

        let status = dash.status(now);
        assert!(status.has_message);
        assert_eq!(status.last_outcome, Some(GenerationOutcome::Degraded));
        rig.cleanup();
    }

    #[test]
    fn manual_trigger_without_readings_reports_nothing_published() {
        let (dash, _, rig) = dashboard(Arc::new(MemoryStore::new()), FakeModel::replying("hi"));
        assert!(matches!(
            dash.trigger_now(testing::now(), SchedulePhase::Report),
            Err(TriggerError::NothingPublished(_))
        ));
        assert!(dash.latest_message().is_none());
        rig.cleanup();
    }

    #[test]
    fn reads_stay_available_while_a_cycle_runs() {
        let now = testing::now();
        let (model, release) = FakeModel::gated("Report time.");
        let (dash, scheduler, rig) = dashboard(testing::store_with_readings(now), model);
        let TickOutcome::Started(_, handle) = scheduler.tick(now) else {
            panic!("10:00 local should open a report window");
        };
        let status = dash.status(now);
        assert!(status.in_flight);
        assert!(!status.has_message);
        assert!(matches!(dash.trigger_now(now, SchedulePhase::Report), Err(TriggerError::Busy)));
        release.send(()).unwrap();
        assert!(handle.join().published());
        assert!(dash.status(now).has_message);
        rig.cleanup();
    }

    #[test]
    fn history_is_clamped_to_known_ranges() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 3, 30, 0).unwrap();
        let (dash, _, rig) = dashboard(testing::store_with_readings(now), FakeModel::replying("hi"));
        let history = dash.history(48, now).unwrap();
        assert_eq!(history.hours, 24);
        assert_eq!(history.series[&Channel::Ph].len(), 1);
        rig.cleanup();
    }
}
