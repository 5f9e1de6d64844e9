//! One generation cycle: snapshot, interpret, speak, publish.

use crate::models::message::{GenerationOutcome, LatestState, MessageEvent, SchedulePhase, TextSource, Trigger};
use crate::services::aggregate::Aggregator;
use crate::services::cache::LatestStateCache;
use crate::services::interpret::Interpreter;
use crate::services::speech::{Narrator, SpeechOutcome};
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub trigger: Trigger,
    pub outcome: GenerationOutcome,
    /// Present unless the cycle failed.
    pub event: Option<Arc<LatestState>>,
    /// Why the cycle failed or degraded.
    pub reason: Option<String>,
}

impl CycleReport {
    fn failed(trigger: Trigger, reason: String) -> Self {
        CycleReport {
            trigger,
            outcome: GenerationOutcome::Failed,
            event: None,
            reason: Some(reason),
        }
    }

    pub fn published(&self) -> bool {
        self.event.is_some()
    }
}

pub struct Pipeline {
    aggregator: Arc<Aggregator>,
    interpreter: Interpreter,
    narrator: Narrator,
    cache: Arc<LatestStateCache>,
    store: Arc<dyn TimeSeriesStore>,
    /// Overall budget for one cycle; speech is skipped once it is spent.
    deadline: Duration,
}

impl Pipeline {
    pub fn new(
        aggregator: Arc<Aggregator>,
        interpreter: Interpreter,
        narrator: Narrator,
        cache: Arc<LatestStateCache>,
        store: Arc<dyn TimeSeriesStore>,
        deadline: Duration,
    ) -> Self {
        Pipeline {
            aggregator,
            interpreter,
            narrator,
            cache,
            store,
            deadline,
        }
    }

    /// Runs the whole cycle on the calling thread. Never panics on provider or
    /// store failures; the report says what happened.
    pub fn run(&self, trigger: Trigger, tone: SchedulePhase, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let deadline = started + self.deadline;
        info!("Generation cycle started ({}, tone {})", trigger, tone);

        let snapshot = match self.aggregator.snapshot(now) {
            Ok(s) if s.is_empty() => {
                warn!("No readings for {}; skipping cycle", self.aggregator.device());
                return CycleReport::failed(trigger, "no readings to report".to_string());
            }
            Ok(s) => s,
            Err(e) => {
                warn!("No snapshot available: {}", e);
                return CycleReport::failed(trigger, format!("no snapshot: {}", e));
            }
        };

        let interpretation = match self.interpreter.generate(&snapshot, tone, deadline) {
            Ok(i) => i,
            Err(e) => return CycleReport::failed(trigger, e.to_string()),
        };

        let speech = self.narrator.synthesize(&interpretation.text, deadline);
        let mut reasons = Vec::new();
        if interpretation.source == TextSource::Fallback {
            reasons.push("language model unavailable, used template".to_string());
        }
        match &speech {
            SpeechOutcome::Stored(_) => {}
            SpeechOutcome::Skipped(r) => reasons.push(format!("speech skipped: {}", r)),
            SpeechOutcome::Failed(r) => reasons.push(format!("speech failed: {}", r)),
        }
        let audio = match speech.audio() {
            Some(clip) if self.narrator.audio_store().path_of(&clip).is_none() => {
                reasons.push(format!("audio clip {} is missing from the audio directory", clip.0));
                None
            }
            other => other,
        };
        let outcome = if interpretation.source == TextSource::Model && audio.is_some() {
            GenerationOutcome::Success
        } else {
            GenerationOutcome::Degraded
        };

        let generated_at = Utc::now();
        let event = MessageEvent {
            id: format!("{}-{:08x}", generated_at.format("%Y%m%dT%H%M%S"), rand::random::<u32>()),
            trigger,
            tone,
            snapshot_at: snapshot.computed_at,
            text: interpretation.text,
            text_source: interpretation.source,
            audio,
            generated_at,
            outcome,
        };
        let state = self.cache.publish(LatestState { event, snapshot });
        if let Err(e) = self.store.record_message(&state) {
            warn!("Published message {} but could not record it: {}", state.event.id, e);
        }

        let reason = (!reasons.is_empty()).then(|| reasons.join("; "));
        match &reason {
            Some(r) => warn!(
                "Generation cycle finished degraded in {}ms ({}): {}",
                started.elapsed().as_millis(),
                trigger,
                r
            ),
            None => info!(
                "Generation cycle finished in {}ms ({})",
                started.elapsed().as_millis(),
                trigger
            ),
        }
        CycleReport {
            trigger,
            outcome,
            event: Some(state),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProviderError;
    use crate::models::reading::Channel;
    use crate::services::testing::{self, FakeModel, FakeVoice};
    use crate::store::MemoryStore;
    use std::thread;

    #[test]
    fn model_text_and_audio_is_a_success() {
        let store = testing::store_with_readings(testing::now());
        let rig = testing::rig(store.clone(), FakeModel::replying("All good here."), FakeVoice::working());
        let report = rig.pipeline.run(Trigger::Manual, SchedulePhase::Report, testing::now());
        assert_eq!(report.outcome, GenerationOutcome::Success);
        let state = rig.cache.read().unwrap();
        assert_eq!(state.event.text, "All good here.");
        assert!(state.event.audio.is_some());
        assert_eq!(store.messages().len(), 1);
        rig.cleanup();
    }

    #[test]
    fn failing_speech_still_publishes_text() {
        let store = testing::store_with_readings(testing::now());
        let rig = testing::rig(store.clone(), FakeModel::replying("I could use some water."), FakeVoice::failing());
        let report = rig.pipeline.run(Trigger::Manual, SchedulePhase::Report, testing::now());
        assert_eq!(report.outcome, GenerationOutcome::Degraded);
        let state = rig.cache.read().unwrap();
        assert_eq!(state.event.audio, None);
        assert!(!state.event.text.is_empty());
        assert_eq!(state.event.outcome, GenerationOutcome::Degraded);
        assert!(report.reason.unwrap().contains("speech failed"));
        rig.cleanup();
    }

    #[test]
    fn unavailable_model_uses_template() {
        let store = testing::store_with_readings(testing::now());
        let rig = testing::rig(
            store,
            FakeModel::failing(ProviderError::Auth {
                status: 401,
                message: "revoked".into(),
            }),
            FakeVoice::working(),
        );
        let report = rig.pipeline.run(Trigger::Manual, SchedulePhase::Wake, testing::now());
        assert_eq!(report.outcome, GenerationOutcome::Degraded);
        let state = rig.cache.read().unwrap();
        assert_eq!(state.event.text_source, TextSource::Fallback);
        assert!(state.event.text.starts_with("Good morning!"));
        assert!(state.event.audio.is_some());
        rig.cleanup();
    }

    #[test]
    fn empty_or_offline_store_fails_without_publishing() {
        let store = Arc::new(MemoryStore::new());
        let rig = testing::rig(store.clone(), FakeModel::replying("unused"), FakeVoice::working());
        let report = rig.pipeline.run(Trigger::Manual, SchedulePhase::Report, testing::now());
        assert_eq!(report.outcome, GenerationOutcome::Failed);
        assert!(!report.published());

        testing::write(&store, Channel::Ph, 6.2, testing::now());
        store.set_available(false);
        let report = rig.pipeline.run(Trigger::Manual, SchedulePhase::Report, testing::now());
        assert_eq!(report.outcome, GenerationOutcome::Failed);
        assert!(rig.cache.read().is_none());
        assert!(store.messages().is_empty());
        rig.cleanup();
    }

    #[test]
    fn record_failure_does_not_block_publish() {
        let inner = testing::store_with_readings(testing::now());
        let store = Arc::new(testing::NoRecordStore(inner.clone()));
        let rig = testing::rig(store, FakeModel::replying("Fine."), FakeVoice::working());
        let report = rig.pipeline.run(Trigger::Manual, SchedulePhase::Report, testing::now());
        assert!(report.published());
        assert_eq!(rig.cache.read().unwrap().event.text, "Fine.");
        assert!(inner.messages().is_empty());
        rig.cleanup();
    }

    #[test]
    fn text_that_arrives_after_the_deadline_is_published_without_audio() {
        let store = testing::store_with_readings(testing::now());
        let (model, release) = FakeModel::gated("Slow but sure.");
        let voice = FakeVoice::working();
        let rig = testing::rig_with_deadline(store.clone(), model, voice.clone(), Duration::from_millis(50));

        let pipeline = rig.pipeline.clone();
        let cycle = thread::spawn(move || pipeline.run(Trigger::Manual, SchedulePhase::Report, testing::now()));
        thread::sleep(Duration::from_millis(250));
        release.send(()).unwrap();
        let report = cycle.join().unwrap();

        assert_eq!(report.outcome, GenerationOutcome::Degraded);
        assert!(report.reason.unwrap().contains("speech skipped"));
        let state = rig.cache.read().unwrap();
        assert_eq!(state.event.text, "Slow but sure.");
        assert_eq!(state.event.text_source, TextSource::Model);
        assert_eq!(state.event.audio, None);
        assert_eq!(state.event.outcome, GenerationOutcome::Degraded);
        assert_eq!(voice.calls(), 0);
        assert_eq!(store.messages().len(), 1);
        rig.cleanup();
    }
}
