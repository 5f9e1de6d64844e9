//! Turns a snapshot into the plant's first-person message.
//!
//! The prompt is a pure function of the snapshot, the phase, the plant name and its
//! growth stage, so
//! the same inputs always produce the same request. When the model cannot be
//! reached the message is built from a fixed template instead and flagged as a
//! fallback; only an empty snapshot leaves nothing to say.

use crate::client::{LanguageModel, PromptRequest};
use crate::models::message::{AggregatedSnapshot, SchedulePhase, TextSource};
use crate::services::assess::{self, Band, GrowthStage};
use crate::services::retry::{RetryError, RetryPolicy};
use log::{error, warn};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub text: String,
    pub source: TextSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpretError {
    /// Nothing to report and nothing to fall back on.
    EmptySnapshot,
}

impl core::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InterpretError::EmptySnapshot => write!(f, "snapshot holds no readings"),
        }
    }
}

impl std::error::Error for InterpretError {}

pub struct Interpreter {
    model: Arc<dyn LanguageModel>,
    policy: RetryPolicy,
    plant_name: String,
    stage: GrowthStage,
}

impl Interpreter {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        policy: RetryPolicy,
        plant_name: impl Into<String>,
        stage: GrowthStage,
    ) -> Self {
        Interpreter {
            model,
            policy,
            plant_name: plant_name.into(),
            stage,
        }
    }

    pub fn generate(
        &self,
        snapshot: &AggregatedSnapshot,
        phase: SchedulePhase,
        deadline: Instant,
    ) -> Result<Interpretation, InterpretError> {
        if snapshot.is_empty() {
            return Err(InterpretError::EmptySnapshot);
        }
        let request = PromptRequest {
            prompt: build_prompt(snapshot, phase, &self.plant_name, self.stage),
            phase,
        };
        match self.policy.run("language model", deadline, |_| self.model.complete(&request)) {
            Ok(text) => Ok(Interpretation {
                text,
                source: TextSource::Model,
            }),
            Err(e) => {
                match &e {
                    RetryError::Fatal(inner) => error!("Language model needs operator attention: {}", inner),
                    other => warn!("Language model unavailable: {}", other),
                }
                fallback_message(snapshot, phase, self.stage)
                    .map(|text| Interpretation {
                        text,
                        source: TextSource::Fallback,
                    })
                    .ok_or(InterpretError::EmptySnapshot)
            }
        }
    }
}

fn phase_context(phase: SchedulePhase) -> &'static str {
    match phase {
        SchedulePhase::Wake => {
            "This is a MORNING GREETING.\n\
             Start by saying good morning and how you feel waking up.\n\
             Be cheerful and optimistic about the new day."
        }
        SchedulePhase::Goodnight => {
            "This is a NIGHT GREETING.\n\
             Say good night and summarize how your day was based on the conditions.\n\
             Be calm and peaceful, ready to rest."
        }
        SchedulePhase::Report | SchedulePhase::Sleep => {
            "This is a REGULAR STATUS REPORT.\n\
             Share your current condition based on the sensor readings.\n\
             Be conversational and helpful, like talking to a caring friend."
        }
    }
}

fn format_value(value: f64, unit: &str) -> String {
    if unit.is_empty() {
        format!("{:.1}", value)
    } else {
        format!("{:.1} {}", value, unit)
    }
}

/// Deterministic prompt: channels appear in a fixed order with their comfort band.
pub fn build_prompt(
    snapshot: &AggregatedSnapshot,
    phase: SchedulePhase,
    plant_name: &str,
    stage: GrowthStage,
) -> String {
    let assessments = assess::assess_snapshot(stage, snapshot);
    let mut prompt = format!(
        "You are a {plant} plant that can speak naturally. Generate a friendly, conversational \
         message about your current condition.\n\n\
         GROWTH STAGE: {stage}\n{description}\nCare tips: {tips}\n\n\
         CURRENT SENSOR READINGS (ranges are for the {stage} stage)\n",
        plant = plant_name,
        stage = stage,
        description = stage.description(),
        tips = stage.tips(),
    );
    for (channel, summary) in &snapshot.channels {
        let t = assess::thresholds(stage, *channel);
        let _ = write!(
            prompt,
            "- {}: {} (comfortable range {} to {}",
            channel.label(),
            format_value(summary.latest, &summary.unit),
            t.optimal_min,
            t.optimal_max,
        );
        if let Some(w) = summary.window {
            let _ = write!(
                prompt,
                "; recent mean {:.1}, min {:.1}, max {:.1}",
                w.mean, w.min, w.max
            );
        }
        let status = assessments.get(channel).map(|a| a.band.describe()).unwrap_or("unknown");
        let _ = writeln!(prompt, ") -> {}", status);
    }
    let _ = write!(
        prompt,
        "\nMESSAGE TYPE\n{}\n\nRULES\n\
         1. Speak as the plant in first person.\n\
         2. Keep it to 2-4 sentences.\n\
         3. Do not use emojis.\n\
         4. Avoid technical jargon and exact numbers unless necessary.\n\
         5. Critically low or high readings are urgent: express discomfort and ask for help.\n\
         6. If everything is just right, express happiness and gratitude.\n\n\
         Now generate the plant voice message:",
        phase_context(phase)
    );
    prompt
}

/// Template message listing out-of-range channels. `None` when the snapshot is empty.
pub fn fallback_message(snapshot: &AggregatedSnapshot, phase: SchedulePhase, stage: GrowthStage) -> Option<String> {
    if snapshot.is_empty() {
        return None;
    }
    let opening = match phase {
        SchedulePhase::Wake => "Good morning! ",
        SchedulePhase::Goodnight => "Good night. ",
        SchedulePhase::Report | SchedulePhase::Sleep => "",
    };
    let concerns = snapshot
        .channels
        .iter()
        .filter_map(|(channel, summary)| {
            let band = assess::classify(stage, *channel, summary.latest);
            (band != Band::Optimal).then(|| {
                format!(
                    "my {} is {} ({})",
                    channel.label(),
                    band.describe(),
                    format_value(summary.latest, &summary.unit)
                )
            })
        })
        .collect::<Vec<_>>();
    let body = if concerns.is_empty() {
        "All my readings are within their comfortable ranges.".to_string()
    } else {
        format!("Please check on me: {}.", concerns.join(", "))
    };
    Some(format!("{}{}", opening, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProviderError;
    use crate::models::message::ChannelSummary;
    use crate::models::reading::{Channel, DeviceId};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const VEG: GrowthStage = GrowthStage::Vegetative;

    struct ScriptedModel {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        prompts: Mutex<Vec<PromptRequest>>,
    }

    impl ScriptedModel {
        fn new(mut replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(ScriptedModel {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    impl LanguageModel for ScriptedModel {
        fn complete(&self, request: &PromptRequest) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(request.clone());
            self.replies.lock().unwrap().pop().unwrap_or(Err(ProviderError::Timeout))
        }
    }

    fn snapshot(values: &[(Channel, f64)]) -> AggregatedSnapshot {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        AggregatedSnapshot {
            device_id: DeviceId("PVL-001".into()),
            channels: values
                .iter()
                .map(|(c, v)| {
                    (
                        *c,
                        ChannelSummary {
                            latest: *v,
                            latest_at: at,
                            unit: c.canonical_unit().into(),
                            window: None,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            computed_at: at,
        }
    }

    fn interpreter(model: Arc<ScriptedModel>) -> Interpreter {
        Interpreter::new(model, RetryPolicy::new(2, Duration::ZERO), "eggplant", VEG)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn prompt_is_deterministic_and_phase_specific() {
        let snap = snapshot(&[(Channel::SoilMoisture, 42.0), (Channel::Temperature, 26.0)]);
        let a = build_prompt(&snap, SchedulePhase::Wake, "eggplant", VEG);
        let b = build_prompt(&snap, SchedulePhase::Wake, "eggplant", VEG);
        assert_eq!(a, b);
        assert!(a.contains("MORNING GREETING"));
        assert!(a.contains("soil moisture: 42.0 %"));
        assert!(build_prompt(&snap, SchedulePhase::Goodnight, "eggplant", VEG).contains("NIGHT GREETING"));
        // channel order is fixed regardless of insertion order
        let temp_at = a.find("temperature").unwrap();
        let soil_at = a.find("soil moisture").unwrap();
        assert!(temp_at < soil_at);
    }

    #[test]
    fn model_text_is_used_when_available() {
        let model = ScriptedModel::new(vec![Ok("I feel great today.".into())]);
        let out = interpreter(model.clone())
            .generate(&snapshot(&[(Channel::Ph, 6.2)]), SchedulePhase::Report, deadline())
            .unwrap();
        assert_eq!(out.source, TextSource::Model);
        assert_eq!(out.text, "I feel great today.");
        assert_eq!(model.prompts.lock().unwrap()[0].phase, SchedulePhase::Report);
    }

    #[test]
    fn transient_failure_retries_then_falls_back() {
        let model = ScriptedModel::new(vec![Err(ProviderError::Timeout), Err(ProviderError::RateLimited)]);
        let snap = snapshot(&[(Channel::SoilMoisture, 21.0), (Channel::Ph, 6.2)]);
        let out = interpreter(model.clone()).generate(&snap, SchedulePhase::Report, deadline()).unwrap();
        assert_eq!(out.source, TextSource::Fallback);
        assert_eq!(out.text, "Please check on me: my soil moisture is low (21.0 %).");
        assert_eq!(model.prompts.lock().unwrap().len(), 2);
    }

    #[test]
    fn auth_failure_is_not_retried() {
        let model = ScriptedModel::new(vec![Err(ProviderError::Auth {
            status: 401,
            message: "no".into(),
        })]);
        let out = interpreter(model.clone())
            .generate(&snapshot(&[(Channel::Ph, 6.2)]), SchedulePhase::Wake, deadline())
            .unwrap();
        assert_eq!(out.source, TextSource::Fallback);
        assert_eq!(out.text, "Good morning! All my readings are within their comfortable ranges.");
        assert_eq!(model.prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_snapshot_fails_without_calling_model() {
        let model = ScriptedModel::new(vec![Ok("unused".into())]);
        let err = interpreter(model.clone())
            .generate(&snapshot(&[]), SchedulePhase::Report, deadline())
            .unwrap_err();
        assert_eq!(err, InterpretError::EmptySnapshot);
        assert!(model.prompts.lock().unwrap().is_empty());
        assert_eq!(fallback_message(&snapshot(&[]), SchedulePhase::Report, VEG), None);
    }

    #[test]
    fn fallback_lists_every_out_of_range_channel() {
        let snap = snapshot(&[(Channel::Temperature, 41.0), (Channel::Humidity, 65.0), (Channel::Ph, 7.8)]);
        assert_eq!(
            fallback_message(&snap, SchedulePhase::Goodnight, VEG).unwrap(),
            "Good night. Please check on me: my temperature is critically high (41.0 °C), my pH is high (7.8)."
        );
    }

    #[test]
    fn prompt_and_fallback_grade_against_the_growth_stage() {
        let snap = snapshot(&[(Channel::Light, 0.0), (Channel::Ph, 6.2)]);
        let sprouting = build_prompt(&snap, SchedulePhase::Report, "eggplant", GrowthStage::Germination);
        assert!(sprouting.contains("GROWTH STAGE: germination"));
        assert!(sprouting.contains("light: 0.0 lux (comfortable range 0 to 10000) -> just right"));
        let leafy = build_prompt(&snap, SchedulePhase::Report, "eggplant", VEG);
        assert!(leafy.contains("light: 0.0 lux (comfortable range 25000 to 80000) -> critically low"));

        assert_eq!(
            fallback_message(&snap, SchedulePhase::Report, GrowthStage::Germination).unwrap(),
            "All my readings are within their comfortable ranges."
        );
        assert_eq!(
            fallback_message(&snap, SchedulePhase::Report, VEG).unwrap(),
            "Please check on me: my light is critically low (0.0 lux)."
        );
    }
}
