//! Comfort bands per channel and growth stage of an eggplant.
//!
//! Temperature, humidity, light and soil moisture follow extension-service
//! growing guides for each stage; pH and TDS follow common hydroponic targets for
//! solanaceae and do not change with the stage.

use crate::models::message::AggregatedSnapshot;
use crate::models::reading::Channel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =====================
// Growth stages
// =====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthStage {
    Germination,
    Seedling,
    Vegetative,
    Flowering,
    Fruiting,
}

impl GrowthStage {
    pub const ALL: [GrowthStage; 5] = [
        GrowthStage::Germination,
        GrowthStage::Seedling,
        GrowthStage::Vegetative,
        GrowthStage::Flowering,
        GrowthStage::Fruiting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GrowthStage::Germination => "germination",
            GrowthStage::Seedling => "seedling",
            GrowthStage::Vegetative => "vegetative",
            GrowthStage::Flowering => "flowering",
            GrowthStage::Fruiting => "fruiting",
        }
    }

    pub fn parse(name: &str) -> Option<GrowthStage> {
        let name = name.trim();
        GrowthStage::ALL.into_iter().find(|s| s.as_str().eq_ignore_ascii_case(name))
    }

    /// What the plant is going through, for the prompt.
    pub fn description(self) -> &'static str {
        match self {
            GrowthStage::Germination => {
                "Seeds are sprouting: root and shoot are emerging. Darkness or low light is preferred."
            }
            GrowthStage::Seedling => {
                "A young seedling with its first true leaves, a delicate stem and a small root system."
            }
            GrowthStage::Vegetative => {
                "Rapid leafy growth: foliage and roots are expanding, no flowers yet."
            }
            GrowthStage::Flowering => {
                "Purple star-shaped flowers are opening and pollinating."
            }
            GrowthStage::Fruiting => "Fruits are forming and swelling toward maturity.",
        }
    }

    /// Care advice for the stage, for the prompt.
    pub fn tips(self) -> &'static str {
        match self {
            GrowthStage::Germination => {
                "Keep soil moist but not waterlogged. Warmth is essential. Darkness is fine."
            }
            GrowthStage::Seedling => {
                "Gradually increase light. Avoid overwatering. Protect from cold."
            }
            GrowthStage::Vegetative => {
                "Full sunlight and consistent watering. Consider fertilizing. Watch for pests."
            }
            GrowthStage::Flowering => {
                "Keep temperature stable, avoid overwatering and keep humidity moderate."
            }
            GrowthStage::Fruiting => {
                "Water consistently to prevent blossom-end rot and support heavy branches."
            }
        }
    }
}

impl fmt::Display for GrowthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =====================
// Thresholds
// =====================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub critical_low: f64,
    pub low: f64,
    pub optimal_min: f64,
    pub optimal_max: f64,
    pub high: f64,
    pub critical_high: f64,
}

pub fn thresholds(stage: GrowthStage, channel: Channel) -> Thresholds {
    use GrowthStage::*;
    let t = |critical_low, low, optimal_min, optimal_max, high, critical_high| Thresholds {
        critical_low,
        low,
        optimal_min,
        optimal_max,
        high,
        critical_high,
    };
    match (channel, stage) {
        (Channel::Temperature, Germination) => t(15.0, 20.0, 25.0, 30.0, 35.0, 40.0),
        (Channel::Temperature, Seedling) => t(10.0, 15.0, 18.0, 30.0, 35.0, 40.0),
        (Channel::Temperature, Vegetative) => t(10.0, 15.0, 22.0, 30.0, 35.0, 40.0),
        (Channel::Temperature, Flowering | Fruiting) => t(15.0, 18.0, 22.0, 32.0, 35.0, 40.0),

        (Channel::Humidity, Germination | Seedling) => t(30.0, 50.0, 70.0, 90.0, 95.0, 100.0),
        (Channel::Humidity, Vegetative | Flowering | Fruiting) => t(30.0, 40.0, 60.0, 70.0, 80.0, 90.0),

        (Channel::Light, Germination) => t(0.0, 0.0, 0.0, 10_000.0, 50_000.0, 100_000.0),
        (Channel::Light, Seedling) => t(0.0, 1_000.0, 10_000.0, 50_000.0, 80_000.0, 100_000.0),
        (Channel::Light, Vegetative | Flowering | Fruiting) => {
            t(5_000.0, 10_000.0, 25_000.0, 80_000.0, 100_000.0, 120_000.0)
        }

        (Channel::SoilMoisture, Germination) => t(10.0, 20.0, 50.0, 80.0, 90.0, 100.0),
        (Channel::SoilMoisture, Seedling) => t(10.0, 20.0, 50.0, 70.0, 90.0, 100.0),
        (Channel::SoilMoisture, Vegetative | Flowering | Fruiting) => t(10.0, 30.0, 50.0, 80.0, 90.0, 100.0),

        (Channel::Tds, _) => t(300.0, 600.0, 800.0, 1_400.0, 2_000.0, 2_800.0),
        (Channel::Ph, _) => t(4.5, 5.0, 5.5, 6.8, 7.5, 8.5),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    CriticalLow,
    Low,
    SlightlyLow,
    Optimal,
    SlightlyHigh,
    High,
    CriticalHigh,
}

impl Band {
    pub fn severity(self) -> Severity {
        match self {
            Band::CriticalLow | Band::CriticalHigh => Severity::Critical,
            Band::Optimal => Severity::Normal,
            _ => Severity::Warning,
        }
    }

    /// Phrase completing "<channel> is ...".
    pub fn describe(self) -> &'static str {
        match self {
            Band::CriticalLow => "critically low",
            Band::Low => "low",
            Band::SlightlyLow => "slightly low",
            Band::Optimal => "just right",
            Band::SlightlyHigh => "slightly high",
            Band::High => "high",
            Band::CriticalHigh => "critically high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Assessment {
    pub value: f64,
    pub band: Band,
    pub severity: Severity,
}

pub fn classify(stage: GrowthStage, channel: Channel, value: f64) -> Band {
    let t = thresholds(stage, channel);
    // sprouting seeds want darkness: no light is never too little
    if stage == GrowthStage::Germination && channel == Channel::Light {
        return if value <= t.optimal_max {
            Band::Optimal
        } else if value <= t.high {
            Band::SlightlyHigh
        } else {
            Band::High
        };
    }
    if value <= t.critical_low {
        Band::CriticalLow
    } else if value <= t.low {
        Band::Low
    } else if value >= t.critical_high {
        Band::CriticalHigh
    } else if value >= t.high {
        Band::High
    } else if value < t.optimal_min {
        Band::SlightlyLow
    } else if value > t.optimal_max {
        Band::SlightlyHigh
    } else {
        Band::Optimal
    }
}

pub fn assess(stage: GrowthStage, channel: Channel, value: f64) -> Assessment {
    let band = classify(stage, channel, value);
    Assessment {
        value,
        band,
        severity: band.severity(),
    }
}

/// Assessment of each channel's latest value.
pub fn assess_snapshot(stage: GrowthStage, snapshot: &AggregatedSnapshot) -> BTreeMap<Channel, Assessment> {
    snapshot
        .channels
        .iter()
        .map(|(channel, summary)| (*channel, assess(stage, *channel, summary.latest)))
        .collect()
}

pub fn overall_severity<'a>(assessments: impl IntoIterator<Item = &'a Assessment>) -> Severity {
    assessments
        .into_iter()
        .map(|a| a.severity)
        .max()
        .unwrap_or(Severity::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VEG: GrowthStage = GrowthStage::Vegetative;

    #[test]
    fn bands_follow_threshold_order() {
        assert_eq!(classify(VEG, Channel::SoilMoisture, 5.0), Band::CriticalLow);
        assert_eq!(classify(VEG, Channel::SoilMoisture, 25.0), Band::Low);
        assert_eq!(classify(VEG, Channel::SoilMoisture, 42.0), Band::SlightlyLow);
        assert_eq!(classify(VEG, Channel::SoilMoisture, 65.0), Band::Optimal);
        assert_eq!(classify(VEG, Channel::SoilMoisture, 85.0), Band::SlightlyHigh);
        assert_eq!(classify(VEG, Channel::SoilMoisture, 92.0), Band::High);
        assert_eq!(classify(VEG, Channel::SoilMoisture, 100.0), Band::CriticalHigh);
    }

    #[test]
    fn boundaries_resolve_toward_the_worse_band() {
        let t = thresholds(VEG, Channel::Temperature);
        assert_eq!(classify(VEG, Channel::Temperature, t.low), Band::Low);
        assert_eq!(classify(VEG, Channel::Temperature, t.high), Band::High);
        assert_eq!(classify(VEG, Channel::Temperature, t.optimal_min), Band::Optimal);
        assert_eq!(classify(VEG, Channel::Temperature, t.optimal_max), Band::Optimal);
    }

    #[test]
    fn stage_changes_the_verdict() {
        // 19 °C suits a seedling but is chilly for a sprouting seed
        assert_eq!(classify(GrowthStage::Seedling, Channel::Temperature, 19.0), Band::Optimal);
        assert_eq!(classify(GrowthStage::Germination, Channel::Temperature, 19.0), Band::Low);
        // 85 % humidity is fine for seedlings, too damp once flowering
        assert_eq!(classify(GrowthStage::Seedling, Channel::Humidity, 85.0), Band::Optimal);
        assert_eq!(classify(GrowthStage::Flowering, Channel::Humidity, 85.0), Band::High);
        // pH targets do not depend on the stage
        for stage in GrowthStage::ALL {
            assert_eq!(classify(stage, Channel::Ph, 6.2), Band::Optimal);
        }
    }

    #[test]
    fn germinating_seeds_prefer_darkness() {
        let g = GrowthStage::Germination;
        assert_eq!(classify(g, Channel::Light, 0.0), Band::Optimal);
        assert_eq!(classify(g, Channel::Light, 8_000.0), Band::Optimal);
        assert_eq!(classify(g, Channel::Light, 30_000.0), Band::SlightlyHigh);
        assert_eq!(classify(g, Channel::Light, 150_000.0), Band::High);
        // the same darkness is critical for a leafy plant
        assert_eq!(classify(VEG, Channel::Light, 0.0), Band::CriticalLow);
    }

    #[test]
    fn stage_names_parse_case_insensitively() {
        for stage in GrowthStage::ALL {
            assert_eq!(GrowthStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(GrowthStage::parse(" Fruiting "), Some(GrowthStage::Fruiting));
        assert_eq!(GrowthStage::parse("harvest"), None);
    }

    #[test]
    fn overall_is_worst_severity() {
        let a = [assess(VEG, Channel::Ph, 6.2), assess(VEG, Channel::Humidity, 45.0)];
        assert_eq!(overall_severity(&a), Severity::Warning);
        let b = [assess(VEG, Channel::Ph, 6.2), assess(VEG, Channel::Temperature, 41.0)];
        assert_eq!(overall_severity(&b), Severity::Critical);
        assert_eq!(overall_severity(&[]), Severity::Normal);
    }
}
