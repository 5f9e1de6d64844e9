use crate::models::message::{AggregatedSnapshot, ChannelSummary, WindowStats};
use crate::models::reading::{Channel, DeviceId};
use crate::store::{StoreError, TimeSeriesStore};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Accepted `history` ranges in hours (day, week, month); anything else falls back to a day.
pub const HISTORY_RANGES: [i64; 3] = [24, 168, 720];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub at: DateTime<Utc>,
    pub mean: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct History {
    pub hours: i64,
    pub series: BTreeMap<Channel, Vec<HistoryPoint>>,
}

/// Derives snapshots and hourly history for one device. Holds no state of its own.
pub struct Aggregator {
    store: Arc<dyn TimeSeriesStore>,
    device: DeviceId,
    window: Duration,
}

impl Aggregator {
    pub fn new(store: Arc<dyn TimeSeriesStore>, device: DeviceId, window: Duration) -> Self {
        Aggregator { store, device, window }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Latest value per channel plus statistics over the trailing window. Channels
    /// that never reported are left out; an empty snapshot means no readings at all.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<AggregatedSnapshot, StoreError> {
        let mut channels = BTreeMap::new();
        for channel in Channel::ALL {
            let Some((latest_at, latest)) = self.store.latest(&self.device, channel)? else {
                continue;
            };
            let samples = self.store.query_range(&self.device, channel, now - self.window, now)?;
            channels.insert(
                channel,
                ChannelSummary {
                    latest,
                    latest_at,
                    unit: channel.canonical_unit().to_string(),
                    window: WindowStats::from_values(samples.into_iter().map(|(_, v)| v)),
                },
            );
        }
        Ok(AggregatedSnapshot {
            device_id: self.device.clone(),
            channels,
            computed_at: now,
        })
    }

    /// Most recent observation time across all channels.
    pub fn last_seen(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut last = None;
        for channel in Channel::ALL {
            if let Some((at, _)) = self.store.latest(&self.device, channel)? {
                last = last.max(Some(at));
            }
        }
        Ok(last)
    }

    /// Hourly means per channel over the last `hours`.
    pub fn history(&self, hours: i64, now: DateTime<Utc>) -> Result<History, StoreError> {
        let hours = if HISTORY_RANGES.contains(&hours) { hours } else { 24 };
        let from = now - Duration::hours(hours);
        let mut series = BTreeMap::new();
        for channel in Channel::ALL {
            let rows = self.store.query_range(&self.device, channel, from, now)?;
            series.insert(channel, bucket_hourly(&rows));
        }
        Ok(History { hours, series })
    }
}

fn bucket_hourly(rows: &[(DateTime<Utc>, f64)]) -> Vec<HistoryPoint> {
    let mut buckets: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();
    for (at, value) in rows {
        let hour = at.duration_trunc(Duration::hours(1)).unwrap_or(*at);
        let entry = buckets.entry(hour).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
    buckets
        .into_iter()
        .map(|(at, (sum, samples))| HistoryPoint {
            at,
            mean: sum / samples as f64,
            samples,
        })
        .collect()
}
