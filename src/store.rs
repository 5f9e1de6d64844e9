//! Time-series storage behind a small trait so the scheduler and ingestion path
//! never see the database directly.
//!
//! - `PgStore`: PostgreSQL/TimescaleDB via a diesel r2d2 pool.
//! - `MemoryStore`: in-process store for tests and `DATABASE_URL=memory://` runs.

use crate::db::models::{NewMessageEvent, NewSensorReading, RecordedPhase};
use crate::db::schema;
use crate::models::message::{LatestState, PhaseKey, SchedulePhase};
use crate::models::reading::{Channel, DeviceId, SensorReading};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::info;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug)]
pub enum StoreError {
    /// No connection could be obtained.
    Unavailable(String),
    /// A statement failed after a connection was obtained.
    Query(String),
    Encode(serde_json::Error),
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::Unavailable(s) => write!(f, "store unavailable: {}", s),
            StoreError::Query(s) => write!(f, "store query failed: {}", s),
            StoreError::Encode(e) => write!(f, "encode failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Query(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Encode(value)
    }
}

/// Key/value-by-time storage for readings plus the log of published messages.
pub trait TimeSeriesStore: Send + Sync {
    /// Durably writes readings. Duplicates of `(device, channel, observed_at)` are ignored.
    /// Returns the number of new rows.
    fn write(&self, readings: &[SensorReading]) -> Result<usize, StoreError>;

    /// Readings in `[from, to]`, oldest first.
    fn query_range(
        &self,
        device: &DeviceId,
        channel: Channel,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError>;

    fn latest(&self, device: &DeviceId, channel: Channel) -> Result<Option<(DateTime<Utc>, f64)>, StoreError>;

    fn record_message(&self, state: &LatestState) -> Result<(), StoreError>;

    /// Scheduled phase-instances of `date` that already produced a message.
    fn published_keys(&self, date: NaiveDate) -> Result<Vec<PhaseKey>, StoreError>;
}

fn recorded_to_key(row: RecordedPhase) -> Option<PhaseKey> {
    let phase = SchedulePhase::parse(&row.trigger)?;
    Some(PhaseKey {
        date: row.phase_date?,
        phase,
        slot: u32::try_from(row.slot?).ok()?,
    })
}

// =====================
// PostgreSQL / TimescaleDB
// =====================

pub struct PgStore {
    pool: Pool<ConnectionManager<PgConnection>>,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) if applied.is_empty() => {
            info!("Database schema is up to date");
            Ok(())
        }
        Ok(applied) => {
            let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
            info!("Applied {} database migration(s): {}", applied.len(), names);
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

impl PgStore {
    pub fn connect(database_url: &str, pool_size: u32, connect_timeout: Duration) -> Result<Self, String> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(connect_timeout)
            .build(manager)
            .map_err(|e| format!("DB connection failed: {}", e))?;
        {
            let mut pooled = pool.get().map_err(|e| format!("DB connection failed: {}", e))?;
            apply_database_migrations(&mut *pooled)?;
        }
        Ok(PgStore { pool })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut PgConnection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut pooled = self.pool.get().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        f(&mut *pooled)
    }
}

impl TimeSeriesStore for PgStore {
    fn write(&self, readings: &[SensorReading]) -> Result<usize, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }
        use schema::sensor_readings::dsl as R;

        let received_at = Utc::now();
        let rows = readings
            .iter()
            .map(|r| NewSensorReading::from_reading(r, received_at))
            .collect::<Vec<_>>();
        self.with_conn(|conn| {
            let inserted = diesel::insert_into(R::sensor_readings)
                .values(&rows)
                .on_conflict((R::device_id, R::channel, R::observed_at))
                .do_nothing()
                .execute(conn)?;
            Ok(inserted)
        })
    }

    fn query_range(
        &self,
        device: &DeviceId,
        channel: Channel,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError> {
        use schema::sensor_readings::dsl as R;

        self.with_conn(|conn| {
            let rows = R::sensor_readings
                .filter(R::device_id.eq(&device.0))
                .filter(R::channel.eq(channel.as_str()))
                .filter(R::observed_at.ge(from))
                .filter(R::observed_at.le(to))
                .order(R::observed_at.asc())
                .select((R::observed_at, R::value))
                .load::<(DateTime<Utc>, f64)>(conn)?;
            Ok(rows)
        })
    }

    fn latest(&self, device: &DeviceId, channel: Channel) -> Result<Option<(DateTime<Utc>, f64)>, StoreError> {
        use schema::sensor_readings::dsl as R;

        self.with_conn(|conn| {
            let row = R::sensor_readings
                .filter(R::device_id.eq(&device.0))
                .filter(R::channel.eq(channel.as_str()))
                .order(R::observed_at.desc())
                .select((R::observed_at, R::value))
                .first::<(DateTime<Utc>, f64)>(conn)
                .optional()?;
            Ok(row)
        })
    }

    fn record_message(&self, state: &LatestState) -> Result<(), StoreError> {
        use schema::message_events::dsl as M;

        let row = NewMessageEvent::from_state(state)?;
        self.with_conn(|conn| {
            diesel::insert_into(M::message_events).values(&row).execute(conn)?;
            Ok(())
        })
    }

    fn published_keys(&self, date: NaiveDate) -> Result<Vec<PhaseKey>, StoreError> {
        use schema::message_events::dsl as M;

        self.with_conn(|conn| {
            let rows = M::message_events
                .filter(M::phase_date.eq(date))
                .filter(M::trigger.ne("manual"))
                .select((M::trigger, M::phase_date, M::slot))
                .load::<RecordedPhase>(conn)?;
            Ok(rows.into_iter().filter_map(recorded_to_key).collect())
        })
    }
}

// =====================
// In-memory
// =====================

#[derive(Default)]
struct MemoryInner {
    readings: BTreeMap<(DeviceId, Channel), BTreeMap<DateTime<Utc>, f64>>,
    messages: Vec<LatestState>,
}

/// Process-local store. `set_available(false)` makes every call fail like a dropped database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<LatestState> {
        self.lock().messages.clone()
    }

    pub fn reading_count(&self) -> usize {
        self.lock().readings.values().map(BTreeMap::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl TimeSeriesStore for MemoryStore {
    fn write(&self, readings: &[SensorReading]) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        let mut inserted = 0;
        for r in readings {
            let series = inner.readings.entry((r.device_id.clone(), r.channel)).or_default();
            if !series.contains_key(&r.observed_at) {
                series.insert(r.observed_at, r.value);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn query_range(
        &self,
        device: &DeviceId,
        channel: Channel,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError> {
        self.check_available()?;
        if from > to {
            return Ok(Vec::new());
        }
        let inner = self.lock();
        Ok(inner
            .readings
            .get(&(device.clone(), channel))
            .map(|series| series.range(from..=to).map(|(t, v)| (*t, *v)).collect())
            .unwrap_or_default())
    }

    fn latest(&self, device: &DeviceId, channel: Channel) -> Result<Option<(DateTime<Utc>, f64)>, StoreError> {
        self.check_available()?;
        let inner = self.lock();
        Ok(inner
            .readings
            .get(&(device.clone(), channel))
            .and_then(|series| series.iter().next_back())
            .map(|(t, v)| (*t, *v)))
    }

    fn record_message(&self, state: &LatestState) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().messages.push(state.clone());
        Ok(())
    }

    fn published_keys(&self, date: NaiveDate) -> Result<Vec<PhaseKey>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .messages
            .iter()
            .filter_map(|s| s.event.trigger.phase_key())
            .filter(|k| k.date == date)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(channel: Channel, value: f64, at: DateTime<Utc>) -> SensorReading {
        SensorReading {
            device_id: DeviceId("PVL-001".into()),
            channel,
            value,
            unit: channel.canonical_unit().to_string(),
            observed_at: at,
        }
    }

    #[test]
    fn latest_returns_most_recent_observation() {
        let store = MemoryStore::new();
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        store
            .write(&[
                reading(Channel::SoilMoisture, 40.0, t - chrono::Duration::minutes(5)),
                reading(Channel::SoilMoisture, 42.0, t),
            ])
            .unwrap();
        let dev = DeviceId("PVL-001".into());
        assert_eq!(store.latest(&dev, Channel::SoilMoisture).unwrap(), Some((t, 42.0)));
        assert_eq!(store.latest(&dev, Channel::Ph).unwrap(), None);
    }

    #[test]
    fn duplicate_observations_are_ignored() {
        let store = MemoryStore::new();
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(store.write(&[reading(Channel::Ph, 6.1, t)]).unwrap(), 1);
        assert_eq!(store.write(&[reading(Channel::Ph, 6.9, t)]).unwrap(), 0);
        let dev = DeviceId("PVL-001".into());
        assert_eq!(store.latest(&dev, Channel::Ph).unwrap(), Some((t, 6.1)));
    }

    #[test]
    fn query_range_is_inclusive_and_ordered() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let rows = (0..5)
            .map(|i| reading(Channel::Temperature, 20.0 + i as f64, t0 + chrono::Duration::minutes(i * 10)))
            .collect::<Vec<_>>();
        store.write(&rows).unwrap();
        let dev = DeviceId("PVL-001".into());
        let got = store
            .query_range(&dev, Channel::Temperature, t0 + chrono::Duration::minutes(10), t0 + chrono::Duration::minutes(30))
            .unwrap();
        assert_eq!(got.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![21.0, 22.0, 23.0]);
    }

    #[test]
    fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        assert!(matches!(
            store.write(&[reading(Channel::Ph, 6.1, t)]),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.latest(&DeviceId("PVL-001".into()), Channel::Ph).is_err());
        assert_eq!(store.reading_count(), 0);
    }

    #[test]
    fn recorded_rows_map_back_to_phase_keys() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let key = recorded_to_key(RecordedPhase {
            trigger: "report".into(),
            phase_date: Some(date),
            slot: Some(3),
        });
        assert_eq!(
            key,
            Some(PhaseKey {
                date,
                phase: SchedulePhase::Report,
                slot: 3
            })
        );
        assert_eq!(
            recorded_to_key(RecordedPhase {
                trigger: "manual".into(),
                phase_date: None,
                slot: None
            }),
            None
        );
    }
}
