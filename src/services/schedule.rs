//! Diurnal scheduler.
//!
//! - `phase(now)` is a pure function of local wall-clock time; nothing about the
//!   previous tick is needed to know where in the day we are.
//! - Each trigger point (wake, every report slot, goodnight) opens a window of
//!   `window_minutes`. A window produces at most one published message, keyed by
//!   (local date, phase, slot).
//! - One generation cycle at a time. A tick that finds a cycle running is dropped;
//!   the next tick inside the same window picks the work up again.

use crate::models::message::{GenerationOutcome, PhaseKey, SchedulePhase, Trigger};
use crate::services::cycle::{CycleReport, Pipeline};
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

// =====================
// Schedule
// =====================

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub offset: FixedOffset,
    pub wake_hour: u32,
    pub report_start_hour: u32,
    pub report_end_hour: u32,
    pub report_every_hours: u32,
    pub goodnight_hour: u32,
    pub window_minutes: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            offset: FixedOffset::east_opt(7 * 3600).unwrap_or_else(|| Utc.fix()),
            wake_hour: 6,
            report_start_hour: 8,
            report_end_hour: 20,
            report_every_hours: 2,
            goodnight_hour: 22,
            window_minutes: 30,
        }
    }
}

/// A trigger point on a given local date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseInstant {
    pub key: PhaseKey,
    pub start: DateTime<Utc>,
}

/// Where `now` falls in the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseState {
    pub phase: SchedulePhase,
    /// The trigger point the current phase started at. `None` while sleeping.
    pub instant: Option<PhaseInstant>,
    /// Whether `now` is still inside that trigger point's window.
    pub window_open: bool,
}

impl ScheduleConfig {
    fn report_hours(&self) -> impl Iterator<Item = u32> + '_ {
        (self.report_start_hour..=self.report_end_hour).step_by(self.report_every_hours.max(1) as usize)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, hour) in [
            ("WAKE_HOUR", self.wake_hour),
            ("REPORT_START_HOUR", self.report_start_hour),
            ("REPORT_END_HOUR", self.report_end_hour),
            ("GOODNIGHT_HOUR", self.goodnight_hour),
        ] {
            if hour > 23 {
                return Err(format!("{} must be between 0 and 23, got {}", name, hour));
            }
        }
        if !(self.wake_hour < self.report_start_hour
            && self.report_start_hour <= self.report_end_hour
            && self.report_end_hour < self.goodnight_hour)
        {
            return Err(format!(
                "schedule hours must satisfy wake < report start <= report end < goodnight, got {} / {} / {} / {}",
                self.wake_hour, self.report_start_hour, self.report_end_hour, self.goodnight_hour
            ));
        }
        if self.report_every_hours == 0 {
            return Err("REPORT_EVERY_HOURS must be at least 1".to_string());
        }
        if self.window_minutes < 1 {
            return Err("TRIGGER_WINDOW_MINUTES must be at least 1".to_string());
        }
        if self.goodnight_hour as i64 * 60 + self.window_minutes > 24 * 60 {
            return Err(format!(
                "goodnight window ({}:00 + {} minutes) must close by midnight",
                self.goodnight_hour, self.window_minutes
            ));
        }
        let mut hours = vec![self.wake_hour];
        hours.extend(self.report_hours());
        hours.push(self.goodnight_hour);
        let spacing = hours.windows(2).map(|w| (w[1] - w[0]) as i64 * 60).min().unwrap_or(i64::MAX);
        if self.window_minutes >= spacing {
            return Err(format!(
                "TRIGGER_WINDOW_MINUTES ({}) must be shorter than the closest trigger spacing ({} minutes)",
                self.window_minutes, spacing
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::minutes(self.window_minutes)
    }

    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    fn at_hour(&self, date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
        let naive = date.and_hms_opt(hour, 0, 0)?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Every trigger point of a local date, in order.
    pub fn trigger_points(&self, date: NaiveDate) -> Vec<PhaseInstant> {
        let point = |phase, slot, hour| {
            self.at_hour(date, hour).map(|start| PhaseInstant {
                key: PhaseKey { date, phase, slot },
                start,
            })
        };
        let mut points = Vec::new();
        points.extend(point(SchedulePhase::Wake, 0, self.wake_hour));
        for (slot, hour) in self.report_hours().enumerate() {
            points.extend(point(SchedulePhase::Report, slot as u32, hour));
        }
        points.extend(point(SchedulePhase::Goodnight, 0, self.goodnight_hour));
        points
    }

    pub fn phase(&self, now: DateTime<Utc>) -> PhaseState {
        let sleeping = PhaseState {
            phase: SchedulePhase::Sleep,
            instant: None,
            window_open: false,
        };
        let Some(current) = self
            .trigger_points(self.local_date(now))
            .into_iter()
            .rev()
            .find(|p| p.start <= now)
        else {
            return sleeping;
        };
        let window_open = now < current.start + self.window();
        if current.key.phase == SchedulePhase::Goodnight && !window_open {
            return sleeping;
        }
        PhaseState {
            phase: current.key.phase,
            instant: Some(current),
            window_open,
        }
    }

    pub fn is_sleeping(&self, now: DateTime<Utc>) -> bool {
        self.phase(now).phase == SchedulePhase::Sleep
    }

    /// First trigger point strictly after `now`.
    pub fn next_trigger(&self, now: DateTime<Utc>) -> Option<PhaseInstant> {
        let today = self.local_date(now);
        let upcoming = self.trigger_points(today).into_iter().find(|p| p.start > now);
        upcoming.or_else(|| {
            today
                .succ_opt()
                .and_then(|tomorrow| self.trigger_points(tomorrow).into_iter().next())
        })
    }

    /// Local `HH:MM` of the next trigger point.
    pub fn next_update(&self, now: DateTime<Utc>) -> String {
        match self.next_trigger(now) {
            Some(p) => p.start.with_timezone(&self.offset).format("%H:%M").to_string(),
            None => format!("{:02}:00", self.wake_hour),
        }
    }
}

// =====================
// In-flight guard
// =====================

#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

impl InFlight {
    pub fn try_acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(self.clone()))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Released on drop, including when a cycle thread unwinds.
#[derive(Debug)]
pub struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.0.store(false, Ordering::Release);
    }
}

// =====================
// Scheduler
// =====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// At least one cycle ran (or is running) without publishing.
    Attempted { failures: u32 },
    Published,
}

type Ledger = Arc<Mutex<BTreeMap<PhaseKey, SlotState>>>;

pub struct CycleHandle {
    trigger: Trigger,
    handle: JoinHandle<CycleReport>,
}

impl CycleHandle {
    pub fn join(self) -> CycleReport {
        let trigger = self.trigger;
        self.handle.join().unwrap_or_else(|_| CycleReport {
            trigger,
            outcome: GenerationOutcome::Failed,
            event: None,
            reason: Some("generation cycle panicked".to_string()),
        })
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    /// Sleeping, or the current window has closed.
    Idle(SchedulePhase),
    AlreadyDone(PhaseKey),
    /// Another cycle holds the in-flight guard; this tick is dropped.
    Busy(PhaseKey),
    Started(PhaseKey, CycleHandle),
    /// The worker thread could not be spawned.
    NotStarted(PhaseKey, String),
}

impl core::fmt::Debug for CycleHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CycleHandle({})", self.trigger)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerError {
    /// A cycle is already running.
    Busy,
    /// The manual cycle ran but produced nothing to show.
    NothingPublished(String),
}

impl core::fmt::Display for TriggerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TriggerError::Busy => write!(f, "a generation cycle is already running"),
            TriggerError::NothingPublished(reason) => write!(f, "nothing was published: {}", reason),
        }
    }
}

impl std::error::Error for TriggerError {}

pub struct Scheduler {
    config: ScheduleConfig,
    pipeline: Arc<Pipeline>,
    ledger: Ledger,
    in_flight: Arc<InFlight>,
}

impl Scheduler {
    pub fn new(config: ScheduleConfig, pipeline: Arc<Pipeline>) -> Self {
        Scheduler {
            config,
            pipeline,
            ledger: Arc::new(Mutex::new(BTreeMap::new())),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_held()
    }

    pub fn slot_state(&self, key: &PhaseKey) -> Option<SlotState> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied()
    }

    /// Marks phase-instances as already published, e.g. from the message log after a restart.
    pub fn seed(&self, keys: impl IntoIterator<Item = PhaseKey>) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            ledger.insert(key, SlotState::Published);
        }
    }

    pub fn seed_from_store(&self, store: &dyn TimeSeriesStore, now: DateTime<Utc>) {
        let today = self.config.local_date(now);
        match store.published_keys(today) {
            Ok(keys) => {
                info!("Restored {} published phase(s) for {}", keys.len(), today);
                self.seed(keys);
            }
            Err(e) => warn!("Could not read today's published phases, starting fresh: {}", e),
        }
    }

    pub fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let state = self.config.phase(now);
        let Some(instant) = state.instant.filter(|_| state.window_open) else {
            return TickOutcome::Idle(state.phase);
        };
        let key = instant.key;
        {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(yesterday) = key.date.pred_opt() {
                ledger.retain(|k, _| k.date >= yesterday);
            }
            if ledger.get(&key) == Some(&SlotState::Published) {
                return TickOutcome::AlreadyDone(key);
            }
        }
        let Some(guard) = self.in_flight.try_acquire() else {
            return TickOutcome::Busy(key);
        };
        {
            // A cycle updates the ledger before releasing the guard, so holding the
            // guard means the entry below is final.
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = ledger.entry(key).or_insert(SlotState::Attempted { failures: 0 });
            if *slot == SlotState::Published {
                drop(ledger);
                drop(guard);
                return TickOutcome::AlreadyDone(key);
            }
        }

        let pipeline = self.pipeline.clone();
        let ledger = self.ledger.clone();
        let trigger = Trigger::Scheduled(key);
        let spawned = thread::Builder::new().name(format!("cycle-{}", key)).spawn(move || {
            let report = pipeline.run(trigger, key.phase, now);
            let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            let next = if report.published() {
                SlotState::Published
            } else {
                match ledger.get(&key) {
                    Some(SlotState::Attempted { failures }) => SlotState::Attempted { failures: failures + 1 },
                    _ => SlotState::Attempted { failures: 1 },
                }
            };
            ledger.insert(key, next);
            drop(ledger);
            drop(guard);
            report
        });
        match spawned {
            Ok(handle) => TickOutcome::Started(key, CycleHandle { trigger, handle }),
            Err(e) => TickOutcome::NotStarted(key, e.to_string()),
        }
    }

    /// Runs a manual cycle outside the schedule in the given tone (`Sleep` speaks as a
    /// report). Never touches the phase ledger.
    pub fn trigger_now(&self, now: DateTime<Utc>, tone: SchedulePhase) -> Result<CycleHandle, TriggerError> {
        let guard = self.in_flight.try_acquire().ok_or(TriggerError::Busy)?;
        let pipeline = self.pipeline.clone();
        let tone = match tone {
            SchedulePhase::Sleep => SchedulePhase::Report,
            other => other,
        };
        let handle = thread::Builder::new()
            .name("cycle-manual".to_string())
            .spawn(move || {
                let report = pipeline.run(Trigger::Manual, tone, now);
                drop(guard);
                report
            })
            .map_err(|e| TriggerError::NothingPublished(format!("could not start cycle: {}", e)))?;
        Ok(CycleHandle {
            trigger: Trigger::Manual,
            handle,
        })
    }
}

/// Ticks forever at a steady cadence. Cycles run on their own threads and are not joined.
pub fn run_loop(scheduler: &Scheduler, interval: std::time::Duration) -> ! {
    loop {
        let tick_start = Instant::now();

        match scheduler.tick(Utc::now()) {
            TickOutcome::Idle(phase) => debug!("Tick: {} (no open window)", phase),
            TickOutcome::AlreadyDone(key) => debug!("Tick: {} already published", key),
            TickOutcome::Busy(key) => debug!("Tick: {} dropped, a cycle is in flight", key),
            TickOutcome::Started(key, _) => info!("Tick: started cycle for {}", key),
            TickOutcome::NotStarted(key, e) => error!("Tick: could not start cycle for {}: {}", key, e),
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}
