//! Fakes and builders shared by the scheduler, pipeline and dashboard tests.

use crate::client::{LanguageModel, PromptRequest, ProviderError, SpeechSynthesizer};
use crate::models::message::{LatestState, PhaseKey};
use crate::models::reading::{Channel, DeviceId, SensorReading};
use crate::services::aggregate::Aggregator;
use crate::services::assess::GrowthStage;
use crate::services::cache::LatestStateCache;
use crate::services::cycle::Pipeline;
use crate::services::interpret::Interpreter;
use crate::services::retry::RetryPolicy;
use crate::services::speech::{AudioStore, Narrator};
use crate::store::{MemoryStore, StoreError, TimeSeriesStore};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEVICE: &str = "PVL-001";

/// 10:00 at +07:00.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 3, 0, 0).unwrap()
}

pub fn write(store: &MemoryStore, channel: Channel, value: f64, at: DateTime<Utc>) {
    store
        .write(&[SensorReading {
            device_id: DeviceId(DEVICE.into()),
            channel,
            value,
            unit: channel.canonical_unit().into(),
            observed_at: at,
        }])
        .unwrap();
}

pub fn store_with_readings(at: DateTime<Utc>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let at = at - chrono::Duration::minutes(5);
    write(&store, Channel::Temperature, 25.0, at);
    write(&store, Channel::SoilMoisture, 55.0, at);
    write(&store, Channel::Ph, 6.2, at);
    store
}

// =====================
// Providers
// =====================

pub struct FakeModel {
    reply: Result<String, ProviderError>,
    gate: Option<Mutex<Receiver<()>>>,
    calls: AtomicUsize,
}

impl FakeModel {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(FakeModel {
            reply: Ok(text.to_string()),
            gate: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(err: ProviderError) -> Arc<Self> {
        Arc::new(FakeModel {
            reply: Err(err),
            gate: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// Blocks every call until the returned sender sends (or is dropped).
    pub fn gated(text: &str) -> (Arc<Self>, Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let model = Arc::new(FakeModel {
            reply: Ok(text.to_string()),
            gate: Some(Mutex::new(rx)),
            calls: AtomicUsize::new(0),
        });
        (model, tx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LanguageModel for FakeModel {
    fn complete(&self, _request: &PromptRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _ = gate.lock().unwrap().recv();
        }
        self.reply.clone()
    }
}

pub struct FakeVoice {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeVoice {
    pub fn working() -> Arc<Self> {
        Arc::new(FakeVoice {
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(FakeVoice {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpeechSynthesizer for FakeVoice {
    fn synthesize(&self, _text: &str) -> Result<Vec<u8>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ProviderError::Unavailable {
                status: 503,
                message: "overloaded".into(),
            })
        } else {
            Ok(vec![0xff, 0xfb, 0x90, 0x00])
        }
    }
}

/// Store whose message log is down while readings still work.
pub struct NoRecordStore(pub Arc<MemoryStore>);

impl TimeSeriesStore for NoRecordStore {
    fn write(&self, readings: &[SensorReading]) -> Result<usize, StoreError> {
        self.0.write(readings)
    }

    fn query_range(
        &self,
        device: &DeviceId,
        channel: Channel,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError> {
        self.0.query_range(device, channel, from, to)
    }

    fn latest(&self, device: &DeviceId, channel: Channel) -> Result<Option<(DateTime<Utc>, f64)>, StoreError> {
        self.0.latest(device, channel)
    }

    fn record_message(&self, _state: &LatestState) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("message log offline".into()))
    }

    fn published_keys(&self, date: NaiveDate) -> Result<Vec<PhaseKey>, StoreError> {
        self.0.published_keys(date)
    }
}

// =====================
// Wiring
// =====================

pub struct Rig {
    pub pipeline: Arc<Pipeline>,
    pub aggregator: Arc<Aggregator>,
    pub cache: Arc<LatestStateCache>,
    pub audio_dir: PathBuf,
}

impl Rig {
    pub fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.audio_dir);
    }
}

pub fn rig(store: Arc<dyn TimeSeriesStore>, model: Arc<FakeModel>, voice: Arc<FakeVoice>) -> Rig {
    rig_with_deadline(store, model, voice, Duration::from_secs(30))
}

pub fn rig_with_deadline(
    store: Arc<dyn TimeSeriesStore>,
    model: Arc<FakeModel>,
    voice: Arc<FakeVoice>,
    deadline: Duration,
) -> Rig {
    let audio_dir = std::env::temp_dir().join(format!("plantvoice-audio-{:08x}", rand::random::<u32>()));
    let policy = RetryPolicy::new(2, Duration::ZERO);
    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        DeviceId(DEVICE.into()),
        chrono::Duration::minutes(30),
    ));
    let cache = Arc::new(LatestStateCache::in_memory());
    let pipeline = Arc::new(Pipeline::new(
        aggregator.clone(),
        Interpreter::new(model, policy.clone(), "eggplant", GrowthStage::Vegetative),
        Narrator::new(voice, AudioStore::new(&audio_dir, 10), policy),
        cache.clone(),
        store,
        deadline,
    ));
    Rig {
        pipeline,
        aggregator,
        cache,
        audio_dir,
    }
}
