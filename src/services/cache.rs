//! Process-wide slot holding the most recently published message.
//!
//! Publishing swaps a whole `Arc<LatestState>`, so a reader either sees the old
//! state or the new one, never a mix. The state is mirrored to a JSON file so the
//! dashboard has something to show right after a restart.

use crate::models::message::LatestState;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

pub struct LatestStateCache {
    slot: RwLock<Option<Arc<LatestState>>>,
    path: Option<PathBuf>,
}

impl LatestStateCache {
    /// Cache without a backing file.
    pub fn in_memory() -> Self {
        LatestStateCache {
            slot: RwLock::new(None),
            path: None,
        }
    }

    /// Cache mirrored to `path`, starting from whatever the file holds. A missing
    /// or unreadable file starts empty.
    pub fn restore(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let restored = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<LatestState>(&contents) {
                Ok(state) => {
                    info!("Restored latest message {} from {}", state.event.id, path.display());
                    Some(Arc::new(state))
                }
                Err(e) => {
                    warn!("Ignoring unreadable latest message file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Could not read latest message file {}: {}", path.display(), e);
                None
            }
        };
        LatestStateCache {
            slot: RwLock::new(restored),
            path: Some(path),
        }
    }

    /// Replaces the current state. Persistence failures are logged; the in-memory
    /// slot is updated regardless.
    pub fn publish(&self, state: LatestState) -> Arc<LatestState> {
        let state = Arc::new(state);
        if let Some(path) = &self.path {
            if let Err(e) = persist(path, &state) {
                warn!("Failed to persist latest message to {}: {}", path.display(), e);
            }
        }
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(state.clone());
        state
    }

    pub fn read(&self) -> Option<Arc<LatestState>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Write-then-rename so the file is never observed half written.
fn persist(path: &Path, state: &LatestState) -> Result<(), String> {
    let serialized = serde_json::to_string_pretty(state).map_err(|e| format!("encode: {}", e))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| format!("create {}: {}", parent.display(), e))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serialized).map_err(|e| format!("write {}: {}", tmp.display(), e))?;
    fs::rename(&tmp, path).map_err(|e| format!("rename {}: {}", tmp.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::{
        AggregatedSnapshot, ChannelSummary, GenerationOutcome, MessageEvent, SchedulePhase, TextSource, Trigger,
    };
    use crate::models::reading::{Channel, DeviceId};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::thread;

    fn state(id: &str, text: &str) -> LatestState {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 1, 0, 0).unwrap();
        let mut channels = BTreeMap::new();
        channels.insert(
            Channel::Humidity,
            ChannelSummary {
                latest: 64.0,
                latest_at: at,
                unit: "%".into(),
                window: None,
            },
        );
        LatestState {
            event: MessageEvent {
                id: id.into(),
                trigger: Trigger::Manual,
                tone: SchedulePhase::Report,
                snapshot_at: at,
                text: text.into(),
                text_source: TextSource::Model,
                audio: None,
                generated_at: at,
                outcome: GenerationOutcome::Degraded,
            },
            snapshot: AggregatedSnapshot {
                device_id: DeviceId("PVL-001".into()),
                channels,
                computed_at: at,
            },
        }
    }

    #[test]
    fn publish_replaces_previous_state() {
        let cache = LatestStateCache::in_memory();
        assert!(cache.read().is_none());
        cache.publish(state("a", "first"));
        let held = cache.read().unwrap();
        cache.publish(state("b", "second"));
        assert_eq!(held.event.text, "first");
        assert_eq!(cache.read().unwrap().event.id, "b");
    }

    #[test]
    fn readers_see_whole_states_only() {
        let cache = Arc::new(LatestStateCache::in_memory());
        cache.publish(state("0", "text-0"));
        let readers = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let s = cache.read().unwrap();
                        assert_eq!(s.event.text, format!("text-{}", s.event.id));
                    }
                })
            })
            .collect::<Vec<_>>();
        for i in 1..200 {
            cache.publish(state(&i.to_string(), &format!("text-{}", i)));
        }
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn persisted_state_survives_restore() {
        let dir = std::env::temp_dir().join(format!("plantvoice-cache-{}", rand::random::<u32>()));
        let path = dir.join("latest_message.json");
        {
            let cache = LatestStateCache::restore(&path);
            assert!(cache.read().is_none());
            cache.publish(state("persisted", "hello"));
        }
        let restored = LatestStateCache::restore(&path);
        assert_eq!(*restored.read().unwrap(), state("persisted", "hello"));
        assert!(!path.with_extension("json.tmp").exists());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = std::env::temp_dir().join(format!("plantvoice-cache-{}", rand::random::<u32>()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("latest_message.json");
        fs::write(&path, "{not json").unwrap();
        assert!(LatestStateCache::restore(&path).read().is_none());
        fs::remove_dir_all(dir).unwrap();
    }
}
