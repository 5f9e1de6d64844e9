//! Speech orchestration: synthesize finished text and keep the clip on disk.
//!
//! A voice failure never blocks the text; callers get a `SpeechOutcome` rather
//! than an error and publish without audio when nothing was stored.

use crate::client::{ProviderError, SpeechSynthesizer};
use crate::models::message::AudioRef;
use crate::services::retry::{RetryError, RetryPolicy};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rand::Rng;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechOutcome {
    Stored(AudioRef),
    /// Nothing was attempted (no text, or the deadline had already passed).
    Skipped(String),
    Failed(String),
}

impl SpeechOutcome {
    pub fn audio(self) -> Option<AudioRef> {
        match self {
            SpeechOutcome::Stored(r) => Some(r),
            _ => None,
        }
    }
}

// =====================
// Audio files
// =====================

/// Directory of synthesized clips, bounded to the newest `keep` files.
#[derive(Debug, Clone)]
pub struct AudioStore {
    dir: PathBuf,
    keep: usize,
}

impl AudioStore {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        AudioStore {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    /// Writes `bytes` as `<timestamp>-<random>.mp3` and prunes older clips. The clip
    /// just written always survives the prune.
    pub fn save(&self, bytes: &[u8], at: DateTime<Utc>) -> Result<AudioRef, ProviderError> {
        fs::create_dir_all(&self.dir).map_err(|e| ProviderError::Io(format!("create {}: {}", self.dir.display(), e)))?;
        let name = format!("{}-{:08x}.mp3", at.format("%Y%m%dT%H%M%S%3f"), rand::rng().random::<u32>());
        let path = self.dir.join(&name);
        fs::write(&path, bytes).map_err(|e| ProviderError::Io(format!("write {}: {}", path.display(), e)))?;
        if let Err(e) = self.prune(&name) {
            warn!("Failed to prune audio directory {}: {}", self.dir.display(), e);
        }
        Ok(AudioRef(name))
    }

    /// Removes the oldest clips until `keep` remain, counting `newest`, which is
    /// never removed. Other names sort by creation time.
    fn prune(&self, newest: &str) -> std::io::Result<usize> {
        let mut clips = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "mp3"))
            .filter(|p| p.file_name().is_none_or(|n| n != newest))
            .collect::<Vec<_>>();
        let room = self.keep - 1;
        if clips.len() <= room {
            return Ok(0);
        }
        clips.sort();
        let excess = clips.len() - room;
        for path in &clips[..excess] {
            fs::remove_file(path)?;
        }
        Ok(excess)
    }

    /// Resolves a reference to a path inside the audio directory. References that
    /// try to escape it resolve to nothing.
    pub fn path_of(&self, audio: &AudioRef) -> Option<PathBuf> {
        let name = audio.0.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return None;
        }
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }
}

// =====================
// Orchestration
// =====================

pub struct Narrator {
    synth: Arc<dyn SpeechSynthesizer>,
    audio: AudioStore,
    policy: RetryPolicy,
}

impl Narrator {
    pub fn new(synth: Arc<dyn SpeechSynthesizer>, audio: AudioStore, policy: RetryPolicy) -> Self {
        Narrator { synth, audio, policy }
    }

    pub fn audio_store(&self) -> &AudioStore {
        &self.audio
    }

    pub fn synthesize(&self, text: &str, deadline: Instant) -> SpeechOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SpeechOutcome::Skipped("no text to speak".to_string());
        }
        if Instant::now() >= deadline {
            return SpeechOutcome::Skipped("cycle deadline passed before synthesis".to_string());
        }
        let bytes = match self.policy.run("speech synthesis", deadline, |_| self.synth.synthesize(text)) {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = e.to_string();
                match e {
                    RetryError::Fatal(_) => error!("Speech synthesis needs operator attention: {}", reason),
                    _ => warn!("Speech synthesis unavailable: {}", reason),
                }
                return SpeechOutcome::Failed(reason);
            }
        };
        match self.audio.save(&bytes, Utc::now()) {
            Ok(audio) => {
                info!("Stored {} bytes of audio as {}", bytes.len(), audio.0);
                SpeechOutcome::Stored(audio)
            }
            Err(e) => {
                warn!("Could not store synthesized audio: {}", e);
                SpeechOutcome::Failed(e.to_string())
            }
        }
    }
}
