//! Audio prompt storage and playback
//!
//! System prompts ship with the binary (synthesised tone patterns) and are
//! extracted to prompts/system/ at first boot; files already on disk are
//! preserved. Custom prompts live under prompts/custom/.

use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{info, warn};

use super::g711::G711Codec;
use super::relay::{LegSide, MediaSession};
use super::wav::{WavFile, WavWriter, SAMPLE_RATE};
use crate::domain::prompt::{AudioPromptRepository, PromptKind};
use crate::{DomainError, Result};

/// Well-known system prompt file names
pub const PROMPT_BEEP: &str = "beep.wav";
pub const PROMPT_VOICEMAIL_GREETING: &str = "voicemail-greeting.wav";
pub const PROMPT_CONFERENCE_FULL: &str = "conference-full.wav";
pub const PROMPT_CONFERENCE_JOIN: &str = "conference-join.wav";
pub const PROMPT_INVALID_OPTION: &str = "invalid-option.wav";
pub const PROMPT_ENTER_PIN: &str = "enter-pin.wav";
pub const PROMPT_CONFIRM_CALL: &str = "confirm-call.wav";

/// (file name, tone pattern) for every bundled prompt. A pattern is a list
/// of (frequency Hz, duration ms) segments; 0 Hz is silence.
const SYSTEM_PROMPTS: &[(&str, &[(u32, u32)])] = &[
    (PROMPT_BEEP, &[(1000, 200)]),
    (PROMPT_VOICEMAIL_GREETING, &[(440, 300), (0, 150), (440, 300), (0, 150), (1000, 200)]),
    (PROMPT_CONFERENCE_FULL, &[(480, 250), (620, 250), (0, 200), (480, 250), (620, 250)]),
    (PROMPT_CONFERENCE_JOIN, &[(600, 150), (0, 50), (800, 150)]),
    (PROMPT_INVALID_OPTION, &[(480, 200), (0, 100), (480, 200)]),
    (PROMPT_ENTER_PIN, &[(350, 200), (0, 100), (440, 200)]),
    (PROMPT_CONFIRM_CALL, &[(440, 200), (0, 100), (660, 200)]),
];

fn synthesise(pattern: &[(u32, u32)]) -> Vec<i16> {
    let mut samples = Vec::new();
    for &(freq, ms) in pattern {
        let count = (SAMPLE_RATE as u64 * ms as u64 / 1000) as usize;
        if freq == 0 {
            samples.extend(std::iter::repeat(0i16).take(count));
        } else {
            for n in 0..count {
                let t = n as f32 / SAMPLE_RATE as f32;
                let value = (TAU * freq as f32 * t).sin() * 8000.0;
                samples.push(value as i16);
            }
        }
    }
    samples
}

/// Write the bundled prompts into `<prompts_dir>/system/`, creating the
/// directory tree. Existing files are left alone. Returns how many files
/// were written.
pub fn extract_system_prompts(prompts_dir: &Path) -> Result<usize> {
    let system = prompts_dir.join("system");
    let custom = prompts_dir.join("custom");
    std::fs::create_dir_all(&system)
        .and_then(|_| std::fs::create_dir_all(&custom))
        .map_err(|e| DomainError::Internal(format!("create prompt dirs: {}", e)))?;

    let mut written = 0;
    for (name, pattern) in SYSTEM_PROMPTS {
        let path = system.join(name);
        if path.exists() {
            continue;
        }
        let payload = G711Codec::Ulaw.encode(&synthesise(pattern));
        let mut writer = WavWriter::create(&path, G711Codec::Ulaw)
            .map_err(|e| DomainError::Internal(format!("write prompt {}: {}", name, e)))?;
        writer
            .write_payload(&payload)
            .and_then(|_| writer.finalize().map(|_| ()))
            .map_err(|e| DomainError::Internal(format!("write prompt {}: {}", name, e)))?;
        written += 1;
    }
    if written > 0 {
        info!(count = written, dir = %system.display(), "extracted system prompts");
    }
    Ok(written)
}

/// Maps prompt references to files on disk.
pub struct PromptStore {
    prompts_dir: PathBuf,
    repository: Arc<dyn AudioPromptRepository>,
}

impl PromptStore {
    pub fn new(prompts_dir: PathBuf, repository: Arc<dyn AudioPromptRepository>) -> Self {
        Self {
            prompts_dir,
            repository,
        }
    }

    pub fn system_path(&self, file_name: &str) -> PathBuf {
        self.prompts_dir.join("system").join(file_name)
    }

    pub async fn path_for(&self, prompt_id: i64) -> Result<PathBuf> {
        let prompt = self
            .repository
            .get(prompt_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("prompt {}", prompt_id)))?;
        let subtree = match prompt.kind {
            PromptKind::System => "system",
            PromptKind::Custom => "custom",
        };
        Ok(self.prompts_dir.join(subtree).join(prompt.file_name))
    }
}

/// Stream a G.711 WAV file to one leg of a session in 20 ms frames.
/// Returns early on cancellation.
pub async fn play_file(
    session: &MediaSession,
    side: LegSide,
    path: &Path,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let wav = WavFile::open(path)
        .map_err(|e| DomainError::NotFound(format!("prompt {}: {}", path.display(), e)))?;
    let payload_type = wav.codec.payload_type();

    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    for chunk in wav.data.chunks(160) {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.wait_for(|c| *c) => {
                warn!("prompt playback cancelled");
                return Ok(());
            }
        }
        session
            .send_audio(side, payload_type, Bytes::copy_from_slice(chunk))
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_writes_once_and_preserves() {
        let dir = tempfile::tempdir().unwrap();
        let written = extract_system_prompts(dir.path()).unwrap();
        assert_eq!(written, SYSTEM_PROMPTS.len());

        // tamper with one file; a second extraction must not overwrite it
        let beep = dir.path().join("system").join(PROMPT_BEEP);
        std::fs::write(&beep, b"operator-replaced").unwrap();
        let written_again = extract_system_prompts(dir.path()).unwrap();
        assert_eq!(written_again, 0);
        assert_eq!(std::fs::read(&beep).unwrap(), b"operator-replaced");
    }

    #[test]
    fn test_extracted_prompts_are_valid_wavs() {
        let dir = tempfile::tempdir().unwrap();
        extract_system_prompts(dir.path()).unwrap();

        for (name, pattern) in SYSTEM_PROMPTS {
            let wav = WavFile::open(dir.path().join("system").join(name)).unwrap();
            assert_eq!(wav.codec, G711Codec::Ulaw);
            let expected_ms: u32 = pattern.iter().map(|&(_, ms)| ms).sum();
            let actual_ms = (wav.data.len() as u64 * 1000 / SAMPLE_RATE as u64) as u32;
            assert_eq!(actual_ms, expected_ms, "{}", name);
        }
    }

    #[test]
    fn test_synthesise_silence_and_tone() {
        let samples = synthesise(&[(0, 100), (440, 100)]);
        assert_eq!(samples.len(), 1600);
        assert!(samples[..800].iter().all(|&s| s == 0));
        assert!(samples[800..].iter().any(|&s| s != 0));
    }
}
