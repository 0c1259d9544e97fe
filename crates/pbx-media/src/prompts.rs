//! Prompt name resolution: symbolic name -> audio bytes, falling back
//! to a synthesized tone when the configured prompt file is missing
//! (§4.5).

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::MediaResult;
use crate::tone::standard_beep;
use crate::wav::{read_wav, SampleFormat, WavAudio};

/// Well-known prompt names referenced by the voicemail IVR (§4.11).
/// Not exhaustive — any name can be resolved, these are just the ones
/// the IVR state machine is guaranteed to ask for.
pub const ENTER_PIN: &str = "enter_pin";
pub const MAIN_MENU: &str = "main_menu";
pub const GOODBYE: &str = "goodbye";
pub const BEEP: &str = "beep";
pub const GREETING_REVIEW_MENU: &str = "greeting_review_menu";
pub const OPTIONS: &str = "options";
pub const ERROR: &str = "error";

/// Resolves prompt names to audio, preferring files under a
/// configured directory and falling back to synthetic tones.
pub struct PromptResolver {
    prompt_dir: Option<PathBuf>,
}

impl PromptResolver {
    pub fn new(prompt_dir: Option<PathBuf>) -> Self {
        PromptResolver { prompt_dir }
    }

    /// Resolve `name` to mu-law payload bytes ready for playback.
    /// Looks for `<prompt_dir>/<name>.wav`; if the directory isn't
    /// configured or the file is missing, falls back to a synthetic
    /// beep so the IVR can still make forward progress.
    pub fn resolve(&self, name: &str) -> MediaResult<Vec<u8>> {
        if let Some(path) = self.file_path(name) {
            match std::fs::read(&path) {
                Ok(bytes) => return Ok(self.as_mulaw_payload(read_wav(&bytes)?)),
                Err(e) => {
                    warn!(prompt = name, path = %path.display(), error = %e, "prompt file missing, using synthetic tone");
                }
            }
        }
        Ok(standard_beep())
    }

    fn file_path(&self, name: &str) -> Option<PathBuf> {
        self.prompt_dir.as_ref().map(|dir| dir.join(format!("{name}.wav")))
    }

    fn as_mulaw_payload(&self, audio: WavAudio) -> Vec<u8> {
        match audio.format {
            SampleFormat::MuLaw => audio.payload,
            SampleFormat::ALaw => audio.payload.into_iter().map(|b| {
                crate::law::ulaw_encode(crate::law::alaw_decode(b))
            }).collect(),
            SampleFormat::Pcm16 => audio
                .payload
                .chunks_exact(2)
                .map(|c| crate::law::ulaw_encode(i16::from_le_bytes([c[0], c[1]])))
                .collect(),
        }
    }
}

pub fn exists(prompt_dir: &Path, name: &str) -> bool {
    prompt_dir.join(format!("{name}.wav")).is_file()
}
