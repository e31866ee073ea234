//! Text-to-speech engines and the process-owned voice catalog.

use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::book::{TokenTable, TokenTiming};
use crate::error::{Error, Result};
use crate::util::{CancelFlag, run_command};

/// An installed synthesis voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    /// Identifier passed back on `generate audio` requests.
    pub id: String,
    /// Language tag, e.g. `en-gb`.
    pub language: String,
    pub name: String,
}

/// Result of synthesizing one chapter.
pub struct Synthesis {
    /// WAV bytes as produced by the engine, pre-canonicalization.
    pub wav: Vec<u8>,
    /// Per-token boundaries when the engine reports them.
    pub timings: Option<Vec<TokenTiming>>,
}

/// A synthesis backend.
///
/// Implementations are blocking; the pipeline runs them on worker threads
/// with the configured per-chapter timeout.
pub trait TtsEngine: Send + Sync {
    fn voices(&self) -> Result<Vec<Voice>>;

    fn synthesize(&self, tokens: &TokenTable, voice: &str, cancel: &CancelFlag)
    -> Result<Synthesis>;
}

/// Leading language subtag of a voice identifier: `ja-JP-standard` -> `ja`.
pub fn voice_language(voice: &str) -> String {
    voice
        .split(['-', '_'])
        .next()
        .unwrap_or(voice)
        .to_ascii_lowercase()
}

// ============================================================================
// espeak-ng
// ============================================================================

/// espeak-ng subprocess engine. Emits WAV on stdout; reports no per-token
/// boundaries, so synthesized chapters go through a refining aligner.
pub struct EspeakEngine {
    command: String,
    timeout: Duration,
}

impl EspeakEngine {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

impl TtsEngine for EspeakEngine {
    fn voices(&self) -> Result<Vec<Voice>> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--voices");
        let out = run_command(cmd, None, self.timeout, &CancelFlag::new(), "tts")?;
        let listing = String::from_utf8_lossy(&out.stdout).into_owned();
        Ok(parse_espeak_voices(&listing))
    }

    fn synthesize(
        &self,
        tokens: &TokenTable,
        voice: &str,
        cancel: &CancelFlag,
    ) -> Result<Synthesis> {
        let text = tokens
            .iter()
            .map(|t| t.surface.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&self.command);
        cmd.args(["-v", voice, "--stdout"]).arg("--").arg(&text);
        let out = run_command(cmd, None, self.timeout, cancel, "tts")?;
        if out.stdout.is_empty() {
            return Err(Error::BackendFailed {
                backend: "tts".into(),
                message: "engine produced no audio".into(),
            });
        }
        Ok(Synthesis {
            wav: out.stdout,
            timings: None,
        })
    }
}

/// Parse `espeak-ng --voices` output.
///
/// Columns: Pty Language Age/Gender VoiceName File Other-Languages.
fn parse_espeak_voices(listing: &str) -> Vec<Voice> {
    listing
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(Voice {
                id: fields[3].to_string(),
                language: fields[1].to_string(),
                name: fields[3].to_string(),
            })
        })
        .collect()
}

// ============================================================================
// Voice catalog
// ============================================================================

/// Process-owned catalog of installed voices, built once at startup and
/// read-only afterwards.
pub struct VoiceCatalog {
    voices: Vec<Voice>,
}

impl VoiceCatalog {
    /// Enumerate voices from the engine. An unreachable engine yields an
    /// empty catalog rather than failing startup.
    pub fn initialize(engine: &dyn TtsEngine) -> Self {
        let voices = match engine.voices() {
            Ok(voices) => {
                info!(count = voices.len(), "voice catalog initialized");
                voices
            }
            Err(e) => {
                tracing::warn!(error = %e, "voice enumeration failed; catalog empty");
                Vec::new()
            }
        };
        Self { voices }
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    /// Validate a requested voice id. An empty catalog accepts any id so an
    /// offline engine can still be driven explicitly.
    pub fn check(&self, voice: &str) -> Result<()> {
        if self.voices.is_empty() || self.voices.iter().any(|v| v.id == voice) {
            Ok(())
        } else {
            Err(Error::UnknownVoice(voice.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_language() {
        assert_eq!(voice_language("ja-JP-standard"), "ja");
        assert_eq!(voice_language("en_US"), "en");
        assert_eq!(voice_language("de"), "de");
    }

    #[test]
    fn test_parse_espeak_voices() {
        let listing = "\
Pty Language       Age/Gender VoiceName          File                 Other Languages
 5  af              --/M      Afrikaans          gmw/af
 5  en-gb           --/M      English_(Great_Britain) gmw/en
 5  ja              --/F      Japanese           jpx/ja";
        let voices = parse_espeak_voices(listing);
        assert_eq!(voices.len(), 3);
        assert_eq!(voices[1].language, "en-gb");
        assert_eq!(voices[2].id, "Japanese");
    }

    #[test]
    fn test_catalog_check() {
        let catalog = VoiceCatalog {
            voices: vec![Voice {
                id: "en-gb".into(),
                language: "en-gb".into(),
                name: "English".into(),
            }],
        };
        assert!(catalog.check("en-gb").is_ok());
        assert!(matches!(
            catalog.check("xx"),
            Err(Error::UnknownVoice(_))
        ));

        let empty = VoiceCatalog { voices: Vec::new() };
        assert!(empty.check("anything").is_ok());
    }
}
