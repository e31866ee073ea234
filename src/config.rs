//! Runtime configuration.
//!
//! Loaded from a TOML file when given, otherwise defaults. Every external
//! backend call site reads its command name and timeout from here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::book::AudioFormat;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the blob store.
    pub storage_root: PathBuf,
    /// HTTP bind address for `serve`.
    pub bind_addr: String,
    /// Public URL prefix rewritten asset references resolve under.
    pub asset_url_prefix: String,

    /// Global cap on concurrently running jobs across all keys.
    pub max_concurrent_jobs: usize,
    /// Attempts per stage for transient backend failures.
    pub retry_attempts: u32,
    /// Base delay of the exponential backoff between attempts.
    pub retry_base_delay_ms: u64,

    /// Per-chapter timeout for TTS synthesis, seconds.
    pub tts_timeout_secs: u64,
    /// Per-chapter timeout for forced alignment, seconds.
    pub align_timeout_secs: u64,
    /// Per-chapter timeout for translation, seconds.
    pub translate_timeout_secs: u64,

    /// Minimum fraction of timed entries an alignment must reach.
    pub min_alignment_coverage: f64,
    /// Provisional-timing coverage at which boundary passthrough is trusted.
    pub passthrough_coverage: f64,

    /// Canonical audio sample rate.
    pub sample_rate: u32,
    /// Canonical audio codec.
    pub canonical_format: AudioFormat,

    /// TTS synthesis command (espeak-ng compatible).
    pub tts_command: String,
    /// External forced-aligner command; None disables the asr backend.
    pub aligner_command: Option<String>,
    /// External translator command; None disables translation.
    pub translator_command: Option<String>,
    pub ffmpeg_command: String,
    pub ffprobe_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./storage/books"),
            bind_addr: "127.0.0.1:8760".into(),
            asset_url_prefix: "/storage/books".into(),
            max_concurrent_jobs: 4,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            tts_timeout_secs: 120,
            align_timeout_secs: 600,
            translate_timeout_secs: 90,
            min_alignment_coverage: 0.8,
            passthrough_coverage: 0.95,
            sample_rate: 22050,
            canonical_format: AudioFormat::Wav,
            tts_command: "espeak-ng".into(),
            aligner_command: None,
            translator_command: None,
            ffmpeg_command: "ffmpeg".into(),
            ffprobe_command: "ffprobe".into(),
        }
    }
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = toml::from_str(&text)
            .map_err(|e| crate::error::Error::Invariant(format!("bad config: {e}")))?;
        Ok(config)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_secs(self.tts_timeout_secs)
    }

    pub fn align_timeout(&self) -> Duration {
        Duration::from_secs(self.align_timeout_secs)
    }

    pub fn translate_timeout(&self) -> Duration {
        Duration::from_secs(self.translate_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.tts_timeout_secs, 120);
        assert_eq!(config.align_timeout_secs, 600);
        assert_eq!(config.translate_timeout_secs, 90);
        assert!((config.min_alignment_coverage - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let config: Config = toml::from_str(
            r#"
            max_concurrent_jobs = 16
            min_alignment_coverage = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_jobs, 16);
        assert!((config.min_alignment_coverage - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.retry_attempts, 3);
    }
}
