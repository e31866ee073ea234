//! Audio codecs: duration probing, canonical transcoding, and range removal.
//!
//! Two implementations share one trait: [`WavCodec`] does sample-accurate
//! in-process work on 16-bit PCM WAV via hound, and [`FfmpegCodec`] shells
//! out for MP3 (or anything else ffmpeg can read). Edits always go through
//! `remove_ranges` so audio and timing stay consistent.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::book::AudioFormat;
use crate::error::{Error, Result};
use crate::util::{CancelFlag, run_command};

/// Codec seam between the editor/source manager and the actual audio bytes.
pub trait AudioCodec: Send + Sync {
    fn format(&self) -> AudioFormat;

    /// Duration of the audio file, seconds.
    fn probe(&self, path: &Path) -> Result<f64>;

    /// Rewrite arbitrary input into the canonical codec (fixed sample rate,
    /// mono).
    fn transcode(&self, input: &Path, output: &Path, cancel: &CancelFlag) -> Result<()>;

    /// Concatenate the complement of `remove` (sorted, coalesced `[t0, t1)`
    /// intervals) into `output`.
    fn remove_ranges(
        &self,
        input: &Path,
        output: &Path,
        remove: &[(f64, f64)],
        cancel: &CancelFlag,
    ) -> Result<()>;
}

// ============================================================================
// WAV (in-process)
// ============================================================================

/// Sample-accurate canonical codec: 16-bit PCM mono WAV.
pub struct WavCodec {
    sample_rate: u32,
}

impl WavCodec {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Decode any PCM/float WAV to mono f32 at the canonical rate.
    fn decode(&self, path: &Path) -> Result<Vec<f32>> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| Error::AudioUnreadable(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        Ok(if spec.sample_rate == self.sample_rate {
            mono
        } else {
            resample(&mono, spec.sample_rate, self.sample_rate)
        })
    }

    fn write(&self, path: &Path, samples: &[f32]) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(value)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

impl AudioCodec for WavCodec {
    fn format(&self) -> AudioFormat {
        AudioFormat::Wav
    }

    fn probe(&self, path: &Path) -> Result<f64> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| Error::AudioUnreadable(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        Ok(reader.duration() as f64 / spec.sample_rate as f64)
    }

    fn transcode(&self, input: &Path, output: &Path, cancel: &CancelFlag) -> Result<()> {
        cancel.checkpoint()?;
        let samples = self.decode(input)?;
        self.write(output, &samples)
    }

    fn remove_ranges(
        &self,
        input: &Path,
        output: &Path,
        remove: &[(f64, f64)],
        cancel: &CancelFlag,
    ) -> Result<()> {
        cancel.checkpoint()?;
        let samples = self.decode(input)?;
        let duration = samples.len() as f64 / self.sample_rate as f64;
        let keep = crate::util::complement_intervals(remove, duration);

        let mut kept = Vec::with_capacity(samples.len());
        for &(begin, end) in &keep {
            let from = (begin * self.sample_rate as f64).round() as usize;
            let to = ((end * self.sample_rate as f64).round() as usize).min(samples.len());
            if from < to {
                kept.extend_from_slice(&samples[from..to]);
            }
        }
        debug!(
            removed = remove.len(),
            kept_samples = kept.len(),
            "cut WAV ranges"
        );
        self.write(output, &kept)
    }
}

/// Linear-interpolation resampling.
fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if samples.is_empty() || from == to {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let base = pos.floor() as usize;
            let frac = (pos - base as f64) as f32;
            let a = samples[base.min(samples.len() - 1)];
            let b = samples[(base + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

// ============================================================================
// FFmpeg (subprocess)
// ============================================================================

/// FFmpeg-backed codec for MP3 canonical audio or foreign input formats.
pub struct FfmpegCodec {
    ffmpeg: String,
    ffprobe: String,
    sample_rate: u32,
    format: AudioFormat,
    timeout: Duration,
}

impl FfmpegCodec {
    pub fn new(
        ffmpeg: impl Into<String>,
        ffprobe: impl Into<String>,
        sample_rate: u32,
        format: AudioFormat,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            sample_rate,
            format,
            timeout: Duration::from_secs(600),
        }
    }

    fn codec_args(&self) -> &'static [&'static str] {
        match self.format {
            AudioFormat::Wav => &["-c:a", "pcm_s16le"],
            AudioFormat::Mp3 => &["-c:a", "libmp3lame", "-q:a", "4"],
        }
    }
}

impl AudioCodec for FfmpegCodec {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn probe(&self, path: &Path) -> Result<f64> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path);
        let out = run_command(cmd, None, self.timeout, &CancelFlag::new(), "ffprobe")
            .map_err(|e| Error::AudioUnreadable(format!("{}: {e}", path.display())))?;
        String::from_utf8_lossy(&out.stdout)
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::AudioUnreadable(format!("{}: no duration", path.display())))
    }

    fn transcode(&self, input: &Path, output: &Path, cancel: &CancelFlag) -> Result<()> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-y")
            .args(["-i"])
            .arg(input)
            .args(["-ac", "1", "-ar", &self.sample_rate.to_string()])
            .args(self.codec_args())
            .arg(output);
        run_command(cmd, None, self.timeout, cancel, "ffmpeg")
            .map_err(into_codec_failure)?;
        Ok(())
    }

    fn remove_ranges(
        &self,
        input: &Path,
        output: &Path,
        remove: &[(f64, f64)],
        cancel: &CancelFlag,
    ) -> Result<()> {
        if remove.is_empty() {
            return self.transcode(input, output, cancel);
        }
        let selector = remove
            .iter()
            .map(|(b, e)| format!("between(t,{b:.6},{e:.6})"))
            .collect::<Vec<_>>()
            .join("+");
        let filter = format!("aselect='not({selector})',asetpts=N/SR/TB");

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-y")
            .args(["-i"])
            .arg(input)
            .args(["-af", &filter])
            .args(self.codec_args())
            .arg(output);
        run_command(cmd, None, self.timeout, cancel, "ffmpeg")
            .map_err(into_codec_failure)?;
        Ok(())
    }
}

fn into_codec_failure(e: Error) -> Error {
    match e {
        Error::Canceled => Error::Canceled,
        Error::BackendTimeout { backend, seconds } => Error::BackendTimeout { backend, seconds },
        other => Error::CodecFailure(other.to_string()),
    }
}
