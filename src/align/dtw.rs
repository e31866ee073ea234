//! Dynamic-time-warping alignment.
//!
//! A reference waveform is re-synthesized from the token sequence, energy
//! envelopes of reference and canonical audio are warped onto each other,
//! and the reference's word boundaries are propagated through the warp path.
//! Reference boundaries come from the engine's provisional timings when
//! available, otherwise they are spread proportionally to token length.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::audio::tts::TtsEngine;
use crate::book::{AudioArtifact, TokenTable};
use crate::error::{Error, Result};
use crate::util::CancelFlag;

use super::{AlignBackend, Candidates, RawAlignment};

/// Envelope lengths are capped so the cost matrix stays small; the frame
/// duration grows with the audio instead.
const MAX_FRAMES: usize = 1500;
const MIN_FRAME_SECS: f64 = 0.02;

pub struct DtwAligner {
    tts: Arc<dyn TtsEngine>,
    fallback_voice: String,
}

impl DtwAligner {
    pub fn new(tts: Arc<dyn TtsEngine>, fallback_voice: impl Into<String>) -> Self {
        Self {
            tts,
            fallback_voice: fallback_voice.into(),
        }
    }
}

impl AlignBackend for DtwAligner {
    fn name(&self) -> &'static str {
        "dtw"
    }

    fn align(
        &self,
        audio: &Path,
        artifact: &AudioArtifact,
        tokens: &TokenTable,
        cancel: &CancelFlag,
    ) -> Result<RawAlignment> {
        if tokens.is_empty() {
            return Ok(RawAlignment {
                candidates: Vec::new(),
            });
        }

        let voice = artifact
            .voice
            .as_deref()
            .unwrap_or(self.fallback_voice.as_str());
        let reference = self.tts.synthesize(tokens, voice, cancel)?;

        let staging = tempfile::tempdir()?;
        let ref_path = staging.path().join("reference.wav");
        std::fs::write(&ref_path, &reference.wav)?;

        let (can_samples, can_rate) = read_mono(audio)?;
        let (ref_samples, ref_rate) = read_mono(&ref_path)?;
        let can_duration = can_samples.len() as f64 / can_rate as f64;
        let ref_duration = ref_samples.len() as f64 / ref_rate as f64;
        if can_duration <= 0.0 || ref_duration <= 0.0 {
            return Err(Error::AudioUnreadable("empty waveform".into()));
        }

        let frame = (can_duration.max(ref_duration) / MAX_FRAMES as f64).max(MIN_FRAME_SECS);
        let can_env = envelope(&can_samples, can_rate, frame);
        let ref_env = envelope(&ref_samples, ref_rate, frame);
        cancel.checkpoint()?;

        let (j_first, j_last) = warp_path(&ref_env, &can_env, cancel)?;
        debug!(
            ref_frames = ref_env.len(),
            can_frames = can_env.len(),
            frame_secs = frame,
            "computed warp path"
        );

        // reference-side word boundaries
        let boundaries: Vec<(f64, f64)> = match &reference.timings {
            Some(timings) if timings.len() == tokens.len() => {
                timings.iter().map(|t| (t.begin, t.end)).collect()
            }
            _ => proportional_boundaries(tokens, ref_duration),
        };

        let map_time = |t: f64, end_side: bool| -> f64 {
            let idx = ((t / frame) as usize).min(ref_env.len().saturating_sub(1));
            let mapped = if end_side {
                (j_last[idx] + 1) as f64 * frame
            } else {
                j_first[idx] as f64 * frame
            };
            mapped.clamp(0.0, can_duration)
        };

        let candidates: Vec<Candidates> = boundaries
            .iter()
            .map(|&(begin, end)| {
                let mapped_begin = map_time(begin, false);
                let mapped_end = map_time(end, true);
                if mapped_begin < mapped_end {
                    vec![(mapped_begin, mapped_end)]
                } else {
                    Vec::new()
                }
            })
            .collect();

        Ok(RawAlignment { candidates })
    }
}

/// Decode a WAV file to mono f32 at its native rate.
fn read_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
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
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// RMS energy envelope, z-normalized.
fn envelope(samples: &[f32], rate: u32, frame_secs: f64) -> Vec<f32> {
    let frame_len = ((rate as f64 * frame_secs) as usize).max(1);
    let mut env: Vec<f32> = samples
        .chunks(frame_len)
        .map(|frame| {
            let power: f32 = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
            power.sqrt()
        })
        .collect();
    if env.is_empty() {
        env.push(0.0);
    }

    let mean = env.iter().sum::<f32>() / env.len() as f32;
    let var = env.iter().map(|e| (e - mean) * (e - mean)).sum::<f32>() / env.len() as f32;
    let std = var.sqrt().max(1e-6);
    for e in &mut env {
        *e = (*e - mean) / std;
    }
    env
}

/// Full DTW between two envelopes. Returns, for each reference frame, the
/// first and last canonical frame matched by the optimal path.
fn warp_path(
    reference: &[f32],
    canonical: &[f32],
    cancel: &CancelFlag,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let n = reference.len();
    let m = canonical.len();
    let width = m + 1;

    let mut cost = vec![f32::INFINITY; (n + 1) * width];
    let mut step = vec![0u8; (n + 1) * width];
    cost[0] = 0.0;

    for i in 1..=n {
        if i % 128 == 0 {
            cancel.checkpoint()?;
        }
        for j in 1..=m {
            let local = (reference[i - 1] - canonical[j - 1]).abs();
            let diag = cost[(i - 1) * width + (j - 1)];
            let up = cost[(i - 1) * width + j];
            let left = cost[i * width + (j - 1)];

            let (best, dir) = if diag <= up && diag <= left {
                (diag, 0u8)
            } else if up <= left {
                (up, 1u8)
            } else {
                (left, 2u8)
            };
            if best.is_finite() {
                cost[i * width + j] = best + local;
                step[i * width + j] = dir;
            }
        }
    }

    let mut j_first = vec![usize::MAX; n];
    let mut j_last = vec![0usize; n];
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        let (ri, cj) = (i - 1, j - 1);
        j_first[ri] = j_first[ri].min(cj);
        j_last[ri] = j_last[ri].max(cj);
        match step[i * width + j] {
            0 => {
                i -= 1;
                j -= 1;
            }
            1 => i -= 1,
            _ => j -= 1,
        }
    }
    // frames never visited (degenerate paths) inherit their neighbor
    let mut prev = 0usize;
    for idx in 0..n {
        if j_first[idx] == usize::MAX {
            j_first[idx] = prev;
            j_last[idx] = prev;
        }
        prev = j_last[idx];
    }
    Ok((j_first, j_last))
}

/// Spread token boundaries across the reference duration proportionally to
/// surface length.
fn proportional_boundaries(tokens: &TokenTable, duration: f64) -> Vec<(f64, f64)> {
    let weights: Vec<f64> = tokens
        .iter()
        .map(|t| t.surface.chars().count() as f64 + 1.0)
        .collect();
    let total: f64 = weights.iter().sum();

    let mut boundaries = Vec::with_capacity(tokens.len());
    let mut cursor = 0.0;
    for weight in weights {
        let begin = duration * cursor / total;
        cursor += weight;
        let end = duration * cursor / total;
        boundaries.push((begin, end));
    }
    boundaries
}
