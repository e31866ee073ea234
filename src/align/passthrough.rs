//! Boundary passthrough: adopt the TTS engine's provisional per-token
//! boundaries directly. Cheapest backend; only used when the provisional
//! table is reliable (see [`PassthroughAligner::eligible`]).

use std::collections::HashMap;
use std::path::Path;

use crate::book::{AudioArtifact, TokenTable, TokenTiming};
use crate::error::{Error, Result};
use crate::util::CancelFlag;

use super::{AlignBackend, RawAlignment};

pub struct PassthroughAligner;

impl PassthroughAligner {
    /// Provisional timing is trusted when it covers at least `min_coverage`
    /// of the tokens with monotone, non-overlapping intervals.
    pub fn eligible(artifact: &AudioArtifact, tokens: &TokenTable, min_coverage: f64) -> bool {
        let Some(timing) = &artifact.provisional_timing else {
            return false;
        };
        let by_id: HashMap<&str, &TokenTiming> =
            timing.iter().map(|t| (t.token_id.as_str(), t)).collect();

        let mut covered = 0usize;
        let mut last_end = f64::NEG_INFINITY;
        for token in tokens {
            if let Some(t) = by_id.get(token.id.as_str()) {
                if t.begin >= t.end || t.begin < last_end {
                    return false;
                }
                last_end = t.end;
                covered += 1;
            }
        }
        covered as f64 >= min_coverage * tokens.len() as f64
    }
}

impl AlignBackend for PassthroughAligner {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn align(
        &self,
        _audio: &Path,
        artifact: &AudioArtifact,
        tokens: &TokenTable,
        cancel: &CancelFlag,
    ) -> Result<RawAlignment> {
        cancel.checkpoint()?;
        let timing = artifact
            .provisional_timing
            .as_ref()
            .ok_or_else(|| Error::Invariant("passthrough without provisional timing".into()))?;
        let by_id: HashMap<&str, &TokenTiming> =
            timing.iter().map(|t| (t.token_id.as_str(), t)).collect();

        let candidates = tokens
            .iter()
            .map(|token| match by_id.get(token.id.as_str()) {
                Some(t) => vec![(t.begin, t.end)],
                None => Vec::new(),
            })
            .collect();
        Ok(RawAlignment { candidates })
    }
}
