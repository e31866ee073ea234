//! Forced alignment: turning a chapter's canonical audio plus its token
//! sequence into the authoritative sync table.
//!
//! Backends are polymorphic behind [`AlignBackend`] and return raw candidate
//! intervals; [`finalize`] applies the shared post-conditions in order —
//! token bijection, monotonicity repair, bounds clipping, and the coverage
//! floor — so every backend yields the same output shape and adding one
//! never touches the controller.

pub mod asr;
pub mod dtw;
pub mod passthrough;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::book::{AudioArtifact, SyncEntry, SyncTable, TokenTable};
use crate::error::{Error, Result};
use crate::util::CancelFlag;

pub use asr::CommandAligner;
pub use dtw::DtwAligner;
pub use passthrough::PassthroughAligner;

/// Alignment request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignMode {
    /// Always refine with the requested backend.
    Word,
    /// Trust reliable provisional TTS boundaries, else refine.
    Auto,
}

/// Candidate intervals for one token, as produced by a backend.
pub type Candidates = Vec<(f64, f64)>;

/// Raw backend output: per-token candidates, index-aligned with the token
/// table. An empty candidate list leaves the token untimed.
pub struct RawAlignment {
    pub candidates: Vec<Candidates>,
}

pub trait AlignBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn align(
        &self,
        audio: &Path,
        artifact: &AudioArtifact,
        tokens: &TokenTable,
        cancel: &CancelFlag,
    ) -> Result<RawAlignment>;
}

/// Run a backend and enforce the alignment post-conditions.
pub fn run(
    backend: &dyn AlignBackend,
    audio: &Path,
    artifact: &AudioArtifact,
    tokens: &TokenTable,
    min_coverage: f64,
    cancel: &CancelFlag,
) -> Result<SyncTable> {
    let raw = backend.align(audio, artifact, tokens, cancel)?;
    let table = finalize(raw, tokens, artifact.duration, min_coverage)?;
    debug!(
        backend = backend.name(),
        tokens = tokens.len(),
        timed = table.timed_count(),
        "alignment complete"
    );
    Ok(table)
}

/// Apply the post-conditions to raw backend output, in order.
pub fn finalize(
    raw: RawAlignment,
    tokens: &TokenTable,
    duration: f64,
    min_coverage: f64,
) -> Result<SyncTable> {
    // 1. Bijection: one entry per token, in token order.
    if raw.candidates.len() != tokens.len() {
        return Err(Error::Invariant(format!(
            "backend produced {} candidate sets for {} tokens",
            raw.candidates.len(),
            tokens.len()
        )));
    }

    let mut entries = resolve_candidates(&raw.candidates, tokens);

    // 2. Monotonicity: repair overlaps between consecutive timed entries by
    //    splitting at the midpoint of the overlap.
    repair_overlaps(&mut entries);

    // 3. Bounds: clip into [0, duration]; degenerate intervals go untimed.
    for entry in &mut entries {
        if let Some((begin, end)) = entry.interval() {
            let begin = begin.max(0.0);
            let end = end.min(duration);
            if begin < end {
                entry.clip_begin = Some(begin);
                entry.clip_end = Some(end);
            } else {
                entry.clip_begin = None;
                entry.clip_end = None;
            }
        }
    }

    // 4. Coverage floor.
    let table = SyncTable::new(entries);
    let timed = table.timed_count();
    if (timed as f64) < min_coverage * tokens.len() as f64 {
        return Err(Error::AlignmentDiverged {
            timed,
            total: tokens.len(),
            minimum: min_coverage,
        });
    }

    table.validate(tokens, duration)?;
    Ok(table)
}

/// Pick one interval per token: the earliest-starting candidate whose end
/// does not run past the next token's earliest candidate start, else the
/// earliest-starting candidate outright.
fn resolve_candidates(candidates: &[Candidates], tokens: &TokenTable) -> Vec<SyncEntry> {
    let next_start: Vec<Option<f64>> = (0..candidates.len())
        .map(|i| {
            candidates[i + 1..]
                .iter()
                .find(|c| !c.is_empty())
                .and_then(|c| {
                    c.iter()
                        .map(|(b, _)| *b)
                        .min_by(|a, b| a.total_cmp(b))
                })
        })
        .collect();

    candidates
        .iter()
        .zip(tokens)
        .enumerate()
        .map(|(i, (cands, token))| {
            let mut sorted: Vec<(f64, f64)> = cands.iter().copied().filter(|(b, e)| e > b).collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
            let chosen = match next_start[i] {
                Some(limit) => sorted
                    .iter()
                    .find(|(_, end)| *end <= limit)
                    .or_else(|| sorted.first()),
                None => sorted.first(),
            };
            match chosen {
                Some(&(begin, end)) => SyncEntry::timed(&token.id, begin, end),
                None => SyncEntry::untimed(&token.id),
            }
        })
        .collect()
}

fn repair_overlaps(entries: &mut [SyncEntry]) {
    let mut prev_timed: Option<usize> = None;
    for i in 0..entries.len() {
        let Some((begin, end)) = entries[i].interval() else {
            continue;
        };
        if let Some(p) = prev_timed
            && let Some((prev_begin, prev_end)) = entries[p].interval()
            && begin < prev_end
        {
            let mid = ((prev_end + begin) / 2.0).clamp(prev_begin, end);
            if mid > prev_begin {
                entries[p].clip_end = Some(mid);
            } else {
                entries[p].clip_begin = None;
                entries[p].clip_end = None;
            }
            if mid < end {
                entries[i].clip_begin = Some(mid);
            } else {
                entries[i].clip_begin = None;
                entries[i].clip_end = None;
            }
        }
        if entries[i].is_timed() {
            prev_timed = Some(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Token;

    fn tokens(n: usize) -> TokenTable {
        (0..n)
            .map(|i| Token {
                id: format!("w{i}"),
                surface: format!("t{i}"),
                normalized: format!("t{i}"),
            })
            .collect()
    }

    #[test]
    fn test_finalize_happy_path() {
        let raw = RawAlignment {
            candidates: vec![vec![(0.0, 0.5)], vec![(0.5, 1.0)], vec![(1.2, 1.8)]],
        };
        let table = finalize(raw, &tokens(3), 2.0, 0.8).unwrap();
        assert_eq!(table.timed_count(), 3);
        assert_eq!(table.entries[2].interval(), Some((1.2, 1.8)));
    }

    #[test]
    fn test_finalize_rejects_wrong_length() {
        let raw = RawAlignment {
            candidates: vec![vec![(0.0, 0.5)]],
        };
        assert!(matches!(
            finalize(raw, &tokens(2), 2.0, 0.0),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_overlap_split_at_midpoint() {
        let raw = RawAlignment {
            candidates: vec![vec![(0.0, 1.0)], vec![(0.8, 1.6)]],
        };
        let table = finalize(raw, &tokens(2), 2.0, 0.0).unwrap();
        assert_eq!(table.entries[0].interval(), Some((0.0, 0.9)));
        assert_eq!(table.entries[1].interval(), Some((0.9, 1.6)));
    }

    #[test]
    fn test_bounds_clipped() {
        let raw = RawAlignment {
            candidates: vec![vec![(-0.5, 0.5)], vec![(1.0, 9.0)]],
        };
        let table = finalize(raw, &tokens(2), 2.0, 0.0).unwrap();
        assert_eq!(table.entries[0].interval(), Some((0.0, 0.5)));
        assert_eq!(table.entries[1].interval(), Some((1.0, 2.0)));
    }

    #[test]
    fn test_coverage_floor_fails() {
        let raw = RawAlignment {
            candidates: vec![vec![(0.0, 0.5)], vec![], vec![], vec![]],
        };
        let err = finalize(raw, &tokens(4), 2.0, 0.8).unwrap_err();
        match err {
            Error::AlignmentDiverged { timed, total, .. } => {
                assert_eq!(timed, 1);
                assert_eq!(total, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tie_break_prefers_fitting_candidate() {
        // first token has two candidates; only the earlier one ends before
        // the next token begins
        let raw = RawAlignment {
            candidates: vec![vec![(0.6, 1.4), (0.0, 0.5)], vec![(0.9, 1.5)]],
        };
        let table = finalize(raw, &tokens(2), 2.0, 0.0).unwrap();
        assert_eq!(table.entries[0].interval(), Some((0.0, 0.5)));
        assert_eq!(table.entries[1].interval(), Some((0.9, 1.5)));
    }

    #[test]
    fn test_untimed_tokens_stay_untimed() {
        let raw = RawAlignment {
            candidates: vec![vec![(0.0, 0.5)], vec![], vec![(0.7, 1.0)]],
        };
        let table = finalize(raw, &tokens(3), 2.0, 0.5).unwrap();
        assert!(!table.entries[1].is_timed());
        assert!(!table.entries[1].skipped);
    }
}
