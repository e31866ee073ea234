//! Core data types for books, chapters, tokens, audio artifacts, and
//! token-to-audio synchronization.
//!
//! These are the persisted shapes: every struct here serializes with serde
//! into the per-book blob layout (see [`crate::store`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Timing comparisons tolerate float noise below one microsecond.
const EPS: f64 = 1e-6;

// ============================================================================
// Book
// ============================================================================

/// Book metadata (Dublin Core subset).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    pub authors: Vec<String>,
    pub language: String,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

/// A table of contents node (hierarchical).
///
/// `chapter_index` is the spine position the entry's href resolves to;
/// entries whose target could not be resolved keep index 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocNode {
    pub title: String,
    pub href: String,
    pub chapter_index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TocNode>,
}

impl TocNode {
    pub fn new(title: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            href: href.into(),
            chapter_index: 0,
            children: Vec::new(),
        }
    }
}

/// Per-chapter record kept in the book's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterMeta {
    pub index: usize,
    pub title: String,
    pub word_count: usize,
}

/// A book record: immutable identity plus derived structure.
///
/// Created on successful ingestion; the heavy payloads (normalized HTML,
/// token tables, audio) live in the blob store under the book's namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: Uuid,
    pub metadata: BookMetadata,
    pub toc: Vec<TocNode>,
    pub chapters: Vec<ChapterMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_href: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Tokens
// ============================================================================

/// One word token of a normalized chapter.
///
/// `id` is the `w{N}` span id in the chapter HTML; it is chapter-scoped and
/// stable across re-normalization of byte-identical input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub surface: String,
    pub normalized: String,
}

pub type TokenTable = Vec<Token>;

/// Provisional per-token boundary reported by a TTS engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTiming {
    pub token_id: String,
    pub begin: f64,
    pub end: f64,
}

// ============================================================================
// Audio artifacts
// ============================================================================

/// Provenance of a chapter's canonical audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSourceKind {
    Upload,
    Tts,
    TtsTranslated,
}

/// Canonical audio codec/container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Wav,
    Mp3,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
        }
    }
}

/// Descriptor of the audio attached to a `(book, chapter, language)` key.
///
/// The canonical blob is the current, possibly edited audio; the immutable
/// source copy backs `restore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub source: AudioSourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisional_timing: Option<Vec<TokenTiming>>,
    pub format: AudioFormat,
    /// Duration of the canonical blob, seconds.
    pub duration: f64,
}

// ============================================================================
// SyncTable
// ============================================================================

/// One token's time interval in the canonical audio.
///
/// Timed entries carry both bounds; a skipped entry (cut out by an edit) and
/// an unalignable entry both carry none, distinguished by the `skipped` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub token_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_begin: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_end: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl SyncEntry {
    pub fn timed(token_id: impl Into<String>, begin: f64, end: f64) -> Self {
        Self {
            token_id: token_id.into(),
            clip_begin: Some(begin),
            clip_end: Some(end),
            skipped: false,
        }
    }

    pub fn untimed(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            clip_begin: None,
            clip_end: None,
            skipped: false,
        }
    }

    pub fn is_timed(&self) -> bool {
        self.clip_begin.is_some() && self.clip_end.is_some()
    }

    /// Both bounds, when timed.
    pub fn interval(&self) -> Option<(f64, f64)> {
        match (self.clip_begin, self.clip_end) {
            (Some(b), Some(e)) => Some((b, e)),
            _ => None,
        }
    }
}

/// The authoritative mapping from a chapter's tokens to audio intervals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncTable {
    pub entries: Vec<SyncEntry>,
}

impl SyncTable {
    pub fn new(entries: Vec<SyncEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries carrying a time interval.
    pub fn timed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_timed()).count()
    }

    /// Fraction of entries carrying a time interval.
    pub fn coverage(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.timed_count() as f64 / self.entries.len() as f64
    }

    /// Enforce the structural invariants against a token table and the
    /// canonical duration.
    ///
    /// Checked, in order: token-id bijection with the table, null bounds on
    /// skipped and unalignable entries, per-entry bounds within
    /// `[0, duration]`, and monotone non-overlap across timed entries.
    pub fn validate(&self, tokens: &TokenTable, duration: f64) -> Result<()> {
        if self.entries.len() != tokens.len() {
            return Err(Error::Invariant(format!(
                "sync table has {} entries for {} tokens",
                self.entries.len(),
                tokens.len()
            )));
        }
        for (entry, token) in self.entries.iter().zip(tokens) {
            if entry.token_id != token.id {
                return Err(Error::Invariant(format!(
                    "sync entry {} does not match token {}",
                    entry.token_id, token.id
                )));
            }
        }

        let mut last_end: Option<f64> = None;
        for entry in &self.entries {
            match entry.interval() {
                Some((begin, end)) => {
                    if entry.skipped {
                        return Err(Error::Invariant(format!(
                            "skipped entry {} carries timing",
                            entry.token_id
                        )));
                    }
                    if begin < -EPS || end > duration + EPS || begin >= end {
                        return Err(Error::Invariant(format!(
                            "entry {} interval [{begin}, {end}) outside [0, {duration})",
                            entry.token_id
                        )));
                    }
                    if let Some(prev) = last_end
                        && begin < prev - EPS
                    {
                        return Err(Error::Invariant(format!(
                            "entry {} begins at {begin} before previous end {prev}",
                            entry.token_id
                        )));
                    }
                    last_end = Some(end);
                }
                None => {
                    if entry.clip_begin.is_some() || entry.clip_end.is_some() {
                        return Err(Error::Invariant(format!(
                            "entry {} carries a single bound",
                            entry.token_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Edit journal
// ============================================================================

/// An edit operation, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOp {
    RangeCut { trim_start: f64, trim_end: f64 },
    SkipCut { skip_word_ids: Vec<String> },
    Restore,
}

/// One line of the append-only edit journal.
///
/// Replaying the journal against the immutable source audio deterministically
/// rebuilds the current canonical state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    #[serde(flatten)]
    pub op: EditOp,
    pub pre_duration: f64,
    pub post_duration: f64,
    pub applied_at: DateTime<Utc>,
}
