//! The audio editor: time-range cuts and word-skip cuts that rewrite the
//! canonical audio and the sync table as a single unit, plus the journal
//! records that make the current state re-derivable from the source copy.
//!
//! The new blob is prepared in a staging directory and published with an
//! atomic swap; a failed codec run or a post-edit invariant violation leaves
//! the previous canonical state untouched.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::audio::codec::AudioCodec;
use crate::book::{AudioArtifact, EditOp, JournalRecord, SyncEntry, SyncTable, TokenTable};
use crate::error::{Error, Result};
use crate::store::{BlobStore, load_json, paths, save_json};
use crate::util::{CancelFlag, coalesce_intervals};

/// Result of a successful edit.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub duration: f64,
    pub sync_table: SyncTable,
}

pub struct AudioEditor {
    store: Arc<dyn BlobStore>,
    codec: Arc<dyn AudioCodec>,
}

impl AudioEditor {
    pub fn new(store: Arc<dyn BlobStore>, codec: Arc<dyn AudioCodec>) -> Self {
        Self { store, codec }
    }

    /// Remove the audio in `[trim_start, trim_end)`. Entries straddling the
    /// cut become skipped; entries after it shift left.
    pub fn range_cut(
        &self,
        book_id: &str,
        chapter: usize,
        lang: &str,
        trim_start: f64,
        trim_end: f64,
        cancel: &CancelFlag,
    ) -> Result<EditOutcome> {
        let artifact = self.load_artifact(book_id, chapter, lang)?;
        if !(0.0 <= trim_start && trim_start < trim_end && trim_end <= artifact.duration) {
            return Err(Error::InvalidRange(format!(
                "[{trim_start}, {trim_end}) outside [0, {})",
                artifact.duration
            )));
        }

        let old_table = self.load_sync(book_id, chapter, lang)?;
        let new_table = old_table
            .as_ref()
            .map(|t| apply_range_cut(t, trim_start, trim_end));

        let record = JournalRecord {
            op: EditOp::RangeCut {
                trim_start,
                trim_end,
            },
            pre_duration: artifact.duration,
            post_duration: 0.0,
            applied_at: Utc::now(),
        };
        self.apply(
            book_id,
            chapter,
            lang,
            artifact,
            &[(trim_start, trim_end)],
            new_table,
            record,
            cancel,
        )
    }

    /// Remove the union of intervals belonging to `skip_word_ids`. Only
    /// currently timed, non-skipped entries are eligible; the rest of the
    /// table shifts by the removed mass before each entry.
    pub fn skip_cut(
        &self,
        book_id: &str,
        chapter: usize,
        lang: &str,
        skip_word_ids: &BTreeSet<String>,
        cancel: &CancelFlag,
    ) -> Result<EditOutcome> {
        let artifact = self.load_artifact(book_id, chapter, lang)?;
        let old_table = self.load_sync(book_id, chapter, lang)?.ok_or_else(|| {
            Error::InvalidRange("no sync table; run alignment before skip cuts".into())
        })?;

        let (new_table, removed) = apply_skip_cut(&old_table, skip_word_ids);
        if removed.is_empty() {
            return Err(Error::InvalidRange(
                "no eligible timed tokens among skip_word_ids".into(),
            ));
        }

        let record = JournalRecord {
            op: EditOp::SkipCut {
                skip_word_ids: skip_word_ids.iter().cloned().collect(),
            },
            pre_duration: artifact.duration,
            post_duration: 0.0,
            applied_at: Utc::now(),
        };
        self.apply(
            book_id,
            chapter,
            lang,
            artifact,
            &removed,
            Some(new_table),
            record,
            cancel,
        )
    }

    /// Cut `remove` out of the canonical blob and publish audio, sync table,
    /// descriptor, and journal together.
    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        book_id: &str,
        chapter: usize,
        lang: &str,
        mut artifact: AudioArtifact,
        remove: &[(f64, f64)],
        new_table: Option<SyncTable>,
        mut record: JournalRecord,
        cancel: &CancelFlag,
    ) -> Result<EditOutcome> {
        let ext = artifact.format.extension();
        let canonical_rel = paths::audio_canonical(lang, chapter, ext);

        let staging = tempfile::tempdir()?;
        let input = staging.path().join(format!("in.{ext}"));
        let output = staging.path().join(format!("out.{ext}"));
        std::fs::write(&input, self.store.get(book_id, &canonical_rel)?)?;

        self.codec.remove_ranges(&input, &output, remove, cancel)?;
        let new_duration = self.codec.probe(&output)?;

        if let Some(table) = &new_table {
            let tokens = self.tokens_for(book_id, chapter, lang)?;
            if let Err(violation) = table.validate(&tokens, new_duration) {
                // abort before publishing anything; canonical state unchanged
                error!(
                    book = book_id,
                    chapter,
                    lang,
                    error = %violation,
                    "post-edit sync table violated invariants; edit rolled back"
                );
                return Err(violation);
            }
        }
        cancel.checkpoint()?;

        let bytes = std::fs::read(&output)?;
        self.store.put(book_id, &canonical_rel, &bytes)?;
        if let Some(table) = &new_table {
            save_json(
                self.store.as_ref(),
                book_id,
                &paths::sync_table(lang, chapter),
                table,
            )?;
        }
        artifact.duration = new_duration;
        save_json(
            self.store.as_ref(),
            book_id,
            &paths::audio_descriptor(lang, chapter),
            &artifact,
        )?;

        record.post_duration = new_duration;
        self.store.append_line(
            book_id,
            &paths::journal(lang, chapter),
            &serde_json::to_string(&record)?,
        )?;

        info!(
            book = book_id,
            chapter,
            lang,
            pre = record.pre_duration,
            post = new_duration,
            "applied audio edit"
        );
        Ok(EditOutcome {
            duration: new_duration,
            sync_table: new_table.unwrap_or_default(),
        })
    }

    fn load_artifact(&self, book_id: &str, chapter: usize, lang: &str) -> Result<AudioArtifact> {
        load_json(
            self.store.as_ref(),
            book_id,
            &paths::audio_descriptor(lang, chapter),
        )
        .map_err(|e| match e {
            Error::NotFound(_) => {
                Error::NotFound(format!("canonical audio for {book_id}/{chapter}/{lang}"))
            }
            other => other,
        })
    }

    fn load_sync(&self, book_id: &str, chapter: usize, lang: &str) -> Result<Option<SyncTable>> {
        match load_json(
            self.store.as_ref(),
            book_id,
            &paths::sync_table(lang, chapter),
        ) {
            Ok(table) => Ok(Some(table)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn tokens_for(&self, book_id: &str, chapter: usize, lang: &str) -> Result<TokenTable> {
        let translated = paths::chapter_tokens_lang(chapter, lang);
        if self.store.exists(book_id, &translated) {
            load_json(self.store.as_ref(), book_id, &translated)
        } else {
            load_json(self.store.as_ref(), book_id, &paths::chapter_tokens(chapter))
        }
    }
}

// ============================================================================
// Sync-table arithmetic
// ============================================================================

/// Rewrite a sync table for the removal of `[trim_start, trim_end)`.
pub fn apply_range_cut(table: &SyncTable, trim_start: f64, trim_end: f64) -> SyncTable {
    let cut = trim_end - trim_start;
    let entries = table
        .entries
        .iter()
        .map(|entry| match entry.interval() {
            Some((begin, end)) if !entry.skipped => {
                if end <= trim_start {
                    entry.clone()
                } else if begin >= trim_end {
                    SyncEntry::timed(&entry.token_id, begin - cut, end - cut)
                } else {
                    // straddles the cut; no longer time-addressable
                    SyncEntry {
                        token_id: entry.token_id.clone(),
                        clip_begin: None,
                        clip_end: None,
                        skipped: true,
                    }
                }
            }
            _ => entry.clone(),
        })
        .collect();
    SyncTable::new(entries)
}

/// Rewrite a sync table for the removal of the named tokens' intervals.
/// Returns the new table and the coalesced removed ranges.
pub fn apply_skip_cut(
    table: &SyncTable,
    skip_word_ids: &BTreeSet<String>,
) -> (SyncTable, Vec<(f64, f64)>) {
    let removed: Vec<(f64, f64)> = table
        .entries
        .iter()
        .filter(|e| !e.skipped && skip_word_ids.contains(&e.token_id))
        .filter_map(|e| e.interval())
        .collect();
    let removed = coalesce_intervals(removed);

    let entries = table
        .entries
        .iter()
        .map(|entry| {
            if !entry.skipped && entry.is_timed() && skip_word_ids.contains(&entry.token_id) {
                return SyncEntry {
                    token_id: entry.token_id.clone(),
                    clip_begin: None,
                    clip_end: None,
                    skipped: true,
                };
            }
            match entry.interval() {
                Some((begin, end)) if !entry.skipped => {
                    let shift = removed_mass_before(&removed, begin);
                    SyncEntry::timed(&entry.token_id, begin - shift, end - shift)
                }
                _ => entry.clone(),
            }
        })
        .collect();
    (SyncTable::new(entries), removed)
}

/// Total removed duration strictly before `position`.
fn removed_mass_before(removed: &[(f64, f64)], position: f64) -> f64 {
    removed
        .iter()
        .map(|&(begin, end)| (end.min(position) - begin).max(0.0))
        .sum()
}
