//! The audio source manager: obtains the canonical audio for a
//! `(book, chapter, language)` key from an upload or from synthesis, keeps
//! the immutable source copy that backs `restore`, and records provenance.
//!
//! The pipeline controller serializes all of these per key; nothing here
//! guards against concurrent writers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::book::{
    AudioArtifact, AudioSourceKind, Book, EditOp, JournalRecord, TokenTable,
};
use crate::error::{Error, Result};
use crate::store::{BlobStore, load_json, paths, save_json};
use crate::util::CancelFlag;

use super::codec::AudioCodec;
use super::translate::Translator;
use super::tts::{TtsEngine, VoiceCatalog, voice_language};

pub struct AudioSourceManager {
    store: Arc<dyn BlobStore>,
    codec: Arc<dyn AudioCodec>,
    tts: Arc<dyn TtsEngine>,
    translator: Option<Arc<dyn Translator>>,
    catalog: Arc<VoiceCatalog>,
}

/// Result of building a source: the language key the artifact landed under
/// and its descriptor.
pub struct BuiltSource {
    pub lang: String,
    pub artifact: AudioArtifact,
}

impl AudioSourceManager {
    pub fn new(
        store: Arc<dyn BlobStore>,
        codec: Arc<dyn AudioCodec>,
        tts: Arc<dyn TtsEngine>,
        translator: Option<Arc<dyn Translator>>,
        catalog: Arc<VoiceCatalog>,
    ) -> Self {
        Self {
            store,
            codec,
            tts,
            translator,
            catalog,
        }
    }

    /// Accept uploaded narration for a chapter: transcode to the canonical
    /// codec and store both the canonical blob and the immutable source copy.
    pub fn upload(
        &self,
        book_id: &str,
        chapter: usize,
        lang: &str,
        bytes: &[u8],
        cancel: &CancelFlag,
    ) -> Result<AudioArtifact> {
        let staging = tempfile::tempdir()?;
        let input = staging.path().join("upload.bin");
        std::fs::write(&input, bytes)?;

        let ext = self.codec.format().extension();
        let canonical = staging.path().join(format!("canonical.{ext}"));
        self.codec.transcode(&input, &canonical, cancel)?;
        let duration = self.codec.probe(&canonical)?;

        let artifact = AudioArtifact {
            source: AudioSourceKind::Upload,
            voice: None,
            provisional_timing: None,
            format: self.codec.format(),
            duration,
        };
        self.publish(book_id, chapter, lang, &canonical, &artifact)?;
        info!(book = book_id, chapter, lang, duration, "stored uploaded audio");
        Ok(artifact)
    }

    /// Synthesize narration for a chapter with the given voice.
    ///
    /// The target language is the voice's locale prefix. With
    /// `use_translation`, a chapter whose language differs is first run
    /// through the translator and synthesis (and later alignment) uses the
    /// translated token table.
    pub fn synthesize(
        &self,
        book_id: &str,
        chapter: usize,
        voice: &str,
        use_translation: bool,
        cancel: &CancelFlag,
    ) -> Result<BuiltSource> {
        self.catalog.check(voice)?;
        let book: Book = load_json(self.store.as_ref(), book_id, &paths::metadata())?;
        let base_tokens: TokenTable =
            load_json(self.store.as_ref(), book_id, &paths::chapter_tokens(chapter))?;

        let target_lang = voice_language(voice);
        let chapter_lang = voice_language(&book.metadata.language);

        let (tokens, kind) = if use_translation && target_lang != chapter_lang {
            let translated = self.translate_tokens(
                book_id,
                chapter,
                &base_tokens,
                &chapter_lang,
                &target_lang,
                cancel,
            )?;
            (translated, AudioSourceKind::TtsTranslated)
        } else {
            (base_tokens, AudioSourceKind::Tts)
        };
        cancel.checkpoint()?;

        let synthesis = self.tts.synthesize(&tokens, voice, cancel)?;

        let staging = tempfile::tempdir()?;
        let raw = staging.path().join("synth.wav");
        std::fs::write(&raw, &synthesis.wav)?;
        let ext = self.codec.format().extension();
        let canonical = staging.path().join(format!("canonical.{ext}"));
        self.codec.transcode(&raw, &canonical, cancel)?;
        let duration = self.codec.probe(&canonical)?;

        let artifact = AudioArtifact {
            source: kind,
            voice: Some(voice.to_string()),
            provisional_timing: synthesis.timings,
            format: self.codec.format(),
            duration,
        };
        self.publish(book_id, chapter, &target_lang, &canonical, &artifact)?;
        let translated = kind == AudioSourceKind::TtsTranslated;
        info!(
            book = book_id,
            chapter,
            voice,
            lang = %target_lang,
            duration,
            translated,
            "synthesized chapter audio"
        );
        Ok(BuiltSource {
            lang: target_lang,
            artifact,
        })
    }

    /// Overwrite the canonical blob with the immutable source copy, clear
    /// the sync table, and journal the restore.
    pub fn restore(&self, book_id: &str, chapter: usize, lang: &str) -> Result<f64> {
        let mut artifact = self.artifact(book_id, chapter, lang)?;
        let ext = artifact.format.extension();
        let source_rel = paths::audio_source(lang, chapter, ext);
        if !self.store.exists(book_id, &source_rel) {
            return Err(Error::NotFound(format!(
                "source audio for {book_id}/{chapter}/{lang}"
            )));
        }

        let pre_duration = artifact.duration;
        let (staging, path) = self.materialize(book_id, &source_rel, ext)?;
        let post_duration = self.codec.probe(&path)?;
        drop(staging);

        self.store
            .copy(book_id, &source_rel, &paths::audio_canonical(lang, chapter, ext))?;
        self.store
            .delete(book_id, &paths::sync_table(lang, chapter))?;

        artifact.duration = post_duration;
        save_json(
            self.store.as_ref(),
            book_id,
            &paths::audio_descriptor(lang, chapter),
            &artifact,
        )?;

        let record = JournalRecord {
            op: EditOp::Restore,
            pre_duration,
            post_duration,
            applied_at: Utc::now(),
        };
        self.store.append_line(
            book_id,
            &paths::journal(lang, chapter),
            &serde_json::to_string(&record)?,
        )?;
        info!(book = book_id, chapter, lang, "restored source audio");
        Ok(post_duration)
    }

    /// Load the artifact descriptor for a key.
    pub fn artifact(&self, book_id: &str, chapter: usize, lang: &str) -> Result<AudioArtifact> {
        load_json(
            self.store.as_ref(),
            book_id,
            &paths::audio_descriptor(lang, chapter),
        )
    }

    /// The token table alignment runs against for a language key: the
    /// translated table when one exists, else the chapter's own.
    pub fn tokens_for(&self, book_id: &str, chapter: usize, lang: &str) -> Result<TokenTable> {
        let translated = paths::chapter_tokens_lang(chapter, lang);
        if self.store.exists(book_id, &translated) {
            load_json(self.store.as_ref(), book_id, &translated)
        } else {
            load_json(self.store.as_ref(), book_id, &paths::chapter_tokens(chapter))
        }
    }

    /// Copy a blob into a temp file so path-based codecs can read it.
    pub fn materialize(
        &self,
        book_id: &str,
        rel: &str,
        ext: &str,
    ) -> Result<(tempfile::TempDir, PathBuf)> {
        let bytes = self.store.get(book_id, rel)?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(format!("blob.{ext}"));
        std::fs::write(&path, bytes)?;
        Ok((dir, path))
    }

    /// Translate a chapter's token stream and persist the translated table.
    pub fn translate_chapter(
        &self,
        book_id: &str,
        chapter: usize,
        source_lang: &str,
        target_lang: &str,
        cancel: &CancelFlag,
    ) -> Result<TokenTable> {
        let base: TokenTable =
            load_json(self.store.as_ref(), book_id, &paths::chapter_tokens(chapter))?;
        self.translate_tokens(book_id, chapter, &base, source_lang, target_lang, cancel)
    }

    fn translate_tokens(
        &self,
        book_id: &str,
        chapter: usize,
        base: &TokenTable,
        source_lang: &str,
        target_lang: &str,
        cancel: &CancelFlag,
    ) -> Result<TokenTable> {
        let translator = self.translator.as_ref().ok_or_else(|| Error::BackendFailed {
            backend: "translator".into(),
            message: "no translator configured".into(),
        })?;
        let translated = translator.translate(base, source_lang, target_lang, cancel)?;
        save_json(
            self.store.as_ref(),
            book_id,
            &paths::chapter_tokens_lang(chapter, target_lang),
            &translated,
        )?;
        Ok(translated)
    }

    /// Publish a freshly built artifact: canonical blob, immutable source
    /// copy, descriptor. Any previous sync table and journal belong to the
    /// replaced audio and are dropped.
    fn publish(
        &self,
        book_id: &str,
        chapter: usize,
        lang: &str,
        canonical: &Path,
        artifact: &AudioArtifact,
    ) -> Result<()> {
        let ext = artifact.format.extension();
        let bytes = std::fs::read(canonical)?;
        self.store
            .put(book_id, &paths::audio_canonical(lang, chapter, ext), &bytes)?;
        self.store
            .put(book_id, &paths::audio_source(lang, chapter, ext), &bytes)?;
        self.store
            .delete(book_id, &paths::sync_table(lang, chapter))?;
        self.store.delete(book_id, &paths::journal(lang, chapter))?;
        save_json(
            self.store.as_ref(),
            book_id,
            &paths::audio_descriptor(lang, chapter),
            artifact,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::WavCodec;
    use crate::audio::tts::{Synthesis, Voice};
    use crate::book::{BookMetadata, Token};
    use crate::store::FsBlobStore;

    struct ToneTts;

    impl TtsEngine for ToneTts {
        fn voices(&self) -> Result<Vec<Voice>> {
            Ok(vec![Voice {
                id: "en-test".into(),
                language: "en".into(),
                name: "Test".into(),
            }])
        }

        fn synthesize(
            &self,
            tokens: &TokenTable,
            _voice: &str,
            _cancel: &CancelFlag,
        ) -> Result<Synthesis> {
            // one second of audio per token
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: 1000,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut cursor = std::io::Cursor::new(Vec::new());
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..tokens.len() * 1000 {
                writer.write_sample(100i16).unwrap();
            }
            writer.finalize().unwrap();
            Ok(Synthesis {
                wav: cursor.into_inner(),
                timings: None,
            })
        }
    }

    fn manager() -> (tempfile::TempDir, AudioSourceManager, String) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::new(dir.path().join("books")).unwrap());
        let tts: Arc<dyn TtsEngine> = Arc::new(ToneTts);
        let catalog = Arc::new(VoiceCatalog::initialize(tts.as_ref()));
        let manager = AudioSourceManager::new(
            Arc::clone(&store),
            Arc::new(WavCodec::new(1000)),
            tts,
            None,
            catalog,
        );

        let book = Book {
            id: uuid::Uuid::new_v4(),
            metadata: BookMetadata {
                title: "T".into(),
                language: "en".into(),
                ..Default::default()
            },
            toc: Vec::new(),
            chapters: Vec::new(),
            cover_href: None,
            created_at: Utc::now(),
        };
        let book_id = book.id.to_string();
        save_json(store.as_ref(), &book_id, &paths::metadata(), &book).unwrap();
        let tokens: TokenTable = vec![
            Token {
                id: "w0".into(),
                surface: "hello".into(),
                normalized: "hello".into(),
            },
            Token {
                id: "w1".into(),
                surface: "there".into(),
                normalized: "there".into(),
            },
        ];
        save_json(store.as_ref(), &book_id, &paths::chapter_tokens(0), &tokens).unwrap();
        (dir, manager, book_id)
    }

    #[test]
    fn test_synthesize_stores_canonical_and_source() {
        let (_dir, manager, book_id) = manager();
        let built = manager
            .synthesize(&book_id, 0, "en-test", false, &CancelFlag::new())
            .unwrap();
        assert_eq!(built.lang, "en");
        assert_eq!(built.artifact.source, AudioSourceKind::Tts);
        assert!((built.artifact.duration - 2.0).abs() < 1e-3);
        assert!(manager.store.exists(&book_id, &paths::audio_canonical("en", 0, "wav")));
        assert!(manager.store.exists(&book_id, &paths::audio_source("en", 0, "wav")));
    }

    #[test]
    fn test_unknown_voice_rejected() {
        let (_dir, manager, book_id) = manager();
        assert!(matches!(
            manager.synthesize(&book_id, 0, "nope", false, &CancelFlag::new()),
            Err(Error::UnknownVoice(_))
        ));
    }

    #[test]
    fn test_restore_resets_canonical_and_clears_sync() {
        let (_dir, manager, book_id) = manager();
        manager
            .synthesize(&book_id, 0, "en-test", false, &CancelFlag::new())
            .unwrap();

        // simulate an edited canonical blob and a stale sync table
        let short = {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: 1000,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut cursor = std::io::Cursor::new(Vec::new());
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..500 {
                writer.write_sample(5i16).unwrap();
            }
            writer.finalize().unwrap();
            cursor.into_inner()
        };
        manager
            .store
            .put(&book_id, &paths::audio_canonical("en", 0, "wav"), &short)
            .unwrap();
        manager
            .store
            .put(&book_id, &paths::sync_table("en", 0), b"[]")
            .unwrap();

        let duration = manager.restore(&book_id, 0, "en").unwrap();
        assert!((duration - 2.0).abs() < 1e-3);
        assert!(!manager.store.exists(&book_id, &paths::sync_table("en", 0)));
        let journal = manager
            .store
            .get(&book_id, &paths::journal("en", 0))
            .unwrap();
        assert!(String::from_utf8_lossy(&journal).contains("restore"));
    }

    #[test]
    fn test_restore_without_audio_is_not_found() {
        let (_dir, manager, book_id) = manager();
        assert!(matches!(
            manager.restore(&book_id, 0, "en"),
            Err(Error::NotFound(_))
        ));
    }
}
