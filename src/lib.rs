//! # readalong
//!
//! A server-side pipeline for synchronized read-along ebooks: ingest an
//! EPUB, obtain per-chapter narration (upload or text-to-speech, optionally
//! translated), force-align the audio to word tokens, apply time-range or
//! word-skip edits that keep audio and timing consistent, and export EPUB 3
//! with SMIL media overlays.
//!
//! ## Pipeline
//!
//! ```text
//! EPUB bytes -> unpack -> normalize -> chapter artifacts
//!   -> audio source (upload | tts | translate+tts)
//!   -> forced alignment -> sync table
//!   -> edits (range cut | skip cut | restore)
//!   -> EPUB 3 + SMIL export
//! ```
//!
//! Every mutating stage runs as a job under the pipeline controller, which
//! serializes work per `(book, chapter, language)` key, caches expensive
//! stages by content fingerprint, and streams typed progress events.
//!
//! ## Quick start
//!
//! ```no_run
//! use readalong::store::FsBlobStore;
//! use readalong::ingest::ingest_book;
//!
//! let store = FsBlobStore::new("./storage/books")?;
//! let bytes = std::fs::read("input.epub")?;
//! let book = ingest_book(&store, "/storage/books", uuid::Uuid::new_v4(), &bytes)?;
//! println!("{}: {} chapters", book.metadata.title, book.chapters.len());
//! # Ok::<(), readalong::Error>(())
//! ```

pub mod align;
pub mod audio;
pub mod book;
pub mod config;
pub mod edit;
pub mod epub;
pub mod error;
pub mod export;
pub mod ingest;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod server;
pub mod store;
pub mod util;

pub use book::{
    AudioArtifact, AudioFormat, AudioSourceKind, Book, BookMetadata, ChapterMeta, SyncEntry,
    SyncTable, TocNode, Token, TokenTable, TokenTiming,
};
pub use config::Config;
pub use error::{Error, Result};
pub use util::CancelFlag;
