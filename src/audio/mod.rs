//! Audio acquisition and processing: codecs, synthesis engines, translation,
//! and the per-chapter source manager.

pub mod codec;
pub mod source;
pub mod translate;
pub mod tts;

pub use codec::{AudioCodec, FfmpegCodec, WavCodec};
pub use source::{AudioSourceManager, BuiltSource};
pub use translate::{CommandTranslator, Translator};
pub use tts::{EspeakEngine, Synthesis, TtsEngine, Voice, VoiceCatalog, voice_language};
