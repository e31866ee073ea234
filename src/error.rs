//! Error types for readalong operations.

use thiserror::Error;

/// Errors that can occur during ingestion, synthesis, alignment, editing,
/// or export.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    #[error("Unsupported package: {0}")]
    UnsupportedPackage(String),

    #[error("Missing asset: {0}")]
    AssetMissing(String),

    #[error("Unreadable audio: {0}")]
    AudioUnreadable(String),

    #[error("Alignment diverged: {timed} of {total} tokens timed, minimum coverage {minimum}")]
    AlignmentDiverged {
        timed: usize,
        total: usize,
        minimum: f64,
    },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Codec failure: {0}")]
    CodecFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend {backend} failed: {message}")]
    BackendFailed { backend: String, message: String },

    #[error("Backend {backend} timed out after {seconds}s")]
    BackendTimeout { backend: String, seconds: u64 },

    #[error("Unknown voice: {0}")]
    UnknownVoice(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Invariant violation: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether a failed stage may be retried with backoff.
    ///
    /// Only backend timeouts and connection-shaped I/O failures qualify;
    /// everything else is rejected at the boundary or surfaced as a
    /// permanent job failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::BackendTimeout { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Short machine-readable reason emitted on `error` progress events.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::MalformedContainer(_) => "malformed_container",
            Error::UnsupportedPackage(_) => "unsupported_package",
            Error::AssetMissing(_) => "asset_missing",
            Error::AudioUnreadable(_) => "audio_unreadable",
            Error::AlignmentDiverged { .. } => "alignment_diverged",
            Error::InvalidRange(_) => "invalid_range",
            Error::CodecFailure(_) => "codec_failure",
            Error::NotFound(_) => "not_found",
            Error::BackendFailed { .. } => "backend_failed",
            Error::BackendTimeout { .. } => "backend_timeout",
            Error::UnknownVoice(_) => "unknown_voice",
            Error::Canceled => "canceled",
            Error::Invariant(_) => "invariant_violation",
            _ => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(
            Error::BackendTimeout {
                backend: "tts".into(),
                seconds: 120
            }
            .is_transient()
        );
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(
            !Error::AlignmentDiverged {
                timed: 1,
                total: 10,
                minimum: 0.8
            }
            .is_transient()
        );
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(Error::Canceled.reason(), "canceled");
        assert_eq!(
            Error::AlignmentDiverged {
                timed: 0,
                total: 1,
                minimum: 0.8
            }
            .reason(),
            "alignment_diverged"
        );
    }
}
