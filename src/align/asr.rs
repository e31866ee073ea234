//! ASR-based forced alignment via an external aligner subprocess.
//!
//! The aligner receives the audio path as its argument and a JSON request on
//! stdin carrying the constraining transcript; it answers with a JSON array
//! of word timings. Multiple records for one index become competing
//! candidates resolved by the shared tie-break.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::book::{AudioArtifact, TokenTable};
use crate::error::{Error, Result};
use crate::util::{CancelFlag, run_command};

use super::{AlignBackend, Candidates, RawAlignment};

#[derive(Serialize)]
struct AlignRequest<'a> {
    language: Option<&'a str>,
    transcript: Vec<&'a str>,
}

/// One word timing in the aligner's response. `index` addresses the
/// transcript position.
#[derive(Debug, Deserialize)]
struct AlignedWord {
    index: usize,
    begin: f64,
    end: f64,
}

pub struct CommandAligner {
    command: String,
    timeout: Duration,
}

impl CommandAligner {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

impl AlignBackend for CommandAligner {
    fn name(&self) -> &'static str {
        "asr"
    }

    fn align(
        &self,
        audio: &Path,
        artifact: &AudioArtifact,
        tokens: &TokenTable,
        cancel: &CancelFlag,
    ) -> Result<RawAlignment> {
        let request = AlignRequest {
            language: artifact.voice.as_deref(),
            transcript: tokens.iter().map(|t| t.surface.as_str()).collect(),
        };
        let stdin = serde_json::to_vec(&request)?;

        let mut cmd = Command::new(&self.command);
        cmd.arg(audio);
        let out = run_command(cmd, Some(stdin), self.timeout, cancel, "aligner")?;

        let words: Vec<AlignedWord> =
            serde_json::from_slice(&out.stdout).map_err(|e| Error::BackendFailed {
                backend: "aligner".into(),
                message: format!("unparseable response: {e}"),
            })?;

        let mut candidates: Vec<Candidates> = vec![Vec::new(); tokens.len()];
        for word in words {
            if let Some(slot) = candidates.get_mut(word.index) {
                slot.push((word.begin, word.end));
            }
        }
        Ok(RawAlignment { candidates })
    }
}
