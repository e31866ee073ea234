//! Chapter translation seam.
//!
//! The translator receives the chapter's token stream and yields a
//! target-language token stream. Token counts are only approximately
//! preserved; downstream alignment is always built against the translated
//! table.

use std::process::Command;
use std::time::Duration;

use serde::Serialize;

use crate::book::TokenTable;
use crate::error::{Error, Result};
use crate::normalize::tokenize_plain;
use crate::util::{CancelFlag, run_command};

pub trait Translator: Send + Sync {
    fn translate(
        &self,
        tokens: &TokenTable,
        source_lang: &str,
        target_lang: &str,
        cancel: &CancelFlag,
    ) -> Result<TokenTable>;
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    source_lang: &'a str,
    target_lang: &'a str,
    text: String,
}

/// Subprocess translator speaking JSON on stdin, plain translated text on
/// stdout.
pub struct CommandTranslator {
    command: String,
    timeout: Duration,
}

impl CommandTranslator {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

impl Translator for CommandTranslator {
    fn translate(
        &self,
        tokens: &TokenTable,
        source_lang: &str,
        target_lang: &str,
        cancel: &CancelFlag,
    ) -> Result<TokenTable> {
        let request = TranslateRequest {
            source_lang,
            target_lang,
            text: tokens
                .iter()
                .map(|t| t.surface.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        };
        let stdin = serde_json::to_vec(&request)?;

        let cmd = Command::new(&self.command);
        let out = run_command(cmd, Some(stdin), self.timeout, cancel, "translator")?;
        let translated = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if translated.is_empty() {
            return Err(Error::BackendFailed {
                backend: "translator".into(),
                message: "empty translation".into(),
            });
        }
        Ok(tokenize_plain(&translated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Token;

    struct Reversing;

    impl Translator for Reversing {
        fn translate(
            &self,
            tokens: &TokenTable,
            _source_lang: &str,
            _target_lang: &str,
            _cancel: &CancelFlag,
        ) -> Result<TokenTable> {
            let text = tokens
                .iter()
                .rev()
                .map(|t| t.surface.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            Ok(tokenize_plain(&text))
        }
    }

    #[test]
    fn test_translated_tokens_get_fresh_ids() {
        let source = vec![
            Token {
                id: "w0".into(),
                surface: "hola".into(),
                normalized: "hola".into(),
            },
            Token {
                id: "w1".into(),
                surface: "mundo".into(),
                normalized: "mundo".into(),
            },
        ];
        let out = Reversing
            .translate(&source, "es", "en", &CancelFlag::new())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "w0");
        assert_eq!(out[0].surface, "mundo");
        assert_eq!(out[1].id, "w1");
    }
}
