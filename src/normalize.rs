//! Chapter normalization: rewrite raw chapter XHTML into reader-ready HTML
//! with one `<span id="wN">` per word token, plus the chapter's token table.
//!
//! The rewrite is a single streaming pass (reader events in, writer events
//! out), so byte-identical input produces byte-identical output and stable
//! token ids. Scripts, event-handler attributes, and HTML imports are
//! dropped; URL-bearing attributes are rebased through an
//! [`AssetUrlRewriter`]; whitespace and punctuation stay as siblings of the
//! token spans.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::warn;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::book::{Token, TokenTable};
use crate::epub::parser::{local_name, resolve_entity};
use crate::epub::resolve_path;

/// Maps a package-relative asset reference to its stable storage path.
///
/// Returning `None` preserves the reference as written; URIs outside the
/// package never reach the rewriter.
pub trait AssetUrlRewriter {
    fn rewrite(&self, href: &str) -> Option<String>;
}

impl<F> AssetUrlRewriter for F
where
    F: Fn(&str) -> Option<String>,
{
    fn rewrite(&self, href: &str) -> Option<String> {
        self(href)
    }
}

/// Output of normalizing one chapter.
#[derive(Debug, Clone)]
pub struct NormalizedChapter {
    pub html: String,
    pub tokens: TokenTable,
    pub word_count: usize,
    /// First `h1|h2|h3|title` text, trimmed.
    pub title: Option<String>,
}

/// Normalize a chapter.
///
/// `chapter_href` is the chapter's manifest href; relative URL references in
/// the chapter are resolved against its directory before being offered to
/// the rewriter. Never fails: malformed markup is recovered by closing the
/// elements opened so far and salvaging the remaining text.
pub fn normalize(
    xhtml: &str,
    chapter_href: &str,
    rewriter: &dyn AssetUrlRewriter,
) -> NormalizedChapter {
    let chapter_dir = match chapter_href.rfind('/') {
        Some(i) => &chapter_href[..i],
        None => "",
    };

    let mut reader = Reader::from_str(xhtml);
    {
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
    }

    let mut state = NormalizeState {
        writer: Writer::new(Cursor::new(Vec::new())),
        tokens: Vec::new(),
        chapter_dir,
        rewriter,
        skip_depth: 0,
        head_depth: 0,
        style_depth: 0,
        title_depth: 0,
        open: Vec::new(),
        pending_text: String::new(),
        title: None,
        capturing_title: false,
        captured: String::new(),
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => state.on_start(&e, false),
            Ok(Event::Empty(e)) => state.on_start(&e, true),
            Ok(Event::End(e)) => state.on_end(&e),
            Ok(Event::Text(e)) => {
                let text = e
                    .decode()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(e.as_ref()).into_owned());
                state.on_text(&text);
            }
            Ok(Event::CData(e)) => {
                state.on_text(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(e)) => {
                let entity = String::from_utf8_lossy(e.as_ref());
                match resolve_entity(&entity) {
                    Some(resolved) => state.on_text(&resolved),
                    None => warn!(entity = %entity, "dropping unresolvable entity"),
                }
            }
            Ok(Event::Comment(e)) => {
                state.flush_text();
                if state.skip_depth == 0 {
                    let _ = state.writer.write_event(Event::Comment(e));
                }
            }
            Ok(ev @ Event::Decl(_)) | Ok(ev @ Event::DocType(_)) => {
                let _ = state.writer.write_event(ev);
            }
            Ok(Event::PI(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(error = %e, "recovering from malformed chapter markup");
                break;
            }
        }
    }

    state.finish(chapter_href)
}

struct NormalizeState<'a> {
    writer: Writer<Cursor<Vec<u8>>>,
    tokens: TokenTable,
    chapter_dir: &'a str,
    rewriter: &'a dyn AssetUrlRewriter,
    /// Depth inside a dropped subtree (script, noscript, html import).
    skip_depth: usize,
    head_depth: usize,
    style_depth: usize,
    title_depth: usize,
    /// Emitted-but-unclosed element names, for malformed-input recovery.
    open: Vec<String>,
    pending_text: String,
    title: Option<String>,
    capturing_title: bool,
    captured: String,
}

impl NormalizeState<'_> {
    fn on_start(&mut self, e: &BytesStart, empty: bool) {
        self.flush_text();

        if self.skip_depth > 0 {
            if !empty {
                self.skip_depth += 1;
            }
            return;
        }

        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let local = local_name(name.as_bytes()).to_vec();

        if matches!(local.as_slice(), b"script" | b"noscript") || self.is_html_import(e) {
            if !empty {
                self.skip_depth = 1;
            }
            return;
        }

        let mut elem = BytesStart::new(name.as_str());
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let key_local = local_name(key.as_bytes());
            if key_local.len() >= 3 && key_local[..2].eq_ignore_ascii_case(b"on") {
                continue;
            }
            let value = attr
                .unescape_value()
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
            let value = self.rewrite_attr(&key, &value);
            elem.push_attribute((key.as_str(), value.as_str()));
        }

        if empty {
            let _ = self.writer.write_event(Event::Empty(elem));
            return;
        }

        let _ = self.writer.write_event(Event::Start(elem));
        self.open.push(name);

        match local.as_slice() {
            b"head" => self.head_depth += 1,
            b"style" => self.style_depth += 1,
            b"title" => self.title_depth += 1,
            _ => {}
        }
        if self.title.is_none()
            && !self.capturing_title
            && matches!(local.as_slice(), b"h1" | b"h2" | b"h3" | b"title")
        {
            self.capturing_title = true;
            self.captured.clear();
        }
    }

    fn on_end(&mut self, e: &BytesEnd) {
        self.flush_text();

        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return;
        }

        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        // unmatched end tags in malformed input are dropped
        if !self.open.iter().any(|n| *n == name) {
            return;
        }
        while let Some(open) = self.open.pop() {
            let _ = self
                .writer
                .write_event(Event::End(BytesEnd::new(open.as_str())));
            self.leave(&open);
            if open == name {
                break;
            }
        }
    }

    fn leave(&mut self, name: &str) {
        match local_name(name.as_bytes()) {
            b"head" => self.head_depth = self.head_depth.saturating_sub(1),
            b"style" => self.style_depth = self.style_depth.saturating_sub(1),
            b"title" => self.title_depth = self.title_depth.saturating_sub(1),
            _ => {}
        }
        if self.capturing_title
            && matches!(local_name(name.as_bytes()), b"h1" | b"h2" | b"h3" | b"title")
        {
            self.capturing_title = false;
            let captured = self.captured.trim();
            if !captured.is_empty() {
                self.title = Some(captured.to_string());
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        if self.skip_depth > 0 {
            return;
        }
        if self.capturing_title {
            self.captured.push_str(text);
        }
        self.pending_text.push_str(text);
    }

    /// Emit accumulated text, wrapping word tokens in id-bearing spans when
    /// inside running text (not head, style, or title content).
    fn flush_text(&mut self) {
        if self.pending_text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending_text);

        if self.head_depth > 0 || self.style_depth > 0 || self.title_depth > 0 {
            let _ = self.writer.write_event(Event::Text(BytesText::new(&text)));
            return;
        }

        for run in split_word_runs(&text) {
            match run {
                Run::Word(word) => {
                    let id = format!("w{}", self.tokens.len());
                    let mut span = BytesStart::new("span");
                    span.push_attribute(("id", id.as_str()));
                    let _ = self.writer.write_event(Event::Start(span));
                    let _ = self.writer.write_event(Event::Text(BytesText::new(word)));
                    let _ = self.writer.write_event(Event::End(BytesEnd::new("span")));
                    self.tokens.push(Token {
                        id,
                        surface: word.to_string(),
                        normalized: normalize_token(word),
                    });
                }
                Run::Other(other) => {
                    let _ = self.writer.write_event(Event::Text(BytesText::new(other)));
                }
            }
        }
    }

    fn is_html_import(&self, e: &BytesStart) -> bool {
        if local_name(e.name().as_ref()) != b"link" {
            return false;
        }
        e.attributes().flatten().any(|a| {
            a.key.as_ref() == b"rel"
                && String::from_utf8_lossy(&a.value)
                    .split_ascii_whitespace()
                    .any(|v| v.eq_ignore_ascii_case("import"))
        })
    }

    /// Rebase a URL-bearing attribute through the rewriter.
    fn rewrite_attr(&self, key: &str, value: &str) -> String {
        let key_local = String::from_utf8_lossy(local_name(key.as_bytes())).into_owned();
        let url_bearing = matches!(key_local.as_str(), "src" | "href" | "poster")
            || key_local.starts_with("data-");
        if !url_bearing || is_external_uri(value) {
            return value.to_string();
        }

        let (path, fragment) = match value.split_once('#') {
            Some((p, f)) => (p, Some(f)),
            None => (value, None),
        };
        if path.is_empty() {
            return value.to_string();
        }

        let resolved = resolve_path(self.chapter_dir, path);
        match self.rewriter.rewrite(&resolved) {
            Some(mut rewritten) => {
                if let Some(fragment) = fragment {
                    rewritten.push('#');
                    rewritten.push_str(fragment);
                }
                rewritten
            }
            None => value.to_string(),
        }
    }

    fn finish(mut self, chapter_href: &str) -> NormalizedChapter {
        self.flush_text();
        // close anything malformed input left open
        while let Some(open) = self.open.pop() {
            let _ = self
                .writer
                .write_event(Event::End(BytesEnd::new(open.as_str())));
            self.leave(&open);
        }

        let bytes = self.writer.into_inner().into_inner();
        let html = String::from_utf8(bytes).unwrap_or_else(|e| {
            warn!(chapter = %chapter_href, "normalized output not UTF-8");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        });
        let word_count = self.tokens.len();

        NormalizedChapter {
            html,
            tokens: self.tokens,
            word_count,
            title: self.title,
        }
    }
}

/// References the rewriter never sees: anything with a scheme, protocol-
/// relative or server-absolute paths, and same-document fragments.
fn is_external_uri(value: &str) -> bool {
    value.contains("://")
        || value.starts_with("data:")
        || value.starts_with("mailto:")
        || value.starts_with("tel:")
        || value.starts_with("//")
        || value.starts_with('/')
        || value.starts_with('#')
}

// ----------------------------------------------------------------------------
// Tokenization
// ----------------------------------------------------------------------------

enum Run<'a> {
    Word(&'a str),
    Other(&'a str),
}

/// A word character: letters, digits, and combining marks. Punctuation and
/// whitespace separate tokens and are emitted verbatim between spans.
fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || is_combining_mark(c)
}

fn split_word_runs(text: &str) -> Vec<Run<'_>> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut in_word = None::<bool>;

    for (i, c) in text.char_indices() {
        let word = is_word_char(c);
        match in_word {
            None => in_word = Some(word),
            Some(prev) if prev != word => {
                runs.push(if prev {
                    Run::Word(&text[start..i])
                } else {
                    Run::Other(&text[start..i])
                });
                start = i;
                in_word = Some(word);
            }
            _ => {}
        }
    }
    if start < text.len() {
        runs.push(if in_word.unwrap_or(false) {
            Run::Word(&text[start..])
        } else {
            Run::Other(&text[start..])
        });
    }
    runs
}

/// Tokenize plain text (no markup) into a standalone token table, e.g. for
/// a translated rendition of a chapter.
pub fn tokenize_plain(text: &str) -> TokenTable {
    let mut tokens = Vec::new();
    for run in split_word_runs(text) {
        if let Run::Word(word) = run {
            tokens.push(Token {
                id: format!("w{}", tokens.len()),
                surface: word.to_string(),
                normalized: normalize_token(word),
            });
        }
    }
    tokens
}

/// Render a standalone token table as minimal reader-ready HTML, one span
/// per token. Used for translated renditions, which have no source markup.
pub fn render_plain_tokens(tokens: &TokenTable) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let _ = writer.write_event(Event::Start(BytesStart::new("div")));
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            let _ = writer.write_event(Event::Text(BytesText::new(" ")));
        }
        let mut span = BytesStart::new("span");
        span.push_attribute(("id", token.id.as_str()));
        let _ = writer.write_event(Event::Start(span));
        let _ = writer.write_event(Event::Text(BytesText::new(&token.surface)));
        let _ = writer.write_event(Event::End(BytesEnd::new("span")));
    }
    let _ = writer.write_event(Event::End(BytesEnd::new("div")));
    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
}

/// Casefold and strip combining marks: `Café` -> `cafe`.
fn normalize_token(surface: &str) -> String {
    surface
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_rewrite(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_tokenizes_running_text() {
        let result = normalize("<p>Hello, world!</p>", "ch1.xhtml", &no_rewrite);
        assert_eq!(result.word_count, 2);
        assert_eq!(result.tokens[0].id, "w0");
        assert_eq!(result.tokens[0].surface, "Hello");
        assert_eq!(result.tokens[1].id, "w1");
        assert_eq!(result.tokens[1].surface, "world");
        assert_eq!(
            result.html,
            r#"<p><span id="w0">Hello</span>, <span id="w1">world</span>!</p>"#
        );
    }

    #[test]
    fn test_token_ids_monotone_across_elements() {
        let result = normalize(
            "<div><p>one two</p><p>three</p></div>",
            "ch1.xhtml",
            &no_rewrite,
        );
        let ids: Vec<&str> = result.tokens.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["w0", "w1", "w2"]);
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let input = "<html><head><title>T</title></head><body><p>Alpha beta — gamma.</p></body></html>";
        let a = normalize(input, "ch1.xhtml", &no_rewrite);
        let b = normalize(input, "ch1.xhtml", &no_rewrite);
        assert_eq!(a.html, b.html);
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn test_strips_scripts_and_handlers() {
        let result = normalize(
            r#"<body><script>alert('x')</script><p onclick="foo()">Text</p></body>"#,
            "ch1.xhtml",
            &no_rewrite,
        );
        assert!(!result.html.contains("script"));
        assert!(!result.html.contains("onclick"));
        assert!(!result.html.contains("alert"));
        assert_eq!(result.word_count, 1);
    }

    #[test]
    fn test_strips_html_imports() {
        let result = normalize(
            r#"<head><link rel="import" href="x.html"/><link rel="stylesheet" href="s.css"/></head>"#,
            "ch1.xhtml",
            &no_rewrite,
        );
        assert!(!result.html.contains("import"));
        assert!(result.html.contains("stylesheet"));
    }

    #[test]
    fn test_rewrites_asset_urls() {
        let rewriter = |href: &str| {
            (href == "images/pic.png").then(|| "/storage/books/b1/assets/images/pic.png".to_string())
        };
        let result = normalize(
            r#"<p><img src="../images/pic.png#frag"/><a href="https://example.com/x">x</a></p>"#,
            "text/ch1.xhtml",
            &rewriter,
        );
        assert!(
            result
                .html
                .contains(r#"src="/storage/books/b1/assets/images/pic.png#frag""#)
        );
        assert!(result.html.contains(r#"href="https://example.com/x""#));
    }

    #[test]
    fn test_external_and_fragment_uris_preserved() {
        assert!(is_external_uri("https://example.com/a"));
        assert!(is_external_uri("data:image/png;base64,xyz"));
        assert!(is_external_uri("#footnote-3"));
        assert!(is_external_uri("/already/served/path.png"));
        assert!(!is_external_uri("images/pic.png"));
        assert!(!is_external_uri("../styles/main.css"));
    }

    #[test]
    fn test_head_and_title_not_tokenized() {
        let result = normalize(
            "<html><head><title>The Title</title></head><body><p>Body text</p></body></html>",
            "ch1.xhtml",
            &no_rewrite,
        );
        assert_eq!(result.title.as_deref(), Some("The Title"));
        assert_eq!(result.word_count, 2);
        assert!(!result.html.contains(r#"<title><span"#));
    }

    #[test]
    fn test_h1_preferred_when_no_title() {
        let result = normalize(
            "<body><h1> Chapter One </h1><p>text</p></body>",
            "ch1.xhtml",
            &no_rewrite,
        );
        assert_eq!(result.title.as_deref(), Some("Chapter One"));
        // heading words are still tokens
        assert_eq!(result.tokens[0].surface, "Chapter");
    }

    #[test]
    fn test_digits_attach_to_words() {
        let result = normalize("<p>room 101b opened</p>", "ch1.xhtml", &no_rewrite);
        let surfaces: Vec<&str> = result.tokens.iter().map(|t| t.surface.as_str()).collect();
        assert_eq!(surfaces, vec!["room", "101b", "opened"]);
    }

    #[test]
    fn test_combining_marks_stay_in_token() {
        // e + combining acute
        let result = normalize("<p>cafe\u{301} latte</p>", "ch1.xhtml", &no_rewrite);
        assert_eq!(result.tokens[0].surface, "cafe\u{301}");
        assert_eq!(result.tokens[0].normalized, "cafe");
        assert_eq!(result.tokens[1].normalized, "latte");
    }

    #[test]
    fn test_normalized_form_casefolds() {
        let result = normalize("<p>Café HELLO</p>", "ch1.xhtml", &no_rewrite);
        assert_eq!(result.tokens[0].normalized, "cafe");
        assert_eq!(result.tokens[1].normalized, "hello");
    }

    #[test]
    fn test_entities_resolve_into_text() {
        let result = normalize("<p>Fish &amp; Chips</p>", "ch1.xhtml", &no_rewrite);
        let surfaces: Vec<&str> = result.tokens.iter().map(|t| t.surface.as_str()).collect();
        assert_eq!(surfaces, vec!["Fish", "Chips"]);
        assert!(result.html.contains("&amp;"));
    }

    #[test]
    fn test_malformed_input_recovers() {
        let result = normalize("<p>unclosed <b>bold text", "ch1.xhtml", &no_rewrite);
        assert_eq!(result.word_count, 3);
        assert!(result.html.ends_with("</b></p>"));
    }

    #[test]
    fn test_cjk_text_tokenizes() {
        let result = normalize("<p>日本語 テスト</p>", "ch1.xhtml", &no_rewrite);
        assert_eq!(result.word_count, 2);
        assert_eq!(result.tokens[0].surface, "日本語");
    }
}
