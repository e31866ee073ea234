//! EPUB 3 export with media overlays.
//!
//! Assembles the normalized chapters, the current canonical audio, and the
//! sync tables into a conformant EPUB 3: mimetype-first OCF container,
//! version-3 OPF whose synced chapter items carry `media-overlay` links,
//! one SMIL document per synced chapter, a navigation document derived from
//! the TOC, and the cover with the `cover-image` property.

pub mod smil;

use std::io::{Cursor, Seek, Write};

use chrono::Utc;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::{debug, info};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::audio::voice_language;
use crate::book::{AudioArtifact, Book, SyncTable, TocNode, TokenTable};
use crate::error::{Error, Result};
use crate::store::{BlobStore, load_json, paths};
use smil::{clock, generate_smil, overlay_duration, validate_overlay};

/// A finished export.
pub struct ExportedEpub {
    pub filename: String,
    pub bytes: Vec<u8>,
}

struct OverlayChapter {
    index: usize,
    audio_ext: &'static str,
    audio_media_type: &'static str,
    duration: f64,
}

/// Export a book as EPUB 3 bytes.
///
/// `asset_url_prefix` is the public prefix chapter asset references were
/// rewritten under at ingestion; references are rebased back onto the
/// package-relative `assets/` directory.
pub fn export_book(
    store: &dyn BlobStore,
    book_id: &str,
    asset_url_prefix: &str,
) -> Result<ExportedEpub> {
    let book: Book = load_json(store, book_id, &paths::metadata())?;
    let lang = match voice_language(&book.metadata.language).as_str() {
        "" => "en".to_string(),
        prefix => prefix.to_string(),
    };
    let storage_prefix = format!("{asset_url_prefix}/{book_id}/assets/");

    let mut cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut cursor);
    let options_stored =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let options_deflate = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(1));

    // mimetype must be first and uncompressed
    zip.start_file("mimetype", options_stored)?;
    zip.write_all(b"application/epub+zip")?;

    zip.start_file("META-INF/container.xml", options_deflate)?;
    zip.write_all(CONTAINER_XML.as_bytes())?;

    // chapters, plus overlays where a sync table exists
    let mut overlays: Vec<OverlayChapter> = Vec::new();
    for chapter in &book.chapters {
        let i = chapter.index;
        let html_bytes = store.get(book_id, &paths::chapter_html(i))?;
        let html =
            String::from_utf8_lossy(&html_bytes).replace(storage_prefix.as_str(), "assets/");

        if let Some(overlay) = build_overlay(store, book_id, i, &lang, &html)? {
            let artifact = overlay.0;
            let sync = overlay.1;
            let ext = artifact.format.extension();
            let audio_bytes = store.get(
                book_id,
                &paths::audio_canonical(&lang, i, ext),
            )?;
            zip.start_file(format!("OEBPS/audio/{i}.{ext}"), options_stored)?;
            zip.write_all(&audio_bytes)?;

            let smil_doc = generate_smil(
                i,
                &format!("chap{i}.xhtml"),
                &format!("audio/{i}.{ext}"),
                &sync,
            );
            zip.start_file(format!("OEBPS/chap{i}.smil"), options_deflate)?;
            zip.write_all(smil_doc.as_bytes())?;

            overlays.push(OverlayChapter {
                index: i,
                audio_ext: ext,
                audio_media_type: artifact.format.media_type(),
                duration: overlay_duration(&sync),
            });
        }

        zip.start_file(format!("OEBPS/chap{i}.xhtml"), options_deflate)?;
        zip.write_all(html.as_bytes())?;
    }

    // assets (cover included)
    let asset_keys = store.list_prefix(book_id, "assets")?;
    for key in &asset_keys {
        let bytes = store.get(book_id, key)?;
        let opts = if is_precompressed(media_type_for(key)) {
            options_stored
        } else {
            options_deflate
        };
        zip.start_file(format!("OEBPS/{key}"), opts)?;
        zip.write_all(&bytes)?;
    }

    let nav = generate_nav(&book);
    zip.start_file("OEBPS/nav.xhtml", options_deflate)?;
    zip.write_all(nav.as_bytes())?;

    let opf = generate_opf(&book, &overlays, &asset_keys);
    zip.start_file("OEBPS/content.opf", options_deflate)?;
    zip.write_all(opf.as_bytes())?;

    zip.finish()?;

    let filename = format!("{}.epub", sanitize_filename(&book.metadata.title));
    info!(
        book = book_id,
        chapters = book.chapters.len(),
        overlays = overlays.len(),
        "exported EPUB 3"
    );
    Ok(ExportedEpub {
        filename,
        bytes: cursor.into_inner(),
    })
}

/// Load and validate a chapter's overlay inputs, if it has been synced.
fn build_overlay(
    store: &dyn BlobStore,
    book_id: &str,
    chapter: usize,
    lang: &str,
    html: &str,
) -> Result<Option<(AudioArtifact, SyncTable)>> {
    let sync: SyncTable = match load_json(store, book_id, &paths::sync_table(lang, chapter)) {
        Ok(sync) => sync,
        Err(Error::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let artifact: AudioArtifact =
        match load_json(store, book_id, &paths::audio_descriptor(lang, chapter)) {
            Ok(artifact) => artifact,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

    // every text reference must resolve, clips must be monotone and bounded
    validate_overlay(html, &sync)?;
    let tokens: TokenTable = load_json(store, book_id, &paths::chapter_tokens(chapter))?;
    sync.validate(&tokens, artifact.duration)?;

    debug!(book = book_id, chapter, lang, "chapter has media overlay");
    Ok(Some((artifact, sync)))
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

fn generate_opf(book: &Book, overlays: &[OverlayChapter], asset_keys: &[String]) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .unwrap();

    let mut package = BytesStart::new("package");
    package.push_attribute(("xmlns", "http://www.idpf.org/2007/opf"));
    package.push_attribute(("version", "3.0"));
    package.push_attribute(("unique-identifier", "BookId"));
    writer.write_event(Event::Start(package)).unwrap();

    // <metadata>
    let mut metadata = BytesStart::new("metadata");
    metadata.push_attribute(("xmlns:dc", "http://purl.org/dc/elements/1.1/"));
    writer.write_event(Event::Start(metadata)).unwrap();

    let mut write_elem = |name: &str, content: &str, attrs: &[(&str, &str)]| {
        let mut elem = BytesStart::new(name);
        for (key, value) in attrs {
            elem.push_attribute((*key, *value));
        }
        writer.write_event(Event::Start(elem)).unwrap();
        writer
            .write_event(Event::Text(BytesText::new(content)))
            .unwrap();
        writer.write_event(Event::End(BytesEnd::new(name))).unwrap();
    };

    let identifier = if book.metadata.identifier.is_empty() {
        format!("urn:uuid:{}", book.id)
    } else {
        book.metadata.identifier.clone()
    };
    write_elem("dc:identifier", &identifier, &[("id", "BookId")]);
    write_elem("dc:title", &book.metadata.title, &[]);
    let language = if book.metadata.language.is_empty() {
        "en"
    } else {
        &book.metadata.language
    };
    write_elem("dc:language", language, &[]);
    for author in &book.metadata.authors {
        write_elem("dc:creator", author, &[]);
    }
    if let Some(publisher) = &book.metadata.publisher {
        write_elem("dc:publisher", publisher, &[]);
    }

    let modified = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    write_elem("meta", &modified, &[("property", "dcterms:modified")]);

    let total: f64 = overlays.iter().map(|o| o.duration).sum();
    if !overlays.is_empty() {
        write_elem("meta", &clock(total), &[("property", "media:duration")]);
        for overlay in overlays {
            write_elem(
                "meta",
                &clock(overlay.duration),
                &[
                    ("property", "media:duration"),
                    ("refines", &format!("#smil{}", overlay.index)),
                ],
            );
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new("metadata")))
        .unwrap();

    // <manifest>
    writer
        .write_event(Event::Start(BytesStart::new("manifest")))
        .unwrap();

    let mut write_item =
        |id: &str, href: &str, media_type: &str, extra: &[(&str, &str)]| {
            let mut item = BytesStart::new("item");
            item.push_attribute(("id", id));
            item.push_attribute(("href", href));
            item.push_attribute(("media-type", media_type));
            for (key, value) in extra {
                item.push_attribute((*key, *value));
            }
            writer.write_event(Event::Empty(item)).unwrap();
        };

    write_item(
        "nav",
        "nav.xhtml",
        "application/xhtml+xml",
        &[("properties", "nav")],
    );
    for chapter in &book.chapters {
        let i = chapter.index;
        let overlay = overlays.iter().find(|o| o.index == i);
        match overlay {
            Some(_) => write_item(
                &format!("chap{i}"),
                &format!("chap{i}.xhtml"),
                "application/xhtml+xml",
                &[("media-overlay", &format!("smil{i}"))],
            ),
            None => write_item(
                &format!("chap{i}"),
                &format!("chap{i}.xhtml"),
                "application/xhtml+xml",
                &[],
            ),
        }
    }
    for overlay in overlays {
        let i = overlay.index;
        write_item(
            &format!("smil{i}"),
            &format!("chap{i}.smil"),
            "application/smil+xml",
            &[],
        );
        write_item(
            &format!("audio{i}"),
            &format!("audio/{i}.{}", overlay.audio_ext),
            overlay.audio_media_type,
            &[],
        );
    }
    let cover_key = book.cover_href.as_ref().map(|href| format!("assets/{href}"));
    for key in asset_keys {
        let is_cover = cover_key.as_deref() == Some(key.as_str());
        let id = if is_cover {
            "cover-image".to_string()
        } else {
            href_to_id(key)
        };
        let extra: &[(&str, &str)] = if is_cover {
            &[("properties", "cover-image")]
        } else {
            &[]
        };
        write_item(&id, key, media_type_for(key), extra);
    }
    writer
        .write_event(Event::End(BytesEnd::new("manifest")))
        .unwrap();

    // <spine>
    writer
        .write_event(Event::Start(BytesStart::new("spine")))
        .unwrap();
    for chapter in &book.chapters {
        let mut itemref = BytesStart::new("itemref");
        itemref.push_attribute(("idref", format!("chap{}", chapter.index).as_str()));
        writer.write_event(Event::Empty(itemref)).unwrap();
    }
    writer
        .write_event(Event::End(BytesEnd::new("spine")))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("package")))
        .unwrap();

    String::from_utf8(writer.into_inner().into_inner()).unwrap()
}

fn generate_nav(book: &Book) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .unwrap();
    writer
        .write_event(Event::DocType(BytesText::from_escaped("html")))
        .unwrap();

    let mut html = BytesStart::new("html");
    html.push_attribute(("xmlns", "http://www.w3.org/1999/xhtml"));
    html.push_attribute(("xmlns:epub", "http://www.idpf.org/2007/ops"));
    writer.write_event(Event::Start(html)).unwrap();

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .unwrap();
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .unwrap();
    writer
        .write_event(Event::Text(BytesText::new(&book.metadata.title)))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .unwrap();

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .unwrap();
    let mut nav = BytesStart::new("nav");
    nav.push_attribute(("epub:type", "toc"));
    nav.push_attribute(("id", "toc"));
    writer.write_event(Event::Start(nav)).unwrap();

    if book.toc.is_empty() {
        // flat fallback from the chapter list
        writer
            .write_event(Event::Start(BytesStart::new("ol")))
            .unwrap();
        for chapter in &book.chapters {
            write_nav_entry(
                &mut writer,
                &TocNode {
                    title: if chapter.title.is_empty() {
                        format!("Chapter {}", chapter.index + 1)
                    } else {
                        chapter.title.clone()
                    },
                    href: String::new(),
                    chapter_index: chapter.index,
                    children: Vec::new(),
                },
            );
        }
        writer.write_event(Event::End(BytesEnd::new("ol"))).unwrap();
    } else {
        writer
            .write_event(Event::Start(BytesStart::new("ol")))
            .unwrap();
        for node in &book.toc {
            write_nav_entry(&mut writer, node);
        }
        writer.write_event(Event::End(BytesEnd::new("ol"))).unwrap();
    }

    writer.write_event(Event::End(BytesEnd::new("nav"))).unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("html")))
        .unwrap();

    String::from_utf8(writer.into_inner().into_inner()).unwrap()
}

fn write_nav_entry(writer: &mut Writer<Cursor<Vec<u8>>>, node: &TocNode) {
    writer.write_event(Event::Start(BytesStart::new("li"))).unwrap();

    let fragment = node.href.split_once('#').map(|(_, f)| f);
    let mut href = format!("chap{}.xhtml", node.chapter_index);
    if let Some(fragment) = fragment {
        href.push('#');
        href.push_str(fragment);
    }
    let mut anchor = BytesStart::new("a");
    anchor.push_attribute(("href", href.as_str()));
    writer.write_event(Event::Start(anchor)).unwrap();
    writer
        .write_event(Event::Text(BytesText::new(&node.title)))
        .unwrap();
    writer.write_event(Event::End(BytesEnd::new("a"))).unwrap();

    if !node.children.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("ol"))).unwrap();
        for child in &node.children {
            write_nav_entry(writer, child);
        }
        writer.write_event(Event::End(BytesEnd::new("ol"))).unwrap();
    }

    writer.write_event(Event::End(BytesEnd::new("li"))).unwrap();
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn href_to_id(href: &str) -> String {
    format!("res_{}", href.replace(['/', '.', ' ', '-'], "_"))
}

fn media_type_for(href: &str) -> &'static str {
    match href.rsplit('.').next().unwrap_or_default() {
        "css" => "text/css",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "xhtml" | "html" => "application/xhtml+xml",
        _ => "application/octet-stream",
    }
}

fn is_precompressed(media_type: &str) -> bool {
    matches!(
        media_type,
        "image/jpeg"
            | "image/png"
            | "image/gif"
            | "image/webp"
            | "audio/mpeg"
            | "font/woff"
            | "font/woff2"
    )
}

fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "book".to_string()
    } else {
        trimmed.to_string()
    }
}
