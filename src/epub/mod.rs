//! EPUB unpacking: OCF container traversal, OPF resolution, spine-order
//! chapter materialization, asset and cover extraction, TOC derivation.

pub mod parser;

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use tracing::{debug, warn};
use zip::ZipArchive;

use crate::book::{BookMetadata, TocNode};
use crate::error::{Error, Result};
use parser::{OpfData, parse_container_xml, parse_ncx, parse_nav_toc, parse_opf, strip_bom};

/// One spine chapter as found in the package, before normalization.
#[derive(Debug, Clone)]
pub struct RawChapter {
    /// Manifest href, relative to the OPF directory.
    pub href: String,
    pub xhtml: String,
}

/// A non-chapter resource (CSS, image, font).
#[derive(Debug, Clone)]
pub struct Asset {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// The result of unpacking an EPUB container.
#[derive(Debug, Clone)]
pub struct UnpackedBook {
    pub metadata: BookMetadata,
    pub chapters: Vec<RawChapter>,
    /// Keyed by OPF-relative href.
    pub assets: BTreeMap<String, Asset>,
    pub cover_href: Option<String>,
    pub toc: Vec<TocNode>,
}

/// Unpack an EPUB from bytes.
///
/// Fails with `MalformedContainer` when the archive or `container.xml` is
/// unusable, `UnsupportedPackage` when the OPF cannot be resolved, and
/// `AssetMissing` when a spine chapter's payload is absent. Missing
/// non-chapter assets are skipped with a warning.
pub fn unpack(bytes: &[u8]) -> Result<UnpackedBook> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::MalformedContainer(format!("not a ZIP archive: {e}")))?;

    let container = read_archive_file_bytes(&mut archive, "META-INF/container.xml")
        .map_err(|_| Error::MalformedContainer("missing META-INF/container.xml".into()))?;
    let opf_path = parse_container_xml(&container)?;
    let opf_dir = Path::new(&opf_path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();

    let opf_bytes = read_archive_file_bytes(&mut archive, &opf_path)
        .map_err(|_| Error::UnsupportedPackage(format!("missing OPF at {opf_path}")))?;
    let opf = parse_opf(&decode_text(&opf_bytes))?;

    let chapters = collect_chapters(&mut archive, &opf, &opf_dir)?;
    let assets = collect_assets(&mut archive, &opf, &opf_dir);
    let mut toc = extract_toc(&mut archive, &opf, &opf_dir);
    resolve_toc_targets(&mut toc, &chapters);

    debug!(
        chapters = chapters.len(),
        assets = assets.len(),
        toc_roots = toc.len(),
        "unpacked EPUB"
    );

    Ok(UnpackedBook {
        metadata: opf.metadata,
        chapters,
        assets,
        cover_href: opf.cover_href,
        toc,
    })
}

fn collect_chapters<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    opf: &OpfData,
    opf_dir: &str,
) -> Result<Vec<RawChapter>> {
    let mut chapters = Vec::new();
    for id in &opf.spine_ids {
        let Some(item) = opf.manifest.get(id) else {
            warn!(idref = %id, "spine references unknown manifest item");
            continue;
        };
        if item.media_type != "application/xhtml+xml" {
            continue;
        }
        let full_path = resolve_path(opf_dir, &item.href);
        let bytes = read_archive_file_bytes(archive, &full_path)
            .map_err(|_| Error::AssetMissing(format!("spine chapter {full_path}")))?;
        chapters.push(RawChapter {
            href: item.href.clone(),
            xhtml: decode_text(&bytes),
        });
    }
    Ok(chapters)
}

fn collect_assets<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    opf: &OpfData,
    opf_dir: &str,
) -> BTreeMap<String, Asset> {
    let spine_hrefs: Vec<&str> = opf
        .spine_ids
        .iter()
        .filter_map(|id| opf.manifest.get(id))
        .map(|item| item.href.as_str())
        .collect();

    let mut assets = BTreeMap::new();
    for item in opf.manifest.values() {
        if spine_hrefs.contains(&item.href.as_str())
            || item.media_type == "application/x-dtbncx+xml"
            || item.has_property("nav")
        {
            continue;
        }
        let full_path = resolve_path(opf_dir, &item.href);
        match read_archive_file_bytes(archive, &full_path) {
            Ok(data) => {
                assets.insert(
                    item.href.clone(),
                    Asset {
                        data,
                        media_type: item.media_type.clone(),
                    },
                );
            }
            Err(_) => warn!(href = %item.href, "manifest asset not present in archive"),
        }
    }
    assets
}

/// Prefer the EPUB 3 nav document, fall back to NCX.
fn extract_toc<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    opf: &OpfData,
    opf_dir: &str,
) -> Vec<TocNode> {
    if let Some(nav_href) = &opf.nav_href {
        let path = resolve_path(opf_dir, nav_href);
        if let Ok(bytes) = read_archive_file_bytes(archive, &path) {
            match parse_nav_toc(&decode_text(&bytes)) {
                Ok(toc) if !toc.is_empty() => return toc,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to parse nav document"),
            }
        }
    }
    if let Some(ncx_href) = &opf.ncx_href {
        let path = resolve_path(opf_dir, ncx_href);
        if let Ok(bytes) = read_archive_file_bytes(archive, &path) {
            match parse_ncx(&decode_text(&bytes)) {
                Ok(toc) => return toc,
                Err(e) => warn!(error = %e, "failed to parse NCX"),
            }
        }
    }
    Vec::new()
}

/// Point each TOC entry at the spine index its href resolves to.
/// Unresolved targets keep index 0.
fn resolve_toc_targets(nodes: &mut [TocNode], chapters: &[RawChapter]) {
    for node in nodes {
        let target = node
            .href
            .split('#')
            .next()
            .map(|h| percent_decode(h))
            .unwrap_or_default();
        node.chapter_index = chapters
            .iter()
            .position(|c| {
                let href = percent_decode(&c.href);
                href == target || href.ends_with(&format!("/{target}")) || {
                    // nav documents may address chapters from a sibling dir
                    target.ends_with(&format!("/{href}"))
                }
            })
            .unwrap_or(0);
        resolve_toc_targets(&mut node.children, chapters);
    }
}

// ----------------------------------------------------------------------------
// Archive helpers
// ----------------------------------------------------------------------------

fn read_archive_file_bytes<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    path: &str,
) -> Result<Vec<u8>> {
    match archive.by_name(path) {
        Ok(mut file) => {
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;
            return Ok(contents);
        }
        Err(zip::result::ZipError::FileNotFound) => {}
        Err(e) => return Err(e.into()),
    }

    // Fallback: percent-decoded path (handles malformed EPUBs)
    let decoded = percent_decode(path);
    let mut file = archive.by_name(&decoded)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(contents)
}

fn percent_decode(path: &str) -> String {
    percent_encoding::percent_decode_str(path)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Decode chapter payload text: UTF-8, else Windows-1252.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = strip_bom(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (cow, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            cow.into_owned()
        }
    }
}

/// Join `href` onto `base`, collapsing `.` and `..` segments.
pub fn resolve_path(base: &str, href: &str) -> String {
    let joined = if base.is_empty() {
        href.to_string()
    } else {
        format!("{base}/{href}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("", "ch1.xhtml"), "ch1.xhtml");
        assert_eq!(resolve_path("OEBPS", "ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(resolve_path("OEBPS", "../images/a.png"), "images/a.png");
        assert_eq!(resolve_path("OEBPS", "./text/ch1.xhtml"), "OEBPS/text/ch1.xhtml");
    }

    #[test]
    fn test_decode_text_utf8_and_1252() {
        assert_eq!(decode_text("héllo".as_bytes()), "héllo");
        // 0xE9 is é in Windows-1252 but invalid UTF-8
        assert_eq!(decode_text(&[b'h', 0xE9]), "hé");
    }

    #[test]
    fn test_unpack_rejects_non_zip() {
        assert!(matches!(
            unpack(b"definitely not a zip"),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_toc_resolution_with_fragments() {
        let chapters = vec![
            RawChapter {
                href: "text/ch1.xhtml".into(),
                xhtml: String::new(),
            },
            RawChapter {
                href: "text/ch2.xhtml".into(),
                xhtml: String::new(),
            },
        ];
        let mut toc = vec![
            TocNode::new("One", "text/ch1.xhtml"),
            TocNode::new("Two", "text/ch2.xhtml#middle"),
            TocNode::new("Missing", "text/nowhere.xhtml"),
        ];
        resolve_toc_targets(&mut toc, &chapters);
        assert_eq!(toc[0].chapter_index, 0);
        assert_eq!(toc[1].chapter_index, 1);
        assert_eq!(toc[2].chapter_index, 0);
    }
}
