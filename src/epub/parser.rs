//! EPUB parsing utilities (container.xml, OPF, NCX, nav document).

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::book::{BookMetadata, TocNode};
use crate::error::{Error, Result};

/// A manifest item as declared in the OPF.
#[derive(Debug, Clone)]
pub struct ManifestItem {
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

impl ManifestItem {
    pub fn has_property(&self, wanted: &str) -> bool {
        self.properties
            .as_ref()
            .is_some_and(|props| props.split_ascii_whitespace().any(|p| p == wanted))
    }
}

/// Parsed OPF package data.
pub struct OpfData {
    pub metadata: BookMetadata,
    /// Maps manifest id -> item; hrefs are as declared (relative to OPF dir).
    pub manifest: HashMap<String, ManifestItem>,
    pub spine_ids: Vec<String>,
    /// NCX href referenced by the spine's `toc` attribute.
    pub ncx_href: Option<String>,
    /// EPUB 3 nav document href (item with `properties="nav"`).
    pub nav_href: Option<String>,
    /// Cover image href (EPUB 3 `cover-image` property wins over the
    /// EPUB 2 `<meta name="cover">` reference).
    pub cover_href: Option<String>,
}

/// Parse META-INF/container.xml to find the OPF rootfile path.
pub fn parse_container_xml(bytes: &[u8]) -> Result<String> {
    let content = String::from_utf8(strip_bom(bytes).to_vec())
        .map_err(|e| Error::MalformedContainer(format!("container.xml not UTF-8: {e}")))?;

    let mut reader = Reader::from_str(&content);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if local_name(e.name().as_ref()) == b"rootfile" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"full-path" {
                        return Ok(String::from_utf8(attr.value.to_vec())?);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::MalformedContainer(format!("bad container.xml: {e}"))),
            _ => {}
        }
    }

    Err(Error::MalformedContainer(
        "no rootfile found in container.xml".into(),
    ))
}

/// Parse the OPF package document.
pub fn parse_opf(content: &str) -> Result<OpfData> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut metadata = BookMetadata::default();
    let mut manifest: HashMap<String, ManifestItem> = HashMap::new();
    let mut spine_ids: Vec<String> = Vec::new();
    let mut toc_id: Option<String> = None;
    let mut epub2_cover_id: Option<String> = None;

    let mut in_metadata = false;
    let mut current_element: Option<String> = None;
    let mut buf_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref());

                match local {
                    b"metadata" => in_metadata = true,
                    b"title" | b"creator" | b"language" | b"identifier" | b"publisher" => {
                        if in_metadata {
                            current_element = Some(String::from_utf8_lossy(local).to_string());
                            buf_text.clear();
                        }
                    }
                    b"spine" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"toc" {
                                toc_id = Some(String::from_utf8(attr.value.to_vec())?);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref());

                match local {
                    b"item" => {
                        let mut id = String::new();
                        let mut href = String::new();
                        let mut media_type = String::new();
                        let mut properties: Option<String> = None;

                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"id" => id = String::from_utf8(attr.value.to_vec())?,
                                b"href" => href = String::from_utf8(attr.value.to_vec())?,
                                b"media-type" => {
                                    media_type = String::from_utf8(attr.value.to_vec())?
                                }
                                b"properties" => {
                                    properties = Some(String::from_utf8(attr.value.to_vec())?)
                                }
                                _ => {}
                            }
                        }

                        if !id.is_empty() {
                            manifest.insert(
                                id,
                                ManifestItem {
                                    href,
                                    media_type,
                                    properties,
                                },
                            );
                        }
                    }
                    b"itemref" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"idref" {
                                spine_ids.push(String::from_utf8(attr.value.to_vec())?);
                            }
                        }
                    }
                    b"meta" if in_metadata => {
                        // EPUB 2 cover reference: <meta name="cover" content="id"/>
                        let mut is_cover = false;
                        let mut cover_id = String::new();
                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"name" if attr.value.as_ref() == b"cover" => is_cover = true,
                                b"content" => cover_id = String::from_utf8(attr.value.to_vec())?,
                                _ => {}
                            }
                        }
                        if is_cover && !cover_id.is_empty() {
                            epub2_cover_id = Some(cover_id);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if current_element.is_some() {
                    buf_text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if current_element.is_some() {
                    let entity = String::from_utf8_lossy(e.as_ref());
                    if let Some(resolved) = resolve_entity(&entity) {
                        buf_text.push_str(&resolved);
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref());

                if local == b"metadata" {
                    in_metadata = false;
                }

                if let Some(ref elem) = current_element {
                    let text = buf_text.clone();
                    match elem.as_str() {
                        "title" => metadata.title = text,
                        "creator" => metadata.authors.push(text),
                        "language" => metadata.language = text,
                        "identifier" if metadata.identifier.is_empty() => {
                            metadata.identifier = text
                        }
                        "publisher" => metadata.publisher = Some(text),
                        _ => {}
                    }
                    current_element = None;
                    buf_text.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::UnsupportedPackage(format!("bad OPF: {e}"))),
            _ => {}
        }
    }

    if spine_ids.is_empty() {
        return Err(Error::UnsupportedPackage("OPF declares no spine".into()));
    }

    let cover_href = manifest
        .values()
        .find(|item| item.has_property("cover-image"))
        .map(|item| item.href.clone())
        .or_else(|| {
            epub2_cover_id
                .and_then(|id| manifest.get(&id))
                .map(|item| item.href.clone())
        });

    let nav_href = manifest
        .values()
        .find(|item| item.has_property("nav"))
        .map(|item| item.href.clone());

    let ncx_href = toc_id.and_then(|id| manifest.get(&id).map(|item| item.href.clone()));

    Ok(OpfData {
        metadata,
        manifest,
        spine_ids,
        ncx_href,
        nav_href,
        cover_href,
    })
}

/// Parse an NCX table of contents into a nested node list.
pub fn parse_ncx(content: &str) -> Result<Vec<TocNode>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    struct NavPointState {
        children: Vec<TocNode>,
        text: Option<String>,
        src: Option<String>,
    }

    let mut stack: Vec<NavPointState> = vec![NavPointState {
        children: Vec::new(),
        text: None,
        src: None,
    }];
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                b"navPoint" => {
                    stack.push(NavPointState {
                        children: Vec::new(),
                        text: None,
                        src: None,
                    });
                }
                b"text" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) == b"content" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"src"
                            && let Some(state) = stack.last_mut()
                        {
                            state.src = Some(String::from_utf8(attr.value.to_vec())?);
                        }
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if in_text && let Some(state) = stack.last_mut() {
                    let raw = String::from_utf8_lossy(e.as_ref());
                    match &mut state.text {
                        Some(existing) => existing.push_str(&raw),
                        None => state.text = Some(raw.into_owned()),
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_text && let Some(state) = stack.last_mut() {
                    let entity = String::from_utf8_lossy(e.as_ref());
                    if let Some(resolved) = resolve_entity(&entity) {
                        match &mut state.text {
                            Some(existing) => existing.push_str(&resolved),
                            None => state.text = Some(resolved),
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"text" => in_text = false,
                b"navPoint" => {
                    if let Some(state) = stack.pop()
                        && let (Some(text), Some(src)) = (state.text, state.src)
                    {
                        let mut node = TocNode::new(text, src);
                        node.children = state.children;
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    Ok(stack.pop().map(|s| s.children).unwrap_or_default())
}

/// Parse the EPUB 3 navigation document's `<nav epub:type="toc">` into a
/// nested node list.
///
/// The nav TOC is an `<ol>` of `<li>` entries, each holding an `<a>` (or a
/// `<span>` for unlinked headings) and optionally a nested `<ol>`.
pub fn parse_nav_toc(content: &str) -> Result<Vec<TocNode>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    struct LiState {
        children: Vec<TocNode>,
        text: String,
        href: Option<String>,
    }

    let mut in_toc_nav = false;
    let mut label_depth = 0usize;
    let mut stack: Vec<LiState> = Vec::new();
    let mut roots: Vec<TocNode> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"nav" => {
                        for attr in e.attributes().flatten() {
                            if local_name(attr.key.as_ref()) == b"type" {
                                let value = String::from_utf8_lossy(&attr.value);
                                if value.split_ascii_whitespace().any(|v| v == "toc") {
                                    in_toc_nav = true;
                                }
                            }
                        }
                    }
                    b"li" if in_toc_nav => {
                        stack.push(LiState {
                            children: Vec::new(),
                            text: String::new(),
                            href: None,
                        });
                    }
                    b"a" | b"span" if in_toc_nav && !stack.is_empty() => {
                        label_depth += 1;
                        if local_name(name.as_ref()) == b"a" {
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"href"
                                    && let Some(state) = stack.last_mut()
                                {
                                    state.href =
                                        Some(String::from_utf8(attr.value.to_vec())?);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if label_depth > 0 && let Some(state) = stack.last_mut() {
                    state.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if label_depth > 0 && let Some(state) = stack.last_mut() {
                    let entity = String::from_utf8_lossy(e.as_ref());
                    if let Some(resolved) = resolve_entity(&entity) {
                        state.text.push_str(&resolved);
                    }
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"nav" => in_toc_nav = false,
                b"a" | b"span" if label_depth > 0 => label_depth -= 1,
                b"li" if in_toc_nav => {
                    if let Some(state) = stack.pop() {
                        let title = state.text.trim().to_string();
                        if !title.is_empty() {
                            let mut node =
                                TocNode::new(title, state.href.unwrap_or_default());
                            node.children = state.children;
                            match stack.last_mut() {
                                Some(parent) => parent.children.push(node),
                                None => roots.push(node),
                            }
                        } else {
                            // keep grandchildren reachable even when the
                            // label was empty
                            match stack.last_mut() {
                                Some(parent) => parent.children.extend(state.children),
                                None => roots.extend(state.children),
                            }
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    Ok(roots)
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Strip UTF-8 BOM if present.
pub fn strip_bom(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &data[3..]
    } else {
        data
    }
}

/// Extract local name from namespaced XML name (e.g., "dc:title" -> "title").
pub fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

/// Resolve XML entity references.
pub fn resolve_entity(entity: &str) -> Option<String> {
    match entity {
        "apos" => return Some("'".to_string()),
        "quot" => return Some("\"".to_string()),
        "lt" => return Some("<".to_string()),
        "gt" => return Some(">".to_string()),
        "amp" => return Some("&".to_string()),
        "nbsp" => return Some("\u{a0}".to_string()),
        _ => {}
    }

    if let Some(hex) = entity.strip_prefix("#x") {
        if let Ok(code) = u32::from_str_radix(hex, 16)
            && let Some(c) = char::from_u32(code)
        {
            return Some(c.to_string());
        }
    } else if let Some(dec) = entity.strip_prefix('#')
        && let Ok(code) = dec.parse::<u32>()
        && let Some(c) = char::from_u32(code)
    {
        return Some(c.to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_bom() {
        let with_bom = &[0xEF, 0xBB, 0xBF, b'h', b'i'];
        assert_eq!(strip_bom(with_bom), b"hi");
        assert_eq!(strip_bom(b"hello"), b"hello");
        let empty: &[u8] = &[];
        assert_eq!(strip_bom(empty), empty);
    }

    #[test]
    fn test_local_name() {
        assert_eq!(local_name(b"title"), b"title");
        assert_eq!(local_name(b"dc:title"), b"title");
        assert_eq!(local_name(b"epub:type"), b"type");
    }

    #[test]
    fn test_resolve_entity() {
        assert_eq!(resolve_entity("apos"), Some("'".to_string()));
        assert_eq!(resolve_entity("#65"), Some("A".to_string()));
        assert_eq!(resolve_entity("#x2019"), Some("\u{2019}".to_string()));
        assert_eq!(resolve_entity("bogus"), None);
    }

    #[test]
    fn test_parse_container_xml() {
        let container = br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;
        assert_eq!(parse_container_xml(container).unwrap(), "OEBPS/content.opf");
    }

    #[test]
    fn test_parse_container_xml_missing_rootfile() {
        let container = br#"<?xml version="1.0"?><container/>"#;
        assert!(matches!(
            parse_container_xml(container),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_parse_opf_metadata_and_spine() {
        let opf = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Test Book</dc:title>
    <dc:creator>Author One</dc:creator>
    <dc:language>en</dc:language>
    <dc:identifier>urn:isbn:1234567890</dc:identifier>
    <dc:publisher>Test Publisher</dc:publisher>
  </metadata>
  <manifest>
    <item id="chapter1" href="chapter1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="chapter1"/>
  </spine>
</package>"#;

        let result = parse_opf(opf).unwrap();
        assert_eq!(result.metadata.title, "Test Book");
        assert_eq!(result.metadata.authors, vec!["Author One"]);
        assert_eq!(result.metadata.language, "en");
        assert_eq!(result.metadata.identifier, "urn:isbn:1234567890");
        assert_eq!(result.metadata.publisher, Some("Test Publisher".to_string()));
        assert_eq!(result.spine_ids, vec!["chapter1"]);
        assert_eq!(result.ncx_href, Some("toc.ncx".to_string()));
    }

    #[test]
    fn test_parse_opf_no_spine_rejected() {
        let opf = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata><dc:title xmlns:dc="http://purl.org/dc/elements/1.1/">Book</dc:title></metadata>
  <manifest><item id="x" href="x.xhtml" media-type="application/xhtml+xml"/></manifest>
</package>"#;
        assert!(matches!(
            parse_opf(opf),
            Err(Error::UnsupportedPackage(_))
        ));
    }

    #[test]
    fn test_parse_opf_cover_epub3_wins() {
        let opf = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata>
    <dc:title xmlns:dc="http://purl.org/dc/elements/1.1/">Book</dc:title>
    <meta name="cover" content="old-cover"/>
  </metadata>
  <manifest>
    <item id="old-cover" href="old.png" media-type="image/png"/>
    <item id="cover-img" href="images/cover.jpg" media-type="image/jpeg" properties="cover-image"/>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="ch1"/></spine>
</package>"#;
        let result = parse_opf(opf).unwrap();
        assert_eq!(result.cover_href, Some("images/cover.jpg".to_string()));
    }

    #[test]
    fn test_parse_opf_cover_epub2_fallback() {
        let opf = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata>
    <dc:title xmlns:dc="http://purl.org/dc/elements/1.1/">Book</dc:title>
    <meta name="cover" content="cover-id"/>
  </metadata>
  <manifest>
    <item id="cover-id" href="cover.png" media-type="image/png"/>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="ch1"/></spine>
</package>"#;
        let result = parse_opf(opf).unwrap();
        assert_eq!(result.cover_href, Some("cover.png".to_string()));
    }

    #[test]
    fn test_parse_opf_nav_href() {
        let opf = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata><dc:title xmlns:dc="http://purl.org/dc/elements/1.1/">Book</dc:title></metadata>
  <manifest>
    <item id="nav" href="toc.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="ch1"/></spine>
</package>"#;
        let result = parse_opf(opf).unwrap();
        assert_eq!(result.nav_href, Some("toc.xhtml".to_string()));
    }

    #[test]
    fn test_parse_ncx_nested() {
        let ncx = r#"<?xml version="1.0"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="part1" playOrder="1">
      <navLabel><text>Part I</text></navLabel>
      <content src="part1.xhtml"/>
      <navPoint id="ch1" playOrder="2">
        <navLabel><text>Chapter 1</text></navLabel>
        <content src="ch1.xhtml"/>
      </navPoint>
    </navPoint>
  </navMap>
</ncx>"#;
        let result = parse_ncx(ncx).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].title, "Part I");
        assert_eq!(result[0].children.len(), 1);
        assert_eq!(result[0].children[0].href, "ch1.xhtml");
    }

    #[test]
    fn test_parse_nav_toc_nested() {
        let nav = r#"<?xml version="1.0"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
  <body>
    <nav epub:type="toc">
      <ol>
        <li><a href="ch1.xhtml">Chapter 1</a></li>
        <li>
          <span>Part II</span>
          <ol>
            <li><a href="ch2.xhtml#start">Chapter 2</a></li>
          </ol>
        </li>
      </ol>
    </nav>
  </body>
</html>"#;
        let result = parse_nav_toc(nav).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].title, "Chapter 1");
        assert_eq!(result[0].href, "ch1.xhtml");
        assert_eq!(result[1].title, "Part II");
        assert_eq!(result[1].children.len(), 1);
        assert_eq!(result[1].children[0].href, "ch2.xhtml#start");
    }

    #[test]
    fn test_parse_nav_toc_ignores_landmarks() {
        let nav = r#"<?xml version="1.0"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
  <body>
    <nav epub:type="landmarks">
      <ol><li><a href="cover.xhtml" epub:type="cover">Cover</a></li></ol>
    </nav>
    <nav epub:type="toc">
      <ol><li><a href="ch1.xhtml">Chapter 1</a></li></ol>
    </nav>
  </body>
</html>"#;
        let result = parse_nav_toc(nav).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].title, "Chapter 1");
    }
}
