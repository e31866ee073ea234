//! Shared fixtures: in-memory EPUB assembly and canonical WAV synthesis.

#![allow(dead_code)]

use std::io::{Cursor, Write};

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub const CHAPTER_ONE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>Down the Rabbit Hole</title></head>
<body>
<h1>Down the Rabbit Hole</h1>
<p>Alice was beginning to get very tired of sitting.</p>
<p><img src="images/rabbit.png" alt="rabbit"/></p>
</body>
</html>"#;

pub const CHAPTER_TWO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>The Pool of Tears</title></head>
<body>
<h1>The Pool of Tears</h1>
<p>Curiouser and curiouser, cried Alice.</p>
</body>
</html>"#;

pub const CHAPTER_THREE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>A Caucus Race</title></head>
<body>
<h1>A Caucus Race</h1>
<p>They were indeed a queer looking party.</p>
</body>
</html>"#;

/// Assemble a three-chapter EPUB 3 with a nested nav TOC, an NCX, a CSS
/// asset, and a cover image.
pub fn build_epub() -> Vec<u8> {
    let chapters = [
        ("ch1.xhtml", CHAPTER_ONE),
        ("ch2.xhtml", CHAPTER_TWO),
        ("ch3.xhtml", CHAPTER_THREE),
    ];

    let mut cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut cursor);
    let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let deflate =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    zip.start_file("META-INF/container.xml", deflate).unwrap();
    zip.write_all(
        br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
    )
    .unwrap();

    zip.start_file("OEBPS/content.opf", deflate).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="BookId">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="BookId">urn:uuid:3f1c7f8a-test</dc:identifier>
    <dc:title>Alice Test</dc:title>
    <dc:creator>Lewis Carroll</dc:creator>
    <dc:language>en</dc:language>
    <dc:publisher>Test House</dc:publisher>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch3" href="ch3.xhtml" media-type="application/xhtml+xml"/>
    <item id="css" href="styles/main.css" media-type="text/css"/>
    <item id="rabbit" href="images/rabbit.png" media-type="image/png"/>
    <item id="cover" href="images/cover.jpg" media-type="image/jpeg" properties="cover-image"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="ch1"/>
    <itemref idref="ch2"/>
    <itemref idref="ch3"/>
  </spine>
</package>"#,
    )
    .unwrap();

    zip.start_file("OEBPS/nav.xhtml", deflate).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>Contents</title></head>
<body>
  <nav epub:type="toc">
    <ol>
      <li><a href="ch1.xhtml">Down the Rabbit Hole</a></li>
      <li>
        <span>Later Chapters</span>
        <ol>
          <li><a href="ch2.xhtml">The Pool of Tears</a></li>
          <li><a href="ch3.xhtml">A Caucus Race</a></li>
        </ol>
      </li>
    </ol>
  </nav>
</body>
</html>"#,
    )
    .unwrap();

    zip.start_file("OEBPS/toc.ncx", deflate).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="n1" playOrder="1">
      <navLabel><text>Down the Rabbit Hole</text></navLabel>
      <content src="ch1.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#,
    )
    .unwrap();

    for (href, body) in chapters {
        zip.start_file(format!("OEBPS/{href}"), deflate).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }

    zip.start_file("OEBPS/styles/main.css", deflate).unwrap();
    zip.write_all(b"body { margin: 1em; }").unwrap();

    zip.start_file("OEBPS/images/rabbit.png", stored).unwrap();
    zip.write_all(&[0x89, b'P', b'N', b'G', 0, 0, 0, 0]).unwrap();

    zip.start_file("OEBPS/images/cover.jpg", stored).unwrap();
    zip.write_all(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]).unwrap();

    zip.finish().unwrap();
    cursor.into_inner()
}

/// A canonical mono 16-bit WAV of the given duration whose samples encode
/// their index, at 1 kHz for fast tests.
pub fn tone_wav(rate: u32, seconds: f64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
    let total = (rate as f64 * seconds) as usize;
    for i in 0..total {
        writer.write_sample((i % 500) as i16).unwrap();
    }
    writer.finalize().unwrap();
    cursor.into_inner()
}
