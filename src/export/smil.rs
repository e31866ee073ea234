//! SMIL media-overlay documents: one per synced chapter, `<par>` elements in
//! token order pairing a text span reference with an audio clip.

use std::collections::HashSet;
use std::io::Cursor;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::{Reader, events::Event as ReadEvent};

use crate::book::SyncTable;
use crate::error::{Error, Result};

/// Format seconds as a SMIL clock value, `HH:MM:SS.mmm`.
pub fn clock(seconds: f64) -> String {
    let millis = (seconds * 1000.0).round() as u64;
    let (ms, rest) = (millis % 1000, millis / 1000);
    let (s, rest) = (rest % 60, rest / 60);
    let (m, h) = (rest % 60, rest / 60);
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

/// Generate the SMIL document for one chapter.
///
/// Skipped and untimed entries are omitted; the remaining `<par>` elements
/// appear in token order.
pub fn generate_smil(
    chapter_index: usize,
    text_href: &str,
    audio_href: &str,
    sync: &SyncTable,
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .unwrap();

    let mut smil = BytesStart::new("smil");
    smil.push_attribute(("xmlns", "http://www.w3.org/ns/SMIL"));
    smil.push_attribute(("xmlns:epub", "http://www.idpf.org/2007/ops"));
    smil.push_attribute(("version", "3.0"));
    writer.write_event(Event::Start(smil)).unwrap();

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .unwrap();

    let mut seq = BytesStart::new("seq");
    seq.push_attribute(("id", format!("seq{chapter_index}").as_str()));
    seq.push_attribute(("epub:textref", text_href));
    seq.push_attribute(("epub:type", "bodymatter"));
    writer.write_event(Event::Start(seq)).unwrap();

    for entry in &sync.entries {
        let Some((begin, end)) = entry.interval() else {
            continue;
        };
        if entry.skipped {
            continue;
        }

        let mut par = BytesStart::new("par");
        par.push_attribute(("id", format!("par-{}", entry.token_id).as_str()));
        writer.write_event(Event::Start(par)).unwrap();

        let mut text = BytesStart::new("text");
        text.push_attribute(("src", format!("{text_href}#{}", entry.token_id).as_str()));
        writer.write_event(Event::Empty(text)).unwrap();

        let mut audio = BytesStart::new("audio");
        audio.push_attribute(("src", audio_href));
        audio.push_attribute(("clipBegin", clock(begin).as_str()));
        audio.push_attribute(("clipEnd", clock(end).as_str()));
        writer.write_event(Event::Empty(audio)).unwrap();

        writer
            .write_event(Event::End(quick_xml::events::BytesEnd::new("par")))
            .unwrap();
    }

    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new("seq")))
        .unwrap();
    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new("body")))
        .unwrap();
    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new("smil")))
        .unwrap();

    String::from_utf8(writer.into_inner().into_inner()).unwrap()
}

/// Total timed duration of a sync table, for the `media:duration` metadata.
pub fn overlay_duration(sync: &SyncTable) -> f64 {
    sync.entries
        .iter()
        .filter(|e| !e.skipped)
        .filter_map(|e| e.interval())
        .map(|(begin, end)| end - begin)
        .sum()
}

/// Collect every element id declared in a chapter document.
pub fn collect_ids(html: &str) -> HashSet<String> {
    let mut reader = Reader::from_str(html);
    {
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
    }
    let mut ids = HashSet::new();
    loop {
        match reader.read_event() {
            Ok(ReadEvent::Start(e)) | Ok(ReadEvent::Empty(e)) => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"id" {
                        ids.insert(String::from_utf8_lossy(&attr.value).into_owned());
                    }
                }
            }
            Ok(ReadEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    ids
}

/// Check that every timed entry's text reference resolves to an id present
/// in the chapter document.
pub fn validate_overlay(chapter_html: &str, sync: &SyncTable) -> Result<()> {
    let ids = collect_ids(chapter_html);
    for entry in &sync.entries {
        if entry.is_timed() && !entry.skipped && !ids.contains(&entry.token_id) {
            return Err(Error::Invariant(format!(
                "overlay references missing span id {}",
                entry.token_id
            )));
        }
    }
    Ok(())
}
