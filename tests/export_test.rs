mod common;

use std::io::{Cursor, Read};

use readalong::book::{AudioArtifact, AudioFormat, AudioSourceKind};
use readalong::export::export_book;
use readalong::export::smil::collect_ids;
use readalong::ingest::ingest_book;
use readalong::store::{BlobStore, FsBlobStore, load_json, paths, save_json};
use readalong::{SyncEntry, SyncTable, TokenTable};
use uuid::Uuid;
use zip::ZipArchive;

const RATE: u32 = 1000;

/// Ingest the fixture book and attach synced audio to chapters 0 and 1.
fn exported_fixture() -> (tempfile::TempDir, FsBlobStore, String, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path()).unwrap();
    let book = ingest_book(&store, "/storage/books", Uuid::new_v4(), &common::build_epub())
        .unwrap();
    let id = book.id.to_string();

    for chapter in 0..2usize {
        let tokens: TokenTable =
            load_json(&store, &id, &paths::chapter_tokens(chapter)).unwrap();
        let duration = tokens.len() as f64;
        store
            .put(
                &id,
                &paths::audio_canonical("en", chapter, "wav"),
                &common::tone_wav(RATE, duration),
            )
            .unwrap();
        let artifact = AudioArtifact {
            source: AudioSourceKind::Tts,
            voice: Some("en".into()),
            provisional_timing: None,
            format: AudioFormat::Wav,
            duration,
        };
        save_json(&store, &id, &paths::audio_descriptor("en", chapter), &artifact).unwrap();

        // one second per token, a skipped entry in the middle
        let entries: Vec<SyncEntry> = tokens
            .iter()
            .enumerate()
            .map(|(i, token)| {
                if i == 2 {
                    SyncEntry {
                        token_id: token.id.clone(),
                        clip_begin: None,
                        clip_end: None,
                        skipped: true,
                    }
                } else {
                    SyncEntry::timed(&token.id, i as f64, i as f64 + 0.9)
                }
            })
            .collect();
        save_json(&store, &id, &paths::sync_table("en", chapter), &SyncTable::new(entries))
            .unwrap();
    }

    let exported = export_book(&store, &id, "/storage/books").unwrap();
    (dir, store, id, exported.bytes)
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> String {
    let mut file = archive.by_name(name).unwrap_or_else(|_| panic!("missing {name}"));
    let mut content = String::new();
    file.read_to_string(&mut content).unwrap();
    content
}

#[test]
fn test_export_structure_and_overlay_links() {
    let (_dir, _store, _id, bytes) = exported_fixture();
    let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();

    // mimetype must be the first entry, stored uncompressed
    assert_eq!(archive.by_index(0).unwrap().name(), "mimetype");

    let opf = read_entry(&mut archive, "OEBPS/content.opf");
    assert!(opf.contains(r#"version="3.0""#));
    assert!(opf.contains(r#"media-overlay="smil0""#));
    assert!(opf.contains(r#"media-overlay="smil1""#));
    // the unsynced third chapter has no overlay link
    assert!(!opf.contains(r#"media-overlay="smil2""#));
    assert!(opf.contains("media:duration"));
    assert!(opf.contains(r#"properties="cover-image""#));
    assert!(opf.contains(r#"properties="nav""#));

    // chapters, smil, audio, nav, assets all present
    for name in [
        "OEBPS/chap0.xhtml",
        "OEBPS/chap1.xhtml",
        "OEBPS/chap2.xhtml",
        "OEBPS/chap0.smil",
        "OEBPS/chap1.smil",
        "OEBPS/audio/0.wav",
        "OEBPS/audio/1.wav",
        "OEBPS/nav.xhtml",
        "OEBPS/assets/styles/main.css",
        "OEBPS/assets/images/cover.jpg",
    ] {
        assert!(archive.by_name(name).is_ok(), "missing {name}");
    }
    assert!(archive.by_name("OEBPS/chap2.smil").is_err());
}

#[test]
fn test_smil_references_resolve_and_clips_are_monotone() {
    let (_dir, _store, _id, bytes) = exported_fixture();
    let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();

    for chapter in 0..2 {
        let html = read_entry(&mut archive, &format!("OEBPS/chap{chapter}.xhtml"));
        let smil = read_entry(&mut archive, &format!("OEBPS/chap{chapter}.smil"));
        let ids = collect_ids(&html);

        let mut last_end = String::new();
        for line in smil.split('<') {
            if let Some(rest) = line.strip_prefix("text src=\"") {
                let src = rest.split('"').next().unwrap();
                let (_, fragment) = src.split_once('#').expect("text src without fragment");
                assert!(ids.contains(fragment), "unresolved span id {fragment}");
            }
            if let Some(rest) = line.strip_prefix("audio ") {
                let begin = rest.split("clipBegin=\"").nth(1).unwrap().split('"').next().unwrap();
                let end = rest.split("clipEnd=\"").nth(1).unwrap().split('"').next().unwrap();
                assert!(begin < end, "clip not forward: {begin}..{end}");
                assert!(
                    last_end.as_str() <= begin,
                    "clips overlap: {last_end} then {begin}"
                );
                last_end = end.to_string();
            }
        }
        // the skipped token is omitted entirely
        assert!(!smil.contains("#w2\""));
    }
}

#[test]
fn test_export_reingest_roundtrip_preserves_tokens() {
    let (_dir, store, id, bytes) = exported_fixture();

    let dir2 = tempfile::tempdir().unwrap();
    let store2 = FsBlobStore::new(dir2.path()).unwrap();
    let book2 = ingest_book(&store2, "/storage/books", Uuid::new_v4(), &bytes)
        .expect("exported EPUB must re-ingest");
    let id2 = book2.id.to_string();

    assert_eq!(book2.chapters.len(), 3);
    for chapter in 0..3usize {
        let original: TokenTable =
            load_json(&store, &id, &paths::chapter_tokens(chapter)).unwrap();
        let roundtrip: TokenTable =
            load_json(&store2, &id2, &paths::chapter_tokens(chapter)).unwrap();
        assert_eq!(original, roundtrip, "chapter {chapter} tokens changed");
    }
}
