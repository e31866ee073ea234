//! Book ingestion: unpack the EPUB, normalize every spine chapter, persist
//! chapter artifacts and assets, and create the book record.

use std::collections::HashSet;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::book::{Book, ChapterMeta};
use crate::epub::unpack;
use crate::error::Result;
use crate::normalize::normalize;
use crate::store::{BlobStore, paths, save_json};

/// Ingest EPUB bytes into the blob store under `book_id`.
///
/// On success the book record is persisted and returned; the original bytes
/// are kept alongside the derived artifacts so exports and re-ingestion
/// never depend on the client re-uploading.
pub fn ingest_book(
    store: &dyn BlobStore,
    asset_url_prefix: &str,
    book_id: Uuid,
    bytes: &[u8],
) -> Result<Book> {
    let unpacked = unpack(bytes)?;
    let id = book_id.to_string();

    store.put(&id, &paths::original_epub(), bytes)?;

    let asset_hrefs: HashSet<&str> = unpacked.assets.keys().map(|k| k.as_str()).collect();
    let rewriter = |href: &str| {
        asset_hrefs
            .contains(href)
            .then(|| format!("{asset_url_prefix}/{id}/assets/{href}"))
    };

    let mut chapters = Vec::with_capacity(unpacked.chapters.len());
    for (index, chapter) in unpacked.chapters.iter().enumerate() {
        let normalized = normalize(&chapter.xhtml, &chapter.href, &rewriter);
        store.put(
            &id,
            &paths::chapter_html(index),
            normalized.html.as_bytes(),
        )?;
        save_json(store, &id, &paths::chapter_tokens(index), &normalized.tokens)?;

        let title = normalized
            .title
            .or_else(|| toc_title(&unpacked.toc, index))
            .unwrap_or_else(|| format!("Chapter {}", index + 1));
        chapters.push(ChapterMeta {
            index,
            title,
            word_count: normalized.word_count,
        });
    }

    for (href, asset) in &unpacked.assets {
        store.put(&id, &paths::asset(href), &asset.data)?;
    }

    let book = Book {
        id: book_id,
        metadata: unpacked.metadata,
        toc: unpacked.toc,
        chapters,
        cover_href: unpacked.cover_href,
        created_at: Utc::now(),
    };
    save_json(store, &id, &paths::metadata(), &book)?;

    info!(
        book = %id,
        title = %book.metadata.title,
        chapters = book.chapters.len(),
        "ingested book"
    );
    Ok(book)
}

/// First TOC entry pointing at a chapter index.
fn toc_title(toc: &[crate::book::TocNode], index: usize) -> Option<String> {
    for node in toc {
        if node.chapter_index == index && !node.title.is_empty() {
            return Some(node.title.clone());
        }
        if let Some(found) = toc_title(&node.children, index) {
            return Some(found);
        }
    }
    None
}
