//! Durable storage: a per-book namespaced blob store plus the book-record
//! metadata store layered on top of it.
//!
//! Writers publish blobs atomically (write to a temp file in the target
//! directory, then rename), so a reader holding a path never observes a torn
//! blob. The key mutexes in the pipeline controller guarantee a single
//! writer per `(book, chapter, language)`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::book::Book;
use crate::error::{Error, Result};

/// Relative blob paths of the per-book layout.
pub mod paths {
    pub fn original_epub() -> String {
        "original.epub".into()
    }

    pub fn metadata() -> String {
        "metadata.json".into()
    }

    pub fn chapter_html(chapter: usize) -> String {
        format!("chapters/{chapter}.html")
    }

    /// Token table of the chapter's own language.
    pub fn chapter_tokens(chapter: usize) -> String {
        format!("chapters/{chapter}.tokens.json")
    }

    /// Token table of a translated rendition.
    pub fn chapter_tokens_lang(chapter: usize, lang: &str) -> String {
        format!("chapters/{chapter}.tokens.{lang}.json")
    }

    /// Rendered HTML of a translated rendition.
    pub fn chapter_html_lang(chapter: usize, lang: &str) -> String {
        format!("chapters/{chapter}.{lang}.html")
    }

    pub fn asset(href: &str) -> String {
        format!("assets/{href}")
    }

    pub fn audio_canonical(lang: &str, chapter: usize, ext: &str) -> String {
        format!("audio/{lang}/{chapter}.canonical.{ext}")
    }

    pub fn audio_source(lang: &str, chapter: usize, ext: &str) -> String {
        format!("audio/{lang}/{chapter}.source.{ext}")
    }

    pub fn audio_descriptor(lang: &str, chapter: usize) -> String {
        format!("audio/{lang}/{chapter}.json")
    }

    pub fn sync_table(lang: &str, chapter: usize) -> String {
        format!("sync/{lang}/{chapter}.json")
    }

    pub fn journal(lang: &str, chapter: usize) -> String {
        format!("journal/{lang}/{chapter}.log")
    }
}

/// Byte-addressable, per-book namespaced storage.
pub trait BlobStore: Send + Sync {
    /// Atomically publish a blob.
    fn put(&self, book: &str, rel: &str, bytes: &[u8]) -> Result<()>;
    fn get(&self, book: &str, rel: &str) -> Result<Vec<u8>>;
    fn exists(&self, book: &str, rel: &str) -> bool;
    fn size(&self, book: &str, rel: &str) -> Result<u64>;
    fn delete(&self, book: &str, rel: &str) -> Result<()>;
    /// Copy one blob to another key within the same book.
    fn copy(&self, book: &str, from: &str, to: &str) -> Result<()>;
    /// Append one line to an append-only log blob.
    fn append_line(&self, book: &str, rel: &str, line: &str) -> Result<()>;
    /// Relative paths of all blobs under a prefix, sorted.
    fn list_prefix(&self, book: &str, prefix: &str) -> Result<Vec<String>>;
    /// Remove a book's entire namespace.
    fn delete_book(&self, book: &str) -> Result<()>;
    fn list_books(&self) -> Result<Vec<String>>;
}

/// Filesystem-backed blob store rooted at a storage directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, book: &str, rel: &str) -> Result<PathBuf> {
        check_component(book)?;
        for component in rel.split('/') {
            check_component(component)?;
        }
        Ok(self.root.join(book).join(rel))
    }
}

fn check_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component == ".."
        || component == "."
        || component.contains(['\\', '\0'])
    {
        return Err(Error::InvalidRange(format!(
            "invalid storage path component: {component:?}"
        )));
    }
    Ok(())
}

impl BlobStore for FsBlobStore {
    fn put(&self, book: &str, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(book, rel)?;
        let dir = path.parent().ok_or_else(|| {
            Error::Invariant(format!("blob path {} has no parent", path.display()))
        })?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        debug!(book, rel, size = bytes.len(), "published blob");
        Ok(())
    }

    fn get(&self, book: &str, rel: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(book, rel)?;
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("{book}/{rel}")),
            _ => Error::Io(e),
        })
    }

    fn exists(&self, book: &str, rel: &str) -> bool {
        self.blob_path(book, rel)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    fn size(&self, book: &str, rel: &str) -> Result<u64> {
        let path = self.blob_path(book, rel)?;
        let meta = fs::metadata(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("{book}/{rel}")),
            _ => Error::Io(e),
        })?;
        Ok(meta.len())
    }

    fn delete(&self, book: &str, rel: &str) -> Result<()> {
        let path = self.blob_path(book, rel)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn copy(&self, book: &str, from: &str, to: &str) -> Result<()> {
        let bytes = self.get(book, from)?;
        self.put(book, to, &bytes)
    }

    fn append_line(&self, book: &str, rel: &str, line: &str) -> Result<()> {
        let path = self.blob_path(book, rel)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn list_prefix(&self, book: &str, prefix: &str) -> Result<Vec<String>> {
        check_component(book)?;
        let base = self.root.join(book);
        let dir = base.join(prefix);
        let mut found = Vec::new();
        if dir.is_dir() {
            walk(&dir, &base, &mut found)?;
        }
        found.sort();
        Ok(found)
    }

    fn delete_book(&self, book: &str) -> Result<()> {
        check_component(book)?;
        let dir = self.root.join(book);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(book.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_books(&self) -> Result<Vec<String>> {
        let mut books = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                books.push(name.to_string());
            }
        }
        books.sort();
        Ok(books)
    }
}

fn walk(dir: &Path, base: &Path, found: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(&path, base, found)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            found.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// JSON record helpers
// ----------------------------------------------------------------------------

pub fn save_json<T: Serialize>(
    store: &dyn BlobStore,
    book: &str,
    rel: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.put(book, rel, &bytes)
}

pub fn load_json<T: DeserializeOwned>(store: &dyn BlobStore, book: &str, rel: &str) -> Result<T> {
    let bytes = store.get(book, rel)?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ----------------------------------------------------------------------------
// Metadata store
// ----------------------------------------------------------------------------

/// Per-book record store, layered over the blob store.
pub struct MetadataStore {
    store: std::sync::Arc<dyn BlobStore>,
}

impl MetadataStore {
    pub fn new(store: std::sync::Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, book: &Book) -> Result<()> {
        save_json(
            self.store.as_ref(),
            &book.id.to_string(),
            &paths::metadata(),
            book,
        )
    }

    pub fn load(&self, book_id: &str) -> Result<Book> {
        load_json(self.store.as_ref(), book_id, &paths::metadata())
    }

    pub fn list(&self) -> Result<Vec<Book>> {
        let mut books = Vec::new();
        for id in self.store.list_books()? {
            match self.load(&id) {
                Ok(book) => books.push(book),
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(books)
    }

    pub fn delete(&self, book_id: &str) -> Result<()> {
        self.store.delete_book(book_id)
    }
}
