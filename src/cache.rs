//! Book-scoped cache of synthesized paragraph audio.
//!
//! Files live under `<cache_dir>/<sha256(book id)>/tts/` and are named after a
//! hash of the paragraph locator, so the same paragraph always maps to the
//! same file. The in-memory index only covers the active book; switching
//! books clears it. The index is capped and evicts least recently used
//! entries; files on disk are left alone and picked up again on the next
//! lookup.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub fn hash_dir(cache_root: &Path, book_id: &str) -> PathBuf {
    cache_root.join(sha256_hex(book_id.as_bytes()))
}

pub fn tts_dir(cache_root: &Path, book_id: &str) -> PathBuf {
    hash_dir(cache_root, book_id).join("tts")
}

/// File a paragraph's audio is stored at.
pub fn audio_path(cache_root: &Path, book_id: &str, locator: &str, extension: &str) -> PathBuf {
    let hash = sha256_hex(locator.as_bytes());
    tts_dir(cache_root, book_id).join(format!("p-{hash}.{extension}"))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub struct AudioCache {
    root: PathBuf,
    extension: String,
    capacity: usize,
    book_id: Option<String>,
    entries: HashMap<String, PathBuf>,
    recency: VecDeque<String>,
}

impl AudioCache {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>, capacity: usize) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            capacity: capacity.max(1),
            book_id: None,
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn book_id(&self) -> Option<&str> {
        self.book_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scope the cache to `book_id`. Entries of another book are dropped;
    /// returns whether that happened.
    pub fn set_book(&mut self, book_id: &str) -> bool {
        if self.book_id.as_deref() == Some(book_id) {
            return false;
        }
        let dropped = self.entries.len();
        self.clear();
        info!(
            book_id,
            previous = ?self.book_id,
            dropped,
            "Switched audio cache to new book"
        );
        self.book_id = Some(book_id.to_string());
        dropped > 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Derived location for a paragraph of the active book.
    pub fn path_for(&self, book_id: &str, locator: &str) -> PathBuf {
        audio_path(&self.root, book_id, locator, &self.extension)
    }

    /// Cached path for `(book_id, locator)`. Falls back to a previously
    /// written, non-empty file at the derived path.
    pub fn get(&mut self, book_id: &str, locator: &str) -> Option<PathBuf> {
        if self.book_id.as_deref() != Some(book_id) {
            return None;
        }
        if let Some(path) = self.entries.get(locator).cloned() {
            if is_playable(&path) {
                self.touch(locator);
                return Some(path);
            }
            warn!(path = %path.display(), "Cached audio vanished; dropping entry");
            self.remove(locator);
        }

        let on_disk = self.find_on_disk(book_id, locator)?;
        debug!(path = %on_disk.display(), "Reusing audio from disk cache");
        self.insert(book_id, locator, on_disk.clone());
        Some(on_disk)
    }

    /// Playable file for the paragraph under the book's tts dir. The
    /// synthesizer may have picked another extension than the configured one.
    fn find_on_disk(&self, book_id: &str, locator: &str) -> Option<PathBuf> {
        let preferred = self.path_for(book_id, locator);
        if is_playable(&preferred) {
            return Some(preferred);
        }
        let stem = format!("p-{}", sha256_hex(locator.as_bytes()));
        fs::read_dir(tts_dir(&self.root, book_id))
            .ok()?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .find(|path| {
                path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str())
                    && is_playable(path)
            })
    }

    pub fn insert(&mut self, book_id: &str, locator: &str, path: PathBuf) {
        if self.book_id.as_deref() != Some(book_id) {
            debug!(book_id, "Ignoring audio for a book that is no longer active");
            return;
        }
        self.entries.insert(locator.to_string(), path);
        self.touch(locator);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!(locator = %oldest, "Evicted least recently used audio entry");
        }
    }

    /// Move a freshly synthesized file to its derived path and index it.
    pub fn persist(&mut self, book_id: &str, locator: &str, produced: &Path) -> Result<PathBuf> {
        let extension = produced
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or(&self.extension)
            .to_string();
        let target = audio_path(&self.root, book_id, locator, &extension);
        if produced != target {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Creating audio cache dir {}", parent.display()))?;
            }
            if fs::rename(produced, &target).is_err() {
                fs::copy(produced, &target).with_context(|| {
                    format!(
                        "Copying synthesized audio {} to {}",
                        produced.display(),
                        target.display()
                    )
                })?;
                let _ = fs::remove_file(produced);
            }
        }
        self.insert(book_id, locator, target.clone());
        Ok(target)
    }

    fn touch(&mut self, locator: &str) {
        if let Some(pos) = self.recency.iter().position(|l| l == locator) {
            self.recency.remove(pos);
        }
        self.recency.push_back(locator.to_string());
    }

    fn remove(&mut self, locator: &str) {
        self.entries.remove(locator);
        if let Some(pos) = self.recency.iter().position(|l| l == locator) {
            self.recency.remove(pos);
        }
    }
}

fn is_playable(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false)
}
