//! Persisted book list and reading positions.
//!
//! The library is a small TOML file shared by every open book in the process.
//! Each operation is a read-modify-write of the whole file and runs under the
//! library's [`FifoMutex`], so two location updates landing together cannot
//! drop one another.

use crate::mutex::FifoMutex;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where narration last was in each book.
#[async_trait]
pub trait LocationStore: Send + Sync {
    async fn get_book_location(&self, book_id: &str) -> Result<Option<String>>;
    async fn update_book_location(&self, book_id: &str, locator: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookEntry {
    pub id: String,
    pub title: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    books: Vec<BookEntry>,
}

pub struct BookLibrary {
    path: PathBuf,
    lock: FifoMutex,
}

impl BookLibrary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: FifoMutex::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a book, or refresh title and path of one already listed. A stored
    /// location survives re-adding.
    pub async fn add_book(&self, entry: BookEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        match file.books.iter_mut().find(|book| book.id == entry.id) {
            Some(existing) => {
                existing.title = entry.title;
                existing.path = entry.path;
                if entry.location.is_some() {
                    existing.location = entry.location;
                }
            }
            None => {
                info!(id = %entry.id, title = %entry.title, "Adding book to library");
                file.books.push(entry);
            }
        }
        self.write(&file).await
    }

    /// Returns whether the book was listed.
    pub async fn remove_book(&self, book_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        let before = file.books.len();
        file.books.retain(|book| book.id != book_id);
        if file.books.len() == before {
            return Ok(false);
        }
        info!(id = %book_id, "Removed book from library");
        self.write(&file).await?;
        Ok(true)
    }

    pub async fn list_books(&self) -> Result<Vec<BookEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.books)
    }

    async fn read(&self) -> Result<LibraryFile> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No library file yet");
                return Ok(LibraryFile::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Reading library {}", self.path.display()));
            }
        };
        match toml::from_str::<LibraryFile>(&data) {
            Ok(file) => Ok(file),
            Err(err) => {
                warn!(path = %self.path.display(), "Invalid library TOML, starting empty: {err}");
                Ok(LibraryFile::default())
            }
        }
    }

    async fn write(&self, file: &LibraryFile) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Creating library dir {}", parent.display()))?;
        }
        let contents = toml::to_string(file).context("Serializing library")?;
        let temp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&temp, contents)
            .await
            .with_context(|| format!("Writing library {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("Replacing library {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl LocationStore for BookLibrary {
    async fn get_book_location(&self, book_id: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let file = self.read().await?;
        Ok(file
            .books
            .into_iter()
            .find(|book| book.id == book_id)
            .and_then(|book| book.location))
    }

    async fn update_book_location(&self, book_id: &str, locator: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        match file.books.iter_mut().find(|book| book.id == book_id) {
            Some(book) => book.location = Some(locator.to_string()),
            None => {
                warn!(id = %book_id, "Location update for a book not in the library; adding it");
                file.books.push(BookEntry {
                    id: book_id.to_string(),
                    title: book_id.to_string(),
                    path: PathBuf::new(),
                    location: Some(locator.to_string()),
                });
            }
        }
        debug!(id = %book_id, %locator, "Saving book location");
        self.write(&file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(id: &str) -> BookEntry {
        BookEntry {
            id: id.into(),
            title: format!("Title {id}"),
            path: PathBuf::from(format!("/books/{id}.epub")),
            location: None,
        }
    }

    #[tokio::test]
    async fn add_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let library = BookLibrary::new(dir.path().join("library.toml"));
        assert!(library.list_books().await.unwrap().is_empty());

        library.add_book(entry("a")).await.unwrap();
        library.add_book(entry("b")).await.unwrap();
        let ids: Vec<_> = library
            .list_books()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(library.remove_book("a").await.unwrap());
        assert!(!library.remove_book("a").await.unwrap());
        assert_eq!(library.list_books().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn location_survives_re_adding() {
        let dir = tempfile::tempdir().unwrap();
        let library = BookLibrary::new(dir.path().join("library.toml"));
        library.add_book(entry("a")).await.unwrap();
        library.update_book_location("a", "range(10,20)").await.unwrap();
        library.add_book(entry("a")).await.unwrap();
        assert_eq!(
            library.get_book_location("a").await.unwrap().as_deref(),
            Some("range(10,20)")
        );
        assert_eq!(library.get_book_location("zzz").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(BookLibrary::new(dir.path().join("library.toml")));
        let mut tasks = Vec::new();
        for idx in 0..16 {
            let library = Arc::clone(&library);
            tasks.push(tokio::spawn(async move {
                library
                    .update_book_location(&format!("book-{idx}"), &format!("{idx}:0"))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let books = library.list_books().await.unwrap();
        assert_eq!(books.len(), 16);
        for idx in 0..16 {
            let id = format!("book-{idx}");
            let location = library.get_book_location(&id).await.unwrap();
            assert_eq!(location, Some(format!("{idx}:0")));
        }
    }
}
