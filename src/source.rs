//! Source text loading.
//!
//! Opens a book file and returns its narratable text. EPUB chapters go through
//! a lightweight HTML-to-text pass, Markdown loses its inline markup, and
//! anything else is read as plain text. The file extension also decides which
//! document backend presents the text.

use anyhow::{Context, Result};
use epub::doc::EpubDoc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

static RE_MARKDOWN_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").unwrap());
static RE_INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static RE_EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*{1,3}|_{2,3})([^*_]+)(\*{1,3}|_{2,3})").unwrap());
static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s{0,3}#{1,6}\s+").unwrap());
static RE_HORIZONTAL_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{00A0}]+").unwrap());
static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n(\s*\n)+").unwrap());

/// How the document is paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Reflowable text addressed by ranges.
    Reflowable,
    /// Fixed pages whose text layer appears after rendering.
    FixedPage,
}

#[derive(Debug, Clone)]
pub struct SourceText {
    pub title: String,
    pub text: String,
    pub layout: Layout,
}

pub fn layout_for(path: &Path) -> Layout {
    match extension(path).as_deref() {
        Some("epub" | "md" | "markdown") => Layout::Reflowable,
        _ => Layout::FixedPage,
    }
}

pub fn load_source(path: &Path) -> Result<SourceText> {
    let title = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("Untitled")
        .to_string();
    let text = match extension(path).as_deref() {
        Some("epub") => load_epub_text(path)?,
        Some("md" | "markdown") => strip_markdown(&read_text(path)?),
        _ => read_text(path)?,
    };
    let text = tidy(&text);
    if text.trim().is_empty() {
        warn!(path = %path.display(), "Source has no textual content");
    }
    info!(
        path = %path.display(),
        total_chars = text.len(),
        layout = ?layout_for(path),
        "Loaded source text"
    );
    Ok(SourceText {
        title,
        text,
        layout: layout_for(path),
    })
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn load_epub_text(path: &Path) -> Result<String> {
    info!(path = %path.display(), "Loading EPUB content");
    let mut doc =
        EpubDoc::new(path).with_context(|| format!("Failed to open EPUB at {}", path.display()))?;

    let mut combined = String::new();
    let mut chapters = 0usize;
    loop {
        if let Some((chapter, _mime)) = doc.get_current_str() {
            chapters += 1;
            if !combined.is_empty() {
                combined.push_str("\n\n");
            }
            // Wide wrap width so no hard line breaks get baked into paragraphs.
            let plain = match html2text::from_read(chapter.as_bytes(), 10_000) {
                Ok(clean) => clean,
                Err(err) => {
                    warn!(chapter = chapters, "html2text failed: {err}");
                    chapter
                }
            };
            debug!(chapter = chapters, added_chars = plain.len(), "Parsed chapter");
            combined.push_str(&plain);
        }
        if !doc.go_next() {
            break;
        }
    }
    debug!(chapters, "Finished walking EPUB spine");
    Ok(combined)
}

/// Drop inline Markdown markup, keeping the readable text.
pub fn strip_markdown(text: &str) -> String {
    let text = RE_HEADING.replace_all(text, "");
    let text = RE_MARKDOWN_LINK.replace_all(&text, "$1");
    let text = RE_INLINE_CODE.replace_all(&text, "$1");
    RE_EMPHASIS.replace_all(&text, "$2").into_owned()
}

/// Collapse runs of spaces and of blank lines.
fn tidy(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = RE_HORIZONTAL_WS.replace_all(&text, " ");
    RE_BLANK_RUNS.replace_all(&text, "\n\n").trim().to_string()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_extension() {
        assert_eq!(layout_for(Path::new("a.EPUB")), Layout::Reflowable);
        assert_eq!(layout_for(Path::new("notes.md")), Layout::Reflowable);
        assert_eq!(layout_for(Path::new("scan.txt")), Layout::FixedPage);
        assert_eq!(layout_for(Path::new("noext")), Layout::FixedPage);
    }

    #[test]
    fn markdown_markup_is_removed() {
        let md = "# Title\n\nSee [the docs](http://x.y) and `cargo` for **bold** text.";
        assert_eq!(
            strip_markdown(md),
            "Title\n\nSee the docs and cargo for bold text."
        );
    }

    #[test]
    fn plain_text_is_tidied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.txt");
        fs::write(&path, "First  line.\r\n\r\n\r\n\r\nSecond\tline.\n").unwrap();
        let source = load_source(&path).unwrap();
        assert_eq!(source.title, "book");
        assert_eq!(source.text, "First line.\n\nSecond line.");
        assert_eq!(source.layout, Layout::FixedPage);
    }
}
