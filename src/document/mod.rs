//! Backend-agnostic view of the rendered document.
//!
//! The player only ever talks to [`DocumentAdapter`]. Two variants exist:
//! [`range::RangeAdapter`] for reflowable documents addressed by text ranges
//! and [`fixed::FixedPageAdapter`] for paginated documents whose text layer
//! appears asynchronously after each page render. The variant is chosen once
//! when a book is opened.

pub mod fixed;
pub mod range;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use fixed::{FixedPageAdapter, LinePages, PageLocator, PagedRenderer, RenderGate};
pub use range::{RangeAdapter, ReflowRenderer, TextRange, TextReflow};

/// One narration unit. `locator` is opaque outside the adapter that made it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Paragraph {
    pub text: String,
    pub locator: String,
}

impl Paragraph {
    pub fn new(text: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            locator: locator.into(),
        }
    }
}

#[async_trait]
pub trait DocumentAdapter: Send + Sync {
    /// Paragraphs visible on the current page, in reading order.
    async fn current_view_paragraphs(&self) -> Result<Vec<Paragraph>>;

    /// Paragraphs of the following page without turning to it.
    async fn next_view_paragraphs(&self) -> Result<Vec<Paragraph>>;

    /// Paragraphs of the preceding page without turning to it.
    async fn previous_view_paragraphs(&self) -> Result<Vec<Paragraph>>;

    fn highlight_paragraph(&self, locator: &str);

    fn remove_highlight(&self, locator: &str);

    /// Turn forward. Resolves once the new page's text is extractable and its
    /// paragraphs have been published.
    async fn move_to_next_page(&self) -> Result<()>;

    /// Turn backward; same contract as [`DocumentAdapter::move_to_next_page`].
    async fn move_to_previous_page(&self) -> Result<()>;

    /// Publish the paragraphs of the page currently shown, plus lookahead.
    async fn display(&self) -> Result<()>;
}
