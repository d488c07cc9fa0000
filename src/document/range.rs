//! Range-based adapter for reflowable documents.
//!
//! Locators are continuous text ranges (`range(start,end)`). Once the renderer
//! has laid out a page its paragraphs can be read straight away, so getters
//! are usable the moment a page turn returns.

use super::{DocumentAdapter, Paragraph};
use crate::events::{EventHub, PlayerEvent};
use crate::pagination;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl fmt::Display for TextRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "range({},{})", self.start, self.end)
    }
}

impl FromStr for TextRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .strip_prefix("range(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| anyhow!("not a range locator: {s}"))?;
        let (start, end) = inner
            .split_once(',')
            .ok_or_else(|| anyhow!("range locator without separator: {s}"))?;
        let start: usize = start.trim().parse()?;
        let end: usize = end.trim().parse()?;
        if end < start {
            bail!("range locator ends before it starts: {s}");
        }
        Ok(Self { start, end })
    }
}

/// Rendering backend for reflowable documents.
pub trait ReflowRenderer: Send {
    fn page_count(&self) -> usize;
    fn current_page(&self) -> usize;
    fn go_to_page(&mut self, page: usize) -> Result<()>;
    /// Paragraphs laid out on `page`, in reading order.
    fn page_paragraphs(&self, page: usize) -> Vec<(TextRange, String)>;
    /// Returns whether the highlight state changed.
    fn set_highlight(&mut self, range: TextRange, on: bool) -> bool;
    fn text_at(&self, range: TextRange) -> Option<String>;
}

/// In-memory reflowable renderer: paginates plain text by font size.
pub struct TextReflow {
    text: String,
    pages: Vec<Vec<TextRange>>,
    current: usize,
    highlighted: BTreeSet<TextRange>,
}

impl TextReflow {
    pub fn new(text: String, font_size: u32) -> Self {
        let pages = pagination::paginate(&text, font_size)
            .into_iter()
            .map(|page| {
                page.into_iter()
                    .map(|range| TextRange {
                        start: range.start,
                        end: range.end,
                    })
                    .collect()
            })
            .collect::<Vec<Vec<TextRange>>>();
        info!(
            chars = text.len(),
            pages = pages.len(),
            font_size,
            "Laid out reflowable text"
        );
        Self {
            text,
            pages,
            current: 0,
            highlighted: BTreeSet::new(),
        }
    }

    /// Page holding the given locator, used to reopen at a stored position.
    pub fn page_for_locator(&self, locator: &str) -> Option<usize> {
        let range: TextRange = locator.parse().ok()?;
        self.pages
            .iter()
            .position(|page| page.iter().any(|r| (r.start..=r.end).contains(&range.start)))
    }

    pub fn is_highlighted(&self, range: TextRange) -> bool {
        self.highlighted.contains(&range)
    }
}

impl ReflowRenderer for TextReflow {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn current_page(&self) -> usize {
        self.current
    }

    fn go_to_page(&mut self, page: usize) -> Result<()> {
        if page >= self.pages.len() {
            bail!("page {page} out of range (pages={})", self.pages.len());
        }
        self.current = page;
        Ok(())
    }

    fn page_paragraphs(&self, page: usize) -> Vec<(TextRange, String)> {
        self.pages
            .get(page)
            .map(|ranges| {
                ranges
                    .iter()
                    .map(|range| (*range, self.text[range.start..range.end].to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set_highlight(&mut self, range: TextRange, on: bool) -> bool {
        if on {
            self.highlighted.insert(range)
        } else {
            self.highlighted.remove(&range)
        }
    }

    fn text_at(&self, range: TextRange) -> Option<String> {
        self.text.get(range.start..range.end).map(str::to_string)
    }
}

pub struct RangeAdapter<R: ReflowRenderer> {
    renderer: Mutex<R>,
    hub: Arc<EventHub>,
}

impl<R: ReflowRenderer> RangeAdapter<R> {
    pub fn new(renderer: R, hub: Arc<EventHub>) -> Self {
        Self {
            renderer: Mutex::new(renderer),
            hub,
        }
    }

    pub fn current_page(&self) -> usize {
        self.renderer().current_page()
    }

    pub fn with_renderer<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(&self.renderer())
    }

    fn renderer(&self) -> MutexGuard<'_, R> {
        self.renderer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn paragraphs_for(&self, page: Option<usize>) -> Vec<Paragraph> {
        let renderer = self.renderer();
        match page {
            Some(page) if page < renderer.page_count() => renderer
                .page_paragraphs(page)
                .into_iter()
                .map(|(range, text)| Paragraph::new(text, range.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn turn(&self, forward: bool) -> Result<usize> {
        let mut renderer = self.renderer();
        let current = renderer.current_page();
        let target = if forward {
            current + 1
        } else {
            current
                .checked_sub(1)
                .ok_or_else(|| anyhow!("already at the first page"))?
        };
        if target >= renderer.page_count() {
            bail!("already at the last page");
        }
        renderer.go_to_page(target)?;
        Ok(target)
    }

    fn set_highlight(&self, locator: &str, on: bool) {
        let range: TextRange = match locator.parse() {
            Ok(range) => range,
            Err(err) => {
                warn!(%locator, "Ignoring highlight for foreign locator: {err}");
                return;
            }
        };
        let (changed, text) = {
            let mut renderer = self.renderer();
            (renderer.set_highlight(range, on), renderer.text_at(range))
        };
        if !changed {
            return;
        }
        let paragraph = Paragraph::new(text.unwrap_or_default(), locator);
        if on {
            self.hub.publish(PlayerEvent::ParagraphHighlighted(paragraph));
        } else {
            self.hub.publish(PlayerEvent::ParagraphUnhighlighted(paragraph));
        }
    }

    fn publish_view(&self, page_changed: bool) {
        let page = self.current_page();
        let current = self.paragraphs_for(Some(page));
        let next = self.paragraphs_for(Some(page + 1));
        let previous = self.paragraphs_for(page.checked_sub(1));
        debug!(
            page,
            paragraphs = current.len(),
            next = next.len(),
            previous = previous.len(),
            "Publishing reflowable view"
        );
        if page_changed {
            self.hub.publish(PlayerEvent::PageChanged);
        }
        self.hub.publish(PlayerEvent::NewParagraphsAvailable(current));
        self.hub.publish(PlayerEvent::NextViewParagraphsAvailable(next));
        self.hub
            .publish(PlayerEvent::PreviousViewParagraphsAvailable(previous));
    }
}

#[async_trait]
impl<R: ReflowRenderer> DocumentAdapter for RangeAdapter<R> {
    async fn current_view_paragraphs(&self) -> Result<Vec<Paragraph>> {
        let page = self.current_page();
        Ok(self.paragraphs_for(Some(page)))
    }

    async fn next_view_paragraphs(&self) -> Result<Vec<Paragraph>> {
        let page = self.current_page();
        Ok(self.paragraphs_for(Some(page + 1)))
    }

    async fn previous_view_paragraphs(&self) -> Result<Vec<Paragraph>> {
        let page = self.current_page();
        Ok(self.paragraphs_for(page.checked_sub(1)))
    }

    fn highlight_paragraph(&self, locator: &str) {
        self.set_highlight(locator, true);
    }

    fn remove_highlight(&self, locator: &str) {
        self.set_highlight(locator, false);
    }

    async fn move_to_next_page(&self) -> Result<()> {
        let page = self.turn(true)?;
        info!(page, "Turned to next reflowable page");
        self.publish_view(true);
        Ok(())
    }

    async fn move_to_previous_page(&self) -> Result<()> {
        let page = self.turn(false)?;
        info!(page, "Turned to previous reflowable page");
        self.publish_view(true);
        Ok(())
    }

    async fn display(&self) -> Result<()> {
        self.publish_view(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn sample_text() -> String {
        let para = "Lorem ipsum dolor sit amet. ".repeat(40);
        (0..6)
            .map(|idx| format!("Paragraph {idx}. {}", para.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn range_locator_round_trips() {
        let range = TextRange { start: 3, end: 17 };
        assert_eq!(range.to_string(), "range(3,17)");
        assert_eq!("range(3,17)".parse::<TextRange>().unwrap(), range);
        assert!("3:1".parse::<TextRange>().is_err());
        assert!("range(9,2)".parse::<TextRange>().is_err());
    }

    #[tokio::test]
    async fn getters_follow_page_turns() {
        let hub = Arc::new(EventHub::new());
        let adapter = RangeAdapter::new(TextReflow::new(sample_text(), 36), Arc::clone(&hub));
        let pages = adapter.with_renderer(|r| r.page_count());
        assert!(pages > 1);

        let first = adapter.current_view_paragraphs().await.unwrap();
        let next = adapter.next_view_paragraphs().await.unwrap();
        assert!(adapter.previous_view_paragraphs().await.unwrap().is_empty());

        adapter.move_to_next_page().await.unwrap();
        assert_eq!(adapter.current_view_paragraphs().await.unwrap(), next);
        assert_eq!(adapter.previous_view_paragraphs().await.unwrap(), first);

        let names: Vec<_> = hub.logs().iter().map(|r| r.event_name).collect();
        assert_eq!(
            names,
            vec![
                "pageChanged",
                "newParagraphsAvailable",
                "nextViewParagraphsAvailable",
                "previousViewParagraphsAvailable"
            ]
        );
    }

    #[tokio::test]
    async fn cannot_turn_before_first_page() {
        let hub = Arc::new(EventHub::new());
        let adapter = RangeAdapter::new(TextReflow::new(sample_text(), 36), Arc::clone(&hub));
        assert!(adapter.move_to_previous_page().await.is_err());
        assert!(hub.logs().is_empty());
    }

    #[tokio::test]
    async fn highlight_is_idempotent() {
        let hub = Arc::new(EventHub::new());
        let adapter = RangeAdapter::new(TextReflow::new(sample_text(), 36), Arc::clone(&hub));
        let first = adapter.current_view_paragraphs().await.unwrap().remove(0);

        adapter.highlight_paragraph(&first.locator);
        adapter.highlight_paragraph(&first.locator);
        adapter.remove_highlight(&first.locator);
        adapter.remove_highlight(&first.locator);

        let logs = hub.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].event_name, EventKind::ParagraphHighlighted.as_str());
        assert_eq!(logs[1].event_name, EventKind::ParagraphUnhighlighted.as_str());
        assert_eq!(logs[0].args["text"], serde_json::json!(first.text));
    }

    #[test]
    fn locator_maps_back_to_page() {
        let reflow = TextReflow::new(sample_text(), 36);
        let last_page = reflow.page_count() - 1;
        let (range, _) = reflow.page_paragraphs(last_page).remove(0);
        assert_eq!(reflow.page_for_locator(&range.to_string()), Some(last_page));
        assert_eq!(reflow.page_for_locator("0:1"), None);
    }
}
