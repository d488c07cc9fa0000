//! Fixed-page adapter for paginated documents.
//!
//! A page's text layer only exists once its render has finished, and the
//! render runs in the background after a page turn. Each turn arms a
//! [`RenderGate`] for the new page; every getter waits on it before reading
//! text, so nothing is extracted from a page that is still being drawn.
//! The text layer is a bare word stream, which goes through the segmenter to
//! become paragraphs addressed as `page:ordinal`.

use super::{DocumentAdapter, Paragraph};
use crate::events::{EventHub, PlayerEvent};
use crate::pagination;
use crate::segmenter::{self, SegmenterOptions};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageLocator {
    pub page: usize,
    pub ordinal: usize,
}

impl fmt::Display for PageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.ordinal)
    }
}

impl FromStr for PageLocator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (page, ordinal) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("not a page locator: {s}"))?;
        Ok(Self {
            page: page.parse()?,
            ordinal: ordinal.parse()?,
        })
    }
}

/// Rendering backend for paginated documents.
#[async_trait]
pub trait PagedRenderer: Send + Sync + 'static {
    fn page_count(&self) -> usize;
    /// Draw the page; its text layer becomes available once this resolves.
    async fn render(&self, page: usize) -> Result<()>;
    /// Raw words of the page in reading order.
    async fn text_layer(&self, page: usize) -> Result<Vec<String>>;
    /// Returns whether the highlight state changed.
    fn set_highlight(&self, locator: PageLocator, on: bool) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    Idle,
    Rendering(usize),
    Rendered(usize),
    Failed(usize, String),
}

/// Single-shot "page rendered" signal, re-armed on every page turn.
#[derive(Clone)]
pub struct RenderGate {
    tx: Arc<watch::Sender<GateState>>,
}

impl Default for RenderGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn arm(&self, page: usize) {
        self.tx.send_replace(GateState::Rendering(page));
    }

    /// Settle the gate for `page`. Ignored when a later turn re-armed it.
    pub fn settle(&self, page: usize, outcome: Result<()>) {
        self.tx.send_if_modified(|state| {
            if *state != GateState::Rendering(page) {
                return false;
            }
            *state = match &outcome {
                Ok(()) => GateState::Rendered(page),
                Err(err) => GateState::Failed(page, err.to_string()),
            };
            true
        });
    }

    pub fn is_open(&self, page: usize) -> bool {
        *self.tx.borrow() == GateState::Rendered(page)
    }

    /// Wait until `page` finished rendering. Fails when the render failed or
    /// a later page turn re-armed the gate for another page.
    pub async fn wait(&self, page: usize) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| match state {
                GateState::Idle => false,
                GateState::Rendering(p) => *p != page,
                GateState::Rendered(_) | GateState::Failed(..) => true,
            })
            .await
            .map_err(|_| anyhow!("render gate closed"))?
            .clone();
        match state {
            GateState::Rendered(p) if p == page => Ok(()),
            GateState::Failed(p, message) if p == page => {
                Err(anyhow!("page {page} failed to render: {message}"))
            }
            _ => Err(anyhow!("page {page} render superseded by another page turn")),
        }
    }
}

pub struct FixedPageAdapter<R: PagedRenderer> {
    renderer: Arc<R>,
    hub: Arc<EventHub>,
    gate: RenderGate,
    current: AtomicUsize,
    options: SegmenterOptions,
    paragraph_text: Mutex<HashMap<PageLocator, String>>,
}

impl<R: PagedRenderer> FixedPageAdapter<R> {
    /// Open at `start_page` and start rendering it.
    pub fn open(
        renderer: R,
        hub: Arc<EventHub>,
        options: SegmenterOptions,
        start_page: usize,
    ) -> Self {
        let last = renderer.page_count().saturating_sub(1);
        let start_page = start_page.min(last);
        let adapter = Self {
            renderer: Arc::new(renderer),
            hub,
            gate: RenderGate::new(),
            current: AtomicUsize::new(start_page),
            options,
            paragraph_text: Mutex::new(HashMap::new()),
        };
        adapter.begin_render(start_page);
        adapter
    }

    pub fn current_page(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn gate(&self) -> &RenderGate {
        &self.gate
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    fn begin_render(&self, page: usize) {
        self.gate.arm(page);
        let renderer = Arc::clone(&self.renderer);
        let gate = self.gate.clone();
        tokio::spawn(async move {
            let outcome = renderer.render(page).await;
            if let Err(err) = &outcome {
                warn!(page, "Page render failed: {err}");
            } else {
                debug!(page, "Page rendered; text layer available");
            }
            gate.settle(page, outcome);
        });
    }

    async fn paragraphs_for(&self, page: Option<usize>) -> Result<Vec<Paragraph>> {
        let current = self.current_page();
        self.gate.wait(current).await?;
        let Some(page) = page.filter(|p| *p < self.renderer.page_count()) else {
            return Ok(Vec::new());
        };

        let words: Vec<String> = self
            .renderer
            .text_layer(page)
            .await?
            .into_iter()
            .map(|word| word.nfkc().collect::<String>())
            .filter(|word| !word.trim().is_empty())
            .collect();
        let texts = segmenter::segment(&words, self.options);
        debug!(page, words = words.len(), paragraphs = texts.len(), "Segmented text layer");

        let paragraphs: Vec<Paragraph> = texts
            .into_iter()
            .enumerate()
            .map(|(ordinal, text)| {
                Paragraph::new(text, PageLocator { page, ordinal }.to_string())
            })
            .collect();
        let mut known = lock(&self.paragraph_text);
        for paragraph in &paragraphs {
            if let Ok(locator) = paragraph.locator.parse::<PageLocator>() {
                known.insert(locator, paragraph.text.clone());
            }
        }
        // Only the shown page and its neighbours can still be highlighted.
        known.retain(|locator, _| locator.page + 1 >= current && locator.page <= current + 1);
        Ok(paragraphs)
    }

    async fn turn(&self, forward: bool) -> Result<()> {
        let current = self.current_page();
        let target = if forward {
            current + 1
        } else {
            current
                .checked_sub(1)
                .ok_or_else(|| anyhow!("already at the first page"))?
        };
        if target >= self.renderer.page_count() {
            bail!("already at the last page");
        }
        self.current.store(target, Ordering::Release);
        self.begin_render(target);
        if let Err(err) = self.gate.wait(target).await {
            self.current.store(current, Ordering::Release);
            self.begin_render(current);
            return Err(err);
        }
        info!(page = target, "Turned page");
        self.publish_view(true).await
    }

    async fn publish_view(&self, page_changed: bool) -> Result<()> {
        let page = self.current_page();
        let current = self.paragraphs_for(Some(page)).await?;
        let next = self.paragraphs_for(Some(page + 1)).await?;
        let previous = self.paragraphs_for(page.checked_sub(1)).await?;
        if page_changed {
            self.hub.publish(PlayerEvent::PageChanged);
        }
        self.hub.publish(PlayerEvent::NewParagraphsAvailable(current));
        self.hub.publish(PlayerEvent::NextViewParagraphsAvailable(next));
        self.hub
            .publish(PlayerEvent::PreviousViewParagraphsAvailable(previous));
        Ok(())
    }

    fn set_highlight(&self, locator: &str, on: bool) {
        let parsed: PageLocator = match locator.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%locator, "Ignoring highlight for foreign locator: {err}");
                return;
            }
        };
        if !self.renderer.set_highlight(parsed, on) {
            return;
        }
        let text = lock(&self.paragraph_text)
            .get(&parsed)
            .cloned()
            .unwrap_or_default();
        let paragraph = Paragraph::new(text, locator);
        if on {
            self.hub.publish(PlayerEvent::ParagraphHighlighted(paragraph));
        } else {
            self.hub.publish(PlayerEvent::ParagraphUnhighlighted(paragraph));
        }
    }
}

#[async_trait]
impl<R: PagedRenderer> DocumentAdapter for FixedPageAdapter<R> {
    async fn current_view_paragraphs(&self) -> Result<Vec<Paragraph>> {
        self.paragraphs_for(Some(self.current_page())).await
    }

    async fn next_view_paragraphs(&self) -> Result<Vec<Paragraph>> {
        self.paragraphs_for(Some(self.current_page() + 1)).await
    }

    async fn previous_view_paragraphs(&self) -> Result<Vec<Paragraph>> {
        self.paragraphs_for(self.current_page().checked_sub(1)).await
    }

    fn highlight_paragraph(&self, locator: &str) {
        self.set_highlight(locator, true);
    }

    fn remove_highlight(&self, locator: &str) {
        self.set_highlight(locator, false);
    }

    async fn move_to_next_page(&self) -> Result<()> {
        self.turn(true).await
    }

    async fn move_to_previous_page(&self) -> Result<()> {
        self.turn(false).await
    }

    async fn display(&self) -> Result<()> {
        self.publish_view(false).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Plain text cut into pages of a fixed number of lines. Rendering is
/// simulated with an optional delay so the text layer shows up late, the way
/// a canvas-backed viewer behaves.
pub struct LinePages {
    pages: Vec<String>,
    render_delay: Duration,
    highlighted: Mutex<HashSet<PageLocator>>,
}

impl LinePages {
    pub fn new(text: &str, lines_per_page: usize) -> Self {
        let pages = pagination::paginate_lines(text, lines_per_page);
        info!(pages = pages.len(), lines_per_page, "Split text into fixed pages");
        Self {
            pages,
            render_delay: Duration::ZERO,
            highlighted: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    pub fn is_highlighted(&self, locator: PageLocator) -> bool {
        lock(&self.highlighted).contains(&locator)
    }

    /// Page a stored `page:ordinal` locator points at, if still in range.
    pub fn page_for_locator(&self, locator: &str) -> Option<usize> {
        let parsed: PageLocator = locator.parse().ok()?;
        (parsed.page < self.pages.len()).then_some(parsed.page)
    }
}

#[async_trait]
impl PagedRenderer for LinePages {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    async fn render(&self, page: usize) -> Result<()> {
        if page >= self.pages.len() {
            bail!("page {page} out of range (pages={})", self.pages.len());
        }
        if !self.render_delay.is_zero() {
            tokio::time::sleep(self.render_delay).await;
        }
        Ok(())
    }

    async fn text_layer(&self, page: usize) -> Result<Vec<String>> {
        let text = self
            .pages
            .get(page)
            .ok_or_else(|| anyhow!("page {page} out of range"))?;
        Ok(text.split_whitespace().map(str::to_string).collect())
    }

    fn set_highlight(&self, locator: PageLocator, on: bool) -> bool {
        let mut highlighted = lock(&self.highlighted);
        if on {
            highlighted.insert(locator)
        } else {
            highlighted.remove(&locator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Text layer is only readable after `render` finished.
    struct SlowCanvas {
        pages: Vec<Vec<String>>,
        rendered: Mutex<HashSet<usize>>,
        read_before_render: AtomicBool,
    }

    impl SlowCanvas {
        fn new(pages: &[&str]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|p| p.split_whitespace().map(str::to_string).collect())
                    .collect(),
                rendered: Mutex::new(HashSet::new()),
                read_before_render: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PagedRenderer for SlowCanvas {
        fn page_count(&self) -> usize {
            self.pages.len()
        }

        async fn render(&self, page: usize) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.rendered.lock().unwrap().insert(page);
            Ok(())
        }

        async fn text_layer(&self, page: usize) -> Result<Vec<String>> {
            if page == 0 && !self.rendered.lock().unwrap().contains(&0) {
                self.read_before_render.store(true, Ordering::SeqCst);
            }
            Ok(self.pages[page].clone())
        }

        fn set_highlight(&self, _locator: PageLocator, _on: bool) -> bool {
            true
        }
    }

    fn options() -> SegmenterOptions {
        SegmenterOptions {
            sentences_per_paragraph: 1,
            min_paragraph_length: 0,
        }
    }

    #[test]
    fn page_locator_round_trips() {
        let locator = PageLocator { page: 4, ordinal: 2 };
        assert_eq!(locator.to_string(), "4:2");
        assert_eq!("4:2".parse::<PageLocator>().unwrap(), locator);
        assert!("range(1,2)".parse::<PageLocator>().is_err());
    }

    #[tokio::test]
    async fn getters_wait_for_render_gate() {
        let hub = Arc::new(EventHub::new());
        let adapter = FixedPageAdapter::open(
            SlowCanvas::new(&["One here. Two there.", "Three now."]),
            hub,
            options(),
            0,
        );
        assert!(!adapter.gate().is_open(0));

        let paragraphs = adapter.current_view_paragraphs().await.unwrap();
        assert!(adapter.gate().is_open(0));
        assert!(!adapter.renderer().read_before_render.load(Ordering::SeqCst));
        assert_eq!(
            paragraphs,
            vec![Paragraph::new("One here.", "0:0"), Paragraph::new("Two there.", "0:1")]
        );
    }

    #[tokio::test]
    async fn page_turn_publishes_after_render() {
        let hub = Arc::new(EventHub::new());
        let adapter = FixedPageAdapter::open(
            LinePages::new("First page line.\nSecond page line.", 5)
                .with_render_delay(Duration::from_millis(5)),
            Arc::clone(&hub),
            options(),
            0,
        );
        assert!(adapter.move_to_next_page().await.is_err(), "only one page");
        adapter.display().await.unwrap();

        let names: Vec<_> = hub.logs().iter().map(|r| r.event_name).collect();
        assert_eq!(
            names,
            vec![
                "newParagraphsAvailable",
                "nextViewParagraphsAvailable",
                "previousViewParagraphsAvailable"
            ]
        );
    }

    #[tokio::test]
    async fn turning_pages_moves_between_line_pages() {
        let text = (1..=10)
            .map(|n| format!("Sentence number {n}."))
            .collect::<Vec<_>>()
            .join("\n");
        let hub = Arc::new(EventHub::new());
        let adapter = FixedPageAdapter::open(LinePages::new(&text, 5), Arc::clone(&hub), options(), 0);

        let upcoming = adapter.next_view_paragraphs().await.unwrap();
        adapter.move_to_next_page().await.unwrap();
        assert_eq!(adapter.current_page(), 1);
        assert_eq!(adapter.current_view_paragraphs().await.unwrap(), upcoming);
        assert_eq!(upcoming[0], Paragraph::new("Sentence number 6.", "1:0"));

        adapter.move_to_previous_page().await.unwrap();
        assert_eq!(adapter.current_page(), 0);
        assert!(hub.logs().iter().any(|r| r.event_name == "pageChanged"));
    }

    #[tokio::test]
    async fn highlight_publishes_once_per_change() {
        let hub = Arc::new(EventHub::new());
        let adapter = FixedPageAdapter::open(
            LinePages::new("Only line here.", 5),
            Arc::clone(&hub),
            options(),
            0,
        );
        let paragraph = adapter.current_view_paragraphs().await.unwrap().remove(0);

        adapter.highlight_paragraph(&paragraph.locator);
        adapter.highlight_paragraph(&paragraph.locator);
        assert!(adapter.renderer().is_highlighted(PageLocator { page: 0, ordinal: 0 }));
        adapter.remove_highlight(&paragraph.locator);

        let names: Vec<_> = hub.logs().iter().map(|r| r.event_name).collect();
        assert_eq!(names, vec!["paragraphHighlighted", "paragraphUnhighlighted"]);
        assert_eq!(hub.logs()[0].args["text"], serde_json::json!("Only line here."));
    }

    #[tokio::test]
    async fn remembered_text_stays_near_the_shown_page() {
        let text = (1..=30)
            .map(|n| format!("Sentence number {n}."))
            .collect::<Vec<_>>()
            .join("\n");
        let hub = Arc::new(EventHub::new());
        let adapter = FixedPageAdapter::open(LinePages::new(&text, 5), Arc::clone(&hub), options(), 0);
        adapter.display().await.unwrap();
        for _ in 0..3 {
            adapter.move_to_next_page().await.unwrap();
        }
        assert_eq!(adapter.current_page(), 3);

        let pages: HashSet<usize> = lock(&adapter.paragraph_text)
            .keys()
            .map(|locator| locator.page)
            .collect();
        assert_eq!(pages, HashSet::from([2, 3, 4]));

        adapter.remove_highlight("2:1");
        adapter.highlight_paragraph("2:1");
        let last = hub.logs().pop().unwrap();
        assert_eq!(last.event_name, "paragraphHighlighted");
        assert_eq!(last.args["text"], serde_json::json!("Sentence number 12."));
    }

    #[tokio::test]
    async fn stale_render_does_not_open_a_newer_gate() {
        let gate = RenderGate::new();
        gate.arm(1);
        gate.arm(2);
        gate.settle(1, Ok(()));
        assert!(!gate.is_open(1));
        assert!(!gate.is_open(2));
        gate.settle(2, Ok(()));
        assert!(gate.wait(2).await.is_ok());
        assert!(gate.wait(1).await.is_err());
    }
}
