//! Narration state machine.
//!
//! [`Player`] is a thin handle. All transitions run on one runtime task that
//! consumes a command channel, so exactly one transition is ever in flight.
//! The observable model lives behind a mutex and getters read it directly;
//! hub handlers update the page queues synchronously and hand the follow-up
//! work (highlighting, playback) to the runtime.

mod runtime;
mod state;

pub use state::{PlayerModel, PlayingState};

use crate::audio::AudioOutput;
use crate::cache::AudioCache;
use crate::context::AppContext;
use crate::document::{DocumentAdapter, Paragraph};
use crate::error::{PlayerError, PlayerResult};
use crate::events::{Direction, EventHub, EventKind, PlayerEvent, SubscriptionId};
use crate::tts::Synthesizer;
use runtime::{Command, Request, Runtime, RuntimeParts};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub(crate) struct Shared {
    model: Mutex<PlayerModel>,
    cache: Mutex<AudioCache>,
    /// Bumped by `initialize` and `close`; async results tagged with an older
    /// value are dropped.
    epoch: AtomicU64,
    /// Set when narration ran past the last page.
    reached_end: watch::Sender<bool>,
}

impl Shared {
    fn model(&self) -> MutexGuard<'_, PlayerModel> {
        self.model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache(&self) -> MutexGuard<'_, AudioCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn set_reached_end(&self, ended: bool) {
        self.reached_end.send_if_modified(|current| {
            let changed = *current != ended;
            *current = ended;
            changed
        });
    }
}

pub struct Player {
    shared: Arc<Shared>,
    hub: Arc<EventHub>,
    commands: mpsc::UnboundedSender<Command>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    /// Create a player for one open document. Must be called inside a tokio
    /// runtime; the player's runtime task is spawned here.
    pub fn new(
        ctx: &AppContext,
        adapter: Arc<dyn DocumentAdapter>,
        synthesizer: Arc<dyn Synthesizer>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let config = &ctx.config;
        let shared = Arc::new(Shared {
            model: Mutex::new(PlayerModel::default()),
            cache: Mutex::new(AudioCache::new(
                config.cache_root(),
                config.tts_output_extension.clone(),
                config.audio_cache_capacity,
            )),
            epoch: AtomicU64::new(0),
            reached_end: watch::channel(false).0,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Runtime::new(RuntimeParts {
            shared: Arc::clone(&shared),
            hub: Arc::clone(&ctx.hub),
            adapter,
            synthesizer,
            output,
            store: ctx.store.clone(),
            commands: tx.clone(),
            retry_attempts: config.synthesis_retry_attempts,
            retry_delay: config.retry_delay(),
        });
        let task = tokio::spawn(runtime.run(rx));
        debug!(
            retry_attempts = config.synthesis_retry_attempts,
            cache_capacity = config.audio_cache_capacity,
            "Player created"
        );
        Self {
            shared,
            hub: Arc::clone(&ctx.hub),
            commands: tx,
            subscriptions: Mutex::new(Vec::new()),
            task: Mutex::new(Some(task)),
        }
    }

    /// Start a session for `book_id`: queues and errors are dropped, the
    /// audio cache is cleared when the book differs, and the player waits in
    /// `Stopped` for the adapter to publish paragraphs. Outstanding moves and
    /// plays, and requests issued before this call that the runtime has not
    /// reached yet, resolve with [`PlayerError::Cancelled`].
    pub async fn initialize(&self, book_id: &str) -> PlayerResult<()> {
        self.subscribe();
        let (tx, rx) = oneshot::channel();
        let epoch = self.shared.bump_epoch();
        self.commands
            .send(Command::Initialize {
                epoch,
                book_id: book_id.to_string(),
                reply: tx,
            })
            .map_err(|_| PlayerError::Closed)?;
        debug!(book_id, epoch, "Queued player initialization");
        rx.await.map_err(|_| PlayerError::Closed)?
    }

    /// Start or resume narration of the current paragraph. Resolves once
    /// audio is playing, or with the failure that paused the player.
    pub async fn play(&self) -> PlayerResult<()> {
        self.request(Request::Play).await
    }

    pub async fn pause(&self) -> PlayerResult<()> {
        self.request(Request::Pause).await
    }

    pub async fn stop(&self) -> PlayerResult<()> {
        self.request(Request::Stop).await
    }

    /// Advance one paragraph, turning the page at the end of the current one.
    /// Across a page boundary this resolves once the new page arrived.
    pub async fn move_to_next_paragraph(&self) -> PlayerResult<()> {
        self.request(Request::Move(Direction::Next)).await
    }

    pub async fn move_to_previous_paragraph(&self) -> PlayerResult<()> {
        self.request(Request::Move(Direction::Previous)).await
    }

    /// Whether narration ran off the last page and is waiting for paragraphs
    /// that will not come.
    pub fn reached_end(&self) -> bool {
        *self.shared.reached_end.borrow()
    }

    /// Resolves once narration has run off the last page.
    pub async fn wait_for_end(&self) {
        let mut ended = self.shared.reached_end.subscribe();
        // `shared` owns the sender, so this only returns once ended.
        let _ = ended.wait_for(|ended| *ended).await;
    }

    /// Stop audio, detach from the hub and end the runtime task.
    pub async fn close(&self) -> PlayerResult<()> {
        self.shared.bump_epoch();
        self.unsubscribe();
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply: Some(tx) })
            .is_ok()
        {
            let _ = rx.await;
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(book_id = ?self.book_id(), "Player closed");
        Ok(())
    }

    pub fn current_paragraphs(&self) -> Vec<Paragraph> {
        self.shared.model().current_paragraphs.clone()
    }

    pub fn next_page_paragraphs(&self) -> Vec<Paragraph> {
        self.shared.model().next_page_paragraphs.clone()
    }

    pub fn previous_page_paragraphs(&self) -> Vec<Paragraph> {
        self.shared.model().previous_page_paragraphs.clone()
    }

    pub fn current_paragraph_index(&self) -> Option<usize> {
        self.shared.model().index()
    }

    pub fn current_paragraph(&self) -> Option<Paragraph> {
        self.shared.model().current_paragraph().cloned()
    }

    pub fn playing_state(&self) -> PlayingState {
        self.shared.model().playing_state()
    }

    pub fn errors(&self) -> Vec<String> {
        self.shared.model().errors.clone()
    }

    pub fn book_id(&self) -> Option<String> {
        self.shared.model().book_id().map(str::to_string)
    }

    pub fn snapshot(&self) -> PlayerModel {
        self.shared.model().clone()
    }

    /// Cached audio for a paragraph of the current book, if any.
    pub fn audio_path_for(&self, locator: &str) -> Option<PathBuf> {
        let book_id = self.book_id()?;
        self.shared.cache().get(&book_id, locator)
    }

    async fn request(&self, request: Request) -> PlayerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                epoch: self.shared.epoch(),
                request,
                reply: tx,
            })
            .map_err(|_| PlayerError::Closed)?;
        rx.await.map_err(|_| PlayerError::Closed)?
    }

    fn subscribe(&self) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !subscriptions.is_empty() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let commands = self.commands.clone();
        subscriptions.push(self.hub.subscribe(
            EventKind::NewParagraphsAvailable,
            move |event| {
                let PlayerEvent::NewParagraphsAvailable(paragraphs) = event else {
                    return;
                };
                let mut model = shared.model();
                let previous = model.current_paragraph().cloned();
                let previous_index = model.index();
                let landing = model.pending_turn.take();
                model.replace_current(paragraphs.clone(), landing);
                let _ = commands.send(Command::ParagraphsArrived {
                    epoch: shared.epoch(),
                    previous,
                    previous_index,
                    landing,
                });
            },
        ));

        let shared = Arc::clone(&self.shared);
        subscriptions.push(self.hub.subscribe(
            EventKind::NextViewParagraphsAvailable,
            move |event| {
                if let PlayerEvent::NextViewParagraphsAvailable(paragraphs) = event {
                    shared.model().next_page_paragraphs = paragraphs.clone();
                }
            },
        ));

        let shared = Arc::clone(&self.shared);
        subscriptions.push(self.hub.subscribe(
            EventKind::PreviousViewParagraphsAvailable,
            move |event| {
                if let PlayerEvent::PreviousViewParagraphsAvailable(paragraphs) = event {
                    shared.model().previous_page_paragraphs = paragraphs.clone();
                }
            },
        ));
        debug!(count = subscriptions.len(), "Player subscribed to paragraph events");
    }

    fn unsubscribe(&self) {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for id in ids {
            self.hub.unsubscribe(id);
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.bump_epoch();
        self.unsubscribe();
        let _ = self.commands.send(Command::Shutdown { reply: None });
    }
}
