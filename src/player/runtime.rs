use super::{PlayingState, Shared};
use crate::audio::AudioOutput;
use crate::document::{DocumentAdapter, Paragraph};
use crate::error::{PlayerError, PlayerResult};
use crate::events::{Direction, EventHub, ParagraphMove, PlayerEvent};
use crate::library::LocationStore;
use crate::tts::{self, RetryExhausted, SynthesisRequest, Synthesizer};
use anyhow::anyhow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

pub(super) type Reply = oneshot::Sender<PlayerResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Request {
    Play,
    Pause,
    Stop,
    Move(Direction),
}

pub(super) enum Command {
    Initialize {
        epoch: u64,
        book_id: String,
        reply: Reply,
    },
    /// A public request, tagged with the epoch it was issued in.
    Request {
        epoch: u64,
        request: Request,
        reply: Reply,
    },
    ParagraphsArrived {
        epoch: u64,
        previous: Option<Paragraph>,
        previous_index: Option<usize>,
        landing: Option<Direction>,
    },
    PageTurnFailed {
        epoch: u64,
        error: anyhow::Error,
    },
    AudioResolved {
        epoch: u64,
        ticket: u64,
        book_id: String,
        paragraph: Paragraph,
        outcome: Result<PathBuf, RetryExhausted>,
    },
    AudioEnded {
        playback_id: u64,
    },
    Shutdown {
        reply: Option<Reply>,
    },
}

pub(super) struct RuntimeParts {
    pub shared: Arc<Shared>,
    pub hub: Arc<EventHub>,
    pub adapter: Arc<dyn DocumentAdapter>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub output: Arc<dyn AudioOutput>,
    pub store: Option<Arc<dyn LocationStore>>,
    pub commands: mpsc::UnboundedSender<Command>,
    pub retry_attempts: usize,
    pub retry_delay: Duration,
}

struct ActivePlayback {
    id: u64,
    locator: String,
}

/// A page turn requested by the player that has not produced paragraphs yet.
struct PendingTurn {
    direction: Direction,
    from: Option<usize>,
    /// Start narrating on the new page once it arrives.
    resume: bool,
    /// State to return to when not resuming.
    fallback: PlayingState,
    failed: bool,
    replies: Vec<Reply>,
}

pub(super) struct Runtime {
    parts: RuntimeParts,
    /// Epoch of the last initialization this runtime carried out.
    session: u64,
    /// Identifies the current load; results for older tickets are cached but
    /// not played.
    ticket: u64,
    next_ticket: u64,
    /// Synthesis still running, by locator, with the ticket it reports under.
    in_flight: HashMap<String, u64>,
    next_playback_id: u64,
    playback: Option<ActivePlayback>,
    waiters: Vec<Reply>,
    turn: Option<PendingTurn>,
}

impl Runtime {
    pub(super) fn new(parts: RuntimeParts) -> Self {
        Self {
            parts,
            session: 0,
            ticket: 0,
            next_ticket: 0,
            in_flight: HashMap::new(),
            next_playback_id: 0,
            playback: None,
            waiters: Vec::new(),
            turn: None,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            if !self.handle(command).await {
                break;
            }
        }
        self.stop_output();
        debug!("Player runtime finished");
    }

    /// Returns false once the runtime should exit.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Initialize {
                epoch,
                book_id,
                reply,
            } => self.initialize(epoch, book_id, reply),
            Command::Request {
                epoch,
                request,
                reply,
            } => {
                if self.is_stale(epoch) {
                    debug!(?request, "Dropping request issued before re-initialization");
                    let _ = reply.send(Err(PlayerError::Cancelled));
                } else {
                    match request {
                        Request::Play => self.play(reply),
                        Request::Pause => self.pause(reply),
                        Request::Stop => self.stop(reply),
                        Request::Move(direction) => self.step(direction, Some(reply)).await,
                    }
                }
            }
            Command::ParagraphsArrived {
                epoch,
                previous,
                previous_index,
                landing,
            } => {
                if self.is_stale(epoch) {
                    debug!(epoch, "Ignoring paragraphs from a previous session");
                } else {
                    self.paragraphs_arrived(previous, previous_index, landing)
                        .await;
                }
            }
            Command::PageTurnFailed { epoch, error } => {
                if !self.is_stale(epoch) {
                    self.page_turn_failed(error);
                }
            }
            Command::AudioResolved {
                epoch,
                ticket,
                book_id,
                paragraph,
                outcome,
            } => {
                if self.is_stale(epoch) {
                    self.discard_stale_audio(&book_id, &paragraph, outcome);
                } else {
                    self.audio_resolved(ticket, &book_id, paragraph, outcome);
                }
            }
            Command::AudioEnded { playback_id } => self.audio_ended(playback_id).await,
            Command::Shutdown { reply } => {
                self.stop_output();
                self.invalidate_load();
                self.resolve_waiters(Err(PlayerError::Closed));
                if let Some(turn) = self.turn.take() {
                    answer_all(turn.replies, Err(PlayerError::Closed));
                }
                self.set_state(PlayingState::Stopped);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return false;
            }
        }
        true
    }

    fn initialize(&mut self, epoch: u64, book_id: String, reply: Reply) {
        self.session = epoch;
        let (previous, had_errors) = {
            let mut model = self.parts.shared.model();
            let previous = model.current_paragraph().cloned();
            let had_errors = !model.errors.is_empty();
            model.reset(&book_id);
            (previous, had_errors)
        };
        self.parts.shared.set_reached_end(false);
        self.stop_output();
        self.invalidate_load();
        self.in_flight.clear();
        self.resolve_waiters(Err(PlayerError::Cancelled));
        if let Some(turn) = self.turn.take() {
            answer_all(turn.replies, Err(PlayerError::Cancelled));
        }
        if self.parts.shared.cache().set_book(&book_id) {
            debug!(%book_id, "Cleared audio cache of the previous book");
        }
        if let Some(previous) = previous {
            self.parts.hub.publish(PlayerEvent::ParagraphIndexChanged {
                index: None,
                paragraph: None,
            });
            self.parts.adapter.remove_highlight(&previous.locator);
        }
        if had_errors {
            self.parts
                .hub
                .publish(PlayerEvent::ErrorsChanged { errors: Vec::new() });
        }
        self.set_state(PlayingState::Stopped);
        info!(%book_id, "Player initialized");
        let _ = reply.send(Ok(()));
    }

    fn play(&mut self, reply: Reply) {
        match self.state() {
            PlayingState::Playing => {
                let _ = reply.send(Ok(()));
            }
            PlayingState::Loading => self.waiters.push(reply),
            PlayingState::WaitingForNewParagraphs => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.resume = true;
                }
                let _ = reply.send(Ok(()));
            }
            state @ (PlayingState::Paused | PlayingState::Stopped) => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.resume = true;
                    self.set_state(PlayingState::WaitingForNewParagraphs);
                    let _ = reply.send(Ok(()));
                    return;
                }
                let Some(current) = self.current_paragraph() else {
                    debug!("Play requested with nothing to narrate");
                    let _ = reply.send(Ok(()));
                    return;
                };
                let resumable = state == PlayingState::Paused
                    && self
                        .playback
                        .as_ref()
                        .is_some_and(|playback| playback.locator == current.locator);
                if resumable {
                    self.parts.output.resume();
                    self.set_state(PlayingState::Playing);
                    let _ = reply.send(Ok(()));
                } else {
                    self.waiters.push(reply);
                    self.begin_load();
                }
            }
        }
    }

    fn pause(&mut self, reply: Reply) {
        match self.state() {
            PlayingState::Playing => {
                self.parts.output.pause();
                self.set_state(PlayingState::Paused);
            }
            PlayingState::Loading => {
                // The load keeps running and lands in the cache.
                self.resolve_waiters(Err(PlayerError::Cancelled));
                self.set_state(PlayingState::Paused);
            }
            PlayingState::WaitingForNewParagraphs => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.resume = false;
                    turn.fallback = PlayingState::Paused;
                }
                self.set_state(PlayingState::Paused);
            }
            PlayingState::Paused | PlayingState::Stopped => {}
        }
        let _ = reply.send(Ok(()));
    }

    fn stop(&mut self, reply: Reply) {
        self.stop_output();
        self.invalidate_load();
        self.resolve_waiters(Err(PlayerError::Cancelled));
        if let Some(turn) = self.turn.as_mut() {
            turn.resume = false;
            turn.fallback = PlayingState::Stopped;
        }
        self.set_state(PlayingState::Stopped);
        let _ = reply.send(Ok(()));
    }

    /// Move one paragraph in `direction`, or turn the page at its edge.
    async fn step(&mut self, direction: Direction, reply: Option<Reply>) {
        if let Some(turn) = self.turn.as_mut() {
            turn.replies.extend(reply);
            if turn.failed {
                turn.failed = false;
                turn.direction = direction;
                self.parts.shared.model().pending_turn = Some(direction);
                self.parts.shared.set_reached_end(false);
                self.spawn_page_turn(direction);
            }
            return;
        }

        let (book_loaded, from, target, previous) = {
            let model = self.parts.shared.model();
            (
                model.book_id().is_some(),
                model.index(),
                model.step(direction),
                model.current_paragraph().cloned(),
            )
        };
        if !book_loaded {
            debug!("Move requested before initialization");
            answer_all(reply, Ok(()));
            return;
        }

        let Some(to) = target else {
            self.start_page_turn(direction, from, reply);
            return;
        };

        self.parts.shared.model().set_index(to);
        self.announce_index(previous).await;
        self.publish_move(direction, from, to);
        if self.state().is_active() {
            self.begin_load();
        } else {
            self.stop_output();
        }
        answer_all(reply, Ok(()));
    }

    fn start_page_turn(&mut self, direction: Direction, from: Option<usize>, reply: Option<Reply>) {
        let state = self.state();
        let resume = state.is_active();
        self.stop_output();
        self.invalidate_load();
        self.parts.shared.model().pending_turn = Some(direction);
        self.turn = Some(PendingTurn {
            direction,
            from,
            resume,
            fallback: if resume { PlayingState::Stopped } else { state },
            failed: false,
            replies: reply.into_iter().collect(),
        });
        info!(?direction, resume, "Reached page edge; requesting page turn");
        self.set_state(PlayingState::WaitingForNewParagraphs);
        self.spawn_page_turn(direction);
    }

    fn spawn_page_turn(&self, direction: Direction) {
        let adapter = Arc::clone(&self.parts.adapter);
        let commands = self.parts.commands.clone();
        let epoch = self.session;
        tokio::spawn(async move {
            let result = match direction {
                Direction::Next => adapter.move_to_next_page().await,
                Direction::Previous => adapter.move_to_previous_page().await,
            };
            if let Err(error) = result {
                let _ = commands.send(Command::PageTurnFailed { epoch, error });
            }
        });
    }

    fn page_turn_failed(&mut self, error: anyhow::Error) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        warn!(direction = ?turn.direction, "Page turn failed: {error:#}");
        let replies = std::mem::take(&mut turn.replies);
        if turn.resume {
            // Nothing to read until the page changes or the player is
            // re-initialized.
            turn.failed = true;
            let at_last_page = turn.direction == Direction::Next
                && self.parts.shared.model().next_page_paragraphs.is_empty();
            if at_last_page {
                info!("Narration reached the end of the document");
                self.parts.shared.set_reached_end(true);
            }
        } else {
            let fallback = turn.fallback;
            self.turn = None;
            self.parts.shared.model().pending_turn = None;
            self.set_state(fallback);
        }
        answer_all(replies, Err(PlayerError::PageTurn(error)));
    }

    async fn paragraphs_arrived(
        &mut self,
        previous: Option<Paragraph>,
        previous_index: Option<usize>,
        landing: Option<Direction>,
    ) {
        let turn = if landing.is_some() {
            self.turn.take()
        } else {
            None
        };
        let (index, count) = {
            let model = self.parts.shared.model();
            (model.index(), model.current_paragraphs.len())
        };
        debug!(count, ?index, ?landing, "New paragraphs arrived");
        self.parts.shared.set_reached_end(false);
        self.announce_index(previous).await;

        if let Some(turn) = turn {
            if let Some(to) = index {
                self.publish_move(turn.direction, turn.from.or(previous_index), to);
            }
            if !turn.resume {
                self.set_state(turn.fallback);
            } else if index.is_some() {
                self.begin_load();
            } else {
                warn!("Turned to a page without paragraphs; still waiting");
            }
            answer_all(turn.replies, Ok(()));
            return;
        }

        match self.state() {
            PlayingState::Playing | PlayingState::Loading | PlayingState::WaitingForNewParagraphs => {
                if index.is_some() {
                    self.begin_load();
                } else {
                    self.stop_output();
                    self.invalidate_load();
                    self.set_state(PlayingState::WaitingForNewParagraphs);
                }
            }
            PlayingState::Paused => self.stop_output(),
            PlayingState::Stopped => {}
        }
    }

    /// Resolve audio for the current paragraph and play it.
    fn begin_load(&mut self) {
        let (book_id, paragraph) = {
            let model = self.parts.shared.model();
            (
                model.book_id().map(str::to_string),
                model.current_paragraph().cloned(),
            )
        };
        let (Some(book_id), Some(paragraph)) = (book_id, paragraph) else {
            return;
        };

        self.stop_output();
        let ticket = self.invalidate_load();
        self.set_state(PlayingState::Loading);

        let (cached, output) = {
            let mut cache = self.parts.shared.cache();
            (
                cache.get(&book_id, &paragraph.locator),
                cache.path_for(&book_id, &paragraph.locator),
            )
        };
        if let Some(path) = cached {
            debug!(locator = %paragraph.locator, "Audio cache hit");
            self.start_playback(paragraph, path);
            return;
        }
        if let Some(&pending) = self.in_flight.get(&paragraph.locator) {
            debug!(locator = %paragraph.locator, ticket = pending, "Joining synthesis in flight");
            self.ticket = pending;
            return;
        }
        self.in_flight.insert(paragraph.locator.clone(), ticket);

        let request = SynthesisRequest {
            book_id,
            paragraph,
            output,
        };
        let synthesizer = Arc::clone(&self.parts.synthesizer);
        let commands = self.parts.commands.clone();
        let epoch = self.session;
        let attempts = self.parts.retry_attempts;
        let delay = self.parts.retry_delay;
        debug!(locator = %request.paragraph.locator, ticket, "Synthesizing paragraph");
        tokio::spawn(async move {
            let outcome = tts::retry(attempts, delay, |attempt| {
                trace!(attempt, locator = %request.paragraph.locator, "Synthesis attempt");
                synthesizer.synthesize(&request)
            })
            .await;
            let _ = commands.send(Command::AudioResolved {
                epoch,
                ticket,
                book_id: request.book_id,
                paragraph: request.paragraph,
                outcome,
            });
        });
    }

    fn audio_resolved(
        &mut self,
        ticket: u64,
        book_id: &str,
        paragraph: Paragraph,
        outcome: Result<PathBuf, RetryExhausted>,
    ) {
        if self.in_flight.get(&paragraph.locator) == Some(&ticket) {
            self.in_flight.remove(&paragraph.locator);
        }
        let current = ticket == self.ticket;
        match outcome {
            Ok(produced) => {
                let stored = self
                    .parts
                    .shared
                    .cache()
                    .persist(book_id, &paragraph.locator, &produced);
                let path = match stored {
                    Ok(path) => path,
                    Err(err) if current => {
                        let message = format!(
                            "Failed to store audio for paragraph {}: {err:#}",
                            paragraph.locator
                        );
                        self.fail(message, PlayerError::Io(std::io::Error::other(format!("{err:#}"))));
                        return;
                    }
                    Err(err) => {
                        warn!(locator = %paragraph.locator, "Failed to store superseded audio: {err:#}");
                        return;
                    }
                };
                if !current {
                    debug!(locator = %paragraph.locator, "Cached audio of a superseded load");
                    return;
                }
                if self.state() == PlayingState::Loading {
                    self.start_playback(paragraph, path);
                } else {
                    debug!(locator = %paragraph.locator, state = %self.state(), "Audio ready; not playing");
                }
            }
            Err(exhausted) => {
                if !current {
                    warn!(
                        locator = %paragraph.locator,
                        "Synthesis of a superseded paragraph failed: {:#}",
                        exhausted.last
                    );
                    return;
                }
                let message = format!(
                    "Failed to synthesize paragraph {} after {} attempts: {:#}",
                    paragraph.locator, exhausted.attempts, exhausted.last
                );
                let err = PlayerError::SynthesisFailed {
                    locator: paragraph.locator,
                    attempts: exhausted.attempts,
                    message: format!("{:#}", exhausted.last),
                };
                self.fail(message, err);
            }
        }
    }

    fn start_playback(&mut self, paragraph: Paragraph, path: PathBuf) {
        let playback = match self.parts.output.start(&path) {
            Ok(playback) => playback,
            Err(err) => {
                let message = format!("Failed to play paragraph {}: {err:#}", paragraph.locator);
                self.fail(message, PlayerError::Io(std::io::Error::other(format!("{err:#}"))));
                return;
            }
        };
        self.next_playback_id += 1;
        let id = self.next_playback_id;
        self.playback = Some(ActivePlayback {
            id,
            locator: paragraph.locator.clone(),
        });
        let commands = self.parts.commands.clone();
        tokio::spawn(async move {
            if playback.finished.await.is_ok() {
                let _ = commands.send(Command::AudioEnded { playback_id: id });
            }
        });
        info!(locator = %paragraph.locator, path = %path.display(), "Playing paragraph");
        self.set_state(PlayingState::Playing);
        self.parts.hub.publish(PlayerEvent::PlayingAudio(paragraph));
        self.resolve_waiters(Ok(()));
    }

    async fn audio_ended(&mut self, playback_id: u64) {
        let matches = self
            .playback
            .as_ref()
            .is_some_and(|playback| playback.id == playback_id);
        if !matches || self.state() != PlayingState::Playing {
            trace!(playback_id, "Ignoring stale end of audio");
            return;
        }
        self.playback = None;
        if let Some(paragraph) = self.current_paragraph() {
            self.parts.hub.publish(PlayerEvent::AudioEnded(paragraph));
        }
        self.step(Direction::Next, None).await;
    }

    /// Record a paragraph failure and pause.
    fn fail(&mut self, message: String, err: PlayerError) {
        error!("{message}");
        let errors = {
            let mut model = self.parts.shared.model();
            model.errors.push(message);
            model.errors.clone()
        };
        self.parts.hub.publish(PlayerEvent::ErrorsChanged { errors });
        self.stop_output();
        self.set_state(PlayingState::Paused);
        self.resolve_waiters(Err(err));
    }

    /// Index change side effects, in order: the event, the highlight swap,
    /// then the saved location.
    async fn announce_index(&mut self, previous: Option<Paragraph>) {
        let (index, current, book_id) = {
            let model = self.parts.shared.model();
            (
                model.index(),
                model.current_paragraph().cloned(),
                model.book_id().map(str::to_string),
            )
        };
        self.parts.hub.publish(PlayerEvent::ParagraphIndexChanged {
            index,
            paragraph: current.clone(),
        });
        if let Some(previous) = &previous {
            let same = current
                .as_ref()
                .is_some_and(|current| current.locator == previous.locator);
            if !same {
                self.parts.adapter.remove_highlight(&previous.locator);
            }
        }
        let Some(current) = current else {
            return;
        };
        self.parts.adapter.highlight_paragraph(&current.locator);

        if let (Some(store), Some(book_id)) = (&self.parts.store, book_id) {
            if let Err(err) = store.update_book_location(&book_id, &current.locator).await {
                warn!(%book_id, locator = %current.locator, "Failed to save location: {err:#}");
            }
        }
    }

    fn publish_move(&self, direction: Direction, from: Option<usize>, to: usize) {
        let movement = ParagraphMove {
            from,
            to,
            direction,
        };
        let event = match direction {
            Direction::Next => PlayerEvent::MovedToNextParagraph(movement),
            Direction::Previous => PlayerEvent::MovedToPrevParagraph(movement),
        };
        self.parts.hub.publish(event);
    }

    fn set_state(&mut self, next: PlayingState) {
        let previous = {
            let mut model = self.parts.shared.model();
            std::mem::replace(&mut model.playing_state, next)
        };
        if previous == next {
            return;
        }
        debug!(from = %previous, to = %next, "Playing state changed");
        self.parts.hub.publish(PlayerEvent::PlayingStateChanged(next));
    }

    fn state(&self) -> PlayingState {
        self.parts.shared.model().playing_state()
    }

    fn current_paragraph(&self) -> Option<Paragraph> {
        self.parts.shared.model().current_paragraph().cloned()
    }

    /// Start a new load generation; results of earlier loads stop counting
    /// as current.
    fn invalidate_load(&mut self) -> u64 {
        self.next_ticket += 1;
        self.ticket = self.next_ticket;
        self.ticket
    }

    /// Audio from a previous session is neither indexed nor played. Files
    /// written for another book are removed.
    fn discard_stale_audio(
        &self,
        book_id: &str,
        paragraph: &Paragraph,
        outcome: Result<PathBuf, RetryExhausted>,
    ) {
        info!(
            locator = %paragraph.locator,
            "Discarding audio synthesized for a previous session"
        );
        let Ok(path) = outcome else {
            return;
        };
        if self.parts.shared.model().book_id() == Some(book_id) {
            return;
        }
        if let Err(err) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), "Failed to remove discarded audio: {err}");
        }
    }

    /// Work tagged with another epoch than both the session being served
    /// and the latest one handed out belongs to a session that is over.
    fn is_stale(&self, epoch: u64) -> bool {
        epoch != self.session || epoch != self.parts.shared.epoch()
    }

    fn stop_output(&mut self) {
        if self.playback.take().is_some() {
            self.parts.output.stop();
        }
    }

    fn resolve_waiters(&mut self, result: PlayerResult<()>) {
        let waiters = std::mem::take(&mut self.waiters);
        answer_all(waiters, result);
    }
}

fn answer_all(replies: impl IntoIterator<Item = Reply>, result: PlayerResult<()>) {
    for reply in replies {
        let _ = reply.send(duplicate(&result));
    }
}

/// `PlayerError` holds non-clonable sources; rebuild an equivalent value for
/// each waiter.
fn duplicate(result: &PlayerResult<()>) -> PlayerResult<()> {
    let Err(err) = result else {
        return Ok(());
    };
    Err(match err {
        PlayerError::SynthesisFailed {
            locator,
            attempts,
            message,
        } => PlayerError::SynthesisFailed {
            locator: locator.clone(),
            attempts: *attempts,
            message: message.clone(),
        },
        PlayerError::PageTurn(source) => PlayerError::PageTurn(anyhow!("{source:#}")),
        PlayerError::Cancelled => PlayerError::Cancelled,
        PlayerError::Closed => PlayerError::Closed,
        PlayerError::Io(source) => {
            PlayerError::Io(std::io::Error::new(source.kind(), source.to_string()))
        }
    })
}
