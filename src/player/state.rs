use crate::document::Paragraph;
use crate::events::Direction;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayingState {
    #[default]
    Stopped,
    Loading,
    Playing,
    Paused,
    WaitingForNewParagraphs,
}

impl PlayingState {
    /// Narration is running or about to run without further user input.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PlayingState::Loading | PlayingState::Playing | PlayingState::WaitingForNewParagraphs
        )
    }
}

impl fmt::Display for PlayingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlayingState::Stopped => "stopped",
            PlayingState::Loading => "loading",
            PlayingState::Playing => "playing",
            PlayingState::Paused => "paused",
            PlayingState::WaitingForNewParagraphs => "waitingForNewParagraphs",
        };
        f.write_str(label)
    }
}

/// Observable player model. The index is only ever `Some(i)` with
/// `i < current_paragraphs.len()`, and `None` iff the page is empty.
#[derive(Debug, Clone, Default)]
pub struct PlayerModel {
    pub(in crate::player) book_id: Option<String>,
    pub(in crate::player) current_paragraphs: Vec<Paragraph>,
    pub(in crate::player) next_page_paragraphs: Vec<Paragraph>,
    pub(in crate::player) previous_page_paragraphs: Vec<Paragraph>,
    index: Option<usize>,
    pub(in crate::player) playing_state: PlayingState,
    pub(in crate::player) errors: Vec<String>,
    /// Direction of a page turn requested by the player and not yet answered
    /// by fresh paragraphs.
    pub(in crate::player) pending_turn: Option<Direction>,
}

impl PlayerModel {
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn current_paragraph(&self) -> Option<&Paragraph> {
        self.index.and_then(|idx| self.current_paragraphs.get(idx))
    }

    pub fn book_id(&self) -> Option<&str> {
        self.book_id.as_deref()
    }

    pub fn playing_state(&self) -> PlayingState {
        self.playing_state
    }

    /// Forget everything about the previous book.
    pub(in crate::player) fn reset(&mut self, book_id: &str) {
        *self = Self {
            book_id: Some(book_id.to_string()),
            playing_state: self.playing_state,
            ..Self::default()
        };
    }

    /// Install a freshly published page. Landing on a page reached backwards
    /// starts at its last paragraph, otherwise at the first.
    pub(in crate::player) fn replace_current(
        &mut self,
        paragraphs: Vec<Paragraph>,
        landing: Option<Direction>,
    ) {
        self.index = match (paragraphs.len(), landing) {
            (0, _) => None,
            (len, Some(Direction::Previous)) => Some(len - 1),
            _ => Some(0),
        };
        self.current_paragraphs = paragraphs;
    }

    /// Move within the page. Returns false, leaving the index untouched, when
    /// `idx` is past the end.
    pub(in crate::player) fn set_index(&mut self, idx: usize) -> bool {
        if idx >= self.current_paragraphs.len() {
            return false;
        }
        self.index = Some(idx);
        true
    }

    /// Neighbouring index on the same page, if any.
    pub(in crate::player) fn step(&self, direction: Direction) -> Option<usize> {
        let idx = self.index?;
        match direction {
            Direction::Next => Some(idx + 1).filter(|next| *next < self.current_paragraphs.len()),
            Direction::Previous => idx.checked_sub(1),
        }
    }
}
