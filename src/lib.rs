//! Paragraph-by-paragraph narration of paginated documents.
//!
//! A [`player::Player`] drives synthesis and playback for the paragraphs a
//! [`document::DocumentAdapter`] publishes on the [`events::EventHub`], keeping
//! highlight, page position and audio in step.

pub mod audio;
pub mod cache;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod events;
pub mod library;
pub mod mutex;
pub mod pagination;
pub mod player;
pub mod segmenter;
pub mod source;
pub mod tts;

pub use context::AppContext;
pub use document::{DocumentAdapter, Paragraph};
pub use error::{PlayerError, PlayerResult};
pub use events::{EventHub, EventKind, PlayerEvent};
pub use player::{Player, PlayingState};
