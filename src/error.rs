use thiserror::Error;

/// Failures surfaced by [`crate::player::Player`] operations.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("synthesis of paragraph {locator} failed after {attempts} attempts: {message}")]
    SynthesisFailed {
        locator: String,
        attempts: usize,
        message: String,
    },
    #[error("page turn failed: {0:#}")]
    PageTurn(anyhow::Error),
    #[error("cancelled by a newer request")]
    Cancelled,
    #[error("player is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type PlayerResult<T> = std::result::Result<T, PlayerError>;
