//! Errors raised by session handlers
//!
//! Every variant is handled where it is detected: the router turns it into
//! an `error` reply to the offending connection and nothing else changes.

/// Rejected game action
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    /// Malformed or missing request fields
    #[error("{0}")]
    Validation(String),

    /// Unknown session code
    #[error("Session not found")]
    NotFound,

    /// Action not allowed in the session's current state
    #[error("{0}")]
    StateConflict(&'static str),
}

impl GameError {
    pub const GAME_ALREADY_STARTED: Self = Self::StateConflict("Game already started");
    pub const NOT_ALL_READY: Self = Self::StateConflict("Not all players are ready");
}
