//! Read-only projections of session state for the wire

use crate::ws::protocol::{PlayerResult, PlayerSummary};

use super::player::Player;
use super::session::SessionState;

impl From<&Player> for PlayerSummary {
    fn from(p: &Player) -> Self {
        Self {
            id: p.id,
            nick: p.nick.clone(),
            icon: p.icon.clone(),
            is_ready: p.is_ready,
            is_owner: p.is_owner,
            score: p.score,
        }
    }
}

impl From<&Player> for PlayerResult {
    fn from(p: &Player) -> Self {
        Self {
            id: p.id,
            nick: p.nick.clone(),
            icon: p.icon.clone(),
            score: p.score,
            round_score: p.round.round_score,
            guess_lat: p.round.guess_lat,
            guess_lon: p.round.guess_lon,
            has_guess: p.round.has_guess,
        }
    }
}

impl SessionState {
    /// Lobby membership list, ordered by player id
    pub fn player_summaries(&self) -> Vec<PlayerSummary> {
        self.players().map(PlayerSummary::from).collect()
    }

    /// Round/game results, ordered by player id
    pub fn player_results(&self) -> Vec<PlayerResult> {
        self.players().map(PlayerResult::from).collect()
    }

    /// True when the session has players and every one of them is ready
    pub fn all_ready(&self) -> bool {
        !self.is_empty() && self.players().all(|p| p.is_ready)
    }
}
