//! Player identity and per-round state

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fallback nick when the client sends none
pub const DEFAULT_NICK: &str = "Player";
/// Fallback icon when the client sends none
pub const DEFAULT_ICON: &str = "😀";
/// Longest nick kept, in characters
pub const MAX_NICK_CHARS: usize = 32;

/// Opaque player identifier.
///
/// Ordering is used as the owner hand-off tie-break, so it has to stay
/// total and stable for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(Uuid);

impl PlayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport-side connection handle. A player only remembers which
/// connection to deliver to; the connection never owns the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Guess state that is wiped at the start of every round
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundGuess {
    pub has_guess: bool,
    pub guess_lat: f64,
    pub guess_lon: f64,
    pub round_score: i64,
}

/// A participant in a session
#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub conn: ConnectionId,
    pub nick: String,
    pub icon: String,
    pub is_ready: bool,
    pub is_owner: bool,
    /// Cumulative score for the current game, never decreases
    pub score: i64,
    pub round: RoundGuess,
}

impl Player {
    pub fn new(conn: ConnectionId, nick: Option<&str>, icon: Option<&str>) -> Self {
        let nick = nick
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| n.chars().take(MAX_NICK_CHARS).collect())
            .unwrap_or_else(|| DEFAULT_NICK.to_string());
        let icon = icon
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .unwrap_or(DEFAULT_ICON)
            .to_string();

        Self {
            id: PlayerId::new(),
            conn,
            nick,
            icon,
            is_ready: false,
            is_owner: false,
            score: 0,
            round: RoundGuess::default(),
        }
    }

    /// Record this round's guess. The client-computed score is taken as-is
    /// apart from clamping negatives, so the cumulative score only grows.
    pub fn record_guess(&mut self, lat: f64, lon: f64, score: Option<f64>) {
        self.round.has_guess = true;
        self.round.guess_lat = lat;
        self.round.guess_lon = lon;
        if let Some(score) = score {
            let points = score.max(0.0) as i64;
            self.round.round_score = points;
            self.score = self.score.saturating_add(points);
        }
    }

    pub fn reset_round(&mut self) {
        self.round = RoundGuess::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_nick_and_icon_fall_back_to_defaults() {
        let player = Player::new(ConnectionId::new(), Some("   "), None);
        assert_eq!(player.nick, DEFAULT_NICK);
        assert_eq!(player.icon, DEFAULT_ICON);
        assert!(!player.is_ready);
        assert!(!player.is_owner);
    }

    #[test]
    fn long_nick_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_NICK_CHARS + 10);
        let player = Player::new(ConnectionId::new(), Some(long.as_str()), Some("🦊"));
        assert_eq!(player.nick.chars().count(), MAX_NICK_CHARS);
        assert_eq!(player.icon, "🦊");
    }

    #[test]
    fn guesses_accumulate_score_and_reset_clears_round_only() {
        let mut player = Player::new(ConnectionId::new(), Some("Ana"), None);
        player.record_guess(50.1, 14.4, Some(4999.7));
        assert!(player.round.has_guess);
        assert_eq!(player.round.round_score, 4999);
        assert_eq!(player.score, 4999);

        player.reset_round();
        assert_eq!(player.round, RoundGuess::default());
        assert_eq!(player.score, 4999);

        player.record_guess(1.0, 2.0, Some(-300.0));
        assert_eq!(player.round.round_score, 0);
        assert_eq!(player.score, 4999);
    }

    #[test]
    fn huge_scores_saturate_instead_of_wrapping() {
        let mut player = Player::new(ConnectionId::new(), None, None);
        player.record_guess(1.0, 1.0, Some(1e19));
        assert_eq!(player.score, i64::MAX);

        player.reset_round();
        player.record_guess(1.0, 1.0, Some(1e19));
        assert_eq!(player.round.round_score, i64::MAX);
        assert_eq!(player.score, i64::MAX);
    }

    #[test]
    fn guess_without_score_leaves_totals_alone() {
        let mut player = Player::new(ConnectionId::new(), None, None);
        player.record_guess(10.0, 20.0, None);
        assert!(player.round.has_guess);
        assert_eq!(player.round.round_score, 0);
        assert_eq!(player.score, 0);
    }
}
