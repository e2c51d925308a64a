//! Session and round coordination

pub mod error;
pub mod player;
pub mod registry;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod timer;

pub use error::GameError;
pub use player::{ConnectionId, Player, PlayerId};
pub use registry::SessionRegistry;
pub use session::{Effects, Outgoing, Session};

use std::time::Duration;

/// Round window opened by the first guess
pub const ROUND_TIMER_SECONDS: u64 = 10;
/// Pause between `roundEnd` and the next round
pub const NEXT_ROUND_DELAY_SECONDS: u64 = 5;
/// Rounds per game
pub const MAX_ROUNDS: u32 = 5;

/// Timing and length of a game, fixed per session at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameRules {
    pub round_timer: Duration,
    pub next_round_delay: Duration,
    pub max_rounds: u32,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            round_timer: Duration::from_secs(ROUND_TIMER_SECONDS),
            next_round_delay: Duration::from_secs(NEXT_ROUND_DELAY_SECONDS),
            max_rounds: MAX_ROUNDS,
        }
    }
}
