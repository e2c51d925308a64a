//! Registry of live sessions, keyed by join code
//!
//! Only the code → session map lives behind the registry's locks. Callers
//! resolve a session here, drop every registry guard, and only then take
//! the session lock; the two are never held together.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use super::error::GameError;
use super::player::Player;
use super::session::Session;
use super::settings::GameSettings;
use super::GameRules;

/// Random bytes per code; hex-encoded this gives six characters
pub const CODE_BYTES: usize = 3;

/// Canonical form of a user-typed code
pub fn canonical_code(code: &str) -> String {
    code.trim().to_ascii_lowercase()
}

/// Registry of all live sessions
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    rng: Mutex<ChaCha8Rng>,
    rules: GameRules,
}

impl SessionRegistry {
    pub fn new(rules: GameRules) -> Self {
        Self::with_rng(rules, ChaCha8Rng::from_entropy())
    }

    #[cfg(test)]
    pub fn with_seed(rules: GameRules, seed: u64) -> Self {
        Self::with_rng(rules, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(rules: GameRules, rng: ChaCha8Rng) -> Self {
        Self {
            sessions: DashMap::new(),
            rng: Mutex::new(rng),
            rules,
        }
    }

    #[cfg(test)]
    pub fn rules(&self) -> GameRules {
        self.rules
    }

    fn generate_code(&self) -> String {
        let bytes: [u8; CODE_BYTES] = self.rng.lock().gen();
        hex::encode(bytes)
    }

    /// Create a session with `owner` as its only member.
    ///
    /// Codes are drawn until one is free; the vacancy check and the insert
    /// happen under the same map entry lock.
    pub fn create(&self, owner: Player, settings: GameSettings) -> Arc<Session> {
        loop {
            let code = self.generate_code();
            match self.sessions.entry(code) {
                Entry::Occupied(entry) => {
                    info!(code = %entry.key(), "Session code collision, retrying");
                }
                Entry::Vacant(entry) => {
                    let session = Arc::new(Session::new(
                        entry.key().clone(),
                        owner,
                        settings,
                        self.rules,
                    ));
                    entry.insert(session.clone());
                    info!(code = %session.code(), "Session created");
                    return session;
                }
            }
        }
    }

    /// Case-insensitive lookup
    pub fn lookup(&self, code: &str) -> Result<Arc<Session>, GameError> {
        self.sessions
            .get(&canonical_code(code))
            .map(|s| s.value().clone())
            .ok_or(GameError::NotFound)
    }

    /// Remove a session. Idempotent.
    pub fn remove(&self, code: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&canonical_code(code)).map(|(_, s)| s);
        if removed.is_some() {
            info!(code = %code, "Session removed");
        }
        removed
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(GameRules::default())
    }
}
