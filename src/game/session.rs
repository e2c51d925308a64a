//! Session state and the round state machine
//!
//! All mutation goes through [`SessionState`] behind the session's
//! `RwLock`. Handlers never send anything themselves: they return
//! [`Effects`] (messages to deliver, a timer to arm, a connection to close)
//! which the caller executes after the lock has been released, so a slow
//! connection can never stall other mutators of the same session.

use std::collections::BTreeMap;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::ws::protocol::{Guess, Location, LocationFailure, LocationRequest, ServerMsg};

use super::error::GameError;
use super::player::{ConnectionId, Player, PlayerId};
use super::settings::{GameSettings, SettingsPatch};
use super::timer::{ArmedTimer, TimerKind};
use super::GameRules;

const KICKED_MESSAGE: &str = "You were kicked from the session";
const RETRY_LOCATION_MESSAGE: &str = "Panorama failed to load, finding new location...";

/// Session phase. `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lobby,
    Playing,
    Finished,
}

/// Progress within the current round while `Playing`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStage {
    /// Accepting guesses
    Guessing,
    /// `roundEnd` has gone out; waiting for the next round
    Resolved,
}

/// One message and its recipients
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: Vec<ConnectionId>,
    pub msg: ServerMsg,
}

/// Side effects of a session mutation, executed outside the lock
#[derive(Debug, Default)]
pub struct Effects {
    pub outbox: Vec<Outgoing>,
    pub timer: Option<ArmedTimer>,
    /// Connection to close once its pending messages are flushed
    pub close: Option<ConnectionId>,
    /// The last player left; the registry entry must go
    pub emptied: bool,
}

impl Effects {
    pub fn send(&mut self, to: ConnectionId, msg: ServerMsg) {
        self.outbox.push(Outgoing { to: vec![to], msg });
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty() && self.timer.is_none() && self.close.is_none() && !self.emptied
    }

    fn extend(&mut self, other: Effects) {
        self.outbox.extend(other.outbox);
        self.timer = other.timer.or(self.timer.take());
        self.close = other.close.or(self.close.take());
        self.emptied |= other.emptied;
    }
}

/// A game session: a short code plus lock-guarded state
#[derive(Debug)]
pub struct Session {
    code: String,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(code: String, owner: Player, settings: GameSettings, rules: GameRules) -> Self {
        Self {
            state: RwLock::new(SessionState::new(code.clone(), owner, settings, rules)),
            code,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write()
    }
}

/// Everything guarded by the session lock
#[derive(Debug)]
pub struct SessionState {
    code: String,
    players: BTreeMap<PlayerId, Player>,
    settings: GameSettings,
    phase: Phase,
    round: u32,
    stage: RoundStage,
    location: Option<Location>,
    /// Identifies the only timer allowed to act; bumping it cancels
    generation: u64,
    /// Set in the same critical section that removes the last player
    closed: bool,
    rules: GameRules,
}

impl SessionState {
    fn new(code: String, mut owner: Player, settings: GameSettings, rules: GameRules) -> Self {
        owner.is_owner = true;
        let mut players = BTreeMap::new();
        players.insert(owner.id, owner);

        Self {
            code,
            players,
            settings,
            phase: Phase::Lobby,
            round: 0,
            stage: RoundStage::Guessing,
            location: None,
            generation: 0,
            closed: false,
            rules,
        }
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    fn is_owner(&self, id: &PlayerId) -> bool {
        self.players.get(id).is_some_and(|p| p.is_owner)
    }

    fn everyone(&self) -> Vec<ConnectionId> {
        self.players.values().map(|p| p.conn).collect()
    }

    fn broadcast(&self, effects: &mut Effects, msg: ServerMsg) {
        effects.outbox.push(Outgoing {
            to: self.everyone(),
            msg,
        });
    }

    fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Greeting for the creator right after the session is registered
    pub fn created(&self, player_id: &PlayerId) -> Effects {
        let mut effects = Effects::default();
        if let Some(player) = self.players.get(player_id) {
            effects.send(
                player.conn,
                ServerMsg::SessionCreated {
                    code: self.code.clone(),
                    players: self.player_summaries(),
                    settings: self.settings.clone(),
                    is_owner: true,
                },
            );
        }
        effects
    }

    /// Add a player. Only allowed in the lobby.
    pub fn join(&mut self, mut player: Player) -> Result<Effects, GameError> {
        if self.closed {
            return Err(GameError::NotFound);
        }
        if self.phase != Phase::Lobby {
            return Err(GameError::GAME_ALREADY_STARTED);
        }

        player.is_owner = false;
        let conn = player.conn;
        info!(code = %self.code, player_id = %player.id, nick = %player.nick, "Player joined session");
        self.players.insert(player.id, player);

        let mut effects = Effects::default();
        effects.send(
            conn,
            ServerMsg::SessionJoined {
                code: self.code.clone(),
                players: self.player_summaries(),
                settings: self.settings.clone(),
                is_owner: false,
            },
        );
        self.broadcast(
            &mut effects,
            ServerMsg::PlayerJoined {
                players: self.player_summaries(),
            },
        );
        Ok(effects)
    }

    /// Remove a player, handing ownership on and closing the session when
    /// it becomes empty. Allowed in any phase; unknown ids are a no-op.
    pub fn leave(&mut self, player_id: &PlayerId) -> Effects {
        let mut effects = Effects::default();
        let Some(player) = self.players.remove(player_id) else {
            return effects;
        };

        if self.players.is_empty() {
            self.closed = true;
            self.location = None;
            self.bump_generation();
            effects.emptied = true;
            info!(code = %self.code, "Last player left, closing session");
            return effects;
        }

        if player.is_owner {
            // Smallest id wins, keeping the hand-off reproducible
            if let Some(next) = self.players.values_mut().next() {
                next.is_owner = true;
                info!(code = %self.code, player_id = %next.id, "Ownership transferred");
            }
        }

        info!(
            code = %self.code,
            player_id = %player_id,
            remaining = self.players.len(),
            "Player left session"
        );
        self.broadcast(
            &mut effects,
            ServerMsg::PlayerLeft {
                player_id: *player_id,
                players: self.player_summaries(),
            },
        );

        // The leaver may have been the last one everybody was waiting on
        if self.phase == Phase::Playing
            && self.stage == RoundStage::Guessing
            && self.players.values().all(|p| p.round.has_guess)
        {
            effects.timer = Some(self.resolve_round(&mut effects));
        }

        effects
    }

    pub fn toggle_ready(&mut self, player_id: &PlayerId) -> Effects {
        let mut effects = Effects::default();
        let Some(player) = self.players.get_mut(player_id) else {
            return effects;
        };
        player.is_ready = !player.is_ready;
        let is_ready = player.is_ready;

        self.broadcast(
            &mut effects,
            ServerMsg::PlayerReady {
                player_id: *player_id,
                is_ready,
                all_ready: self.all_ready(),
                players: self.player_summaries(),
            },
        );
        effects
    }

    /// Owner-only, lobby-only partial settings merge
    pub fn update_settings(&mut self, player_id: &PlayerId, patch: SettingsPatch) -> Effects {
        let mut effects = Effects::default();
        if !self.is_owner(player_id) || self.phase != Phase::Lobby {
            debug!(code = %self.code, player_id = %player_id, "Ignoring settings update");
            return effects;
        }

        patch.apply(&mut self.settings);
        self.broadcast(
            &mut effects,
            ServerMsg::SettingsUpdated {
                settings: self.settings.clone(),
            },
        );
        effects
    }

    /// Owner removes another player. The target hears about it first.
    pub fn kick(&mut self, player_id: &PlayerId, target_id: &PlayerId) -> Effects {
        let mut effects = Effects::default();
        if !self.is_owner(player_id) || player_id == target_id {
            debug!(code = %self.code, player_id = %player_id, "Ignoring kick");
            return effects;
        }
        let Some(target_conn) = self.players.get(target_id).map(|p| p.conn) else {
            return effects;
        };

        info!(code = %self.code, player_id = %target_id, "Kicking player");
        effects.send(
            target_conn,
            ServerMsg::Kicked {
                message: KICKED_MESSAGE.to_string(),
            },
        );
        effects.extend(self.leave(target_id));
        effects.close = Some(target_conn);
        effects
    }

    /// Owner starts the game once everyone is ready
    pub fn start_game(&mut self, player_id: &PlayerId) -> Result<Effects, GameError> {
        let mut effects = Effects::default();
        if !self.is_owner(player_id) {
            debug!(code = %self.code, player_id = %player_id, "Ignoring start from non-owner");
            return Ok(effects);
        }
        if self.phase != Phase::Lobby {
            return Err(GameError::GAME_ALREADY_STARTED);
        }
        if !self.all_ready() {
            return Err(GameError::NOT_ALL_READY);
        }

        self.phase = Phase::Playing;
        self.round = 1;
        self.stage = RoundStage::Guessing;
        self.location = None;
        self.bump_generation();
        for player in self.players.values_mut() {
            player.score = 0;
            player.reset_round();
        }

        info!(code = %self.code, players = self.players.len(), "Game started");
        self.broadcast(
            &mut effects,
            ServerMsg::GameStarted {
                settings: self.settings.clone(),
            },
        );
        Ok(effects)
    }

    /// Record a guess and decide who, if anyone, ends the round.
    ///
    /// The client-supplied score is trusted verbatim; there is no server-side
    /// distance check.
    pub fn submit_guess(&mut self, player_id: &PlayerId, guess: Guess) -> Effects {
        let mut effects = Effects::default();
        if self.phase != Phase::Playing || self.stage != RoundStage::Guessing {
            debug!(code = %self.code, player_id = %player_id, "Guess outside an open round");
            return effects;
        }

        let is_first = !self.players.values().any(|p| p.round.has_guess);
        let Some(player) = self.players.get_mut(player_id) else {
            return effects;
        };
        if player.round.has_guess {
            debug!(code = %self.code, player_id = %player_id, "Duplicate guess ignored");
            return effects;
        }
        player.record_guess(guess.lat, guess.lon, guess.score);
        let (conn, nick, icon) = (player.conn, player.nick.clone(), player.icon.clone());

        let is_quorum = self.players.values().all(|p| p.round.has_guess);
        if is_quorum {
            info!(code = %self.code, round = self.round, "All players submitted");
            effects.timer = Some(self.resolve_round(&mut effects));
        } else if is_first {
            let generation = self.bump_generation();
            debug!(code = %self.code, generation, "Round timer armed");
            effects.timer = Some(ArmedTimer::new(
                generation,
                TimerKind::RoundWindow,
                self.rules.round_timer,
            ));
            self.broadcast(
                &mut effects,
                ServerMsg::TimerStarted {
                    duration: self.rules.round_timer.as_secs(),
                },
            );
        }

        self.broadcast(
            &mut effects,
            ServerMsg::PlayerSubmitted {
                player_id: *player_id,
                nick,
                icon,
            },
        );
        effects.send(conn, ServerMsg::GuessReceived(guess));
        effects
    }

    /// First valid location wins; later requests get the stored one back.
    ///
    /// A latitude of exactly zero means "no location" and is never stored,
    /// so a genuine equatorial target cannot be shared this way.
    pub fn request_location(&mut self, player_id: &PlayerId, request: LocationRequest) -> Effects {
        let mut effects = Effects::default();
        if self.phase != Phase::Playing {
            return effects;
        }
        let Some(conn) = self.players.get(player_id).map(|p| p.conn) else {
            return effects;
        };

        if let Some(location) = &self.location {
            effects.send(conn, ServerMsg::LocationData(location.clone()));
            return effects;
        }
        if request.lat == 0.0 {
            return effects;
        }

        let location = Location {
            lat: request.lat,
            lon: request.lon,
            date: request.date,
        };
        info!(code = %self.code, lat = location.lat, lon = location.lon, "Location set");
        self.location = Some(location.clone());
        self.broadcast(&mut effects, ServerMsg::LocationData(location));
        effects
    }

    /// Drop the stored location and ask everyone to find a new one.
    /// Round, guesses and timers are left running.
    pub fn location_failed(&mut self, player_id: &PlayerId, failure: LocationFailure) -> Effects {
        let mut effects = Effects::default();
        if self.phase != Phase::Playing || !self.players.contains_key(player_id) {
            return effects;
        }

        info!(code = %self.code, lat = ?failure.lat, lon = ?failure.lon, "Location failed");
        self.location = None;
        self.broadcast(
            &mut effects,
            ServerMsg::RetryLocation {
                message: RETRY_LOCATION_MESSAGE.to_string(),
            },
        );
        effects
    }

    /// Owner skips the rest of the inter-round delay
    pub fn next_round(&mut self, player_id: &PlayerId) -> Effects {
        let mut effects = Effects::default();
        if !self.is_owner(player_id)
            || self.phase != Phase::Playing
            || self.stage != RoundStage::Resolved
        {
            debug!(code = %self.code, player_id = %player_id, "Ignoring next round request");
            return effects;
        }

        self.bump_generation();
        self.advance_or_finish(&mut effects);
        effects
    }

    /// Timer callback. Only the live generation may act; anything else was
    /// superseded and does nothing.
    pub fn fire_timer(&mut self, timer: ArmedTimer) -> Effects {
        let mut effects = Effects::default();
        if self.closed || timer.generation != self.generation {
            debug!(
                code = %self.code,
                generation = timer.generation,
                live = self.generation,
                "Stale timer ignored"
            );
            return effects;
        }

        match (timer.kind, self.phase, self.stage) {
            (TimerKind::RoundWindow, Phase::Playing, RoundStage::Guessing) => {
                info!(code = %self.code, round = self.round, "Round timer expired");
                effects.timer = Some(self.resolve_round(&mut effects));
            }
            (TimerKind::Intermission, Phase::Playing, RoundStage::Resolved) => {
                self.advance_or_finish(&mut effects);
            }
            _ => {}
        }
        effects
    }

    /// Close the round: supersede whatever timer is live, publish results
    /// and hand back the inter-round timer to arm.
    fn resolve_round(&mut self, effects: &mut Effects) -> ArmedTimer {
        self.stage = RoundStage::Resolved;
        let generation = self.bump_generation();
        self.broadcast(
            effects,
            ServerMsg::RoundEnd {
                round: self.round,
                players: self.player_results(),
            },
        );
        ArmedTimer::new(generation, TimerKind::Intermission, self.rules.next_round_delay)
    }

    fn advance_or_finish(&mut self, effects: &mut Effects) {
        if self.round >= self.rules.max_rounds {
            self.phase = Phase::Finished;
            self.location = None;
            self.bump_generation();
            info!(code = %self.code, "Game finished");
            self.broadcast(
                effects,
                ServerMsg::GameFinished {
                    players: self.player_results(),
                },
            );
            return;
        }

        self.round += 1;
        self.stage = RoundStage::Guessing;
        self.location = None;
        for player in self.players.values_mut() {
            player.reset_round();
        }

        info!(code = %self.code, round = self.round, "Starting next round");
        self.broadcast(effects, ServerMsg::StartNextRound { round: self.round });
    }
}

// Read-only views used by tests across the crate
#[cfg(test)]
impl SessionState {
    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn owner(&self) -> Option<&Player> {
        self.players.values().find(|p| p.is_owner)
    }

    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn stage(&self) -> RoundStage {
        self.stage
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
