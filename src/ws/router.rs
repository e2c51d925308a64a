//! Inbound message dispatch
//!
//! The router resolves which session and player a connection speaks for,
//! runs the handler under that session's lock and then, with the lock
//! released, delivers messages, closes kicked connections, removes emptied
//! sessions from the registry and arms timers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::game::settings::GameSettings;
use crate::game::{timer, ConnectionId, Effects, GameError, Player, PlayerId, Session, SessionRegistry};

use super::hub::ConnectionHub;
use super::protocol::{ClientMsg, CreateSession, JoinSession, ServerMsg};

#[derive(Clone)]
struct Membership {
    session: Arc<Session>,
    player_id: PlayerId,
}

/// Per-connection routing state, owned by the connection's reader task
pub struct ConnectionContext {
    id: ConnectionId,
    membership: Option<Membership>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            membership: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[cfg(test)]
    pub fn player_id(&self) -> Option<PlayerId> {
        self.membership.as_ref().map(|m| m.player_id)
    }

    pub fn session_code(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.session.code())
    }
}

/// Dispatches client messages to session handlers
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>, hub: Arc<ConnectionHub>) -> Self {
        Self { registry, hub }
    }

    /// Handle one raw text frame
    pub fn handle_text(&self, ctx: &mut ConnectionContext, text: &str) {
        match ClientMsg::parse(text) {
            Ok(msg) => self.handle(ctx, msg),
            Err(e) => {
                warn!(conn = %ctx.id, error = %e, "Failed to parse client message");
                self.reject(ctx, e.into());
            }
        }
    }

    pub fn handle(&self, ctx: &mut ConnectionContext, msg: ClientMsg) {
        let result = match msg {
            ClientMsg::CreateSession(req) => self.create_session(ctx, req),
            ClientMsg::JoinSession(req) => self.join_session(ctx, req),
            other => self.in_session(ctx, other),
        };

        if let Err(e) = result {
            self.reject(ctx, e);
        }
    }

    /// The transport reports the connection is gone. Called once per
    /// connection.
    pub fn disconnect(&self, ctx: &mut ConnectionContext) {
        info!(conn = %ctx.id, code = ?ctx.session_code(), "Connection ended");
        self.leave_current(ctx);
    }

    fn create_session(&self, ctx: &mut ConnectionContext, req: CreateSession) -> Result<(), GameError> {
        self.leave_current(ctx);

        let player = Player::new(ctx.id, req.nick.as_deref(), req.icon.as_deref());
        let player_id = player.id;
        let mut settings = GameSettings::default();
        if let Some(patch) = req.settings {
            patch.apply(&mut settings);
        }

        let session = self.registry.create(player, settings);
        let effects = session.read().created(&player_id);
        self.apply(&session, effects);
        ctx.membership = Some(Membership { session, player_id });
        Ok(())
    }

    fn join_session(&self, ctx: &mut ConnectionContext, req: JoinSession) -> Result<(), GameError> {
        if req.code.trim().is_empty() {
            return Err(GameError::Validation("Session code is required".to_string()));
        }
        let session = self.registry.lookup(&req.code)?;

        let player = Player::new(ctx.id, req.nick.as_deref(), req.icon.as_deref());
        let player_id = player.id;
        let effects = session.write().join(player)?;

        self.leave_current(ctx);
        self.apply(&session, effects);
        ctx.membership = Some(Membership { session, player_id });
        Ok(())
    }

    fn in_session(&self, ctx: &mut ConnectionContext, msg: ClientMsg) -> Result<(), GameError> {
        let Some(Membership { session, player_id }) = ctx.membership.clone() else {
            debug!(conn = %ctx.id, ?msg, "Message from connection without a session");
            return Ok(());
        };

        let effects = {
            let mut state = session.write();
            match msg {
                ClientMsg::ToggleReady => state.toggle_ready(&player_id),
                ClientMsg::UpdateSettings(patch) => state.update_settings(&player_id, patch),
                ClientMsg::KickPlayer(kick) => state.kick(&player_id, &kick.player_id),
                ClientMsg::StartGame => state.start_game(&player_id)?,
                ClientMsg::SubmitGuess(guess) => state.submit_guess(&player_id, guess),
                ClientMsg::RequestLocation(request) => state.request_location(&player_id, request),
                ClientMsg::NextRound => state.next_round(&player_id),
                ClientMsg::LocationFailed(failure) => state.location_failed(&player_id, failure),
                ClientMsg::CreateSession(_) | ClientMsg::JoinSession(_) => Effects::default(),
            }
        };

        self.apply(&session, effects);
        Ok(())
    }

    fn leave_current(&self, ctx: &mut ConnectionContext) {
        if let Some(Membership { session, player_id }) = ctx.membership.take() {
            let effects = session.write().leave(&player_id);
            self.apply(&session, effects);
        }
    }

    /// Execute handler effects. Must be called without the session lock.
    fn apply(&self, session: &Arc<Session>, effects: Effects) {
        self.hub.dispatch(effects.outbox);
        if let Some(conn) = effects.close {
            self.hub.close(conn);
        }
        if effects.emptied {
            self.registry.remove(session.code());
        }
        if let Some(armed) = effects.timer {
            timer::spawn(Arc::downgrade(session), armed, self.hub.clone());
        }
    }

    fn reject(&self, ctx: &ConnectionContext, err: GameError) {
        debug!(conn = %ctx.id, error = %err, "Rejected client action");
        self.hub.deliver(ctx.id, ServerMsg::error(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    use crate::game::session::Phase;
    use crate::game::GameRules;

    struct Client {
        ctx: ConnectionContext,
        rx: mpsc::Receiver<ServerMsg>,
    }

    impl Client {
        fn connect(router: &MessageRouter) -> Self {
            let id = ConnectionId::new();
            let rx = router.hub.register(id);
            Self {
                ctx: ConnectionContext::new(id),
                rx,
            }
        }

        fn send(&mut self, router: &MessageRouter, value: serde_json::Value) {
            router.handle_text(&mut self.ctx, &value.to_string());
        }

        fn drain(&mut self) -> Vec<ServerMsg> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn router() -> MessageRouter {
        MessageRouter::new(
            Arc::new(SessionRegistry::new(GameRules::default())),
            Arc::new(ConnectionHub::new()),
        )
    }

    fn created_code(msgs: &[ServerMsg]) -> String {
        msgs.iter()
            .find_map(|m| match m {
                ServerMsg::SessionCreated { code, .. } => Some(code.clone()),
                _ => None,
            })
            .expect("sessionCreated")
    }

    fn count(msgs: &[ServerMsg], pred: impl Fn(&ServerMsg) -> bool) -> usize {
        msgs.iter().filter(|m| pred(m)).count()
    }

    /// Owner and one guest, both ready, game started
    fn started_pair(router: &MessageRouter) -> (Client, Client, Arc<Session>) {
        let mut owner = Client::connect(router);
        owner.send(router, json!({ "type": "createSession", "payload": { "nick": "Ana" } }));
        let code = created_code(&owner.drain());

        let mut guest = Client::connect(router);
        guest.send(
            router,
            json!({ "type": "joinSession", "payload": { "code": code, "nick": "Bo" } }),
        );
        for client in [&mut owner, &mut guest] {
            client.send(router, json!({ "type": "toggleReady", "payload": {} }));
        }
        owner.send(router, json!({ "type": "startGame", "payload": {} }));

        let session = router.registry.lookup(&code).unwrap();
        owner.drain();
        guest.drain();
        (owner, guest, session)
    }

    fn guess(score: i64) -> serde_json::Value {
        json!({ "type": "submitGuess", "payload": { "lat": 50.08, "lon": 14.42, "score": score } })
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_round_then_delayed_next_round() {
        let router = router();
        let (mut owner, mut guest, session) = started_pair(&router);
        {
            let state = session.read();
            assert_eq!(state.phase(), Phase::Playing);
            assert_eq!(state.round(), 1);
        }

        owner.send(&router, guess(5000));
        guest.send(&router, guess(3000));

        let seen = owner.drain();
        let results = seen
            .iter()
            .find_map(|m| match m {
                ServerMsg::RoundEnd { round: 1, players } => Some(players.clone()),
                _ => None,
            })
            .expect("roundEnd right after quorum");
        let mut scores: Vec<i64> = results.iter().map(|p| p.score).collect();
        scores.sort();
        assert_eq!(scores, vec![3000, 5000]);
        assert_eq!(count(&guest.drain(), |m| matches!(m, ServerMsg::RoundEnd { .. })), 1);

        sleep(Duration::from_secs(4)).await;
        assert!(owner.drain().is_empty());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(owner.drain(), vec![ServerMsg::StartNextRound { round: 2 }]);
        assert_eq!(guest.drain(), vec![ServerMsg::StartNextRound { round: 2 }]);

        let state = session.read();
        assert_eq!(state.round(), 2);
        assert!(state.location().is_none());
        assert!(state.players().all(|p| !p.round.has_guess));
    }

    #[tokio::test(start_paused = true)]
    async fn round_window_expiry_ends_round() {
        let router = router();
        let (mut owner, mut guest, session) = started_pair(&router);

        owner.send(&router, guess(4000));
        let first = guest.drain();
        assert!(first.contains(&ServerMsg::TimerStarted { duration: 10 }));
        assert_eq!(count(&first, |m| matches!(m, ServerMsg::PlayerSubmitted { .. })), 1);

        sleep(Duration::from_secs(9)).await;
        assert_eq!(count(&guest.drain(), |m| matches!(m, ServerMsg::RoundEnd { .. })), 0);

        sleep(Duration::from_secs(2)).await;
        let ended = guest.drain();
        let results = ended
            .iter()
            .find_map(|m| match m {
                ServerMsg::RoundEnd { players, .. } => Some(players.clone()),
                _ => None,
            })
            .expect("roundEnd from timer");
        let guest_id = guest.ctx.player_id().unwrap();
        assert!(!results.iter().find(|p| p.id == guest_id).unwrap().has_guess);

        sleep(Duration::from_secs(5)).await;
        assert!(guest.drain().contains(&ServerMsg::StartNextRound { round: 2 }));
        assert_eq!(session.read().round(), 2);
        owner.drain();
    }

    #[tokio::test(start_paused = true)]
    async fn late_quorum_beats_timer_exactly_once() {
        let router = router();
        let (mut owner, mut guest, session) = started_pair(&router);

        owner.send(&router, guess(1000));
        sleep(Duration::from_millis(9_900)).await;
        guest.send(&router, guess(2000));

        sleep(Duration::from_secs(30)).await;
        let seen = owner.drain();
        assert_eq!(count(&seen, |m| matches!(m, ServerMsg::RoundEnd { .. })), 1);
        assert_eq!(count(&seen, |m| matches!(m, ServerMsg::StartNextRound { .. })), 1);
        assert_eq!(session.read().round(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_player_game_runs_to_finish() {
        let router = router();
        let mut solo = Client::connect(&router);
        solo.send(&router, json!({ "type": "createSession", "payload": {} }));
        let code = created_code(&solo.drain());
        solo.send(&router, json!({ "type": "toggleReady" }));
        solo.send(&router, json!({ "type": "startGame" }));

        for _ in 0..crate::game::MAX_ROUNDS {
            solo.send(&router, guess(100));
            sleep(Duration::from_secs(6)).await;
        }

        let seen = solo.drain();
        let finished = seen
            .iter()
            .find_map(|m| match m {
                ServerMsg::GameFinished { players } => Some(players.clone()),
                _ => None,
            })
            .expect("gameFinished");
        assert_eq!(finished[0].score, 500);

        let session = router.registry.lookup(&code).unwrap();
        assert_eq!(session.read().phase(), Phase::Finished);
    }

    #[tokio::test]
    async fn join_is_case_insensitive_and_unknown_codes_error() {
        let router = router();
        let mut owner = Client::connect(&router);
        owner.send(&router, json!({ "type": "createSession", "payload": { "nick": "Ana" } }));
        let code = created_code(&owner.drain());

        let mut lost = Client::connect(&router);
        lost.send(&router, json!({ "type": "joinSession", "payload": { "code": "ffffff0" } }));
        assert_eq!(lost.drain(), vec![ServerMsg::error("Session not found")]);

        lost.send(&router, json!({ "type": "joinSession", "payload": { "code": "" } }));
        assert_eq!(lost.drain(), vec![ServerMsg::error("Session code is required")]);

        let mut guest = Client::connect(&router);
        guest.send(
            &router,
            json!({ "type": "joinSession", "payload": { "code": code.to_uppercase() } }),
        );
        let joined = guest.drain();
        assert!(matches!(joined[0], ServerMsg::SessionJoined { is_owner: false, .. }));
        assert!(matches!(
            &owner.drain()[..],
            [ServerMsg::PlayerJoined { players }] if players.len() == 2
        ));
    }

    #[tokio::test]
    async fn start_without_everyone_ready_is_reported() {
        let router = router();
        let mut owner = Client::connect(&router);
        owner.send(&router, json!({ "type": "createSession", "payload": {} }));
        let code = created_code(&owner.drain());
        let mut guest = Client::connect(&router);
        guest.send(&router, json!({ "type": "joinSession", "payload": { "code": code } }));
        owner.send(&router, json!({ "type": "toggleReady", "payload": {} }));
        owner.drain();
        guest.drain();

        owner.send(&router, json!({ "type": "startGame", "payload": {} }));
        assert_eq!(owner.drain(), vec![ServerMsg::error("Not all players are ready")]);
        assert!(guest.drain().is_empty());

        let session = router.registry.lookup(&code).unwrap();
        assert_eq!(session.read().phase(), Phase::Lobby);
        assert_eq!(session.read().round(), 0);
    }

    #[tokio::test]
    async fn kick_notifies_then_closes_target() {
        let router = router();
        let mut owner = Client::connect(&router);
        owner.send(&router, json!({ "type": "createSession", "payload": {} }));
        let code = created_code(&owner.drain());
        let mut guest = Client::connect(&router);
        guest.send(&router, json!({ "type": "joinSession", "payload": { "code": code } }));
        owner.drain();
        guest.drain();

        let target = guest.ctx.player_id().unwrap();
        owner.send(&router, json!({ "type": "kickPlayer", "payload": { "playerId": target } }));

        assert!(matches!(guest.rx.try_recv(), Ok(ServerMsg::Kicked { .. })));
        assert!(matches!(
            guest.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(
            &owner.drain()[..],
            [ServerMsg::PlayerLeft { player_id, players }] if *player_id == target && players.len() == 1
        ));

        // The kicked connection's eventual disconnect changes nothing
        router.disconnect(&mut guest.ctx);
        assert!(owner.drain().is_empty());
        assert_eq!(router.registry.lookup(&code).unwrap().read().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_disconnect_destroys_session_and_silences_timers() {
        let router = router();
        let (mut owner, mut guest, session) = started_pair(&router);
        let code = session.code().to_string();

        owner.send(&router, guess(10));
        router.disconnect(&mut guest.ctx);
        let new_owner = session.read().owner().map(|p| p.id);
        assert_eq!(new_owner, owner.ctx.player_id());

        router.disconnect(&mut owner.ctx);
        assert!(matches!(router.registry.lookup(&code), Err(GameError::NotFound)));
        assert_eq!(router.registry.active_sessions(), 0);

        let generation = session.read().generation();
        sleep(Duration::from_secs(20)).await;
        assert_eq!(session.read().generation(), generation);
        assert_eq!(session.read().round(), 1);
    }

    #[tokio::test]
    async fn malformed_messages_get_an_error_reply() {
        let router = router();
        let mut client = Client::connect(&router);
        router.handle_text(&mut client.ctx, "{\"type\":\"submitGuess\",\"payload\":{\"lat\":\"x\"}}");

        let reply = client.drain();
        assert!(matches!(
            &reply[..],
            [ServerMsg::Error { message }] if message.starts_with("Invalid submitGuess payload")
        ));
    }

    #[tokio::test]
    async fn messages_before_joining_are_ignored() {
        let router = router();
        let mut client = Client::connect(&router);
        client.send(&router, guess(10));
        client.send(&router, json!({ "type": "startGame" }));
        assert!(client.drain().is_empty());
    }

    #[tokio::test]
    async fn creating_again_leaves_previous_session() {
        let router = router();
        let mut host = Client::connect(&router);
        host.send(&router, json!({ "type": "createSession", "payload": {} }));
        let first = created_code(&host.drain());

        host.send(&router, json!({ "type": "createSession", "payload": {} }));
        let second = created_code(&host.drain());

        assert_ne!(first, second);
        assert!(router.registry.lookup(&first).is_err());
        assert_eq!(router.registry.active_sessions(), 1);
        assert_eq!(host.ctx.session_code(), Some(second.as_str()));
    }
}
