//! Round timers
//!
//! A timer never gets cancelled directly. Arming captures the session's
//! generation; when the sleep ends the task takes the session lock and acts
//! only if that generation is still the live one. Superseding a timer is
//! therefore just bumping the generation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::ws::hub::ConnectionHub;

use super::session::Session;

/// What happens when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Round window opened by the first guess; expiry ends the round
    RoundWindow,
    /// Delay after `roundEnd`; expiry advances or finishes the game
    Intermission,
}

/// A scheduled action bound to one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub generation: u64,
    pub kind: TimerKind,
    pub delay: Duration,
}

impl ArmedTimer {
    pub fn new(generation: u64, kind: TimerKind, delay: Duration) -> Self {
        Self {
            generation,
            kind,
            delay,
        }
    }
}

/// Run a timer chain for a session.
///
/// The task holds only a weak reference, so a destroyed session is simply
/// dropped. When firing arms a follow-up (round window into intermission)
/// the same task keeps going with the new generation.
pub fn spawn(session: Weak<Session>, timer: ArmedTimer, hub: Arc<ConnectionHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = timer;
        loop {
            tokio::time::sleep(timer.delay).await;

            let Some(session) = session.upgrade() else {
                debug!(generation = timer.generation, "Session gone before timer fired");
                return;
            };
            let effects = session.write().fire_timer(timer);
            hub.dispatch(effects.outbox);

            match effects.timer {
                Some(next) => timer = next,
                None => return,
            }
        }
    })
}
