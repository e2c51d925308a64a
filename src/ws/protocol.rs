//! WebSocket protocol message definitions
//! These are the wire types for client-server communication.
//!
//! Every frame is a JSON envelope `{"type": "...", "payload": {...}}`.
//! Inbound envelopes are parsed in two steps: the tag first, then the
//! payload into the typed request for that tag, so handlers only ever see
//! already-validated requests.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::game::error::GameError;
use crate::game::player::PlayerId;
use crate::game::settings::{GameSettings, SettingsPatch};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    CreateSession(CreateSession),
    JoinSession(JoinSession),
    ToggleReady,
    UpdateSettings(SettingsPatch),
    KickPlayer(KickPlayer),
    StartGame,
    SubmitGuess(Guess),
    RequestLocation(LocationRequest),
    /// Owner asks to skip the rest of the inter-round delay
    NextRound,
    LocationFailed(LocationFailure),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreateSession {
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    /// Initial settings, merged over the defaults
    #[serde(default)]
    pub settings: Option<SettingsPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JoinSession {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickPlayer {
    pub player_id: PlayerId,
}

/// A submitted guess. Echoed back verbatim in `guessReceived`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Guess {
    pub lat: f64,
    pub lon: f64,
    /// Client-computed round score, trusted as sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationRequest {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub date: String,
}

/// Only used for logging which panorama failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct LocationFailure {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Inbound frame could not be turned into a [`ClientMsg`]
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ProtocolError> for GameError {
    fn from(err: ProtocolError) -> Self {
        GameError::Validation(err.to_string())
    }
}

impl ClientMsg {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let payload = envelope.payload;

        Ok(match envelope.kind.as_str() {
            "createSession" => Self::CreateSession(decode("createSession", payload)?),
            "joinSession" => Self::JoinSession(decode("joinSession", payload)?),
            "toggleReady" => Self::ToggleReady,
            "updateSettings" => Self::UpdateSettings(decode("updateSettings", payload)?),
            "kickPlayer" => Self::KickPlayer(decode("kickPlayer", payload)?),
            "startGame" => Self::StartGame,
            "submitGuess" => Self::SubmitGuess(decode("submitGuess", payload)?),
            "requestLocation" => Self::RequestLocation(decode("requestLocation", payload)?),
            "nextRound" => Self::NextRound,
            "locationFailed" => Self::LocationFailed(decode("locationFailed", payload)?),
            _ => return Err(ProtocolError::UnknownType(envelope.kind)),
        })
    }
}

fn decode<T: DeserializeOwned>(kind: &'static str, payload: Value) -> Result<T, ProtocolError> {
    // A missing payload reads as an empty object
    let payload = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMsg {
    /// Sent to the creator only
    SessionCreated {
        code: String,
        players: Vec<PlayerSummary>,
        settings: GameSettings,
        is_owner: bool,
    },

    /// Sent to the joiner only
    SessionJoined {
        code: String,
        players: Vec<PlayerSummary>,
        settings: GameSettings,
        is_owner: bool,
    },

    PlayerJoined {
        players: Vec<PlayerSummary>,
    },

    PlayerLeft {
        player_id: PlayerId,
        players: Vec<PlayerSummary>,
    },

    PlayerReady {
        player_id: PlayerId,
        is_ready: bool,
        all_ready: bool,
        players: Vec<PlayerSummary>,
    },

    SettingsUpdated {
        settings: GameSettings,
    },

    /// Sent to the kicked player before removal
    Kicked {
        message: String,
    },

    GameStarted {
        settings: GameSettings,
    },

    /// Round window opened by the first guess
    TimerStarted {
        duration: u64,
    },

    PlayerSubmitted {
        player_id: PlayerId,
        nick: String,
        icon: String,
    },

    /// Acknowledgement to the submitter only
    GuessReceived(Guess),

    RoundEnd {
        round: u32,
        players: Vec<PlayerResult>,
    },

    StartNextRound {
        round: u32,
    },

    GameFinished {
        players: Vec<PlayerResult>,
    },

    LocationData(Location),

    RetryLocation {
        message: String,
    },

    Error {
        message: String,
    },
}

impl ServerMsg {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Target location for the current round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub date: String,
}

/// Player info for lobby membership lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub id: PlayerId,
    pub nick: String,
    pub icon: String,
    pub is_ready: bool,
    pub is_owner: bool,
    pub score: i64,
}

/// Player results at round or game end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub id: PlayerId,
    pub nick: String,
    pub icon: String,
    pub score: i64,
    pub round_score: i64,
    pub guess_lat: f64,
    pub guess_lon: f64,
    pub has_guess: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_payloadless_messages_with_or_without_payload() {
        assert_eq!(
            ClientMsg::parse(r#"{"type":"toggleReady","payload":{}}"#).unwrap(),
            ClientMsg::ToggleReady
        );
        assert_eq!(
            ClientMsg::parse(r#"{"type":"startGame"}"#).unwrap(),
            ClientMsg::StartGame
        );
    }

    #[test]
    fn parses_create_with_initial_settings() {
        let msg = ClientMsg::parse(
            r#"{"type":"createSession","payload":{"nick":"Ana","icon":"🦊","settings":{"region":"world","zoom":false}}}"#,
        )
        .unwrap();

        let ClientMsg::CreateSession(create) = msg else {
            panic!("expected createSession, got {msg:?}");
        };
        assert_eq!(create.nick.as_deref(), Some("Ana"));
        let settings = create.settings.unwrap();
        assert_eq!(settings.region.as_deref(), Some("world"));
        assert_eq!(settings.zoom, Some(false));
        assert_eq!(settings.mode, None);
    }

    #[test]
    fn guess_requires_coordinates() {
        let err = ClientMsg::parse(r#"{"type":"submitGuess","payload":{"lat":1.0}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { kind: "submitGuess", .. }));
        assert!(err.to_string().contains("lon"));
    }

    #[test]
    fn rejects_unknown_type_and_garbage() {
        assert!(matches!(
            ClientMsg::parse(r#"{"type":"fly","payload":{}}"#),
            Err(ProtocolError::UnknownType(kind)) if kind == "fly"
        ));
        assert!(matches!(
            ClientMsg::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn protocol_errors_become_validation_errors() {
        let err: GameError = ClientMsg::parse("{}").unwrap_err().into();
        assert!(matches!(err, GameError::Validation(_)));
    }

    #[test]
    fn server_messages_use_type_payload_envelope() {
        let value = serde_json::to_value(ServerMsg::TimerStarted { duration: 10 }).unwrap();
        assert_eq!(value, json!({ "type": "timerStarted", "payload": { "duration": 10 } }));

        let value = serde_json::to_value(ServerMsg::StartNextRound { round: 2 }).unwrap();
        assert_eq!(value, json!({ "type": "startNextRound", "payload": { "round": 2 } }));
    }

    #[test]
    fn guess_received_echoes_the_guess() {
        let guess = Guess {
            lat: 48.2,
            lon: 16.4,
            score: Some(3000.0),
        };
        let value = serde_json::to_value(ServerMsg::GuessReceived(guess)).unwrap();
        assert_eq!(value["type"], "guessReceived");
        assert_eq!(value["payload"], json!({ "lat": 48.2, "lon": 16.4, "score": 3000.0 }));
    }

    #[test]
    fn player_ready_fields_are_camel_case() {
        let id = PlayerId::new();
        let value = serde_json::to_value(ServerMsg::PlayerReady {
            player_id: id,
            is_ready: true,
            all_ready: false,
            players: vec![],
        })
        .unwrap();
        assert_eq!(value["payload"]["playerId"], json!(id.to_string()));
        assert_eq!(value["payload"]["allReady"], json!(false));
    }
}
