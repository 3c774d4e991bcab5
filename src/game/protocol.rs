//! JSON envelopes exchanged with game clients over WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminant. Unknown client
//! types deserialize to [`ClientMessage::Unknown`] so the dispatcher can log
//! and ignore them instead of erroring the connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::registry::{Color, GameOutcome};

/// Frames sent from the server to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    GameStart {
        game_id: String,
        your_color: Color,
        your_username: String,
        opponent_username: String,
        fen: String,
        legal_moves: Vec<String>,
        current_turn: Color,
    },
    MoveUpdate {
        fen: String,
        next_turn: Color,
        legal_moves: Vec<String>,
        last_move: String,
        move_history: Vec<String>,
    },
    GameOver {
        winner: GameOutcome,
        reason: String,
        /// Rating deltas keyed by color name.
        elo_changes: HashMap<String, i32>,
    },
    DrawOffered {
        message: String,
    },
    DrawAccepted {
        message: String,
    },
    DrawDeclined {
        message: String,
    },
    DrawCancelled {
        message: String,
    },
    OpponentDisconnected {
        message: String,
    },
    HandshakeAck {
        message: String,
    },
    /// Server heartbeat; clients answer with `pong`.
    Ping,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialized frame body. Serialization of these envelopes cannot fail
    /// in practice; a `None` here means a bug worth dropping the frame over.
    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Frames received from a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake,
    Move {
        #[serde(rename = "move")]
        mv: Option<String>,
        from: Option<String>,
        to: Option<String>,
    },
    Resign,
    OfferDraw,
    AcceptDraw,
    DeclineDraw,
    CancelDrawOffer,
    /// Heartbeat reply; ignored.
    Pong,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Resolve the two accepted move encodings into one move string.
    pub fn move_string(mv: Option<String>, from: Option<String>, to: Option<String>) -> Option<String> {
        match (mv, from, to) {
            (Some(mv), _, _) if !mv.is_empty() => Some(mv),
            (_, Some(from), Some(to)) if !from.is_empty() && !to.is_empty() => {
                Some(format!("{from}{to}"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_frames_carry_snake_case_types() {
        let frame = ServerMessage::DrawOffered {
            message: "alice offers a draw".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "draw_offered");
        assert_eq!(value["message"], "alice offers a draw");
    }

    #[test]
    fn heartbeat_is_a_bare_ping() {
        let value: serde_json::Value =
            serde_json::from_str(&ServerMessage::Ping.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "ping"}));
    }

    #[test]
    fn game_over_includes_elo_changes() {
        let frame = ServerMessage::GameOver {
            winner: GameOutcome::White,
            reason: "resignation".into(),
            elo_changes: HashMap::from([("white".into(), 16), ("black".into(), -16)]),
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["winner"], "white");
        assert_eq!(value["elo_changes"]["black"], -16);
    }

    #[test]
    fn client_move_accepts_single_string() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"move","move":"e2e4"}"#).unwrap();
        let ClientMessage::Move { mv, from, to } = msg else {
            panic!("expected move");
        };
        assert_eq!(ClientMessage::move_string(mv, from, to).as_deref(), Some("e2e4"));
    }

    #[test]
    fn client_move_accepts_from_to_pair() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"move","from":"e2","to":"e4"}"#).unwrap();
        let ClientMessage::Move { mv, from, to } = msg else {
            panic!("expected move");
        };
        assert_eq!(ClientMessage::move_string(mv, from, to).as_deref(), Some("e2e4"));
    }

    #[test]
    fn move_without_either_encoding_is_none() {
        assert_eq!(ClientMessage::move_string(None, Some("e2".into()), None), None);
        assert_eq!(ClientMessage::move_string(Some(String::new()), None, None), None);
    }

    #[test]
    fn unknown_client_type_maps_to_unknown() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"teleport"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
    }

    #[test]
    fn frame_without_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"move":"e2e4"}"#).is_err());
    }
}
