//! Line-delimited JSON protocol spoken with engine subprocesses.
//!
//! One request line in, one reply line out. Replies are discriminated on
//! the `message` field; unknown fields are ignored so engine upgrades can
//! add fields without breaking the pool.

use serde::{Deserialize, Serialize};

/// A request written to an engine's stdin as a single JSON line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason", rename_all = "lowercase")]
pub enum EngineRequest {
    /// Liveness probe sent right after spawn.
    Ping,
    /// Compute the legal moves for a position.
    Validate { fen: String, moves: String },
    /// Apply a move to the given position.
    Move { fen: String, moves: String },
    /// Ask the engine to terminate.
    Exit { fen: String, moves: String },
}

impl EngineRequest {
    pub fn validate(fen: impl Into<String>) -> Self {
        Self::Validate {
            fen: fen.into(),
            moves: String::new(),
        }
    }

    pub fn apply_move(fen: impl Into<String>, mv: impl Into<String>) -> Self {
        Self::Move {
            fen: fen.into(),
            moves: mv.into(),
        }
    }

    pub fn exit() -> Self {
        Self::Exit {
            fen: String::new(),
            moves: String::new(),
        }
    }
}

/// A reply read from an engine's stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "message", rename_all = "lowercase")]
pub enum EngineReply {
    Valid {
        fen: Option<String>,
        #[serde(default)]
        possible_moves: Vec<String>,
        /// Set when the position is terminal ("white", "black").
        winner: Option<String>,
        /// Terminal cause ("checkmate", "stalemate", ...).
        reason: Option<String>,
    },
    Invalid {
        error: Option<String>,
    },
}

impl EngineReply {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ping_serializes_bare() {
        let line = serde_json::to_value(EngineRequest::Ping).unwrap();
        assert_eq!(line, json!({"reason": "ping"}));
    }

    #[test]
    fn exit_carries_empty_fields() {
        let line = serde_json::to_value(EngineRequest::exit()).unwrap();
        assert_eq!(line, json!({"reason": "exit", "fen": "", "moves": ""}));
    }

    #[test]
    fn move_request_carries_position_and_move() {
        let line = serde_json::to_value(EngineRequest::apply_move("8/8/8/8/8/8/8/8 w - - 0 1", "e2e4"))
            .unwrap();
        assert_eq!(
            line,
            json!({"reason": "move", "fen": "8/8/8/8/8/8/8/8 w - - 0 1", "moves": "e2e4"})
        );
    }

    #[test]
    fn bare_valid_reply_parses() {
        let reply: EngineReply = serde_json::from_str(r#"{"message":"valid"}"#).unwrap();
        assert!(reply.is_valid());
        match reply {
            EngineReply::Valid {
                fen,
                possible_moves,
                winner,
                reason,
            } => {
                assert_eq!(fen, None);
                assert!(possible_moves.is_empty());
                assert_eq!(winner, None);
                assert_eq!(reason, None);
            }
            EngineReply::Invalid { .. } => panic!("expected valid"),
        }
    }

    #[test]
    fn full_valid_reply_parses() {
        let reply: EngineReply = serde_json::from_str(
            r#"{"message":"valid","fen":"pos","possible_moves":["e7e5"],"winner":"white","reason":"checkmate","extra":42}"#,
        )
        .unwrap();
        match reply {
            EngineReply::Valid {
                fen,
                possible_moves,
                winner,
                reason,
            } => {
                assert_eq!(fen.as_deref(), Some("pos"));
                assert_eq!(possible_moves, vec!["e7e5"]);
                assert_eq!(winner.as_deref(), Some("white"));
                assert_eq!(reason.as_deref(), Some("checkmate"));
            }
            EngineReply::Invalid { .. } => panic!("expected valid"),
        }
    }

    #[test]
    fn invalid_reply_carries_error() {
        let reply: EngineReply =
            serde_json::from_str(r#"{"message":"invalid","error":"illegal move"}"#).unwrap();
        assert!(!reply.is_valid());
        match reply {
            EngineReply::Invalid { error } => assert_eq!(error.as_deref(), Some("illegal move")),
            EngineReply::Valid { .. } => panic!("expected invalid"),
        }
    }

    #[test]
    fn reply_without_discriminant_is_an_error() {
        assert!(serde_json::from_str::<EngineReply>(r#"{"fen":"pos"}"#).is_err());
    }
}
