//! Game domain: registry and state machine, matchmaking, ratings, and the
//! client-facing message envelopes.

pub mod elo;
pub mod matchmaking;
pub mod protocol;
pub mod registry;

pub use matchmaking::{Candidate, MatchmakingDeps, MatchmakingQueue};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{Color, Game, GameOutcome, GameRegistry, GameStatus, Player, SharedGame, STARTING_FEN};
