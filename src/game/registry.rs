//! In-memory registry of ongoing games and their state machines.
//!
//! A game moves through: ongoing → finished, where the finishing edge is an
//! engine-reported terminal position, a resignation, an accepted draw, or
//! (administratively) the inactivity sweeper. Terminal status is write-once;
//! settlement updates ratings and counters, broadcasts `game_over`, and
//! drops the game from every map.
//!
//! Within one game, accepted moves are totally ordered: the per-game async
//! mutex is held across the engine round-trip. The registry maps themselves
//! are never held across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::elo;
use super::protocol::ServerMessage;
use crate::db::users::UserStore;
use crate::engine::{EnginePool, EngineReply, EngineRequest};

/// Standard chess starting position.
pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn opposite(self) -> Self {
        match self {
            Self::White => Self::Black,
            Self::Black => Self::White,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Black => "black",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Ongoing,
    Finished,
}

/// Final result as broadcast to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GameOutcome {
    White,
    Black,
    Draw,
}

impl From<Color> for GameOutcome {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Self::White,
            Color::Black => Self::Black,
        }
    }
}

/// One seat of a game.
#[derive(Debug)]
pub struct Player {
    pub user_id: i64,
    pub username: String,
    pub session_id: String,
    pub color: Color,
    /// Rating cached at game creation, used for settlement.
    pub elo: i32,
    /// Outbound channel of the player's WebSocket, when connected.
    pub outbound: Option<UnboundedSender<String>>,
}

#[derive(Debug)]
pub struct Game {
    pub game_id: String,
    pub players: [Player; 2],
    pub fen: String,
    pub moves: Vec<String>,
    pub current_turn: Color,
    pub legal_moves: Vec<String>,
    pub status: GameStatus,
    pub winner: Option<GameOutcome>,
    pub created_at: Instant,
    pub last_move_at: Instant,
}

impl Game {
    pub fn new(game_id: String, player1: Player, player2: Player) -> Self {
        let now = Instant::now();
        Self {
            game_id,
            players: [player1, player2],
            fen: STARTING_FEN.to_string(),
            moves: Vec::new(),
            current_turn: Color::White,
            legal_moves: Vec::new(),
            status: GameStatus::Ongoing,
            winner: None,
            created_at: now,
            last_move_at: now,
        }
    }

    pub fn seat_of_session(&self, session_id: &str) -> Option<usize> {
        self.players.iter().position(|p| p.session_id == session_id)
    }

    pub fn seat_of_color(&self, color: Color) -> usize {
        if self.players[0].color == color {
            0
        } else {
            1
        }
    }

    pub fn send_to(&self, seat: usize, message: &ServerMessage) {
        let Some(text) = message.encode() else {
            return;
        };
        if let Some(tx) = &self.players[seat].outbound {
            let _ = tx.send(text);
        }
    }

    pub fn broadcast(&self, message: &ServerMessage) {
        let Some(text) = message.encode() else {
            return;
        };
        for player in &self.players {
            if let Some(tx) = &player.outbound {
                let _ = tx.send(text.clone());
            }
        }
    }
}

pub type SharedGame = Arc<Mutex<Game>>;

/// How a finished game is scored.
enum Settlement {
    Decisive { winner: Color },
    Draw,
}

pub struct GameRegistry {
    games: DashMap<String, SharedGame>,
    /// Matchmaking results: session_id → game_id, consulted on WS upgrade.
    results: DashMap<String, String>,
    /// Membership index: user_id → game_id.
    players: DashMap<i64, String>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self {
            games: DashMap::new(),
            results: DashMap::new(),
            players: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Install a new game and index its players and sessions.
    pub fn insert(&self, game: Game) -> SharedGame {
        let game_id = game.game_id.clone();
        for player in &game.players {
            self.players.insert(player.user_id, game_id.clone());
            self.results.insert(player.session_id.clone(), game_id.clone());
        }
        let shared = Arc::new(Mutex::new(game));
        self.games.insert(game_id, shared.clone());
        shared
    }

    pub fn get(&self, game_id: &str) -> Option<SharedGame> {
        self.games.get(game_id).map(|entry| entry.value().clone())
    }

    /// The game a session was matched into, if any.
    pub fn game_for_session(&self, session_id: &str) -> Option<SharedGame> {
        let game_id = self.results.get(session_id).map(|e| e.value().clone())?;
        match self.get(&game_id) {
            Some(game) => Some(game),
            None => {
                self.results.remove(session_id);
                None
            }
        }
    }

    pub fn user_in_game(&self, user_id: i64) -> bool {
        self.players.contains_key(&user_id)
    }

    fn remove_game(&self, game: &Game) {
        self.games.remove(&game.game_id);
        for player in &game.players {
            self.results.remove(&player.session_id);
            self.players.remove(&player.user_id);
        }
    }

    /// Broker one move submission through the engine.
    ///
    /// The game mutex stays held across the engine round-trip, which is
    /// what serializes moves within a game. Nothing is mutated unless the
    /// engine accepted the move.
    pub async fn handle_move(
        &self,
        game: &SharedGame,
        session_id: &str,
        mv: &str,
        engine: &EnginePool,
        users: &UserStore,
    ) {
        let mut g = game.lock().await;
        let Some(seat) = g.seat_of_session(session_id) else {
            return;
        };
        if g.status != GameStatus::Ongoing {
            g.send_to(seat, &ServerMessage::error("Game is already over"));
            return;
        }
        if g.players[seat].color != g.current_turn {
            g.send_to(seat, &ServerMessage::error("Not your turn"));
            return;
        }

        let request = EngineRequest::apply_move(g.fen.clone(), mv);
        match engine.submit(&g.game_id, request).await {
            None => {
                g.send_to(seat, &ServerMessage::error("Move processing error"));
            }
            Some(EngineReply::Invalid { error }) => {
                let message = error.unwrap_or_else(|| "Invalid move".to_string());
                g.send_to(seat, &ServerMessage::Error { message });
            }
            Some(EngineReply::Valid {
                fen,
                possible_moves,
                winner,
                reason,
            }) => {
                let Some(fen) = fen else {
                    warn!(game = %g.game_id, "Engine accepted a move without a position");
                    g.send_to(seat, &ServerMessage::error("Move processing error"));
                    return;
                };

                g.fen = fen;
                g.moves.push(mv.to_string());
                g.legal_moves = possible_moves;
                g.current_turn = g.current_turn.opposite();
                g.last_move_at = Instant::now();

                if let Some(winner) = winner.as_deref() {
                    let winner = match winner {
                        "white" => Color::White,
                        "black" => Color::Black,
                        other => {
                            warn!(game = %g.game_id, winner = other, "Unrecognized winner, settling as draw");
                            let reason = reason.unwrap_or_else(|| "draw".to_string());
                            self.settle(&mut g, &reason, Settlement::Draw, users);
                            return;
                        }
                    };
                    let reason = reason.unwrap_or_else(|| "checkmate".to_string());
                    self.settle(&mut g, &reason, Settlement::Decisive { winner }, users);
                    return;
                }

                let update = ServerMessage::MoveUpdate {
                    fen: g.fen.clone(),
                    next_turn: g.current_turn,
                    legal_moves: g.legal_moves.clone(),
                    last_move: mv.to_string(),
                    move_history: g.moves.clone(),
                };
                g.broadcast(&update);
            }
        }
    }

    /// The resigning color loses; the opposite color wins.
    pub async fn resign(&self, game: &SharedGame, session_id: &str, users: &UserStore) {
        let mut g = game.lock().await;
        let Some(seat) = g.seat_of_session(session_id) else {
            return;
        };
        if g.status != GameStatus::Ongoing {
            return;
        }
        let winner = g.players[seat].color.opposite();
        self.settle(&mut g, "resignation", Settlement::Decisive { winner }, users);
    }

    /// Forward a draw offer to the opponent. Offers carry no stored state;
    /// repeating one just re-notifies.
    pub async fn offer_draw(&self, game: &SharedGame, session_id: &str) {
        let g = game.lock().await;
        let Some(seat) = g.seat_of_session(session_id) else {
            return;
        };
        if g.status != GameStatus::Ongoing {
            return;
        }
        let message = format!("{} offers a draw", g.players[seat].username);
        g.send_to(1 - seat, &ServerMessage::DrawOffered { message });
    }

    pub async fn accept_draw(&self, game: &SharedGame, users: &UserStore) {
        let mut g = game.lock().await;
        if g.status != GameStatus::Ongoing {
            return;
        }
        g.broadcast(&ServerMessage::DrawAccepted {
            message: "Draw accepted".into(),
        });
        self.settle(&mut g, "draw", Settlement::Draw, users);
    }

    pub async fn decline_draw(&self, game: &SharedGame, session_id: &str) {
        let g = game.lock().await;
        let Some(seat) = g.seat_of_session(session_id) else {
            return;
        };
        g.send_to(
            1 - seat,
            &ServerMessage::DrawDeclined {
                message: "Draw offer declined".into(),
            },
        );
    }

    pub async fn cancel_draw_offer(&self, game: &SharedGame, session_id: &str) {
        let g = game.lock().await;
        let Some(seat) = g.seat_of_session(session_id) else {
            return;
        };
        g.send_to(
            1 - seat,
            &ServerMessage::DrawCancelled {
                message: "Draw offer cancelled".into(),
            },
        );
    }

    /// Clear a departing player's socket slot and, while the game is still
    /// ongoing, notify the remaining peer. The game itself stays joinable
    /// until the sweeper reaps it.
    ///
    /// `conn` identifies the departing connection; a seat that was already
    /// taken over by a reconnect is left alone.
    pub async fn disconnect(
        &self,
        game: &SharedGame,
        session_id: &str,
        conn: &UnboundedSender<String>,
    ) {
        let mut g = game.lock().await;
        let Some(seat) = g.seat_of_session(session_id) else {
            return;
        };
        let still_attached = g.players[seat]
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.same_channel(conn));
        if !still_attached {
            return;
        }
        g.players[seat].outbound = None;
        if g.status == GameStatus::Ongoing {
            let message = format!("{} disconnected", g.players[seat].username);
            g.send_to(1 - seat, &ServerMessage::OpponentDisconnected { message });
            debug!(game = %g.game_id, username = %g.players[seat].username, "Player disconnected");
        }
    }

    /// Terminal settlement: rating deltas, counters, `game_over` broadcast,
    /// then removal from the registry. Status is write-once; a second call
    /// is a no-op.
    fn settle(&self, g: &mut Game, reason: &str, settlement: Settlement, users: &UserStore) {
        if g.status == GameStatus::Finished && g.winner.is_some() {
            return;
        }
        g.status = GameStatus::Finished;

        let (outcome, elo_changes) = match settlement {
            Settlement::Decisive { winner } => {
                let winner_seat = g.seat_of_color(winner);
                let loser_seat = 1 - winner_seat;
                let (w, l) = (&g.players[winner_seat], &g.players[loser_seat]);
                let delta = elo::delta(w.elo, l.elo, 1.0);

                if users.update_elo(w.user_id, w.elo + delta).is_err()
                    || users.update_elo(l.user_id, l.elo - delta).is_err()
                {
                    warn!(game = %g.game_id, "Failed to persist rating update");
                }
                if let Err(e) = users.record_win(w.user_id, l.user_id) {
                    warn!(game = %g.game_id, error = %e, "Failed to record result");
                }

                let changes = HashMap::from([
                    (w.color.as_str().to_string(), delta),
                    (l.color.as_str().to_string(), -delta),
                ]);
                (GameOutcome::from(winner), changes)
            }
            Settlement::Draw => {
                let (a, b) = (&g.players[0], &g.players[1]);
                let delta = elo::delta(a.elo, b.elo, 0.5);

                if users.update_elo(a.user_id, a.elo + delta).is_err()
                    || users.update_elo(b.user_id, b.elo - delta).is_err()
                {
                    warn!(game = %g.game_id, "Failed to persist rating update");
                }
                if let Err(e) = users.record_draw(a.user_id, b.user_id) {
                    warn!(game = %g.game_id, error = %e, "Failed to record result");
                }

                let changes = HashMap::from([
                    (a.color.as_str().to_string(), delta),
                    (b.color.as_str().to_string(), -delta),
                ]);
                (GameOutcome::Draw, changes)
            }
        };

        g.winner = Some(outcome);
        g.broadcast(&ServerMessage::GameOver {
            winner: outcome,
            reason: reason.to_string(),
            elo_changes,
        });
        self.remove_game(g);
        info!(game = %g.game_id, winner = ?outcome, reason, "Game finished");
    }

    /// Drop finished games and games idle past `max_idle`. Games whose
    /// mutex is busy are skipped until the next tick.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let mut doomed = Vec::new();
        for entry in self.games.iter() {
            if let Ok(g) = entry.value().try_lock() {
                if g.status == GameStatus::Finished || g.last_move_at.elapsed() > max_idle {
                    doomed.push(entry.value().clone());
                }
            }
        }

        let mut removed = 0;
        for shared in doomed {
            if let Ok(g) = shared.try_lock() {
                if g.status == GameStatus::Finished || g.last_move_at.elapsed() > max_idle {
                    debug!(game = %g.game_id, "Sweeping game");
                    self.remove_game(&g);
                    removed += 1;
                }
            }
        }
        removed
    }
}

impl Default for GameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn player(seat: i64, color: Color) -> Player {
        Player {
            user_id: seat,
            username: format!("player{seat}"),
            session_id: format!("session{seat}"),
            color,
            elo: 500,
            outbound: None,
        }
    }

    fn sample_game(id: &str) -> Game {
        Game::new(
            id.to_string(),
            player(1, Color::White),
            player(2, Color::Black),
        )
    }

    #[test]
    fn new_game_starts_at_the_initial_position() {
        let game = sample_game("game_1_0001");
        assert_eq!(game.fen, STARTING_FEN);
        assert_eq!(game.current_turn, Color::White);
        assert_eq!(game.status, GameStatus::Ongoing);
        assert!(game.moves.is_empty());
        assert_eq!(game.winner, None);
    }

    #[test]
    fn registry_indexes_players_and_sessions() {
        let registry = GameRegistry::new();
        registry.insert(sample_game("game_1_0001"));

        assert_eq!(registry.len(), 1);
        assert!(registry.user_in_game(1));
        assert!(registry.user_in_game(2));
        assert!(!registry.user_in_game(3));
        assert!(registry.game_for_session("session1").is_some());
        assert!(registry.game_for_session("session9").is_none());
    }

    #[test]
    fn seat_lookups() {
        let game = sample_game("game_1_0001");
        assert_eq!(game.seat_of_session("session1"), Some(0));
        assert_eq!(game.seat_of_session("session2"), Some(1));
        assert_eq!(game.seat_of_session("nope"), None);
        assert_eq!(game.seat_of_color(Color::Black), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_both_connected_players() {
        let registry = GameRegistry::new();
        let shared = registry.insert(sample_game("game_1_0001"));

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        {
            let mut g = shared.lock().await;
            g.players[0].outbound = Some(tx1);
            g.players[1].outbound = Some(tx2);
            g.broadcast(&ServerMessage::error("test"));
        }

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("\"error\""));
    }

    #[tokio::test]
    async fn sweep_reaps_finished_games_only() {
        let registry = GameRegistry::new();
        let shared = registry.insert(sample_game("game_1_0001"));
        registry.insert(sample_game("game_1_0002"));

        shared.lock().await.status = GameStatus::Finished;

        let removed = registry.sweep(Duration::from_secs(1800));
        assert_eq!(removed, 1);
        assert_eq!(registry.len(), 1);
        assert!(!registry.user_in_game(1));
    }

    #[tokio::test]
    async fn sweep_reaps_idle_games() {
        let registry = GameRegistry::new();
        let shared = registry.insert(sample_game("game_1_0001"));
        shared.lock().await.last_move_at = Instant::now() - Duration::from_secs(10);

        assert_eq!(registry.sweep(Duration::from_secs(5)), 1);
        assert!(registry.is_empty());
        assert!(registry.game_for_session("session1").is_none());
    }

    #[tokio::test]
    async fn disconnect_notifies_the_remaining_peer() {
        let registry = GameRegistry::new();
        let shared = registry.insert(sample_game("game_1_0001"));

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        {
            let mut g = shared.lock().await;
            g.players[0].outbound = Some(tx1.clone());
            g.players[1].outbound = Some(tx2);
        }

        registry.disconnect(&shared, "session1", &tx1).await;

        let frame = rx2.recv().await.unwrap();
        assert!(frame.contains("opponent_disconnected"));
        assert!(shared.lock().await.players[0].outbound.is_none());
    }

    #[tokio::test]
    async fn stale_disconnect_leaves_a_reconnected_seat_alone() {
        let registry = GameRegistry::new();
        let shared = registry.insert(sample_game("game_1_0001"));

        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        shared.lock().await.players[0].outbound = Some(new_tx);

        registry.disconnect(&shared, "session1", &old_tx).await;

        assert!(shared.lock().await.players[0].outbound.is_some());
    }
}
