//! FIFO matchmaking: a candidate feed, a shared waiting list, and the
//! pairing loop.
//!
//! Candidates arrive through a bounded multi-producer channel and are
//! drained into an ordered waiting list (deduplicated by `user_id`). Each
//! tick purges stale entries, then pairs the two oldest waiters whose
//! sessions still validate. Pairing is strictly FIFO and rating-agnostic.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::registry::{Color, Game, GameRegistry, Player, STARTING_FEN};
use crate::config::MatchmakingConfig;
use crate::db::users::UserStore;
use crate::engine::{EnginePool, EngineReply, EngineRequest};
use crate::session::SessionStore;
use crate::state::ServerState;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub user_id: i64,
    pub username: String,
    pub session_id: String,
    pub queued_at: Instant,
}

#[derive(Default)]
struct Waiting {
    list: VecDeque<Candidate>,
    ids: HashSet<i64>,
}

impl Waiting {
    fn push(&mut self, candidate: Candidate) -> bool {
        if !self.ids.insert(candidate.user_id) {
            return false;
        }
        self.list.push_back(candidate);
        true
    }

    fn pop_front(&mut self) -> Option<Candidate> {
        let candidate = self.list.pop_front()?;
        self.ids.remove(&candidate.user_id);
        Some(candidate)
    }

    fn push_front(&mut self, candidate: Candidate) {
        self.ids.insert(candidate.user_id);
        self.list.push_front(candidate);
    }
}

/// Shared handle: request handlers enqueue and cancel, the loop drains.
#[derive(Clone)]
pub struct MatchmakingQueue {
    feed: mpsc::Sender<Candidate>,
    waiting: Arc<Mutex<Waiting>>,
}

impl MatchmakingQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Candidate>) {
        let (feed, rx) = mpsc::channel(capacity);
        (
            Self {
                feed,
                waiting: Arc::new(Mutex::new(Waiting::default())),
            },
            rx,
        )
    }

    /// Submit a candidate. Returns false when the feed channel is full.
    pub fn enqueue(&self, user_id: i64, username: &str, session_id: &str) -> bool {
        self.feed
            .try_send(Candidate {
                user_id,
                username: username.to_string(),
                session_id: session_id.to_string(),
                queued_at: Instant::now(),
            })
            .is_ok()
    }

    /// Remove a session from the waiting list (rebuild-without-self).
    /// Returns false when the session was not waiting.
    pub fn cancel(&self, session_id: &str) -> bool {
        let mut waiting = self.waiting.lock();
        let before = waiting.list.len();
        waiting.list.retain(|c| c.session_id != session_id);
        let removed = before - waiting.list.len();
        if removed > 0 {
            waiting.ids = waiting.list.iter().map(|c| c.user_id).collect();
        }
        removed > 0
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().list.len()
    }
}

pub struct MatchmakingDeps {
    pub registry: Arc<GameRegistry>,
    pub engine: Arc<EnginePool>,
    pub sessions: Arc<SessionStore>,
    pub users: UserStore,
}

/// Long-running pairing loop. One candidate is drained per tick (bounded
/// 1 s wait), stale waiters are purged, then as many valid pairs as exist
/// are matched.
pub async fn matchmaking_loop(
    queue: MatchmakingQueue,
    mut rx: mpsc::Receiver<Candidate>,
    deps: MatchmakingDeps,
    config: MatchmakingConfig,
    state: Arc<ServerState>,
) {
    let tick = Duration::from_millis(config.tick_ms);
    let stale_after = Duration::from_secs(config.stale_after_secs);
    let mut shutdown = state.subscribe();

    info!("Matchmaking loop started");
    loop {
        if state.should_shutdown() {
            break;
        }

        // Drain at most one new candidate, waiting up to a second so
        // shutdown is never blocked behind an idle queue.
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(candidate)) => {
                let mut waiting = queue.waiting.lock();
                let stamped = Candidate {
                    queued_at: Instant::now(),
                    ..candidate
                };
                if waiting.push(stamped.clone()) {
                    debug!(username = %stamped.username, "Candidate joined matchmaking");
                } else {
                    debug!(user_id = stamped.user_id, "Skipping duplicate matchmaking entry");
                }
            }
            Ok(None) => break,
            Err(_) => {}
        }

        purge_stale(&queue, stale_after);
        pair_waiting(&queue, &deps).await;

        tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            _ = tokio::time::sleep(tick) => {}
        }
    }
    info!("Matchmaking loop stopped");
}

fn purge_stale(queue: &MatchmakingQueue, stale_after: Duration) {
    let mut waiting = queue.waiting.lock();
    let before = waiting.list.len();
    waiting.list.retain(|c| c.queued_at.elapsed() < stale_after);
    let removed = before - waiting.list.len();
    if removed > 0 {
        waiting.ids = waiting.list.iter().map(|c| c.user_id).collect();
        info!(removed, "Purged stale matchmaking candidates");
    }
}

async fn pair_waiting(queue: &MatchmakingQueue, deps: &MatchmakingDeps) {
    loop {
        // Pop under the lock, pair outside it.
        let (player1, player2) = {
            let mut waiting = queue.waiting.lock();
            if waiting.list.len() < 2 {
                return;
            }
            let p1 = match waiting.pop_front() {
                Some(p) => p,
                None => return,
            };
            let p2 = match waiting.pop_front() {
                Some(p) => p,
                None => {
                    waiting.push_front(p1);
                    return;
                }
            };
            (p1, p2)
        };

        let valid = deps.sessions.get(&player1.session_id).is_some()
            && deps.sessions.get(&player2.session_id).is_some();
        if !valid {
            debug!("Skipping match, invalid session(s)");
            continue;
        }

        if !create_game(&player1, &player2, deps).await {
            let mut waiting = queue.waiting.lock();
            waiting.push_front(player2);
            waiting.push_front(player1);
            return;
        }
    }
}

/// Create and register a game between two candidates. Returns false on
/// failure so the caller can reinsert both at the head of the list.
async fn create_game(player1: &Candidate, player2: &Candidate, deps: &MatchmakingDeps) -> bool {
    let game_id = generate_game_id();

    let elo1 = match deps.users.elo(player1.user_id) {
        Ok(Some(elo)) => elo,
        _ => {
            warn!(user_id = player1.user_id, "Missing rating, cannot create game");
            return false;
        }
    };
    let elo2 = match deps.users.elo(player2.user_id) {
        Ok(Some(elo)) => elo,
        _ => {
            warn!(user_id = player2.user_id, "Missing rating, cannot create game");
            return false;
        }
    };

    let mut colors = [Color::White, Color::Black];
    colors.shuffle(&mut rand::thread_rng());

    let mut game = Game::new(
        game_id.clone(),
        Player {
            user_id: player1.user_id,
            username: player1.username.clone(),
            session_id: player1.session_id.clone(),
            color: colors[0],
            elo: elo1,
            outbound: None,
        },
        Player {
            user_id: player2.user_id,
            username: player2.username.clone(),
            session_id: player2.session_id.clone(),
            color: colors[1],
            elo: elo2,
            outbound: None,
        },
    );

    // Populate the initial legal-move set before the game becomes visible.
    // A failure here is tolerated; the set refreshes on the first accepted
    // move.
    match deps
        .engine
        .submit(&game_id, EngineRequest::validate(STARTING_FEN))
        .await
    {
        Some(EngineReply::Valid { possible_moves, .. }) if !possible_moves.is_empty() => {
            game.legal_moves = possible_moves;
        }
        _ => warn!(game = %game_id, "Failed to initialize legal moves"),
    }
    deps.registry.insert(game);

    info!(
        game = %game_id,
        player1 = %player1.username,
        color1 = colors[0].as_str(),
        elo1,
        player2 = %player2.username,
        color2 = colors[1].as_str(),
        elo2,
        "Game created"
    );
    true
}

fn generate_game_id() -> String {
    let nonce: u32 = rand::thread_rng().gen_range(1000..10000);
    format!("game_{}_{}", chrono::Utc::now().timestamp(), nonce)
}
