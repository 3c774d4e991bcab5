//! Background maintenance loops.
//!
//! Both loops are interval-driven and `select!` against the shutdown latch,
//! so they stop within one tick of the signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::engine::EnginePool;
use crate::game::GameRegistry;
use crate::session::SessionStore;
use crate::state::ServerState;

/// Engine auto-scaling plus the game sweeper, sharing one tick. A pool
/// summary is logged roughly every 30 seconds.
pub async fn maintenance_loop(
    engine: Arc<EnginePool>,
    registry: Arc<GameRegistry>,
    state: Arc<ServerState>,
    tick: Duration,
    game_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(tick.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = state.subscribe();
    let stats_every = (30 / tick.as_secs().max(1)).max(1);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            _ = ticker.tick() => {}
        }

        engine.auto_scale().await;

        let swept = registry.sweep(game_timeout);
        if swept > 0 {
            info!(swept, "Reaped finished or inactive games");
        }

        ticks += 1;
        if ticks % stats_every == 0 {
            let stats = engine.stats();
            let queued: usize = stats.instances.values().map(|i| i.queue_size).sum();
            info!(
                instances = stats.instance_count,
                queued,
                games = registry.len(),
                "Pool status"
            );
        }
    }
    debug!("Maintenance loop stopped");
}

/// Periodic bulk delete of expired sessions.
pub async fn session_cleanup_loop(
    sessions: Arc<SessionStore>,
    state: Arc<ServerState>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = state.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            _ = ticker.tick() => {}
        }
        sessions.cleanup_expired();
    }
    debug!("Session cleanup loop stopped");
}
