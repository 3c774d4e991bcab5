//! HTTP/WebSocket front end.
//!
//! One axum router carries the whole surface: page routes, the JSON
//! auth/profile/matchmaking endpoints, and the in-game WebSocket upgrade.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::db::users::UserStore;
use crate::engine::EnginePool;
use crate::game::{GameRegistry, MatchmakingQueue};
use crate::session::SessionStore;
use crate::state::ServerState;

pub mod http;
pub mod ws;

/// Shared application state threaded through every handler.
pub struct App {
    pub config: Config,
    pub state: Arc<ServerState>,
    pub users: UserStore,
    pub sessions: Arc<SessionStore>,
    pub engine: Arc<EnginePool>,
    pub registry: Arc<GameRegistry>,
    pub matchmaking: MatchmakingQueue,
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(http::index))
        .route("/login", get(http::login_page).post(http::login))
        .route("/register", get(http::register_page).post(http::register))
        .route("/home", get(http::home_page))
        .route("/stats", get(http::stats_page).post(http::stats))
        .route("/profile", get(http::profile_page))
        .route("/game", get(http::game_page))
        .route("/game/ws", get(ws::upgrade))
        .route("/session", post(http::session_info))
        .route("/logout", post(http::logout))
        .route("/home/search", post(http::search))
        .route("/home/cancel", post(http::cancel_search))
        .route("/profile/update-username", post(http::update_username))
        .route("/profile/update-password", post(http::update_password))
        .route("/profile/delete-account", post(http::delete_account))
        .fallback(http::not_found)
        .with_state(app)
}

/// Serve the router until the shutdown latch is raised, then drain.
pub async fn serve(listener: TcpListener, app: Arc<App>) -> crate::error::Result<()> {
    let state = app.state.clone();
    let local = listener.local_addr()?;
    info!(addr = %local, "HTTP server listening");

    axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        state.wait_for_shutdown(None).await;
    })
    .await?;
    Ok(())
}
