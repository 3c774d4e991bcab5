use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use gambit::config::Config;
use gambit::db::users::UserStore;
use gambit::engine::{EnginePool, EnginePoolConfig};
use gambit::game::matchmaking::{matchmaking_loop, MatchmakingDeps};
use gambit::game::{GameRegistry, MatchmakingQueue};
use gambit::server::{self, App};
use gambit::session::SessionStore;
use gambit::state::ServerState;
use gambit::{db, tasks};

#[derive(Debug, Parser)]
#[command(name = "gambit", version, about = "Chess matchmaking and game server")]
struct Cli {
    /// Path of the TOML configuration file.
    #[arg(long, default_value = "gambit.toml")]
    config: PathBuf,

    /// Override the engine command from the config file.
    #[arg(long)]
    engine: Option<String>,

    /// Override the listen port from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Override the database path from the config file.
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(engine) = cli.engine {
        config.engine.command = engine;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(database) = cli.database {
        config.database.url = database;
    }

    config.logging.init();
    info!("gambit starting");

    match run(config).await {
        Ok(()) => info!("gambit stopped"),
        Err(e) => {
            error!(error = %e, "Fatal error");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(ServerState::new());

    // Persistence comes up first; nothing else is worth starting without it.
    let pool = db::create_pool(&config.database.url)
        .inspect_err(|e| state.signal_error(format!("Database init failed: {e}")))
        .context("database init failed")?;
    db::run_migrations(&pool)
        .inspect_err(|e| state.signal_error(format!("Database migration failed: {e}")))
        .context("database migration failed")?;
    info!(database = %config.database.url, "Database initialized");

    let users = UserStore::new(pool.clone());
    let sessions = Arc::new(SessionStore::new(
        pool,
        Duration::from_secs(config.session.timeout_secs),
        config.session.cache_size,
        config.session.user_cache_size,
    ));

    let engine = Arc::new(
        EnginePool::new(
            config.engine.command.clone(),
            EnginePoolConfig::from(&config.engine),
            state.clone(),
        )
        .await
        .context("engine pool init failed")?,
    );
    info!(
        instances = engine.instance_count(),
        command = %config.engine.command,
        "Engine pool initialized"
    );

    let registry = Arc::new(GameRegistry::new());
    let (matchmaking, feed_rx) = MatchmakingQueue::new(config.matchmaking.queue_capacity);

    tokio::spawn(matchmaking_loop(
        matchmaking.clone(),
        feed_rx,
        MatchmakingDeps {
            registry: registry.clone(),
            engine: engine.clone(),
            sessions: sessions.clone(),
            users: users.clone(),
        },
        config.matchmaking.clone(),
        state.clone(),
    ));
    tokio::spawn(tasks::maintenance_loop(
        engine.clone(),
        registry.clone(),
        state.clone(),
        Duration::from_secs(config.engine.scale_interval_secs),
        Duration::from_secs(config.game.move_timeout_secs),
    ));
    tokio::spawn(tasks::session_cleanup_loop(
        sessions.clone(),
        state.clone(),
        Duration::from_secs(config.session.cleanup_interval_secs),
    ));
    tokio::spawn(watch_signals(state.clone()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        state.signal_error(format!("Failed to bind {addr}: {e}"));
        anyhow::anyhow!("failed to bind {addr}: {e}")
    })?;

    let app = Arc::new(App {
        config,
        state: state.clone(),
        users,
        sessions,
        engine: engine.clone(),
        registry,
        matchmaking,
    });

    let result = server::serve(listener, app).await;
    state.signal_shutdown("server loop exited");

    info!("Shutting down engine pool");
    engine.shutdown().await;

    result.context("HTTP server failed")?;
    if let Some(message) = state.error_message() {
        anyhow::bail!(message);
    }
    Ok(())
}

/// Translate SIGINT/SIGTERM into the shutdown latch.
async fn watch_signals(state: Arc<ServerState>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                state.signal_shutdown("SIGINT received");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => state.signal_shutdown("SIGINT received"),
            _ = term.recv() => state.signal_shutdown("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        state.signal_shutdown("SIGINT received");
    }
}
