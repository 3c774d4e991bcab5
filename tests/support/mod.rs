//! Shared helpers for the cross-component tests: scripted fake engines and
//! an in-process server bootstrapped the same way the binary does it.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use gambit::config::Config;
use gambit::db;
use gambit::db::users::UserStore;
use gambit::engine::{EnginePool, EnginePoolConfig};
use gambit::game::matchmaking::{matchmaking_loop, MatchmakingDeps};
use gambit::game::{GameRegistry, MatchmakingQueue};
use gambit::server::{self, App};
use gambit::session::SessionStore;
use gambit::state::ServerState;

/// The fen the fake engine reports after any accepted move.
pub const MOVED_FEN: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join(name);
    std::fs::write(&path, body).expect("write fake engine script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake engine script");
    path
}

/// A well-behaved engine: answers every request immediately.
pub fn fake_engine(dir: &TempDir) -> PathBuf {
    let body = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"ping"'*) printf '{{"message":"valid"}}\n' ;;
    *'"exit"'*) exit 0 ;;
    *'"validate"'*) printf '{{"message":"valid","fen":"rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1","possible_moves":["e2e4","d2d4","g1f3"]}}\n' ;;
    *'"move"'*) printf '{{"message":"valid","fen":"{MOVED_FEN}","possible_moves":["e7e5","g8f6"],"winner":null}}\n' ;;
    *) printf '{{"message":"invalid","error":"unknown request"}}\n' ;;
  esac
done
"#
    );
    write_script(dir, "engine.sh", &body)
}

/// Passes the spawn probe, then stalls for `delay_secs` before every reply.
pub fn slow_engine(dir: &TempDir, delay_secs: u64) -> PathBuf {
    let body = format!(
        r#"#!/bin/sh
IFS= read -r line
printf '{{"message":"valid"}}\n'
while IFS= read -r line; do
  case "$line" in
    *'"exit"'*) exit 0 ;;
  esac
  sleep {delay_secs}
  printf '{{"message":"valid","fen":"{MOVED_FEN}","possible_moves":["e7e5"],"winner":null}}\n'
done
"#
    );
    write_script(dir, "slow-engine.sh", &body)
}

/// An engine whose probe reports `invalid`; spawn must refuse it.
pub fn broken_engine(dir: &TempDir) -> PathBuf {
    let body = "#!/bin/sh\nwhile IFS= read -r line; do printf '{\"message\":\"invalid\",\"error\":\"boot failure\"}\\n'; done\n";
    write_script(dir, "broken-engine.sh", body)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub state: Arc<ServerState>,
    pub registry: Arc<GameRegistry>,
    pub engine: Arc<EnginePool>,
    _dir: TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/game/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.signal_shutdown("test server dropped");
    }
}

/// Boot the whole stack on an ephemeral port with a scripted engine and a
/// fast matchmaking tick.
pub async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine_path = fake_engine(&dir);
    let db_path = dir.path().join("gambit.db");

    let toml = format!(
        "[engine]\ncommand = \"{}\"\n\n[database]\nurl = \"{}\"\n\n[matchmaking]\ntick_ms = 50\n\n[logging]\nlevel = \"warn\"\n",
        engine_path.display(),
        db_path.display()
    );
    let config: Config = toml::from_str(&toml).expect("test config parses");

    let state = Arc::new(ServerState::new());
    let pool = db::create_pool(&config.database.url).expect("db pool");
    db::run_migrations(&pool).expect("migrations");

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
        .expect("engine pool"),
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

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    let app = Arc::new(App {
        config,
        state: state.clone(),
        users,
        sessions,
        engine: engine.clone(),
        registry: registry.clone(),
        matchmaking,
    });
    tokio::spawn(async move {
        let _ = server::serve(listener, app).await;
    });

    TestServer {
        addr,
        base_url: format!("http://{addr}"),
        state,
        registry,
        engine,
        _dir: dir,
    }
}
