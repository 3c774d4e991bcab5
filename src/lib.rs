//! Gambit - matchmaking and move brokering for online two-player chess.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── state.rs      # Shutdown/error latches every loop cooperates with
//! ├── db/           # SQLite persistence (users table, migrations)
//! ├── session.rs    # Session store with bounded LRU caches
//! ├── engine/       # Auto-scaling pool of engine subprocesses
//! ├── game/         # Registry, state machine, matchmaking, ELO
//! ├── server/       # axum HTTP endpoints + in-game WebSocket
//! └── tasks.rs      # Background sweepers
//! ```
//!
//! The flow: an HTTP request authenticates against the session store, a
//! matchmaking submission lands in the pairing queue, the loop pairs two
//! players and installs a game, both players upgrade to WebSocket, and
//! every move then runs WS → registry → engine pool → registry → both
//! peers.

pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod game;
pub mod server;
pub mod session;
pub mod state;
pub mod tasks;
pub mod validate;
