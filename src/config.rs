//! Server configuration loaded from a TOML file.
//!
//! Every section has sensible defaults except `[engine] command`, which must
//! point at a chess-engine executable speaking the line-delimited JSON
//! protocol.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub matchmaking: MatchmakingConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory the static pages are served from. When unset, a minimal
    /// built-in placeholder page is returned instead.
    pub frontend_dir: Option<PathBuf>,
    /// Add `Secure` to session cookies (enable behind TLS termination).
    pub secure_cookies: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            frontend_dir: None,
            secure_cookies: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite database holding the users and sessions tables.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "gambit.db".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds of inactivity before a session expires.
    pub timeout_secs: u64,
    /// Capacity of the single-session lookup cache.
    pub cache_size: usize,
    /// Capacity of the per-user session-list cache.
    pub user_cache_size: usize,
    /// Interval of the expired-session sweeper.
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            cache_size: 1000,
            user_cache_size: 250,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Engine command line, split on whitespace (program plus arguments).
    pub command: String,
    #[serde(default = "default_min_instances")]
    pub min_instances: usize,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Caller-side wait for a reply to a submitted task.
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Per-response read timeout on the engine's stdout.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Bounded wait when enqueueing onto a full instance queue.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    /// Auto-scale evaluation period.
    #[serde(default = "default_scale_interval_secs")]
    pub scale_interval_secs: u64,
    /// Extra environment passed to every engine subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_min_instances() -> usize {
    1
}
fn default_max_instances() -> usize {
    10
}
fn default_queue_size() -> usize {
    100
}
fn default_submit_timeout_ms() -> u64 {
    5000
}
fn default_response_timeout_ms() -> u64 {
    2000
}
fn default_enqueue_timeout_ms() -> u64 {
    500
}
fn default_scale_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Pairing loop tick period.
    pub tick_ms: u64,
    /// Candidates waiting longer than this are purged.
    pub stale_after_secs: u64,
    /// Capacity of the candidate feed channel.
    pub queue_capacity: usize,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            stale_after_secs: 300,
            queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Games with no accepted move for this long are reaped.
    pub move_timeout_secs: u64,
    /// Sweep period, shared with the engine auto-scale tick.
    pub sweep_interval_secs: u64,
    /// Server-side WebSocket heartbeat period.
    pub heartbeat_secs: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            move_timeout_secs: 1800,
            sweep_interval_secs: 5,
            heartbeat_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl LoggingConfig {
    /// Initialize the tracing subscriber with this logging configuration.
    ///
    /// `RUST_LOG` takes precedence over the configured level.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format.as_str() {
            "json" => {
                fmt().json().with_env_filter(filter).init();
            }
            _ => {
                fmt().with_env_filter(filter).init();
            }
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| {
            Error::Config(format!("invalid value for {}: {}", field, reason))
        };

        if self.engine.command.trim().is_empty() {
            return Err(invalid("engine.command", "must not be empty"));
        }
        if self.engine.min_instances == 0 {
            return Err(invalid("engine.min_instances", "must be > 0"));
        }
        if self.engine.max_instances < self.engine.min_instances {
            return Err(invalid("engine.max_instances", "must be >= min_instances"));
        }
        if self.engine.queue_size == 0 {
            return Err(invalid("engine.queue_size", "must be > 0"));
        }
        if self.session.cache_size == 0 {
            return Err(invalid("session.cache_size", "must be > 0"));
        }
        if self.session.user_cache_size == 0 {
            return Err(invalid("session.user_cache_size", "must be > 0"));
        }
        if self.matchmaking.queue_capacity == 0 {
            return Err(invalid("matchmaking.queue_capacity", "must be > 0"));
        }
        Ok(())
    }
}
