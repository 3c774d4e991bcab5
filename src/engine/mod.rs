//! Auto-scaling pool of chess-engine subprocesses.
//!
//! Each instance owns a bounded task queue and a dedicated worker task;
//! submissions go to the instance with the shortest queue. A periodic
//! control tick grows the pool under sustained queue pressure and shrinks
//! it after sustained idleness, holding the instance count between the
//! configured minimum and maximum.
//!
//! The pool map is only ever locked to read or mutate the map itself; all
//! subprocess I/O happens on the worker tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::state::ServerState;

mod instance;
pub mod protocol;

use instance::{epoch_millis, EngineInstance, EngineTask, SpawnOptions};
pub use protocol::{EngineReply, EngineRequest};

/// Queue-pressure fraction above which an instance queue counts as full.
const FULL_QUEUE_FRACTION: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct EnginePoolConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    pub queue_size: usize,
    /// Caller-side wait for a submitted task's reply.
    pub submit_timeout: Duration,
    /// Per-response read timeout on an engine's stdout.
    pub response_timeout: Duration,
    /// Bounded wait when enqueueing onto a full instance queue.
    pub enqueue_timeout: Duration,
    /// Sustained-pressure window before scaling up.
    pub scale_up_after: Duration,
    /// Sustained-idle window before scaling down.
    pub scale_down_after: Duration,
    /// Extra environment passed to every engine subprocess.
    pub env: HashMap<String, String>,
}

impl Default for EnginePoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            queue_size: 100,
            submit_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(2),
            enqueue_timeout: Duration::from_millis(500),
            scale_up_after: Duration::from_secs(5),
            scale_down_after: Duration::from_secs(10),
            env: HashMap::new(),
        }
    }
}

impl From<&EngineConfig> for EnginePoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            min_instances: config.min_instances,
            max_instances: config.max_instances,
            queue_size: config.queue_size,
            submit_timeout: Duration::from_millis(config.submit_timeout_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
            env: config.env.clone(),
            ..Self::default()
        }
    }
}

/// Pool statistics for logging and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub instance_count: usize,
    pub instances: BTreeMap<u64, InstanceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub queue_size: usize,
    pub tasks_processed: u64,
    pub uptime_secs: u64,
    pub idle_secs: u64,
}

struct Inner {
    instances: BTreeMap<u64, EngineInstance>,
    /// Set while aggregate queue pressure has been above the full
    /// threshold; cleared on relief or after acting.
    full_since: Option<Instant>,
    /// Set while every queue has been empty; cleared on traffic or after
    /// acting.
    empty_since: Option<Instant>,
}

pub struct EnginePool {
    command: String,
    config: EnginePoolConfig,
    state: Arc<ServerState>,
    inner: Mutex<Inner>,
    instance_counter: AtomicU64,
}

impl EnginePool {
    /// Validate the configuration and start the minimum instance count.
    ///
    /// # Errors
    /// Returns an error on invalid configuration or when any of the initial
    /// instances fails its spawn probe.
    pub async fn new(
        command: impl Into<String>,
        config: EnginePoolConfig,
        state: Arc<ServerState>,
    ) -> Result<Self> {
        Self::validate_config(&config)?;

        let pool = Self {
            command: command.into(),
            config,
            state,
            inner: Mutex::new(Inner {
                instances: BTreeMap::new(),
                full_since: None,
                empty_since: None,
            }),
            instance_counter: AtomicU64::new(0),
        };

        for _ in 0..pool.config.min_instances {
            pool.spawn_instance().await?;
        }
        Ok(pool)
    }

    fn validate_config(config: &EnginePoolConfig) -> Result<()> {
        let invalid = |field: &'static str, reason: &str| {
            Error::Config(format!("invalid value for engine {field}: {reason}"))
        };
        if config.min_instances == 0 {
            return Err(invalid("min_instances", "must be > 0"));
        }
        if config.max_instances < config.min_instances {
            return Err(invalid("max_instances", "must be >= min_instances"));
        }
        if config.queue_size == 0 {
            return Err(invalid("queue_size", "must be > 0"));
        }
        Ok(())
    }

    /// Spawn and admit one instance.
    ///
    /// # Errors
    /// Returns an error at the instance cap or when the spawn probe fails.
    pub async fn spawn_instance(&self) -> Result<u64> {
        if self.inner.lock().instances.len() >= self.config.max_instances {
            return Err(Error::Engine("engine pool is at max_instances".into()));
        }

        let id = self.instance_counter.fetch_add(1, Ordering::Relaxed);
        let spawned = instance::spawn(
            id,
            SpawnOptions {
                command: &self.command,
                env: &self.config.env,
                queue_size: self.config.queue_size,
                response_timeout: self.config.response_timeout,
            },
            self.state.subscribe(),
        )
        .await?;

        let total = {
            let mut inner = self.inner.lock();
            inner.instances.insert(id, spawned);
            inner.instances.len()
        };
        info!(instance = id, total, "Spawned engine instance");
        Ok(id)
    }

    /// Submit a task and wait for the engine's reply.
    ///
    /// Returns `None` when no instance exists, the chosen queue stayed full
    /// past the enqueue timeout, the reply timed out, or the worker reported
    /// an error. All failure modes are logged.
    pub async fn submit(&self, game_id: &str, request: EngineRequest) -> Option<EngineReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let task = EngineTask {
            game_id: game_id.to_string(),
            request,
            reply: reply_tx,
            created_at: Instant::now(),
        };

        // Shortest queue wins; ties go to the lowest instance id.
        let task_tx = {
            let inner = self.inner.lock();
            let best = inner
                .instances
                .values()
                .filter(|inst| !inst.is_dead())
                .min_by_key(|inst| inst.queue_len());
            match best {
                Some(inst) => inst.task_tx.clone(),
                None => {
                    warn!(game = %game_id, "No engine instances available");
                    return None;
                }
            }
        };

        // Enqueue outside the lock, with a bounded wait for a slot.
        let permit = match tokio::time::timeout(self.config.enqueue_timeout, task_tx.reserve())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                warn!(game = %game_id, "Engine instance closed while enqueueing");
                return None;
            }
            Err(_) => {
                warn!(game = %game_id, "Engine queue full");
                return None;
            }
        };
        permit.send(task);

        match tokio::time::timeout(self.config.submit_timeout, reply_rx).await {
            Ok(Ok(Ok(reply))) => Some(reply),
            Ok(Ok(Err(message))) => {
                warn!(game = %game_id, error = %message, "Engine task failed");
                None
            }
            Ok(Err(_)) => {
                warn!(game = %game_id, "Engine worker dropped the task");
                None
            }
            Err(_) => {
                warn!(
                    game = %game_id,
                    timeout_ms = self.config.submit_timeout.as_millis() as u64,
                    "Engine task timed out"
                );
                None
            }
        }
    }

    /// One auto-scaling control tick.
    ///
    /// At most one instance is added or removed per invocation. Dead
    /// instances (worker gone after a pipe failure) are pruned first so the
    /// pool can recover by respawning on a later tick.
    pub async fn auto_scale(&self) {
        enum Action {
            Spawn,
            Close(u64),
        }

        let action = {
            let mut inner = self.inner.lock();
            inner.instances.retain(|id, inst| {
                if inst.is_dead() {
                    warn!(instance = id, "Removing dead engine instance");
                    false
                } else {
                    true
                }
            });

            let count = inner.instances.len();
            if count == 0 {
                Some(Action::Spawn)
            } else {
                let total_queued: usize =
                    inner.instances.values().map(EngineInstance::queue_len).sum();
                let full_threshold =
                    count as f64 * self.config.queue_size as f64 * FULL_QUEUE_FRACTION;
                let now = Instant::now();
                let mut action = None;

                if total_queued as f64 >= full_threshold {
                    match inner.full_since {
                        None => inner.full_since = Some(now),
                        Some(since) if now.duration_since(since) > self.config.scale_up_after => {
                            if count < self.config.max_instances {
                                debug!(total_queued, count, "Scaling up engine pool");
                                action = Some(Action::Spawn);
                            }
                            inner.full_since = None;
                        }
                        Some(_) => {}
                    }
                } else {
                    inner.full_since = None;
                }

                if action.is_none() {
                    if total_queued == 0 && count > self.config.min_instances {
                        match inner.empty_since {
                            None => inner.empty_since = Some(now),
                            Some(since)
                                if now.duration_since(since) > self.config.scale_down_after =>
                            {
                                // Evict the least recently used instance.
                                let idle = inner
                                    .instances
                                    .iter()
                                    .min_by_key(|(_, inst)| inst.last_used.load(Ordering::Relaxed))
                                    .map(|(id, _)| *id);
                                if let Some(id) = idle {
                                    debug!(instance = id, "Scaling down engine pool");
                                    action = Some(Action::Close(id));
                                }
                                inner.empty_since = None;
                            }
                            Some(_) => {}
                        }
                    } else {
                        inner.empty_since = None;
                    }
                }
                action
            }
        };

        match action {
            Some(Action::Spawn) => {
                if let Err(e) = self.spawn_instance().await {
                    warn!(error = %e, "Failed to spawn engine instance");
                }
            }
            Some(Action::Close(id)) => self.close_instance(id).await,
            None => {}
        }
    }

    /// Remove an instance from the pool and wait for its worker to run the
    /// close protocol.
    async fn close_instance(&self, id: u64) {
        let removed = self.inner.lock().instances.remove(&id);
        let Some(inst) = removed else {
            return;
        };

        let EngineInstance {
            close_tx, worker, ..
        } = inst;
        let _ = close_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .is_err()
        {
            warn!(instance = id, "Engine worker did not stop in time");
        }
        info!(instance = id, "Closed engine instance");
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().instances.len()
    }

    pub fn stats(&self) -> PoolStats {
        let now = epoch_millis();
        let inner = self.inner.lock();
        let instances = inner
            .instances
            .iter()
            .map(|(id, inst)| {
                let last_used = inst.last_used.load(Ordering::Relaxed);
                (
                    *id,
                    InstanceStats {
                        queue_size: inst.queue_len(),
                        tasks_processed: inst.tasks_processed.load(Ordering::Relaxed),
                        uptime_secs: inst.created_at.elapsed().as_secs(),
                        idle_secs: now.saturating_sub(last_used) / 1000,
                    },
                )
            })
            .collect();
        PoolStats {
            instance_count: inner.instances.len(),
            instances,
        }
    }

    /// Close every instance. Called once during server shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<u64> = self.inner.lock().instances.keys().copied().collect();
        for id in ids {
            self.close_instance(id).await;
        }
    }
}
