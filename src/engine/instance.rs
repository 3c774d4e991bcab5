//! A single engine subprocess and its worker task.
//!
//! Ownership is strict: the worker task is the only reader of the child's
//! stdout and the only writer of its stdin. The pool talks to the instance
//! exclusively through the bounded task channel and the close latch.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::protocol::{EngineReply, EngineRequest};
use crate::error::{Error, Result};

/// Grace period for a closing engine between the `exit` message and a kill.
const EXIT_GRACE: Duration = Duration::from_secs(2);

pub(super) type TaskReply = std::result::Result<EngineReply, String>;

/// One unit of work for an engine instance.
pub(super) struct EngineTask {
    pub game_id: String,
    pub request: EngineRequest,
    pub reply: oneshot::Sender<TaskReply>,
    pub created_at: Instant,
}

/// Pool-side handle to a running engine subprocess.
pub(super) struct EngineInstance {
    pub id: u64,
    pub task_tx: mpsc::Sender<EngineTask>,
    pub created_at: Instant,
    /// Epoch millis of the last dequeued task.
    pub last_used: Arc<AtomicU64>,
    pub tasks_processed: Arc<AtomicU64>,
    pub close_tx: watch::Sender<bool>,
    pub worker: tokio::task::JoinHandle<()>,
}

impl EngineInstance {
    /// Tasks currently waiting in this instance's queue.
    pub fn queue_len(&self) -> usize {
        self.task_tx.max_capacity() - self.task_tx.capacity()
    }

    /// True once the worker has exited (pipe death or close).
    pub fn is_dead(&self) -> bool {
        self.task_tx.is_closed()
    }
}

pub(super) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(super) struct SpawnOptions<'a> {
    pub command: &'a str,
    pub env: &'a HashMap<String, String>,
    pub queue_size: usize,
    pub response_timeout: Duration,
}

/// How a single task went wrong.
enum TaskFailure {
    /// The task failed but the instance is still usable (timeout, garbage
    /// reply). Reported to the caller, instance retained.
    Soft(String),
    /// The pipes are broken; the worker must close the instance.
    Pipe(String),
}

impl TaskFailure {
    fn into_message(self) -> String {
        match self {
            Self::Soft(m) | Self::Pipe(m) => m,
        }
    }
}

/// Spawn an engine subprocess, probe it, and start its worker.
///
/// The instance is only admitted when the probe reply reports
/// `"message":"valid"` within the response timeout; anything else kills the
/// child and surfaces an error.
pub(super) async fn spawn(
    id: u64,
    opts: SpawnOptions<'_>,
    shutdown: watch::Receiver<bool>,
) -> Result<EngineInstance> {
    let mut parts = opts.command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::Engine("empty engine command".into()))?;

    let mut child = Command::new(program)
        .args(parts)
        .envs(opts.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Engine(format!("failed to spawn engine: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Engine("engine stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Engine("engine stdout unavailable".into()))?;
    let mut lines = BufReader::new(stdout).lines();

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    warn!(instance = id, line = %line, "Engine stderr");
                }
            }
        });
    }

    let probe = run_task(
        &mut stdin,
        &mut lines,
        &EngineRequest::Ping,
        opts.response_timeout,
    )
    .await;
    match probe {
        Ok(reply) if reply.is_valid() => {}
        Ok(_) => {
            let _ = child.kill().await;
            return Err(Error::Engine("engine probe reported invalid".into()));
        }
        Err(failure) => {
            let _ = child.kill().await;
            return Err(Error::Engine(format!(
                "engine probe failed: {}",
                failure.into_message()
            )));
        }
    }

    let (task_tx, task_rx) = mpsc::channel(opts.queue_size);
    let (close_tx, close_rx) = watch::channel(false);
    let last_used = Arc::new(AtomicU64::new(epoch_millis()));
    let tasks_processed = Arc::new(AtomicU64::new(0));

    let worker = tokio::spawn(worker_loop(WorkerContext {
        id,
        child,
        stdin,
        lines,
        task_rx,
        close_rx,
        shutdown,
        last_used: last_used.clone(),
        tasks_processed: tasks_processed.clone(),
        response_timeout: opts.response_timeout,
    }));

    Ok(EngineInstance {
        id,
        task_tx,
        created_at: Instant::now(),
        last_used,
        tasks_processed,
        close_tx,
        worker,
    })
}

struct WorkerContext {
    id: u64,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    task_rx: mpsc::Receiver<EngineTask>,
    close_rx: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    last_used: Arc<AtomicU64>,
    tasks_processed: Arc<AtomicU64>,
    response_timeout: Duration,
}

async fn worker_loop(mut ctx: WorkerContext) {
    debug!(instance = ctx.id, "Engine worker started");

    loop {
        let task = tokio::select! {
            // Shutdown wins over queued work.
            biased;
            _ = ctx.shutdown.wait_for(|v| *v) => break,
            _ = ctx.close_rx.wait_for(|v| *v) => break,
            task = ctx.task_rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        ctx.last_used.store(epoch_millis(), Ordering::Relaxed);
        ctx.tasks_processed.fetch_add(1, Ordering::Relaxed);
        debug!(
            instance = ctx.id,
            game = %task.game_id,
            queued_ms = task.created_at.elapsed().as_millis() as u64,
            "Processing engine task"
        );

        match run_task(
            &mut ctx.stdin,
            &mut ctx.lines,
            &task.request,
            ctx.response_timeout,
        )
        .await
        {
            Ok(reply) => {
                let _ = task.reply.send(Ok(reply));
            }
            Err(TaskFailure::Soft(message)) => {
                warn!(instance = ctx.id, game = %task.game_id, error = %message, "Engine task failed");
                let _ = task.reply.send(Err(message));
            }
            Err(TaskFailure::Pipe(message)) => {
                warn!(
                    instance = ctx.id,
                    game = %task.game_id,
                    error = %message,
                    "Engine pipe broken, closing instance"
                );
                let _ = task.reply.send(Err(message));
                break;
            }
        }
    }

    close_process(ctx.id, &mut ctx.child, &mut ctx.stdin).await;
    debug!(instance = ctx.id, "Engine worker stopped");
}

/// Send one request line and read one reply line.
async fn run_task(
    stdin: &mut ChildStdin,
    lines: &mut Lines<BufReader<ChildStdout>>,
    request: &EngineRequest,
    limit: Duration,
) -> std::result::Result<EngineReply, TaskFailure> {
    let payload = serde_json::to_string(request)
        .map_err(|e| TaskFailure::Soft(format!("request encoding failed: {e}")))?;
    write_line(stdin, &payload)
        .await
        .map_err(TaskFailure::Pipe)?;

    match tokio::time::timeout(limit, lines.next_line()).await {
        Err(_) => Err(TaskFailure::Soft(format!(
            "engine did not respond within {}ms",
            limit.as_millis()
        ))),
        Ok(Err(e)) => Err(TaskFailure::Pipe(format!("engine stdout read failed: {e}"))),
        Ok(Ok(None)) => Err(TaskFailure::Pipe("engine closed its stdout".into())),
        Ok(Ok(Some(line))) if line.trim().is_empty() => {
            Err(TaskFailure::Soft("engine returned an empty response".into()))
        }
        Ok(Ok(Some(line))) => serde_json::from_str(&line)
            .map_err(|e| TaskFailure::Soft(format!("engine reply parse failed: {e}"))),
    }
}

async fn write_line(stdin: &mut ChildStdin, payload: &str) -> std::result::Result<(), String> {
    let mut line = payload.to_string();
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("engine stdin write failed: {e}"))?;
    stdin
        .flush()
        .await
        .map_err(|e| format!("engine stdin flush failed: {e}"))?;
    Ok(())
}

/// Best-effort graceful termination: `exit` message, bounded wait, kill.
async fn close_process(id: u64, child: &mut Child, stdin: &mut ChildStdin) {
    if let Ok(payload) = serde_json::to_string(&EngineRequest::exit()) {
        let _ = write_line(stdin, &payload).await;
    }

    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(instance = id, %status, "Engine exited"),
        Ok(Err(e)) => warn!(instance = id, error = %e, "Engine wait failed"),
        Err(_) => {
            warn!(instance = id, "Engine did not exit in time, killing");
            let _ = child.kill().await;
        }
    }
}
