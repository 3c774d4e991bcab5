//! Engine-pool tests against scripted engine subprocesses: spawn probing,
//! submission, soft-failure handling, and both auto-scaling directions.

mod support;

use std::sync::Arc;
use std::time::Duration;

use gambit::engine::{EnginePool, EnginePoolConfig, EngineReply, EngineRequest};
use gambit::game::STARTING_FEN;
use gambit::state::ServerState;

fn fast_scaling_config() -> EnginePoolConfig {
    EnginePoolConfig {
        scale_up_after: Duration::from_millis(100),
        scale_down_after: Duration::from_millis(100),
        ..EnginePoolConfig::default()
    }
}

#[tokio::test]
async fn pool_starts_minimum_instances_and_answers() {
    let dir = tempfile::tempdir().unwrap();
    let engine = support::fake_engine(&dir);
    let state = Arc::new(ServerState::new());

    let pool = EnginePool::new(
        engine.to_str().unwrap(),
        EnginePoolConfig::default(),
        state,
    )
    .await
    .unwrap();
    assert_eq!(pool.instance_count(), 1);

    let reply = pool
        .submit("game_test", EngineRequest::validate(STARTING_FEN))
        .await
        .expect("engine should reply");
    match reply {
        EngineReply::Valid { possible_moves, .. } => {
            assert!(possible_moves.contains(&"e2e4".to_string()));
        }
        EngineReply::Invalid { .. } => panic!("expected a valid reply"),
    }

    let stats = pool.stats();
    assert_eq!(stats.instance_count, 1);
    let instance = stats.instances.values().next().unwrap();
    assert!(instance.tasks_processed >= 1);

    pool.shutdown().await;
    assert_eq!(pool.instance_count(), 0);
}

#[tokio::test]
async fn spawn_rejects_an_engine_that_fails_the_probe() {
    let dir = tempfile::tempdir().unwrap();
    let engine = support::broken_engine(&dir);
    let state = Arc::new(ServerState::new());

    let result = EnginePool::new(
        engine.to_str().unwrap(),
        EnginePoolConfig::default(),
        state,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn spawn_rejects_a_command_that_dies_immediately() {
    let state = Arc::new(ServerState::new());
    let result = EnginePool::new("/bin/false", EnginePoolConfig::default(), state).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn response_timeout_is_a_soft_failure_that_keeps_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let engine = support::slow_engine(&dir, 3);
    let state = Arc::new(ServerState::new());

    let pool = EnginePool::new(
        engine.to_str().unwrap(),
        EnginePoolConfig {
            response_timeout: Duration::from_millis(500),
            submit_timeout: Duration::from_secs(5),
            ..EnginePoolConfig::default()
        },
        state,
    )
    .await
    .unwrap();

    // The engine stalls past the response timeout; the caller sees None.
    let reply = pool
        .submit("game_test", EngineRequest::validate(STARTING_FEN))
        .await;
    assert!(reply.is_none());

    // A timed-out subprocess is a soft failure: the instance survives.
    assert_eq!(pool.instance_count(), 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn sustained_queue_pressure_scales_up_but_never_past_max() {
    let dir = tempfile::tempdir().unwrap();
    let engine = support::slow_engine(&dir, 2);
    let state = Arc::new(ServerState::new());

    let pool = Arc::new(
        EnginePool::new(
            engine.to_str().unwrap(),
            EnginePoolConfig {
                max_instances: 2,
                queue_size: 2,
                response_timeout: Duration::from_secs(5),
                submit_timeout: Duration::from_secs(20),
                enqueue_timeout: Duration::from_secs(1),
                ..fast_scaling_config()
            },
            state,
        )
        .await
        .unwrap(),
    );
    assert_eq!(pool.instance_count(), 1);

    // One task in flight plus two queued keeps the single queue above the
    // 90% threshold while the slow engine grinds.
    for i in 0..3 {
        let pool = pool.clone();
        tokio::spawn(async move {
            let _ = pool
                .submit(&format!("game_{i}"), EngineRequest::validate(STARTING_FEN))
                .await;
        });
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // First tick arms the pressure marker, second one acts on it.
    pool.auto_scale().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.auto_scale().await;
    assert_eq!(pool.instance_count(), 2);

    // Further pressure must not push the pool past max_instances.
    pool.auto_scale().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.auto_scale().await;
    assert!(pool.instance_count() <= 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn sustained_idleness_scales_down_to_minimum_only() {
    let dir = tempfile::tempdir().unwrap();
    let engine = support::fake_engine(&dir);
    let state = Arc::new(ServerState::new());

    let pool = EnginePool::new(
        engine.to_str().unwrap(),
        EnginePoolConfig {
            max_instances: 4,
            ..fast_scaling_config()
        },
        state,
    )
    .await
    .unwrap();
    pool.spawn_instance().await.unwrap();
    pool.spawn_instance().await.unwrap();
    assert_eq!(pool.instance_count(), 3);

    // Arm the idle marker, then act on it: exactly one instance goes away.
    pool.auto_scale().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.auto_scale().await;
    assert_eq!(pool.instance_count(), 2);

    // Another round removes one more, then the floor holds.
    pool.auto_scale().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.auto_scale().await;
    assert_eq!(pool.instance_count(), 1);

    pool.auto_scale().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.auto_scale().await;
    assert_eq!(pool.instance_count(), 1, "must not drop below min_instances");

    pool.shutdown().await;
}

#[tokio::test]
async fn auto_scale_respawns_after_total_loss() {
    let dir = tempfile::tempdir().unwrap();
    let engine = support::fake_engine(&dir);
    let state = Arc::new(ServerState::new());

    let pool = EnginePool::new(
        engine.to_str().unwrap(),
        EnginePoolConfig::default(),
        state,
    )
    .await
    .unwrap();
    pool.shutdown().await;
    assert_eq!(pool.instance_count(), 0);

    // An empty pool spawns immediately, no sustain window required.
    pool.auto_scale().await;
    assert_eq!(pool.instance_count(), 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn submissions_without_instances_return_none() {
    let dir = tempfile::tempdir().unwrap();
    let engine = support::fake_engine(&dir);
    let state = Arc::new(ServerState::new());

    let pool = EnginePool::new(
        engine.to_str().unwrap(),
        EnginePoolConfig::default(),
        state,
    )
    .await
    .unwrap();
    pool.shutdown().await;

    let reply = pool
        .submit("game_test", EngineRequest::validate(STARTING_FEN))
        .await;
    assert!(reply.is_none());
}
