//! 进程池集成测试：使用真实的 `switchboard worker` 子进程

use std::sync::Arc;
use std::time::{Duration, Instant};

use switchboard::core::{BackoffPolicy, PoolError};
use switchboard::worker::{
    AgentClient, AgentRequest, PoolSettings, RunInput, SchedulerOp, WorkerCommand, WorkerPool,
};

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_switchboard");

fn settings(size: usize) -> PoolSettings {
    PoolSettings {
        size,
        response_timeout: Duration::from_secs(10),
        response_margin: Duration::from_secs(1),
        health_check_interval: Duration::from_secs(30),
        health_check_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(2),
        restart_policy: BackoffPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: 3,
            ..BackoffPolicy::default()
        },
    }
}

/// 通过 sh 包装真实 Worker，便于注入崩溃
fn wrapped(script: &str) -> WorkerCommand {
    WorkerCommand::new("sh")
        .arg("-c")
        .arg(script)
        .arg("sh")
        .env("WORKER_BIN", WORKER_BIN)
}

#[tokio::test]
async fn test_round_trip_through_real_worker() {
    let pool = Arc::new(WorkerPool::new(settings(2), WorkerCommand::new(WORKER_BIN).arg("worker")).unwrap());
    pool.start().await.unwrap();

    let mut request = AgentRequest::new(
        "default",
        "/scheduler_add {\"channel\":\"telegram\",\"user_id\":\"u1\",\"content\":\"开会\",\"interval_secs\":600}\n\
         /send_message {\"channel\":\"telegram\",\"user_id\":\"u2\",\"text\":\"hi\"}",
    );
    request.tool_names = vec!["scheduler_add".into(), "send_message".into()];
    let response = pool.submit(request.clone()).await.unwrap();

    assert!(response.success);
    assert_eq!(response.id, request.id);
    assert_eq!(response.pending_pushes.len(), 1);
    assert_eq!(response.pending_pushes[0].user_id, "u2");
    match &response.pending_scheduler_ops[..] {
        [SchedulerOp::Add { job_id, .. }] => assert!(job_id.starts_with("reminder_u1_")),
        other => panic!("unexpected ops: {other:?}"),
    }

    // 同样的调用方式经由 AgentClient
    let client = AgentClient::pooled(Arc::clone(&pool));
    let result = client.run(RunInput::new("default", "ping")).await.unwrap();
    assert_eq!(result.text, "ping");

    let status = client.pool_status().await.unwrap();
    assert!(status.started);
    assert_eq!(status.live_count, 2);
    assert!(status.workers.values().all(|w| w.alive && w.pid.is_some()));

    pool.shutdown().await;
    let status = pool.status().await;
    assert!(status.shutting_down);
    assert!(matches!(
        pool.submit(AgentRequest::new("default", "late")).await,
        Err(PoolError::NotStarted | PoolError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_worker_crash_mid_request_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("crashed");
    let script = r#"
if [ ! -e "$MARKER" ]; then
  touch "$MARKER"
  read line
  exit 1
fi
exec "$WORKER_BIN" worker "$@"
"#;
    let command = wrapped(script).env("MARKER", &marker);
    let pool = WorkerPool::new(settings(1), command).unwrap();
    pool.start().await.unwrap();

    let err = pool.submit(AgentRequest::new("default", "first")).await.unwrap_err();
    assert!(matches!(err, PoolError::ConnectionLost(0)), "unexpected error: {err:?}");
    assert!(marker.exists());

    let response = pool.submit(AgentRequest::new("default", "second")).await.unwrap();
    assert!(response.success);
    assert_eq!(response.text, "second");

    let status = pool.status().await;
    assert_eq!(status.live_count, 1);
    assert_eq!(status.workers[&0].restart_count, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_slot_exceeding_restart_budget_is_removed() {
    let script = r#"
if [ "$SWITCHBOARD_WORKER_ID" = "2" ]; then
  exit 1
fi
exec "$WORKER_BIN" worker "$@"
"#;
    let mut settings = settings(3);
    settings.health_check_interval = Duration::from_millis(100);
    settings.restart_policy.max_attempts = 2;
    let pool = WorkerPool::new(settings, wrapped(script)).unwrap();
    pool.start().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        let status = pool.status().await;
        if !status.workers.contains_key(&2) {
            break status;
        }
        assert!(Instant::now() < deadline, "slot 2 was never removed: {status:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(status.configured_size, 3);
    assert_eq!(status.live_count, 2);
    assert!(status.workers.contains_key(&0) && status.workers.contains_key(&1));

    // 剩余两个 Worker 继续服务
    for i in 0..4 {
        let response = pool.submit(AgentRequest::new("default", format!("msg {i}"))).await.unwrap();
        assert_eq!(response.text, format!("msg {i}"));
    }
    pool.shutdown().await;
}
