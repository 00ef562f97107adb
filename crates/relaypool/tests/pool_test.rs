// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the static pool running real echo workers over pipes.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{
    FixedStats, echo_worker, pids, pipe_factory, pool_config, start_pool, wait_for_event,
    wait_for_pids, wait_until,
};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use relaypool::error::Error;
use relaypool::events::{Event, EventBus, WorkerEventKind};
use relaypool::pool::{PoolConfig, StaticPool};
use relaypool::worker::WorkerStatus;
use relaypool_protocol::Payload;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pid reported by a `sleep` mode worker in the response context.
fn context_pid(payload: &Payload) -> u32 {
    let context: serde_json::Value =
        serde_json::from_slice(&payload.context).expect("context is not JSON");
    context["pid"].as_u64().expect("pid missing from context") as u32
}

fn body(payload: &Payload) -> String {
    payload.body_str().expect("body is not UTF-8").to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_starts_configured_number_of_workers() {
    let (pool, _events) = start_pool(echo_worker("echo"), pool_config(3)).await;

    let workers = pool.workers().await;
    assert_eq!(workers.len(), 3);
    assert!(workers.iter().all(|w| w.status() == WorkerStatus::Ready));
    assert_eq!(pids(&pool).await.into_iter().collect::<HashSet<_>>().len(), 3);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_execs_use_distinct_workers() {
    let command = echo_worker("sleep").arg("--delay-ms").arg("200");
    let (pool, _events) = start_pool(command, pool_config(2)).await;

    let payload_a = Payload::from_body("a");
    let payload_b = Payload::from_body("b");
    let (a, b) = tokio::join!(pool.exec(&payload_a), pool.exec(&payload_b));
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(body(&a), "a");
    assert_eq!(body(&b), "b");
    assert_ne!(context_pid(&a), context_pid(&b));

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_jobs_rotates_worker_after_each_exec() {
    let config = PoolConfig {
        max_jobs: 1,
        ..pool_config(1)
    };
    let (pool, _events) = start_pool(echo_worker("pid"), config).await;

    let mut seen = HashSet::new();
    for _ in 0..3 {
        let result = pool.exec(&Payload::from_body("pid")).await.unwrap();
        seen.insert(body(&result));
    }
    assert_eq!(seen.len(), 3);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allocate_timeout_while_all_workers_busy() {
    let config = PoolConfig {
        allocate_timeout: Duration::from_millis(50),
        ..pool_config(1)
    };
    let command = echo_worker("sleep").arg("--delay-ms").arg("300");
    let (pool, _events) = start_pool(command, config).await;

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.exec(&Payload::from_body("slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = tokio::time::Instant::now();
    let result = pool.exec(&Payload::from_body("fast")).await;
    assert!(matches!(result, Err(Error::AllocateTimeout(_))));
    assert!(started.elapsed() < Duration::from_millis(250));

    let slow = busy.await.unwrap().unwrap();
    assert_eq!(body(&slow), "slow");

    // The timed out request did not leak the worker.
    let again = pool.exec(&Payload::from_body("again")).await.unwrap();
    assert_eq!(body(&again), "again");

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_exec_retires_worker() {
    let config = PoolConfig {
        allocate_timeout: Duration::from_secs(3),
        ..pool_config(1)
    };
    let command = echo_worker("sleep").arg("--delay-ms").arg("300");
    let (pool, events) = start_pool(command, config).await;
    let mut rx = events.subscribe();
    let old_pid = pids(&pool).await[0];

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), pool.exec(&Payload::from_body("a"))).await;
    assert!(cancelled.is_err(), "exec should still be running");

    let destructed = wait_for_event(&mut rx, EVENT_TIMEOUT, |event| {
        event.worker_kind() == Some(WorkerEventKind::WorkerDestruct) && event.pid() == Some(old_pid)
    })
    .await;
    assert!(destructed.is_some(), "cancelled worker was not retired");

    // The slot comes back with a fresh worker instead of staying checked out.
    let result = pool.exec(&Payload::from_body("b")).await.unwrap();
    assert_eq!(body(&result), "b");
    assert_ne!(context_pid(&result), old_pid);

    let workers = pool.workers().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status(), WorkerStatus::Ready);

    let started = tokio::time::Instant::now();
    pool.destroy().await;
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_killed_worker_is_replaced() {
    let (pool, events) = start_pool(echo_worker("pid"), pool_config(1)).await;
    let mut rx = events.subscribe();

    let old_pid = pids(&pool).await[0];
    kill(Pid::from_raw(old_pid as i32), Signal::SIGKILL).unwrap();

    let error = wait_for_event(&mut rx, EVENT_TIMEOUT, |event| {
        event.worker_kind() == Some(WorkerEventKind::WorkerError) && event.pid() == Some(old_pid)
    })
    .await;
    assert!(error.is_some(), "no error event for the killed worker");

    let replaced = wait_for_pids(&pool, EVENT_TIMEOUT, |current| {
        current.len() == 1 && current[0] != old_pid
    })
    .await;
    assert!(replaced, "worker was not replaced");

    let result = pool.exec(&Payload::from_body("pid")).await.unwrap();
    assert_ne!(body(&result), old_pid.to_string());

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_trip_preserves_context_and_binary_body() {
    let (pool, _events) = start_pool(echo_worker("echo"), pool_config(1)).await;

    let request = Payload::new("{\"route\":\"/\"}", vec![0u8, 1, 2, 0xfe, 0xff, b'\n']);
    let response = pool.exec(&request).await.unwrap();
    assert_eq!(response, request);

    let large = Payload::from_body(vec![b'x'; 1024 * 1024]);
    assert_eq!(pool.exec(&large).await.unwrap(), large);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exec_counts_executions_and_returns_worker() {
    let (pool, _events) = start_pool(echo_worker("echo"), pool_config(1)).await;
    let worker = pool.workers().await.remove(0);

    for expected in 1..=3 {
        pool.exec(&Payload::from_body("ping")).await.unwrap();
        assert_eq!(worker.num_execs(), expected);
        assert_eq!(worker.status(), WorkerStatus::Ready);
    }

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_payload_rejected() {
    let (pool, _events) = start_pool(echo_worker("echo"), pool_config(1)).await;

    let result = pool.exec(&Payload::default()).await;
    assert!(matches!(result, Err(Error::EmptyPayload)));
    assert_eq!(pool.workers().await[0].num_execs(), 0);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_error_keeps_worker() {
    let (pool, _events) = start_pool(echo_worker("error"), pool_config(1)).await;
    let before = pids(&pool).await;

    let err = pool.exec(&Payload::from_body("x")).await.unwrap_err();
    assert!(err.is_job_error());
    match err {
        Error::Job(message) => assert_eq!(message, "job failed: x"),
        other => panic!("unexpected error: {other}"),
    }

    let worker = pool.workers().await.remove(0);
    assert_eq!(worker.status(), WorkerStatus::Ready);
    assert_eq!(worker.num_execs(), 1);
    assert_eq!(pids(&pool).await, before);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crash_during_exec_is_worker_error() {
    let (pool, events) = start_pool(echo_worker("crash"), pool_config(1)).await;
    let mut rx = events.subscribe();
    let old_pid = pids(&pool).await[0];

    let err = pool.exec(&Payload::from_body("x")).await.unwrap_err();
    assert!(err.is_worker_error(), "unexpected error: {err}");

    let error = wait_for_event(&mut rx, EVENT_TIMEOUT, |event| {
        event.worker_kind() == Some(WorkerEventKind::WorkerError) && event.pid() == Some(old_pid)
    })
    .await;
    assert!(error.is_some());

    let replaced = wait_for_pids(&pool, EVENT_TIMEOUT, |current| {
        current.len() == 1 && current[0] != old_pid
    })
    .await;
    assert!(replaced);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_stderr_published() {
    let (pool, events) = start_pool(echo_worker("noisy"), pool_config(1)).await;
    let mut rx = events.subscribe();

    let result = pool.exec(&Payload::from_body("hello stderr")).await.unwrap();
    assert_eq!(body(&result), "hello stderr");

    let stderr = wait_for_event(&mut rx, EVENT_TIMEOUT, |event| {
        matches!(event, Event::Worker(e)
            if e.kind == WorkerEventKind::WorkerStderr
                && e.detail.as_deref() == Some("hello stderr"))
    })
    .await;
    assert!(stderr.is_some());
    assert!(pool.workers().await[0].stderr_output().contains("hello stderr"));

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_request_retries_on_another_worker() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("refused");
    let command = echo_worker("stop-once").arg("--marker").arg(&marker);
    let (pool, events) = start_pool(command, pool_config(2)).await;
    let mut rx = events.subscribe();

    let result = pool.exec(&Payload::from_body("hello")).await.unwrap();
    assert_eq!(body(&result), "hello");

    let refused: u32 = std::fs::read_to_string(&marker)
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    let destructed = wait_for_event(&mut rx, EVENT_TIMEOUT, |event| {
        event.worker_kind() == Some(WorkerEventKind::WorkerDestruct) && event.pid() == Some(refused)
    })
    .await;
    assert!(destructed.is_some(), "refusing worker was not destroyed");

    let replaced = wait_for_pids(&pool, EVENT_TIMEOUT, |current| {
        current.len() == 2 && !current.contains(&refused)
    })
    .await;
    assert!(replaced);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exec_ttl_kills_slow_worker() {
    let config = PoolConfig {
        exec_ttl: Some(Duration::from_millis(200)),
        ..pool_config(1)
    };
    let command = echo_worker("sleep").arg("--delay-ms").arg("5000");
    let (pool, events) = start_pool(command, config).await;
    let mut rx = events.subscribe();
    let old_pid = pids(&pool).await[0];

    let started = tokio::time::Instant::now();
    let result = pool.exec(&Payload::from_body("slow")).await;
    assert!(matches!(result, Err(Error::ExecTtl(_))));
    assert!(started.elapsed() < Duration::from_secs(3));

    let event = wait_for_event(&mut rx, EVENT_TIMEOUT, |event| {
        event.worker_kind() == Some(WorkerEventKind::ExecTtl)
    })
    .await
    .unwrap();
    assert_eq!(event.pid(), Some(old_pid));

    let replaced = wait_for_pids(&pool, EVENT_TIMEOUT, |current| {
        current.len() == 1 && current[0] != old_pid
    })
    .await;
    assert!(replaced);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_idle_worker_is_idempotent() {
    let (pool, _events) = start_pool(echo_worker("echo"), pool_config(2)).await;
    let worker = pool.workers().await.remove(0);
    let removed_pid = worker.pid().unwrap();

    assert!(pool.remove_worker(&worker).await.unwrap());
    assert!(!pool.remove_worker(&worker).await.unwrap());

    let replaced = wait_for_pids(&pool, EVENT_TIMEOUT, |current| {
        current.len() == 2 && !current.contains(&removed_pid)
    })
    .await;
    assert!(replaced);
    assert!(!pool.remove_worker(&worker).await.unwrap());

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_busy_worker_after_request() {
    let command = echo_worker("sleep").arg("--delay-ms").arg("300");
    let (pool, _events) = start_pool(command, pool_config(1)).await;
    let worker = pool.workers().await.remove(0);
    let removed_pid = worker.pid().unwrap();

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.exec(&Payload::from_body("busy")).await })
    };
    let working =
        wait_until(EVENT_TIMEOUT, || worker.status() == WorkerStatus::Working).await;
    assert!(working);

    assert!(pool.remove_worker(&worker).await.unwrap());
    assert_eq!(worker.status(), WorkerStatus::Remove);

    let result = busy.await.unwrap().unwrap();
    assert_eq!(body(&result), "busy");

    let replaced = wait_for_pids(&pool, EVENT_TIMEOUT, |current| {
        current.len() == 1 && current[0] != removed_pid
    })
    .await;
    assert!(replaced);

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_destroy_stops_every_worker() {
    let (pool, events) = start_pool(echo_worker("echo"), pool_config(3)).await;
    let mut rx = events.subscribe();
    let workers = pool.workers().await;

    pool.destroy().await;

    assert!(pool.workers().await.is_empty());
    for worker in &workers {
        assert!(worker.has_exited());
        assert_eq!(worker.status(), WorkerStatus::Destroyed);
    }
    assert!(matches!(
        pool.exec(&Payload::from_body("late")).await,
        Err(Error::WatcherStopped)
    ));

    // Destroyed workers are never replaced.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pool.workers().await.is_empty());
    let constructed = common::drain_events(&mut rx)
        .iter()
        .filter(|e| e.worker_kind() == Some(WorkerEventKind::WorkerConstruct))
        .count();
    assert_eq!(constructed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_replaces_all_workers() {
    let (pool, _events) = start_pool(echo_worker("echo"), pool_config(2)).await;
    let before: HashSet<u32> = pids(&pool).await.into_iter().collect();

    pool.reset().await.unwrap();

    let after: HashSet<u32> = pids(&pool).await.into_iter().collect();
    assert_eq!(after.len(), 2);
    assert!(before.is_disjoint(&after));

    let result = pool.exec(&Payload::from_body("after reset")).await.unwrap();
    assert_eq!(body(&result), "after reset");

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_states_report_stats() {
    let events = EventBus::new();
    let stats = FixedStats::new();
    stats.set_default(3 * 1024 * 1024);

    let pool = StaticPool::new(echo_worker("echo"), pipe_factory(), pool_config(2), events)
        .await
        .unwrap()
        .with_stats(stats);

    let states = pool.states().await;
    assert_eq!(states.len(), 2);
    for state in &states {
        assert_eq!(state.status, "ready");
        assert_eq!(state.memory_usage, 3 * 1024 * 1024);
        assert_eq!(state.num_execs, 0);
    }

    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debug_mode_spawns_worker_per_request() {
    let config = PoolConfig {
        num_workers: 0,
        debug: true,
        ..pool_config(0)
    };
    let (pool, events) = start_pool(echo_worker("pid"), config).await;
    let mut rx = events.subscribe();
    assert!(pool.workers().await.is_empty());

    let first = body(&pool.exec(&Payload::from_body("pid")).await.unwrap());
    let second = body(&pool.exec(&Payload::from_body("pid")).await.unwrap());
    assert_ne!(first, second);
    assert!(pool.workers().await.is_empty());

    let destructs = common::drain_events(&mut rx)
        .iter()
        .filter(|e| e.worker_kind() == Some(WorkerEventKind::WorkerDestruct))
        .count();
    assert_eq!(destructs, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_pid_mismatch_fails_construction() {
    let result = StaticPool::new(
        echo_worker("wrong-pid"),
        pipe_factory(),
        pool_config(2),
        EventBus::new(),
    )
    .await;

    assert!(matches!(result, Err(Error::PidMismatch { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_binary_fails_construction() {
    let result = StaticPool::new(
        relaypool::command::WorkerCommand::new("/nonexistent/relaypool-worker"),
        pipe_factory(),
        pool_config(1),
        EventBus::new(),
    )
    .await;

    assert!(matches!(result, Err(Error::ProcessStart(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_many_concurrent_execs_on_small_pool() {
    let command = echo_worker("sleep").arg("--delay-ms").arg("20");
    let (pool, _events) = start_pool(command, pool_config(4)).await;

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let pool: Arc<StaticPool> = pool.clone();
            tokio::spawn(async move {
                let result = pool.exec(&Payload::from_body(format!("req-{i}"))).await;
                (i, result)
            })
        })
        .collect();

    let mut used = HashSet::new();
    for handle in handles {
        let (i, result) = handle.await.unwrap();
        let result = result.unwrap();
        assert_eq!(body(&result), format!("req-{i}"));
        used.insert(context_pid(&result));
    }
    assert!(used.len() <= 4);

    let total: u64 = pool.workers().await.iter().map(|w| w.num_execs()).sum();
    assert_eq!(total, 32);
    assert!(
        pool.workers()
            .await
            .iter()
            .all(|w| w.status() == WorkerStatus::Ready)
    );

    pool.destroy().await;
}
