//! Integration tests for the task driver.
//!
//! These tests drive the full lifecycle through [`WasmDriver`]:
//! - Start, wait, inspect, destroy
//! - Cache hits across runs of the same module
//! - Duplicate starts and unknown identifiers
//! - Stopping a task stuck in an infinite loop
//! - Wait cancellation and the stats, fingerprint, and event streams
//! - Cache warm-up at driver creation

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use wasm_driver_common::{
    CacheConfig, DriverError, PluginConfig, PreCacheConfig, TaskConfig, TaskDescriptor,
};
use wasm_driver_core::{ExitCause, ExitResult};
use wasm_driver_plugin::{TaskState, WasmDriver};

const SUM_WAT: &str = r#"
    (module
        (func (export "sum") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add)
    )
"#;

const BUFFER_WAT: &str = r#"
    (module
        (memory (export "memory") 1)
        (global $offset (mut i32) (i32.const 0))
        (global $len (mut i32) (i32.const 0))
        (func (export "alloc") (param $size i32) (result i32)
            (global.set $offset (i32.const 2048))
            (global.set $len (local.get $size))
            (i32.const 2048))
        (func (export "handle_buffer") (result i32)
            (local $i i32)
            (local $sum i32)
            (block $done
                (loop $next
                    (br_if $done (i32.ge_u (local.get $i) (global.get $len)))
                    (local.set $sum
                        (i32.add
                            (local.get $sum)
                            (i32.load8_u (i32.add (global.get $offset) (local.get $i)))))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br $next)))
            (local.get $sum))
    )
"#;

const SPIN_WAT: &str = r#"
    (module
        (func (export "spin")
            (loop $forever
                (br $forever)))
    )
"#;

/// Generous bound for anything that should happen within one epoch tick.
const DEADLINE: Duration = Duration::from_secs(10);

fn write_module(dir: &Path, name: &str, wat: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, wat).unwrap();
    path
}

fn driver() -> WasmDriver {
    WasmDriver::new(PluginConfig::default()).unwrap()
}

fn sum_task(id: &str, path: &Path) -> TaskDescriptor {
    TaskDescriptor::new(
        id,
        TaskConfig::new(path).with_entry("sum", vec![123_456, 678_910]),
    )
}

fn spin_task(id: &str, path: &Path) -> TaskDescriptor {
    TaskDescriptor::new(id, TaskConfig::new(path).with_entry("spin", vec![]))
}

async fn wait(driver: &WasmDriver, task_id: &str) -> ExitResult {
    let mut exit = driver
        .wait_task(task_id, CancellationToken::new())
        .unwrap();
    timeout(DEADLINE, exit.recv())
        .await
        .expect("task did not exit in time")
        .expect("wait stream closed without a result")
}

// ============================================================================
// Test: Lifecycle
// ============================================================================

#[tokio::test]
async fn test_sum_runs_and_second_run_hits_cache() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let driver = driver();

    let handle = assert_ok!(driver.start_task(sum_task("run-1", &path)).await);
    assert_eq!(handle.version, 1);
    assert_eq!(handle.task_id, "run-1");

    let result = wait(&driver, "run-1").await;
    assert_eq!(result.cause, ExitCause::Completed);
    assert_eq!(result.return_values, vec![802_366]);
    assert_ok!(driver.destroy_task("run-1", false));

    // The second run cannot read the file.
    std::fs::remove_file(&path).unwrap();
    assert_ok!(driver.start_task(sum_task("run-2", &path)).await);
    let result = wait(&driver, "run-2").await;
    assert!(result.is_success(), "{}", result.message);

    let stats = driver.cache_stats().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_buffer_task_observes_input() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "buffer.wasm", BUFFER_WAT);
    let driver = driver();

    let input = r#"{"line":"test"}"#;
    let mut config = TaskConfig::new(&path).with_input(input);
    config.io_buffer.args = vec![i64::try_from(input.len()).unwrap()];

    assert_ok!(
        driver
            .start_task(TaskDescriptor::new("buffer-1", config))
            .await
    );
    let result = wait(&driver, "buffer-1").await;

    let expected: i64 = input.bytes().map(i64::from).sum();
    assert_eq!(result.return_values, vec![expected]);
}

#[tokio::test]
async fn test_inspect_reports_exit() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let driver = driver();

    assert_ok!(driver.start_task(sum_task("inspect-1", &path)).await);
    let result = wait(&driver, "inspect-1").await;

    let status = assert_ok!(driver.inspect_task("inspect-1"));
    assert_eq!(status.state, TaskState::Exited);
    assert_eq!(status.exit_result, Some(result));
}

#[tokio::test]
async fn test_load_error_releases_id() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("later.wasm");
    let driver = driver();

    let err = assert_err!(driver.start_task(sum_task("load-1", &path)).await);
    assert!(matches!(err, DriverError::Load { .. }));
    assert!(err.to_string().contains("later.wasm"));
    assert!(driver.inspect_task("load-1").unwrap_err().is_not_found());

    write_module(dir.path(), "later.wasm", SUM_WAT);
    assert_ok!(driver.start_task(sum_task("load-1", &path)).await);
    assert!(wait(&driver, "load-1").await.is_success());
}

#[tokio::test]
async fn test_abandoned_start_releases_id() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let driver = driver();
    let mut events = driver.task_events();

    // Dropped while the module is still loading.
    let abandoned = timeout(Duration::ZERO, driver.start_task(sum_task("cancel-1", &path))).await;
    assert!(abandoned.is_err());
    assert!(driver.inspect_task("cancel-1").unwrap_err().is_not_found());
    assert!(driver.registry().is_empty());

    let event = timeout(DEADLINE, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.task_id, "cancel-1");
    assert!(event.message.starts_with("Task exited: stopped"));

    assert_ok!(driver.start_task(sum_task("cancel-1", &path)).await);
    let result = wait(&driver, "cancel-1").await;
    assert_eq!(result.return_values, vec![802_366]);
}

#[tokio::test]
async fn test_fault_is_reported_not_raised() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let driver = driver();

    let config = TaskConfig::new(&path).with_entry("missing", vec![]);
    assert_ok!(
        driver
            .start_task(TaskDescriptor::new("fault-1", config))
            .await
    );

    let result = wait(&driver, "fault-1").await;
    assert_eq!(result.cause, ExitCause::Faulted);
    assert_eq!(result.exit_code, 1);
    assert!(result.message.contains("'missing' not found"));

    // Other tasks are unaffected.
    assert_ok!(driver.start_task(sum_task("fault-2", &path)).await);
    assert!(wait(&driver, "fault-2").await.is_success());
}

// ============================================================================
// Test: Identifiers
// ============================================================================

#[tokio::test]
async fn test_concurrent_duplicate_start() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let driver = driver();

    let (first, second) = tokio::join!(
        driver.start_task(spin_task("dup", &path)),
        driver.start_task(spin_task("dup", &path)),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(DriverError::DuplicateTask { .. })))
    );
    assert_eq!(driver.registry().len(), 1);

    assert_ok!(driver.destroy_task("dup", true));
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let driver = driver();

    assert!(driver.inspect_task("nope").unwrap_err().is_not_found());
    assert!(driver.stop_task("nope", None).unwrap_err().is_not_found());
    assert!(driver.destroy_task("nope", true).unwrap_err().is_not_found());
    assert!(
        driver
            .wait_task("nope", CancellationToken::new())
            .unwrap_err()
            .is_not_found()
    );
    assert!(
        driver
            .task_stats("nope", Duration::from_secs(1), CancellationToken::new())
            .unwrap_err()
            .is_not_found()
    );
}

// ============================================================================
// Test: Stop and Destroy
// ============================================================================

#[tokio::test]
async fn test_stop_interrupts_infinite_loop() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let driver = driver();

    assert_ok!(driver.start_task(spin_task("spin-1", &path)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        driver.inspect_task("spin-1").unwrap().state,
        TaskState::Running
    );

    assert_ok!(driver.stop_task("spin-1", Some("SIGINT")));
    let result = wait(&driver, "spin-1").await;
    assert_eq!(result.cause, ExitCause::Stopped);
    assert_eq!(result.exit_code, 143);

    // A second stop changes nothing.
    assert_ok!(driver.stop_task("spin-1", None));
    let status = driver.inspect_task("spin-1").unwrap();
    assert_eq!(status.exit_result, Some(result));
}

#[tokio::test]
async fn test_destroy_running_requires_force() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let driver = driver();

    assert_ok!(driver.start_task(spin_task("destroy-1", &path)).await);
    let mut exit = driver
        .wait_task("destroy-1", CancellationToken::new())
        .unwrap();

    let err = assert_err!(driver.destroy_task("destroy-1", false));
    assert!(matches!(err, DriverError::TaskRunning { .. }));
    assert!(err.is_state_error());

    assert_ok!(driver.destroy_task("destroy-1", true));
    assert!(driver.registry().is_empty());

    // The destroyed task still stops and releases its waiters.
    let result = timeout(DEADLINE, exit.recv()).await.unwrap().unwrap();
    assert!(result.is_stopped());
}

// ============================================================================
// Test: Streams
// ============================================================================

#[tokio::test]
async fn test_cancelled_wait_leaves_task_running() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let driver = driver();

    assert_ok!(driver.start_task(spin_task("wait-1", &path)).await);

    let cancel = CancellationToken::new();
    let mut exit = driver.wait_task("wait-1", cancel.clone()).unwrap();
    cancel.cancel();

    assert!(timeout(DEADLINE, exit.recv()).await.unwrap().is_none());
    assert_eq!(
        driver.inspect_task("wait-1").unwrap().state,
        TaskState::Running
    );

    assert_ok!(driver.stop_task("wait-1", None));
    assert!(wait(&driver, "wait-1").await.is_stopped());
}

#[tokio::test]
async fn test_stats_stream_until_cancelled() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let driver = driver();
    assert_ok!(driver.start_task(spin_task("stats-1", &path)).await);

    let cancel = CancellationToken::new();
    let mut stats = driver
        .task_stats("stats-1", Duration::from_millis(10), cancel.clone())
        .unwrap();

    for _ in 0..2 {
        let sample = timeout(DEADLINE, stats.recv()).await.unwrap().unwrap();
        assert!(sample.memory.is_none());
        assert!(sample.cpu.is_none());
    }

    cancel.cancel();
    // Drain what was already in flight; the stream then closes.
    let drained = timeout(DEADLINE, async { while stats.recv().await.is_some() {} }).await;
    assert!(drained.is_ok());

    assert_ok!(driver.destroy_task("stats-1", true));
}

#[tokio::test]
async fn test_stats_rejects_zero_interval() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let driver = driver();
    assert_ok!(driver.start_task(sum_task("stats-2", &path)).await);

    let err = driver
        .task_stats("stats-2", Duration::ZERO, CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, DriverError::Configuration { .. }));
}

#[tokio::test]
async fn test_fingerprint_first_sample_immediate() {
    let driver = driver();
    let cancel = CancellationToken::new();
    let mut fingerprints = driver.fingerprint(cancel.clone());

    let sample = timeout(Duration::from_secs(1), fingerprints.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sample.attributes["driver.wasm"], "true");
    assert_eq!(sample.attributes["driver.wasm.cache.type"], "lfu");

    cancel.cancel();
    assert!(timeout(DEADLINE, fingerprints.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_events_cover_start_stop_and_exit() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let driver = driver();
    let mut events = driver.task_events();

    assert_ok!(driver.start_task(spin_task("events-1", &path)).await);
    assert_ok!(driver.stop_task("events-1", None));
    wait(&driver, "events-1").await;

    let mut messages = Vec::new();
    while messages.len() < 3 {
        let event = timeout(DEADLINE, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.task_id, "events-1");
        messages.push(event.message);
    }

    assert!(messages.iter().any(|m| m == "Task started"));
    assert!(messages.iter().any(|m| m == "Task stop requested"));
    assert!(messages.iter().any(|m| m.starts_with("Task exited: stopped")));
}

#[tokio::test]
async fn test_shutdown_stops_tasks_and_streams() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let driver = driver();
    assert_ok!(driver.start_task(spin_task("shutdown-1", &path)).await);

    let mut fingerprints = driver.fingerprint(CancellationToken::new());
    timeout(DEADLINE, fingerprints.recv()).await.unwrap().unwrap();

    driver.shutdown();
    assert!(driver.is_shut_down());
    assert!(timeout(DEADLINE, fingerprints.recv()).await.unwrap().is_none());

    let task = driver.registry().lookup("shutdown-1").unwrap();
    let result = timeout(DEADLINE, task.wait()).await.unwrap().unwrap();
    assert!(result.is_stopped());
}

// ============================================================================
// Test: Warm-up
// ============================================================================

fn pre_cache_config(dir: &Path, size: usize) -> PluginConfig {
    PluginConfig {
        cache: CacheConfig {
            size,
            pre_cache: PreCacheConfig {
                enabled: true,
                modules_dir: Some(dir.to_path_buf()),
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_pre_cached_module_is_a_hit() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let driver = WasmDriver::new(pre_cache_config(dir.path(), 2)).unwrap();

    assert_eq!(driver.cache_stats().unwrap().entries, 1);

    assert_ok!(driver.start_task(sum_task("warm-1", &path)).await);
    assert!(wait(&driver, "warm-1").await.is_success());

    let stats = driver.cache_stats().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
}

#[test]
fn test_warm_up_over_capacity_blocks_driver() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "a.wasm", SUM_WAT);
    write_module(dir.path(), "b.wasm", SUM_WAT);

    let err = WasmDriver::new(pre_cache_config(dir.path(), 1)).unwrap_err();
    assert!(matches!(err, DriverError::Configuration { .. }));
    assert!(err.to_string().contains("cache size (1)"));
}
