//! Integration tests for wasm-driver-core.
//!
//! These tests verify the complete execution pipeline:
//! - Module files on disk (text format) loaded through the backend
//! - Cache resolution and hit accounting
//! - Input staging into guest memory
//! - Trap and missing-function faults
//! - Interruption of a running call from another thread
//! - Cache warm-up from a directory

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use wasm_driver_common::{DriverError, EngineConfig, EvictionKind, TaskConfig};
use wasm_driver_core::{
    EngineBackend, ExecutionContext, ExitCause, ModuleCache, WasmtimeBackend, execute,
    resolve_module,
};

const SUM_WAT: &str = r#"
    (module
        (func (export "sum") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add)
    )
"#;

/// `alloc` always hands out offset 1024 and remembers the requested length;
/// `handle_buffer` returns the byte sum of that region.
const BUFFER_WAT: &str = r#"
    (module
        (memory (export "memory") 1)
        (global $offset (mut i32) (i32.const 0))
        (global $len (mut i32) (i32.const 0))
        (func (export "alloc") (param $size i32) (result i32)
            (global.set $offset (i32.const 1024))
            (global.set $len (local.get $size))
            (i32.const 1024))
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

const TRAP_WAT: &str = r#"
    (module
        (func (export "boom")
            unreachable)
    )
"#;

fn backend() -> Arc<WasmtimeBackend> {
    Arc::new(WasmtimeBackend::new(&EngineConfig::default()).unwrap())
}

fn write_module(dir: &Path, name: &str, wat: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, wat).unwrap();
    path
}

fn byte_sum(input: &str) -> i64 {
    input.bytes().map(i64::from).sum()
}

// ============================================================================
// Test: Basic Execution
// ============================================================================

#[test]
fn test_sum_completes() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let backend = backend();

    let module = backend.load_module(&path).unwrap();
    let config = TaskConfig::new(&path).with_entry("sum", vec![123_456, 678_910]);
    let interrupt = backend.interrupt_handle();

    let result = execute(backend.as_ref(), "task-sum", &module, &config, &interrupt);

    assert_eq!(result.cause, ExitCause::Completed);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.return_values, vec![802_366]);
}

// ============================================================================
// Test: Cache Resolution
// ============================================================================

#[test]
fn test_second_resolve_skips_disk() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let backend = backend();
    let cache = ModuleCache::new(2, EvictionKind::Lfu, None).unwrap();

    resolve_module(Some(&cache), backend.as_ref(), &path).unwrap();

    // The file is gone: only the cache can satisfy the second lookup.
    std::fs::remove_file(&path).unwrap();
    let module = resolve_module(Some(&cache), backend.as_ref(), &path).unwrap();

    let config = TaskConfig::new(&path).with_entry("sum", vec![1, 2]);
    let result = execute(
        backend.as_ref(),
        "task-cached",
        &module,
        &config,
        &backend.interrupt_handle(),
    );
    assert_eq!(result.return_values, vec![3]);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[test]
fn test_resolve_without_cache_reads_disk() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let backend = backend();

    resolve_module(None, backend.as_ref(), &path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let err = resolve_module(None, backend.as_ref(), &path).unwrap_err();
    assert!(matches!(err, DriverError::Load { .. }));
    assert!(err.to_string().contains("sum.wasm"));
}

// ============================================================================
// Test: Input Staging
// ============================================================================

#[test]
fn test_buffer_staged_and_observed() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "buffer.wasm", BUFFER_WAT);
    let backend = backend();
    let module = backend.load_module(&path).unwrap();

    let input = r#"{"line":"test"}"#;
    let mut config = TaskConfig::new(&path).with_input(input);
    config.io_buffer.args = vec![i64::try_from(input.len()).unwrap()];

    let result = execute(
        backend.as_ref(),
        "task-buffer",
        &module,
        &config,
        &backend.interrupt_handle(),
    );

    assert!(result.is_success(), "{}", result.message);
    assert_eq!(result.return_values, vec![byte_sum(input)]);
}

#[test]
fn test_buffer_bytes_in_guest_memory() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "buffer.wasm", BUFFER_WAT);
    let backend = backend();
    let module = backend.load_module(&path).unwrap();
    let interrupt = backend.interrupt_handle();

    let input = r#"{"line":"test"}"#;
    let mut context = backend.new_context("task-memory", &module, &interrupt).unwrap();

    let offset = context.call("alloc", &[15]).unwrap()[0];
    assert_eq!(offset, 1024);

    context.write_memory(1024, input.as_bytes()).unwrap();
    assert_eq!(context.read_memory(1024, input.len()).unwrap(), input.as_bytes());
    assert_eq!(context.memory_size(), Some(65_536));

    let err = context.write_memory(65_530, input.as_bytes()).unwrap_err();
    assert!(err.to_string().contains("exceeds guest memory"));
}

#[test]
fn test_missing_allocator_faults() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let backend = backend();
    let module = backend.load_module(&path).unwrap();

    let config = TaskConfig::new(&path)
        .with_input("hello")
        .with_entry("sum", vec![1, 2]);

    let result = execute(
        backend.as_ref(),
        "task-no-alloc",
        &module,
        &config,
        &backend.interrupt_handle(),
    );

    assert_eq!(result.cause, ExitCause::Faulted);
    assert!(result.message.contains("allocator function 'alloc' not found"));
}

// ============================================================================
// Test: Faults
// ============================================================================

#[test]
fn test_trap_faults() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "trap.wasm", TRAP_WAT);
    let backend = backend();
    let module = backend.load_module(&path).unwrap();

    let config = TaskConfig::new(&path).with_entry("boom", vec![]);
    let result = execute(
        backend.as_ref(),
        "task-trap",
        &module,
        &config,
        &backend.interrupt_handle(),
    );

    assert_eq!(result.cause, ExitCause::Faulted);
    assert_eq!(result.exit_code, 1);
    assert!(result.message.contains("boom"));
}

#[test]
fn test_missing_entry_and_bad_arity_fault() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let backend = backend();
    let module = backend.load_module(&path).unwrap();

    let missing = TaskConfig::new(&path);
    let result = execute(
        backend.as_ref(),
        "task-missing",
        &module,
        &missing,
        &backend.interrupt_handle(),
    );
    assert_eq!(result.cause, ExitCause::Faulted);
    assert!(result.message.contains("handle_buffer"));

    let arity = TaskConfig::new(&path).with_entry("sum", vec![1]);
    let result = execute(
        backend.as_ref(),
        "task-arity",
        &module,
        &arity,
        &backend.interrupt_handle(),
    );
    assert_eq!(result.cause, ExitCause::Faulted);
    assert!(result.message.contains("expected 2 arguments"));
}

// ============================================================================
// Test: Interruption
// ============================================================================

#[test]
fn test_interrupt_stops_infinite_loop() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let backend = backend();
    let module = backend.load_module(&path).unwrap();
    let interrupt = backend.interrupt_handle();

    let runner = {
        let backend = backend.clone();
        let interrupt = interrupt.clone();
        let config = TaskConfig::new(&path).with_entry("spin", vec![]);
        thread::spawn(move || execute(backend.as_ref(), "task-spin", &module, &config, &interrupt))
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!runner.is_finished());

    assert!(interrupt.interrupt());
    let result = runner.join().unwrap();

    assert_eq!(result.cause, ExitCause::Stopped);
    assert_eq!(result.exit_code, 143);
}

#[test]
fn test_interrupt_only_stops_its_own_task() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "spin.wasm", SPIN_WAT);
    let backend = backend();
    let module = backend.load_module(&path).unwrap();

    let spawn = |task_id: &'static str| {
        let backend = backend.clone();
        let module = module.clone();
        let interrupt = backend.interrupt_handle();
        let config = TaskConfig::new(&path).with_entry("spin", vec![]);
        let handle = interrupt.clone();
        let runner =
            thread::spawn(move || execute(backend.as_ref(), task_id, &module, &config, &interrupt));
        (handle, runner)
    };

    let (first, first_runner) = spawn("task-first");
    let (second, second_runner) = spawn("task-second");
    thread::sleep(Duration::from_millis(100));

    first.interrupt();
    assert!(first_runner.join().unwrap().is_stopped());

    thread::sleep(Duration::from_millis(50));
    assert!(!second_runner.is_finished());

    second.interrupt();
    assert!(second_runner.join().unwrap().is_stopped());
}

#[test]
fn test_interrupt_before_execute() {
    let dir = TempDir::new().unwrap();
    let path = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let backend = backend();
    let module = backend.load_module(&path).unwrap();
    let interrupt = backend.interrupt_handle();
    interrupt.interrupt();

    let config = TaskConfig::new(&path).with_entry("sum", vec![1, 2]);
    let result = execute(backend.as_ref(), "task-early", &module, &config, &interrupt);

    assert!(result.is_stopped());
}

// ============================================================================
// Test: Warm-up
// ============================================================================

#[test]
fn test_warm_caches_every_module() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    let sum = write_module(dir.path(), "sum.wasm", SUM_WAT);
    let trap = write_module(&dir.path().join("nested"), "trap.wasm", TRAP_WAT);
    write_module(dir.path(), "notes.txt", "not a module");

    let backend = backend();
    let cache = ModuleCache::new(2, EvictionKind::Arc, None).unwrap();

    assert_eq!(cache.warm(dir.path(), backend.as_ref()).unwrap(), 2);
    assert!(cache.contains(&sum));
    assert!(cache.contains(&trap));
}

#[test]
fn test_warm_rejects_more_modules_than_capacity() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "a.wasm", SUM_WAT);
    write_module(dir.path(), "b.wasm", SUM_WAT);
    write_module(dir.path(), "c.wasm", SUM_WAT);

    let backend = backend();
    let cache = ModuleCache::new(2, EvictionKind::Lru, None).unwrap();

    let err = cache.warm(dir.path(), backend.as_ref()).unwrap_err();
    assert!(matches!(err, DriverError::Configuration { .. }));
    let message = err.to_string();
    assert!(message.contains("(2)"), "{message}");
    assert!(message.contains("(3)"), "{message}");
    assert!(cache.is_empty());
}

#[test]
fn test_warm_aborts_on_invalid_module() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "a_good.wasm", SUM_WAT);
    write_module(dir.path(), "b_broken.wasm", "(module (func");

    let backend = backend();
    let cache = ModuleCache::new(5, EvictionKind::Simple, None).unwrap();

    let err = cache.warm(dir.path(), backend.as_ref()).unwrap_err();
    assert!(matches!(err, DriverError::Load { .. }));
    assert!(err.to_string().contains("b_broken.wasm"));
}
