//! Integration tests for request coalescing and durable storage.
//!
//! These drive the coordinator with many concurrent callers and check that
//! each key executes once, distinct keys run in parallel, failures are not
//! cached, and stored results survive a restart.

use anyhow::{anyhow, Result};
use command_cache::{CommandKey, Coordinator, FileStore, MemoryStore, ResolveError, Store};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tracing_test::traced_test;

/// Counts executions per command and returns a result unique to each one.
#[derive(Default)]
struct CountingExecutor {
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl CountingExecutor {
    async fn run(&self, key: &CommandKey, delay: Duration) -> Result<String> {
        let n = self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;
        tokio::time::sleep(delay).await;
        Ok(format!("{}-{}", key, n))
    }

    fn calls_for(&self, key: &CommandKey) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(key.as_str())
            .copied()
            .unwrap_or(0)
    }
}

fn memory_coordinator() -> Arc<Coordinator> {
    Arc::new(Coordinator::new(Arc::new(MemoryStore::new())))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn test_concurrent_callers_share_one_execution() {
    let coordinator = memory_coordinator();
    let executor = Arc::new(CountingExecutor::default());
    let key = CommandKey::new(5, "build");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let coordinator = coordinator.clone();
            let executor = executor.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coordinator
                    .resolve(&key, || executor.run(&key, Duration::from_millis(100)))
                    .await
            })
        })
        .collect();

    let mut results = HashSet::new();
    let mut executed = 0;
    for handle in handles {
        let resolved = handle.await.unwrap().unwrap();
        if !resolved.cached {
            executed += 1;
        }
        results.insert(resolved.result);
    }

    assert_eq!(executor.calls_for(&key), 1);
    assert_eq!(executed, 1);
    assert_eq!(results.len(), 1);
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test]
async fn test_stored_result_is_stable() {
    let coordinator = memory_coordinator();
    let executor = CountingExecutor::default();
    let key = CommandKey::new(1, "deploy");

    let first = coordinator
        .resolve(&key, || executor.run(&key, Duration::ZERO))
        .await
        .unwrap();
    for _ in 0..5 {
        let again = coordinator
            .resolve(&key, || executor.run(&key, Duration::ZERO))
            .await
            .unwrap();
        assert!(again.cached);
        assert_eq!(again.result, first.result);
    }
    assert_eq!(executor.calls_for(&key), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_run_in_parallel() {
    let coordinator = memory_coordinator();
    let executor = Arc::new(CountingExecutor::default());
    let start = Instant::now();

    let handles: Vec<_> = [CommandKey::new(1, "deploy"), CommandKey::new(2, "deploy")]
        .into_iter()
        .map(|key| {
            let coordinator = coordinator.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                coordinator
                    .resolve(&key, || executor.run(&key, Duration::from_millis(200)))
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(!handle.await.unwrap().unwrap().cached);
    }

    // Serialized execution would take at least 400ms.
    assert!(start.elapsed() < Duration::from_millis(380));
}

#[tokio::test]
#[traced_test]
async fn test_results_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    let key = CommandKey::new(1, "deploy");

    let original = {
        let store = Arc::new(FileStore::open(&path).await.unwrap());
        let coordinator = Coordinator::new(store);
        coordinator
            .resolve(&key, || async { Ok("first-run".to_string()) })
            .await
            .unwrap()
    };
    assert!(!original.cached);

    let reopened = Arc::new(FileStore::open(&path).await.unwrap());
    assert_eq!(reopened.get(key.as_str()).await.as_deref(), Some("first-run"));

    let coordinator = Coordinator::new(reopened);
    let resolved = coordinator
        .resolve(&key, || async { Err(anyhow!("must not execute after restart")) })
        .await
        .unwrap();
    assert!(resolved.cached);
    assert_eq!(resolved.result, "first-run");
}

#[tokio::test]
async fn test_file_contents_match_served_results() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    let coordinator = Coordinator::new(Arc::new(FileStore::open(&path).await.unwrap()));

    let mut served = HashMap::new();
    for (id, cmd) in [(1, "deploy"), (5, "build"), (5, "test")] {
        let key = CommandKey::new(id, cmd);
        let resolved = coordinator
            .resolve(&key, || async move { Ok(format!("out-{}", id)) })
            .await
            .unwrap();
        served.insert(key.to_string(), resolved.result);
    }

    let on_disk: HashMap<String, String> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk, served);
}

#[tokio::test]
#[traced_test]
async fn test_failed_execution_is_retried_by_next_caller() {
    let coordinator = memory_coordinator();
    let key = CommandKey::new(9, "flaky");

    let err = coordinator
        .resolve(&key, || async { Err(anyhow!("exit status 1")) })
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::Execution(_)));
    assert!(logs_contain("Execution failed"));

    let resolved = coordinator
        .resolve(&key, || async { Ok("recovered".to_string()) })
        .await
        .unwrap();
    assert!(!resolved.cached);
    assert_eq!(resolved.result, "recovered");
}

#[tokio::test]
async fn test_persistence_failure_is_reported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("db.json");
    let store = Arc::new(FileStore::open(&path).await.unwrap());

    // A regular file where the parent directory should be makes every write fail.
    std::fs::write(dir.path().join("state"), b"").unwrap();

    let coordinator = Coordinator::new(store);
    let err = coordinator
        .resolve(&CommandKey::new(1, "deploy"), || async { Ok("OK".to_string()) })
        .await
        .unwrap_err();
    assert!(err.is_persistence());
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_keys_many_callers() {
    let coordinator = memory_coordinator();
    let executor = Arc::new(CountingExecutor::default());

    let keys: Vec<CommandKey> = (1..=20)
        .flat_map(|id| ["deploy", "build"].map(|cmd| CommandKey::new(id, cmd)))
        .collect();

    let mut handles = Vec::new();
    for _ in 0..8 {
        for key in &keys {
            let coordinator = coordinator.clone();
            let executor = executor.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let resolved = coordinator
                    .resolve(&key, || executor.run(&key, Duration::from_millis(10)))
                    .await
                    .unwrap();
                (key, resolved.result)
            }));
        }
    }

    let mut results: HashMap<CommandKey, HashSet<String>> = HashMap::new();
    for handle in handles {
        let (key, result) = handle.await.unwrap();
        results.entry(key).or_default().insert(result);
    }

    for key in &keys {
        assert_eq!(executor.calls_for(key), 1, "{} executed more than once", key);
        assert_eq!(results[key].len(), 1);
    }
    assert_eq!(executor.total.load(Ordering::SeqCst), keys.len());
    assert_eq!(coordinator.cached_entries().await, keys.len());
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test]
async fn test_key_composition_is_unambiguous() {
    let coordinator = memory_coordinator();

    let a = coordinator
        .resolve(&CommandKey::new(1, "2+x"), || async { Ok("a".to_string()) })
        .await
        .unwrap();
    let b = coordinator
        .resolve(&CommandKey::new(12, "x"), || async { Ok("b".to_string()) })
        .await
        .unwrap();

    assert!(!a.cached);
    assert!(!b.cached);
    assert_eq!(coordinator.cached_entries().await, 2);
}
