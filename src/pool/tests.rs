use super::*;
use std::sync::atomic::AtomicUsize;

fn manager(fetch: usize, query: usize) -> WorkerPoolManager {
    WorkerPoolManager::new(
        WorkerConfig {
            fetch_workers: fetch,
            query_workers: query,
            ..WorkerConfig::default()
        },
        Handle::current(),
    )
}

#[tokio::test]
async fn pool_is_created_once_and_reused() {
    let manager = manager(3, 3);
    assert!(manager.created_pools().is_empty(), "pools are created lazily");

    let first = manager.pool(WorkloadClass::Fetch).unwrap();
    let second = manager.pool(WorkloadClass::Fetch).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.max_workers(), 3);
    assert_eq!(first.state(), PoolState::Active);
    assert_eq!(manager.created_pools().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_yields_single_instance() {
    let manager = Arc::new(manager(2, 2));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.pool(WorkloadClass::Query).unwrap())
        })
        .collect();
    let pools: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    for pool in &pools[1..] {
        assert!(Arc::ptr_eq(&pools[0], pool));
    }
    assert_eq!(manager.created_pools().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_jobs_never_exceed_worker_count() {
    let manager = manager(2, 2);
    let pool = manager.pool(WorkloadClass::Fetch).unwrap();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.submit_blocking(move || {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                current.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_class_does_not_block_another_class() {
    let manager = manager(1, 1);
    let fetch = manager.pool(WorkloadClass::Fetch).unwrap();
    let query = manager.pool(WorkloadClass::Query).unwrap();

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let blocker = fetch
        .submit(async move {
            let _ = release_rx.await;
        })
        .unwrap();

    // Fetch pool is full; a query job must still run promptly
    let answer = query.submit(async { 42 }).unwrap();
    let answer = tokio::time::timeout(Duration::from_secs(2), answer)
        .await
        .expect("query pool was blocked by the fetch pool")
        .unwrap();
    assert_eq!(answer, 42);
    assert_eq!(fetch.running(), 1);

    release_tx.send(()).unwrap();
    blocker.await.unwrap();
}

#[tokio::test]
async fn submit_from_non_runtime_thread_runs_on_pool() {
    let manager = Arc::new(manager(1, 1));
    let pool = manager.pool(WorkloadClass::Fetch).unwrap();

    let handle = std::thread::spawn(move || pool.submit(async { "done" }).unwrap())
        .join()
        .unwrap();

    assert_eq!(handle.await.unwrap(), "done");
}

#[tokio::test]
async fn shutdown_drains_jobs_and_is_idempotent() {
    let manager = manager(2, 2);
    let pool = manager.pool(WorkloadClass::Fetch).unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let finished = Arc::clone(&finished);
        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            finished.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(manager.shutdown(Duration::from_secs(5)).await);
    assert_eq!(
        finished.load(Ordering::SeqCst),
        3,
        "queued jobs still run during a graceful shutdown"
    );
    assert_eq!(pool.state(), PoolState::Terminated);

    assert!(manager.shutdown(Duration::ZERO).await, "second shutdown is a no-op");
}

#[tokio::test]
async fn shutdown_rejects_new_work() {
    let manager = manager(2, 2);
    let pool = manager.pool(WorkloadClass::Fetch).unwrap();

    assert!(manager.shutdown(Duration::from_secs(1)).await);
    assert!(manager.is_shutting_down());

    match pool.submit(async {}) {
        Err(Error::PoolShutDown(WorkloadClass::Fetch)) => {}
        other => panic!("expected PoolShutDown, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(
        manager.pool(WorkloadClass::Query),
        Err(Error::ShuttingDown)
    ));

    // Existing pools are still handed out so callers can observe their state
    let same = manager.pool(WorkloadClass::Fetch).unwrap();
    assert_eq!(same.state(), PoolState::Terminated);
}

#[tokio::test]
async fn shutdown_reports_timeout_when_jobs_outlive_deadline() {
    let manager = manager(1, 1);
    let pool = manager.pool(WorkloadClass::Fetch).unwrap();

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    pool.submit(async move {
        let _ = release_rx.await;
    })
    .unwrap();

    assert!(!manager.shutdown(Duration::from_millis(50)).await);
    assert_eq!(pool.state(), PoolState::ShuttingDown);

    release_tx.send(()).unwrap();
    assert!(manager.shutdown(Duration::from_secs(2)).await);
    assert_eq!(pool.state(), PoolState::Terminated);
}
