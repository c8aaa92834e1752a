mod common;

use common::FakeSpawner;
use palisade_core::pool::{SandboxTask, WorkerPool};
use palisade_core::{PalisadeError, PermissionPolicy, PoolConfig, RunMode};
use std::sync::Arc;
use std::time::Duration;

fn task(unit: &str) -> SandboxTask {
    SandboxTask::new(unit, PermissionPolicy::new("remote").freeze(), RunMode::Sandboxed, Vec::new())
}

fn pool(spawner: &FakeSpawner, workers: usize, freelancers: usize) -> WorkerPool {
    let config = PoolConfig::builder().pool_size(workers).freelancers(freelancers).build();
    WorkerPool::with_spawner(config, Arc::new(spawner.clone())).expect("pool")
}

#[test]
fn tasks_complete_with_their_results() {
    let spawner = FakeSpawner::new();
    let pool = pool(&spawner, 2, 0);
    let futures: Vec<_> = ["a", "b", "c"].iter().map(|u| pool.submit(task(u))).collect();
    for (future, unit) in futures.iter().zip(["a", "b", "c"]) {
        assert_eq!(future.get().expect("result").raw(), unit);
    }
    assert_eq!(pool.status().total, 2);
}

#[test]
fn retried_task_runs_before_later_submissions() {
    let spawner = FakeSpawner::new();
    *spawner.world.delay.lock() = Duration::from_millis(30);
    spawner.world.die_once("A");
    let pool = pool(&spawner, 1, 0);

    let a = pool.submit(task("A"));
    let b = pool.submit(task("B"));
    assert_eq!(a.get().expect("A").raw(), "A");
    assert_eq!(b.get().expect("B").raw(), "B");

    assert_eq!(spawner.world.log(), ["1:A", "2:A", "2:B"]);
    assert_eq!(*spawner.world.destroyed.lock(), [1]);
}

#[test]
fn retries_are_bounded() {
    let spawner = FakeSpawner::new();
    let config = PoolConfig::builder().pool_size(1).freelancers(0).max_task_retries(0).build();
    let pool = WorkerPool::with_spawner(config, Arc::new(spawner.clone())).expect("pool");
    spawner.world.die_once("fragile");

    let result = pool.submit(task("fragile")).get();
    assert!(matches!(result, Err(PalisadeError::ProcessUnreachable(_))));
    // The worker came back with a fresh process.
    assert_eq!(pool.submit(task("next")).get().expect("next").raw(), "next");
}

#[test]
fn unsafe_kill_fails_the_task_and_replaces_the_process() {
    let spawner = FakeSpawner::new();
    spawner.world.make_unsafe("Runaway");
    let pool = pool(&spawner, 1, 0);

    assert!(matches!(
        pool.submit(task("Runaway")).get(),
        Err(PalisadeError::UnsafeKillSignaled)
    ));
    assert_eq!(pool.submit(task("After")).get().expect("after").origin().as_str(), "Nr2");
    assert_eq!(*spawner.world.destroyed.lock(), [1]);
}

#[test]
fn freelancer_is_replaced_after_an_unsafe_kill() {
    let spawner = FakeSpawner::new();
    spawner.world.make_unsafe("Runaway");
    let pool = pool(&spawner, 0, 1);
    let policy = PermissionPolicy::new("session").freeze();

    let mut freelancer = pool.acquire_freelancer().expect("freelancer");
    let before = freelancer.process_id().expect("process");
    freelancer.init(&policy).expect("init");
    assert!(matches!(
        freelancer.run_sandboxed("Runaway", &[]),
        Err(PalisadeError::UnsafeKillSignaled)
    ));
    assert!(freelancer.is_quarantined());
    pool.release_freelancer(freelancer);

    let mut freelancer = pool.acquire_freelancer().expect("freelancer");
    assert_ne!(freelancer.process_id().expect("process"), before);
    // A fresh process carries no session.
    assert!(matches!(freelancer.run_in_context("Ok", &[]), Err(PalisadeError::NotInitialized)));
}

#[test]
fn released_freelancer_is_reset_not_replaced() {
    let spawner = FakeSpawner::new();
    let pool = pool(&spawner, 0, 1);
    let policy = PermissionPolicy::new("session").freeze();

    let mut freelancer = pool.acquire_freelancer().expect("freelancer");
    let pid = freelancer.process_id();
    freelancer.init(&policy).expect("init");
    assert!(matches!(freelancer.init(&policy), Err(PalisadeError::AlreadyInitialized)));
    assert_eq!(freelancer.run_sandboxed("Ok", &[]).expect("run").raw(), "Ok");
    drop(freelancer);

    let mut freelancer = pool.acquire_freelancer().expect("freelancer");
    assert_eq!(freelancer.process_id(), pid);
    freelancer.init(&policy).expect("session was reset");
}

#[test]
fn acquiring_times_out_when_every_freelancer_is_busy() {
    let spawner = FakeSpawner::new();
    let pool = pool(&spawner, 0, 1);
    let held = pool.acquire_freelancer().expect("freelancer");
    let waited = pool
        .acquire_freelancer_timeout(Duration::from_millis(30))
        .expect("no error");
    assert!(waited.is_none());
    assert_eq!(pool.status().freelancers_available, 0);
    drop(held);
    assert_eq!(pool.status().freelancers_available, 1);
}

#[test]
fn waiting_acquirers_are_served_in_order() {
    let spawner = FakeSpawner::new();
    let pool = Arc::new(pool(&spawner, 0, 1));
    let held = pool.acquire_freelancer().expect("freelancer");
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let waiters: Vec<_> = (0..3)
        .map(|i| {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            // Stagger so the queue order is known.
            std::thread::sleep(Duration::from_millis(20));
            std::thread::spawn(move || {
                let freelancer = pool.acquire_freelancer().expect("freelancer");
                order.lock().push(i);
                drop(freelancer);
            })
        })
        .collect();
    std::thread::sleep(Duration::from_millis(20));
    drop(held);
    for waiter in waiters {
        waiter.join().expect("waiter");
    }
    assert_eq!(*order.lock(), [0, 1, 2]);
}

#[test]
fn shutdown_fails_pending_work_and_restart_recovers() {
    let spawner = FakeSpawner::new();
    let pool = pool(&spawner, 1, 1);
    pool.shutdown();
    assert!(pool.is_shutdown());
    assert!(matches!(pool.submit(task("late")).get(), Err(PalisadeError::PoolShutdown)));
    assert!(matches!(pool.acquire_freelancer(), Err(PalisadeError::PoolShutdown)));

    pool.restart().expect("restart");
    assert!(!pool.is_shutdown());
    assert_eq!(pool.submit(task("again")).get().expect("again").raw(), "again");
    assert!(pool.acquire_freelancer_timeout(Duration::from_secs(1)).expect("acquire").is_some());
}
