//! Lifecycle behavior of `Environment`: barrier semantics, the first-error
//! latch, sibling cancellation, and spawn-after-stop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod common;

use graceserve::{Environment, TaskError};

#[tokio::test]
async fn test_wait_blocks_until_every_task_returns() {
    common::init_tracing();
    let env = Environment::new();
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let finished = Arc::clone(&finished);
        env.spawn(move |ctx| async move {
            ctx.cancelled().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            finished.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }

    env.cancel(None);
    env.wait().await.unwrap();

    assert_eq!(finished.load(Ordering::Relaxed), 8);
}

#[tokio::test]
async fn test_first_cancel_wins() {
    common::init_tracing();
    let env = Environment::new();
    env.spawn(|ctx| async move {
        ctx.cancelled().await;
        Ok(())
    });

    assert!(env.cancel(Some(TaskError::fail("first"))));
    assert!(!env.cancel(Some(TaskError::fail("second"))));

    assert_eq!(env.wait().await, Err(TaskError::fail("first")));
}

#[tokio::test]
async fn test_failing_task_cancels_siblings() {
    common::init_tracing();
    let env = Environment::new();
    let siblings_cancelled = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let count = Arc::clone(&siblings_cancelled);
        env.spawn(move |ctx| async move {
            ctx.cancelled().await;
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }
    env.spawn(|_ctx| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err(TaskError::fail("boom"))
    });

    assert_eq!(env.wait().await, Err(TaskError::fail("boom")));
    // Both blocked siblings observed cancellation before wait returned.
    assert_eq!(siblings_cancelled.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_spawn_after_cancel_is_a_noop() {
    common::init_tracing();
    let env = Environment::new();
    env.cancel(None);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    env.spawn(move |_ctx| async move {
        flag.store(true, Ordering::Relaxed);
        Ok(())
    });

    env.wait().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!ran.load(Ordering::Relaxed));
}

#[tokio::test]
async fn test_cancel_with_no_tasks_completes_immediately() {
    common::init_tracing();
    let env = Environment::new();
    env.cancel(None);
    tokio::time::timeout(Duration::from_secs(1), env.wait())
        .await
        .expect("wait should not block")
        .unwrap();
}

#[tokio::test]
async fn test_stop_lets_tasks_finish_on_their_own() {
    common::init_tracing();
    let env = Environment::new();
    let finished = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&finished);
    env.spawn(move |ctx| async move {
        // Runs to completion without being cancelled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ctx.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        Ok(())
    });

    assert!(env.stop());
    env.wait().await.unwrap();

    assert!(finished.load(Ordering::Relaxed));
    // The base token is cancelled once the drain is complete.
    assert!(env.context().is_cancelled());
}

#[tokio::test]
async fn test_signaled_error_is_distinguishable() {
    common::init_tracing();
    let env = Environment::new();
    env.cancel(Some(TaskError::Signaled));
    let err = env.wait().await.unwrap_err();
    assert!(graceserve::is_signaled(&err));
}
