// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation tests: idempotent submission, failures, scheduling, actions,
//! hooks and postponement handling of the execution loop.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use common::*;
use rekindle_core::{Error, FunctionId, FunctionRuntime, Outcome, Status};

fn runtime() -> FunctionRuntime {
    init_tracing();
    FunctionRuntime::builder()
        .store(memory_store())
        .settings(quiet_settings())
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_invokes_execute_body_once() {
    let runtime = runtime();
    let executions = Arc::new(AtomicUsize::new(0));

    let double = {
        let executions = executions.clone();
        runtime
            .register_func("double", move |x: i32| {
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Outcome::succeed(x * 2)
                }
            })
            .unwrap()
    };

    let instance = unique_id("double");
    let calls = (0..10).map(|_| double.invoke(instance.as_str(), 21));
    let results = futures::future::join_all(calls).await;

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap(), 42);
    }
}

#[tokio::test]
async fn test_failed_function_is_not_re_executed() {
    let runtime = runtime();
    let executions = Arc::new(AtomicUsize::new(0));

    let fragile = {
        let executions = executions.clone();
        runtime
            .register_func("fragile", move |_: ()| {
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(anyhow!("boom"))
                }
            })
            .unwrap()
    };

    let err = fragile.invoke("1", ()).await.unwrap_err();
    match err {
        Error::FunctionFailed { failure, .. } => assert_eq!(failure.message, "boom"),
        other => panic!("expected FunctionFailed, got {other:?}"),
    }

    let err = fragile.invoke("1", ()).await.unwrap_err();
    assert_eq!(err.error_code(), "PREVIOUS_INVOCATION_FAILED");
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let stored = runtime
        .store()
        .get_function(&FunctionId::new("fragile", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, Status::Failed);
    assert_eq!(stored.failure.unwrap().message, "boom");

    let err = fragile
        .re_invoke("1", &[Status::Failed], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FunctionFailed { .. }));
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_schedule_runs_in_background() {
    let runtime = runtime();
    let greet = runtime
        .register_func("greet", |name: String| async move {
            Ok::<_, anyhow::Error>(format!("hello {name}"))
        })
        .unwrap();

    greet.schedule("1", "world".to_string()).await.unwrap();

    let id = FunctionId::new("greet", "1");
    assert!(wait_for_status(runtime.store(), &id, Status::Succeeded, Duration::from_secs(2)).await);

    let stored = runtime.store().get_function(&id).await.unwrap().unwrap();
    let result: String = stored.result.unwrap().decode().unwrap();
    assert_eq!(result, "hello world");

    // A second submission observes the stored result.
    assert_eq!(greet.invoke("1", "ignored".to_string()).await.unwrap(), "hello world");
}

#[tokio::test]
async fn test_schedule_of_existing_function_is_a_no_op() {
    let runtime = runtime();
    let executions = Arc::new(AtomicUsize::new(0));
    let count = {
        let executions = executions.clone();
        runtime
            .register_action("count", move |_: ()| {
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Outcome::succeed(())
                }
            })
            .unwrap()
    };

    count.invoke("1", ()).await.unwrap();
    count.schedule("1", ()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_action_persists_no_result() {
    let runtime = runtime();
    let notify = runtime
        .register_action("notify", |_: String| async { Ok::<_, anyhow::Error>(()) })
        .unwrap();

    notify.invoke("1", "ping".to_string()).await.unwrap();
    notify.invoke("1", "ping".to_string()).await.unwrap();

    let stored = runtime
        .store()
        .get_function(&FunctionId::new("notify", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, Status::Succeeded);
    assert!(stored.result.is_none());
    assert!(stored.scrapbook.is_none());
}

#[tokio::test]
async fn test_pre_invoke_error_fails_without_running_body() {
    let runtime = runtime();
    let executions = Arc::new(AtomicUsize::new(0));

    let guarded = {
        let executions = executions.clone();
        runtime
            .function("guarded", move |x: u32| {
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Outcome::succeed(x)
                }
            })
            .pre_invoke(|_scrapbook, metadata| async move {
                if metadata.param > 10 {
                    anyhow::bail!("{} is too large", metadata.param);
                }
                Ok(())
            })
            .register()
            .unwrap()
    };

    assert_eq!(guarded.invoke("small", 3).await.unwrap(), 3);
    let err = guarded.invoke("large", 11).await.unwrap_err();
    match err {
        Error::FunctionFailed { failure, .. } => assert_eq!(failure.message, "11 is too large"),
        other => panic!("expected FunctionFailed, got {other:?}"),
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_post_invoke_remaps_outcome() {
    let runtime = runtime();
    let lenient = runtime
        .function("lenient", |_: ()| async { Err::<i64, _>(anyhow!("unavailable")) })
        .post_invoke(|outcome, _scrapbook, metadata| async move {
            match outcome {
                Outcome::Fail(failure) => {
                    tracing::info!(function_id = %metadata.function_id, %failure, "Falling back");
                    Outcome::succeed(-1)
                }
                other => other,
            }
        })
        .register()
        .unwrap();

    assert_eq!(lenient.invoke("1", ()).await.unwrap(), -1);
}

#[tokio::test]
async fn test_panicking_body_is_recorded_as_failure() {
    let runtime = runtime();
    let explosive = runtime
        .register_func("explosive", |_: ()| async {
            if true {
                panic!("kaboom");
            }
            Outcome::succeed(0u8)
        })
        .unwrap();

    let err = explosive.invoke("1", ()).await.unwrap_err();
    match err {
        Error::FunctionFailed { failure, .. } => {
            assert_eq!(failure.kind, "panic");
            assert_eq!(failure.message, "kaboom");
        }
        other => panic!("expected FunctionFailed, got {other:?}"),
    }

    let stored = runtime
        .store()
        .get_function(&FunctionId::new("explosive", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, Status::Failed);
}

#[tokio::test]
async fn test_long_postponement_is_left_to_the_watchdog() {
    let runtime = runtime();
    let later = runtime
        .register_func("later", |_: ()| async {
            Outcome::<()>::postpone_for(Duration::from_secs(3600))
        })
        .unwrap();

    let err = later.invoke("1", ()).await.unwrap_err();
    assert!(err.is_postponed());

    let stored = runtime
        .store()
        .get_function(&FunctionId::new("later", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, Status::Postponed);
    assert!(stored.postponed_until.unwrap() > chrono::Utc::now());
    assert_eq!(stored.epoch, 0);

    // A duplicate submission reports the postponement as well.
    assert!(later.invoke("1", ()).await.unwrap_err().is_postponed());
}

#[tokio::test]
async fn test_short_postponement_is_waited_for_in_process() {
    let runtime = runtime();
    let executions = Arc::new(AtomicUsize::new(0));

    let retrying = {
        let executions = executions.clone();
        runtime
            .register_func("retrying", move |_: ()| {
                let executions = executions.clone();
                async move {
                    if executions.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Outcome::postpone_for(Duration::from_millis(50));
                    }
                    Outcome::succeed("done".to_string())
                }
            })
            .unwrap()
    };

    assert_eq!(retrying.invoke("1", ()).await.unwrap(), "done");
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    let stored = runtime
        .store()
        .get_function(&FunctionId::new("retrying", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, Status::Succeeded);
    assert_eq!(stored.epoch, 1);
}

#[tokio::test]
async fn test_postponement_without_in_process_wait_returns_immediately() {
    let runtime = runtime();
    let deferred = runtime
        .register_action("deferred", |_: ()| async {
            Outcome::postpone_for(Duration::from_millis(10)).without_in_process_wait()
        })
        .unwrap();

    let err = deferred.invoke("1", ()).await.unwrap_err();
    assert!(err.is_postponed());
}

#[tokio::test]
async fn test_invoke_after_shutdown_is_refused() {
    let runtime = runtime();
    let echo = runtime
        .register_func("echo", |x: u8| async move { Outcome::succeed(x) })
        .unwrap();

    runtime.shutdown_gracefully(None).await.unwrap();

    assert!(echo.invoke("1", 1).await.unwrap_err().is_shutdown());
    assert!(echo.schedule("2", 2).await.unwrap_err().is_shutdown());
    assert!(
        runtime
            .store()
            .get_function(&FunctionId::new("echo", "1"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_invoke_waits_through_in_process_postponement() {
    let runtime = runtime();
    let executions = Arc::new(AtomicUsize::new(0));

    let nap = {
        let executions = executions.clone();
        runtime
            .register_func("nap", move |_: ()| {
                let executions = executions.clone();
                async move {
                    if executions.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Outcome::postpone_for(Duration::from_millis(300));
                    }
                    Outcome::succeed("done".to_string())
                }
            })
            .unwrap()
    };

    let first = {
        let nap = nap.clone();
        tokio::spawn(async move { nap.invoke("1", ()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = nap.invoke("1", ()).await;

    assert_eq!(first.await.unwrap().unwrap(), "done");
    assert_eq!(second.unwrap(), "done");
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_duplicate_invoke_of_watchdog_postponement_returns_postponed() {
    let runtime = runtime();
    let later = runtime
        .register_action("later", |_: ()| async {
            Outcome::postpone_for(Duration::from_secs(3600))
        })
        .unwrap();

    assert!(later.invoke("1", ()).await.unwrap_err().is_postponed());
    assert!(later.invoke("1", ()).await.unwrap_err().is_postponed());
}

#[tokio::test]
async fn test_panicking_post_invoke_hook_is_recorded_as_failure() {
    init_tracing();
    let catcher = UnhandledErrorCatcher::new();
    let runtime = FunctionRuntime::builder()
        .store(memory_store())
        .settings(quiet_settings())
        .on_unhandled_error(catcher.callback())
        .build()
        .unwrap();

    let hooked = runtime
        .action("hooked", |_: ()| async { Outcome::succeed(()) })
        .post_invoke(|_outcome, _scrapbook, _metadata| async { panic!("hook boom") })
        .register()
        .unwrap();

    hooked.schedule("1", ()).await.unwrap();

    let id = FunctionId::new("hooked", "1");
    assert!(wait_for_status(runtime.store(), &id, Status::Failed, Duration::from_secs(1)).await);
    let failure = runtime
        .store()
        .get_function(&id)
        .await
        .unwrap()
        .unwrap()
        .failure
        .unwrap();
    assert_eq!(failure.kind, "panic");
    assert_eq!(failure.message, "hook boom");

    let reported = wait_until(Duration::from_secs(1), || {
        let catcher = catcher.clone();
        async move { !catcher.is_empty() }
    })
    .await;
    assert!(reported);
    assert_eq!(catcher.errors()[0].error.error_code(), "FUNCTION_FAILED");
}
