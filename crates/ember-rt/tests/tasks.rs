// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task lifecycle, timers, cancellation, executors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_rt::{Runtime, RuntimeConfig, Task, TaskOptions};
use ember_value::{native, native_async, CallFuture, ErrorKind, Value};

fn runtime(workers: usize) -> Runtime {
    Runtime::with_config(RuntimeConfig {
        workers,
        eager_timer: false,
    })
    .unwrap()
}

#[test]
fn simple_task_produces_result() {
    let rt = runtime(2);
    let task = rt
        .spawn(native("seven", |_| Ok(Value::I32(7))), Value::None)
        .unwrap();
    assert_eq!(task.join().unwrap(), Value::I32(7));
    rt.shutdown();
}

#[test]
fn task_argument_is_passed() {
    let rt = runtime(2);
    let task = rt
        .spawn(
            native("double", |args: Value| Ok(Value::I64(args.as_i64()? * 2))),
            Value::I64(21),
        )
        .unwrap();
    assert_eq!(task.join().unwrap(), Value::I64(42));
    rt.shutdown();
}

#[test]
fn failing_task_reports_error() {
    let rt = runtime(1);
    let task = rt
        .spawn(
            native("boom", |_| {
                Err(ember_value::RtError::invalid_operation("boom"))
            }),
            Value::None,
        )
        .unwrap();
    let err = task.join().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    rt.shutdown();
}

#[test]
fn exception_handler_intercepts() {
    let rt = runtime(1);
    let task = Task::with_options(
        native("boom", |_| {
            Err(ember_value::RtError::invalid_operation("boom"))
        }),
        Value::None,
        TaskOptions {
            exception_handler: Some(native("handler", |args: Value| {
                let text = args.get(0)?.as_str()?.to_string();
                Ok(Value::Str(format!("handled: {text}")))
            })),
            ..Default::default()
        },
    );
    task.start(&rt).unwrap();
    let out = task.join().unwrap();
    assert!(out.as_str().unwrap().starts_with("handled: invalid_operation"));
    rt.shutdown();
}

#[test]
fn sleep_wakes_after_deadline() {
    let rt = runtime(2);
    let start = Instant::now();
    let task = Task::from_future(Box::pin(async {
        ember_rt::sleep(Duration::from_millis(50)).await?;
        Ok(Value::None)
    }));
    task.start(&rt).unwrap();
    task.join().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    rt.shutdown();
}

#[test]
fn cancel_a_sleeping_task() {
    let rt = runtime(2);
    let task = Task::from_future(Box::pin(async {
        ember_rt::sleep(Duration::from_millis(10_000)).await?;
        Ok(Value::None)
    }));
    task.start(&rt).unwrap();
    std::thread::sleep(Duration::from_millis(5));

    let start = Instant::now();
    task.notify_cancel();
    let err = task.join().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TaskCancellation);
    assert!(start.elapsed() < Duration::from_millis(1000));
    assert!(task.is_ended());
    rt.shutdown();
}

#[test]
fn cancel_before_start_ends_immediately() {
    let rt = runtime(1);
    let task = Task::new(native("never", |_| Ok(Value::None)), Value::None);
    task.notify_cancel();
    task.start(&rt).unwrap();
    let err = task.join().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TaskCancellation);
    rt.shutdown();
}

#[test]
fn task_deadline_cancels_it() {
    let rt = runtime(2);
    let task = Task::with_options(
        native_async("sleepy", |_| {
            Box::pin(async {
                ember_rt::sleep(Duration::from_millis(10_000)).await?;
                Ok(Value::None)
            }) as CallFuture
        }),
        Value::None,
        TaskOptions {
            timeout: Some(Instant::now() + Duration::from_millis(30)),
            ..Default::default()
        },
    );
    task.start(&rt).unwrap();
    let start = Instant::now();
    let err = task.join().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TaskCancellation);
    assert!(start.elapsed() < Duration::from_millis(2000));
    rt.shutdown();
}

#[test]
fn await_task_from_within_a_task() {
    let rt = runtime(2);
    let inner = Task::new(native("inner", |_| Ok(Value::I32(5))), Value::None);
    let inner2 = inner.clone();
    let outer = Task::from_future(Box::pin(async move {
        // Not yet started: await_task starts it on the ambient pool.
        ember_rt::await_task(&inner2).await
    }));
    outer.start(&rt).unwrap();
    assert_eq!(outer.join().unwrap(), Value::I32(5));
    rt.shutdown();
}

#[test]
fn yield_results_and_iterate() {
    let rt = runtime(2);
    let producer = Task::from_future(Box::pin(async {
        for i in 0..3 {
            ember_rt::yield_result(Value::I32(i)).await?;
        }
        Ok(Value::Str("end".into()))
    }));
    producer.start(&rt).unwrap();

    let p2 = producer.clone();
    let consumer = Task::from_future(Box::pin(async move {
        let mut seen = Vec::new();
        for i in 0.. {
            if !ember_rt::yield_iterate(&p2).await? {
                break;
            }
            seen.push(ember_rt::get_result(&p2, i).await?);
        }
        Ok(Value::Array(seen))
    }));
    consumer.start(&rt).unwrap();
    let out = consumer.join().unwrap();
    let seen = out.as_array().unwrap();
    // Three yields plus the final result.
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0], Value::I32(0));
    assert_eq!(seen[3], Value::Str("end".into()));
    rt.shutdown();
}

#[test]
fn get_result_blocks_until_yield() {
    let rt = runtime(2);
    let producer = Task::from_future(Box::pin(async {
        ember_rt::sleep(Duration::from_millis(30)).await?;
        ember_rt::yield_result(Value::I32(1)).await?;
        Ok(Value::None)
    }));
    producer.start(&rt).unwrap();
    let p2 = producer.clone();
    let consumer = Task::from_future(Box::pin(async move {
        ember_rt::get_result(&p2, 0).await
    }));
    consumer.start(&rt).unwrap();
    assert_eq!(consumer.join().unwrap(), Value::I32(1));
    rt.shutdown();
}

#[test]
fn fulfilled_and_dummy_tasks() {
    let rt = runtime(1);
    let done = Task::fulfilled(vec![Value::I32(1), Value::I32(2)]);
    assert!(done.is_ended());
    assert!(ember_rt::has_result(&done, 1));

    let dummy = Task::dummy();
    let d2 = dummy.clone();
    let waiter = Task::from_future(Box::pin(async move {
        ember_rt::await_task(&d2).await
    }));
    waiter.start(&rt).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    dummy.complete(Value::I32(9));
    assert_eq!(waiter.join().unwrap(), Value::I32(9));
    rt.shutdown();
}

#[test]
fn await_multiple_and_results() {
    let rt = runtime(2);
    let tasks: Vec<Task> = (0..4)
        .map(|i| {
            let t = Task::new(
                native("n", move |_| Ok(Value::I32(i))),
                Value::None,
            );
            t.start(&rt).unwrap();
            t
        })
        .collect();
    let list = tasks.clone();
    let waiter = Task::from_future(Box::pin(async move {
        ember_rt::await_multiple(&list).await?;
        let all = ember_rt::await_results(&list).await?;
        Ok(Value::Array(all))
    }));
    waiter.start(&rt).unwrap();
    let out = waiter.join().unwrap();
    assert_eq!(out.as_array().unwrap().len(), 4);
    rt.shutdown();
}

#[test]
fn bind_only_executor_runs_pinned_tasks() {
    let rt = runtime(1);
    let id = rt.create_bind_only_executor(2, false).unwrap();
    let task = Task::new(native("pinned", |_| Ok(Value::I32(1))), Value::None);
    task.set_worker_id(id).unwrap();
    task.start(&rt).unwrap();
    assert_eq!(task.join().unwrap(), Value::I32(1));

    // Re-pinning a pinned task is refused.
    let again = task.set_worker_id(id);
    assert!(again.is_err());

    rt.close_bind_only_executor(id).unwrap();
    assert!(rt.close_bind_only_executor(id).is_err());
    rt.shutdown();
}

#[test]
fn implicit_start_bind_executor() {
    let rt = runtime(1);
    let id = rt.create_bind_only_executor(1, true).unwrap();
    let task = Task::new(native("pinned", |_| Ok(Value::I32(3))), Value::None);
    task.set_worker_id(id).unwrap();
    task.start(&rt).unwrap();
    assert_eq!(task.join().unwrap(), Value::I32(3));
    rt.shutdown();
}

#[test]
fn binding_to_missing_executor_fails() {
    let rt = runtime(1);
    let task = Task::new(native("nope", |_| Ok(Value::None)), Value::None);
    task.set_worker_id(999).unwrap();
    let err = task.start(&rt).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    rt.shutdown();
}

#[test]
fn auto_bind_tasks_complete() {
    let rt = runtime(3);
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..16)
        .map(|_| {
            let c = counter.clone();
            let t = Task::new(
                native("tick", move |_| {
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(Value::None)
                }),
                Value::None,
            );
            t.auto_bind_worker_enable(true);
            t.start(&rt).unwrap();
            t
        })
        .collect();
    for t in tasks {
        t.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 16);
    rt.shutdown();
}

#[test]
fn reduce_executor_leaves_pool_working() {
    let rt = runtime(4);
    rt.reduce_executor(2).unwrap();
    // Remaining workers still execute tasks.
    let task = rt
        .spawn(native("alive", |_| Ok(Value::I32(1))), Value::None)
        .unwrap();
    assert_eq!(task.join().unwrap(), Value::I32(1));
    rt.shutdown();
}

#[test]
fn await_no_tasks_returns_when_idle() {
    let rt = runtime(2);
    for _ in 0..8 {
        rt.spawn(native("quick", |_| Ok(Value::None)), Value::None)
            .unwrap();
    }
    rt.await_no_tasks();
    rt.shutdown();
}

#[test]
fn task_local_environment() {
    let rt = runtime(1);
    let task = Task::with_options(
        native("uses_local", |_| {
            let env = ember_rt::task_local().expect("task local configured");
            env.set("k", Value::I32(1));
            Ok(env.get("k").unwrap_or(Value::None))
        }),
        Value::None,
        TaskOptions {
            use_task_local: true,
            ..Default::default()
        },
    );
    task.start(&rt).unwrap();
    assert_eq!(task.join().unwrap(), Value::I32(1));
    rt.shutdown();
}

#[test]
fn yield_now_round_trips() {
    let rt = runtime(1);
    let task = Task::from_future(Box::pin(async {
        for _ in 0..10 {
            ember_rt::yield_now().await?;
        }
        Ok(Value::Bool(ember_rt::is_task()))
    }));
    task.start(&rt).unwrap();
    assert_eq!(task.join().unwrap(), Value::Bool(true));
    assert!(!ember_rt::is_task());
    rt.shutdown();
}
