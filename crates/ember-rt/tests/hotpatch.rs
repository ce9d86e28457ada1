// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Hot patching under concurrent callers: no torn bindings, prompt
//! visibility.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_registry::FuncBody;
use ember_rt::{Runtime, RuntimeConfig, Task};
use ember_value::{native, Callable, Value};
use parking_lot::Mutex;

#[test]
fn concurrent_callers_observe_old_or_new_only() {
    let rt = Runtime::with_config(RuntimeConfig {
        workers: 4,
        eager_timer: false,
    })
    .unwrap();
    let symbols = &rt.env().symbols;
    symbols.register_native("f", native("f", |_| Ok(Value::I32(1))));
    let handle = symbols.handle("f");

    let observations: Arc<Mutex<Vec<(Instant, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let deadline = Instant::now() + Duration::from_millis(100);

    let mut callers = Vec::new();
    for _ in 0..4 {
        let handle = handle.clone();
        let observations = observations.clone();
        let task = Task::from_future(Box::pin(async move {
            while Instant::now() < deadline {
                let out = handle.call(Value::None).await?;
                observations.lock().push((Instant::now(), out.as_i64()? as i32));
                ember_rt::yield_now().await?;
            }
            Ok(Value::None)
        }));
        task.start(&rt).unwrap();
        callers.push(task);
    }

    std::thread::sleep(Duration::from_millis(50));
    let patched_at = Instant::now();
    symbols.hot_patch(
        "f",
        Arc::new(FuncBody::native(native("f", |_| Ok(Value::I32(2))))),
    );

    for task in callers {
        task.join().unwrap();
    }

    let observations = observations.lock();
    assert!(!observations.is_empty());
    // Never a torn value.
    assert!(observations.iter().all(|&(_, v)| v == 1 || v == 2));
    // Both bindings were observed around the patch.
    assert!(observations.iter().any(|&(_, v)| v == 1));
    assert!(observations.iter().any(|&(_, v)| v == 2));
    // Shortly after the patch no caller sees the old body.
    let epsilon = Duration::from_millis(20);
    assert!(observations
        .iter()
        .filter(|(at, _)| *at > patched_at + epsilon)
        .all(|&(_, v)| v == 2));

    rt.shutdown();
}

#[test]
fn unload_is_observed_by_held_references() {
    let rt = Runtime::with_config(RuntimeConfig {
        workers: 2,
        eager_timer: false,
    })
    .unwrap();
    let symbols = &rt.env().symbols;
    symbols.register_native("g", native("g", |_| Ok(Value::I32(1))));
    let handle = symbols.handle("g");

    symbols.unload("g");
    let task = Task::from_future(handle.call(Value::None));
    task.start(&rt).unwrap();
    let err = task.join().unwrap_err();
    assert_eq!(err.kind(), ember_value::ErrorKind::FunctionNotFound);
    rt.shutdown();
}
