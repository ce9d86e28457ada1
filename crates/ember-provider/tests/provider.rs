// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Provider pipeline: precompiled round-trip, hash dedup, initializers,
//! live watching.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_provider::{
    write_precompiled, LanguageHandler, LanguageProvider, PrecompiledFn, PrecompiledHandler,
};
use ember_registry::{FuncBody, FuncCode, IlBackend};
use ember_rt::{Runtime, RuntimeConfig};
use ember_value::{Callable, CallFuture, Value};

/// Interprets "bytecode" as: result = first byte. Counts executions.
struct ByteBackend {
    executions: AtomicUsize,
}

impl IlBackend for ByteBackend {
    fn execute(&self, body: &FuncBody, _args: Value) -> CallFuture {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let out = match &body.code {
            FuncCode::Il { bytecode, .. } => bytecode.first().copied().unwrap_or(0) as i32,
            FuncCode::Native(_) => -1,
        };
        Box::pin(std::future::ready(Ok(Value::I32(out))))
    }
}

fn record(symbol: &[u8], code: &[u8]) -> PrecompiledFn {
    PrecompiledFn {
        symbol: symbol.to_vec(),
        cross_compiler_version: None,
        bytecode: code.to_vec(),
        is_cheap: false,
    }
}

fn runtime_with_backend() -> (Runtime, Arc<ByteBackend>) {
    let rt = Runtime::with_config(RuntimeConfig {
        workers: 2,
        eager_timer: false,
    })
    .unwrap();
    let backend = Arc::new(ByteBackend {
        executions: AtomicUsize::new(0),
    });
    rt.env().symbols.set_backend(backend.clone());
    (rt, backend)
}

fn call_symbol(rt: &Runtime, name: &str) -> Option<i32> {
    let handle = rt.env().symbols.resolve(name)?;
    let task = ember_rt::Task::from_future(handle.call(Value::None));
    task.start(rt).unwrap();
    match task.join() {
        Ok(Value::I32(v)) => Some(v),
        _ => None,
    }
}

#[test]
fn precompiled_round_trip_with_hash_dedup() {
    let (rt, _backend) = runtime_with_backend();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("lib.emberc");
    std::fs::write(&file, write_precompiled(&[record(b"f", &[1])])).unwrap();

    let handler = PrecompiledHandler::new(&rt);
    let provider = LanguageProvider::new(rt.env(), dir.path(), false);
    provider.register_language("emberc", handler.clone());

    // Init pass binds the symbol in one apply.
    provider.run_once();
    assert_eq!(call_symbol(&rt, "f"), Some(1));

    // Identical content: the re-read stages nothing.
    let unchanged = handler.handle_changed(&file).unwrap();
    assert!(unchanged.is_empty());

    // New bytecode: rebinding becomes visible; the old body frees once
    // the last holder drops.
    let old_body = rt.env().symbols.resolve("f").unwrap().body().unwrap();
    std::fs::write(&file, write_precompiled(&[record(b"f", &[2])])).unwrap();
    let mut changed = handler.handle_changed(&file).unwrap();
    assert_eq!(changed.len(), 1);
    changed.apply(&rt.env().symbols);
    assert_eq!(call_symbol(&rt, "f"), Some(2));
    assert_eq!(Arc::strong_count(&old_body), 1);
    drop(old_body);

    rt.shutdown();
}

#[test]
fn removed_file_unloads_its_symbols() {
    let (rt, _backend) = runtime_with_backend();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("mod.emberc");
    std::fs::write(
        &file,
        write_precompiled(&[record(b"a", &[10]), record(b"b", &[20])]),
    )
    .unwrap();

    let handler = PrecompiledHandler::new(&rt);
    let provider = LanguageProvider::new(rt.env(), dir.path(), false);
    provider.register_language("emberc", handler.clone());
    provider.run_once();
    assert_eq!(call_symbol(&rt, "a"), Some(10));
    assert_eq!(call_symbol(&rt, "b"), Some(20));

    let mut removal = handler.handle_removed(&file).unwrap();
    assert_eq!(removal.len(), 2);
    removal.apply(&rt.env().symbols);
    assert!(rt.env().symbols.resolve("a").is_none());
    assert!(rt.env().symbols.resolve("b").is_none());
    rt.shutdown();
}

#[test]
fn vanished_symbols_unload_on_reread() {
    let (rt, _backend) = runtime_with_backend();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("mod.emberc");
    std::fs::write(
        &file,
        write_precompiled(&[record(b"keep", &[1]), record(b"drop", &[2])]),
    )
    .unwrap();

    let handler = PrecompiledHandler::new(&rt);
    let mut first = handler.handle_init(&file).unwrap();
    first.apply(&rt.env().symbols);
    assert!(rt.env().symbols.resolve("drop").is_some());

    // Rewrite without "drop": it must unload, "keep" stays unpatched.
    std::fs::write(&file, write_precompiled(&[record(b"keep", &[1])])).unwrap();
    let mut second = handler.handle_changed(&file).unwrap();
    assert_eq!(second.len(), 1);
    second.apply(&rt.env().symbols);
    assert!(rt.env().symbols.resolve("keep").is_some());
    assert!(rt.env().symbols.resolve("drop").is_none());
    rt.shutdown();
}

#[test]
fn initializer_symbols_run_and_stay_unregistered() {
    let (rt, backend) = runtime_with_backend();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("boot.emberc");

    let mut init_symbol = vec![0x02];
    init_symbol.extend_from_slice(b"boot");
    std::fs::write(
        &file,
        write_precompiled(&[record(&init_symbol, &[99]), record(b"g", &[5])]),
    )
    .unwrap();

    let handler = PrecompiledHandler::new(&rt);
    let mut patches = handler.handle_init(&file).unwrap();
    // The initializer already ran during the read.
    assert_eq!(backend.executions.load(Ordering::SeqCst), 1);
    assert_eq!(patches.len(), 1);
    patches.apply(&rt.env().symbols);
    assert_eq!(call_symbol(&rt, "g"), Some(5));
    assert!(rt.env().symbols.resolve("\u{2}boot").is_none());
    rt.shutdown();
}

#[test]
fn renamed_file_keeps_hash_state() {
    let (rt, _backend) = runtime_with_backend();
    let dir = tempfile::tempdir().unwrap();
    let old = dir.path().join("one.emberc");
    std::fs::write(&old, write_precompiled(&[record(b"h", &[7])])).unwrap();

    let handler = PrecompiledHandler::new(&rt);
    let mut first = handler.handle_init(&old).unwrap();
    first.apply(&rt.env().symbols);

    let new = dir.path().join("two.emberc");
    std::fs::rename(&old, &new).unwrap();
    // Same content under the new name: nothing re-stages.
    let renamed = handler.handle_renamed(&old, &new).unwrap();
    assert!(renamed.is_empty());
    rt.shutdown();
}

#[test]
fn live_watcher_applies_events() {
    let (rt, _backend) = runtime_with_backend();
    let dir = tempfile::tempdir().unwrap();

    let handler = PrecompiledHandler::new(&rt);
    let provider = LanguageProvider::new(rt.env(), dir.path(), true);
    provider.register_language("emberc", handler);
    provider.start().unwrap();
    assert!(provider.is_watching());

    let file = dir.path().join("live.emberc");
    std::fs::write(&file, write_precompiled(&[record(b"live", &[3])])).unwrap();

    let mut bound = false;
    for _ in 0..200 {
        if rt.env().symbols.resolve("live").is_some() {
            bound = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(bound, "watcher never applied the new file");
    assert_eq!(call_symbol(&rt, "live"), Some(3));

    std::fs::remove_file(&file).unwrap();
    let mut unbound = false;
    for _ in 0..200 {
        if rt.env().symbols.resolve("live").is_none() {
            unbound = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(unbound, "watcher never applied the removal");

    provider.stop();
    assert!(!provider.is_watching());
    rt.shutdown();
}
