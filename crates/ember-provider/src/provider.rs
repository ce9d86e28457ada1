// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Watcher glue.
//!
//! File events map onto handler calls keyed by extension
//! (case-sensitive). In init mode the resulting patch lists aggregate;
//! `run_once` finishes init by collecting each handler's
//! init-complete list and applying everything in one step. Afterwards
//! every event applies immediately after handling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ember_registry::{Environment, PatchList};
use ember_value::{RtError, RtResult};
use log::{debug, warn};
use notify::event::{EventKind, ModifyKind};
use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};

use crate::handler::LanguageHandler;

struct ProviderInner {
    env: Arc<Environment>,
    root: PathBuf,
    recursive: bool,
    languages: RwLock<HashMap<String, Arc<dyn LanguageHandler>>>,
    /// Aggregated staging during init mode.
    patches: Mutex<PatchList>,
    init_mode: AtomicBool,
}

impl ProviderInner {
    fn handler_for(&self, path: &Path) -> Option<Arc<dyn LanguageHandler>> {
        let ext = path.extension()?.to_str()?;
        self.languages.read().get(ext).cloned()
    }

    fn stage_or_apply(&self, result: RtResult<PatchList>, origin: &Path) {
        let list = match result {
            Ok(list) => list,
            Err(e) => {
                warn!("handler failed for {}: {e}", origin.display());
                return;
            }
        };
        let mut patches = self.patches.lock();
        if let Err(e) = patches.add_patches(list) {
            warn!("patch conflict from {}: {e}", origin.display());
        }
        if !self.init_mode.load(Ordering::Acquire) {
            patches.apply(&self.env.symbols);
        }
    }

    fn on_created(&self, path: &Path) {
        let Some(handler) = self.handler_for(path) else {
            return;
        };
        let result = if self.init_mode.load(Ordering::Acquire) {
            handler.handle_init(path)
        } else {
            handler.handle_create(path)
        };
        self.stage_or_apply(result, path);
    }

    fn on_changed(&self, path: &Path) {
        if let Some(handler) = self.handler_for(path) {
            self.stage_or_apply(handler.handle_changed(path), path);
        }
    }

    fn on_renamed(&self, old: &Path, new: &Path) {
        if let Some(handler) = self.handler_for(new) {
            self.stage_or_apply(handler.handle_renamed(old, new), new);
        }
    }

    fn on_removed(&self, path: &Path) {
        if let Some(handler) = self.handler_for(path) {
            self.stage_or_apply(handler.handle_removed(path), path);
        }
    }

    fn dispatch(&self, event: notify::Event) {
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.on_created(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                if event.paths.len() >= 2 {
                    self.on_renamed(&event.paths[0], &event.paths[1]);
                } else {
                    // Half of a rename pair; treat as content change.
                    for path in &event.paths {
                        if path.exists() {
                            self.on_changed(path);
                        } else {
                            self.on_removed(path);
                        }
                    }
                }
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.on_changed(path);
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.on_removed(path);
                }
            }
            _ => {}
        }
    }

    fn scan_dir(&self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("scan of {} failed: {e}", dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if self.recursive {
                    self.scan_dir(&path);
                }
            } else {
                self.on_created(&path);
            }
        }
    }
}

pub struct LanguageProvider {
    inner: Arc<ProviderInner>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl LanguageProvider {
    pub fn new(env: &Arc<Environment>, path: impl Into<PathBuf>, include_sub_directories: bool) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                env: env.clone(),
                root: path.into(),
                recursive: include_sub_directories,
                languages: RwLock::new(HashMap::new()),
                patches: Mutex::new(PatchList::new()),
                init_mode: AtomicBool::new(true),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Extensions compare case-sensitively; re-registering replaces.
    pub fn register_language(&self, extension: &str, handler: Arc<dyn LanguageHandler>) {
        self.inner
            .languages
            .write()
            .insert(extension.to_string(), handler);
    }

    pub fn unregister_language(&self, extension: &str) {
        self.inner.languages.write().remove(extension);
    }

    /// Scan the directory once. The first call completes init: every
    /// handler's init-complete list joins the aggregate, and the whole
    /// batch becomes visible in one apply.
    pub fn run_once(&self) {
        let inner = &self.inner;
        inner.scan_dir(&inner.root);
        if inner.init_mode.load(Ordering::Acquire) {
            let handlers: Vec<_> = inner.languages.read().values().cloned().collect();
            let mut patches = inner.patches.lock();
            for handler in handlers {
                match handler.handle_init_complete() {
                    Ok(list) => {
                        if let Err(e) = patches.add_patches(list) {
                            warn!("init-complete conflict: {e}");
                        }
                    }
                    Err(e) => warn!("init-complete failed: {e}"),
                }
            }
            patches.apply(&inner.env.symbols);
            inner.init_mode.store(false, Ordering::Release);
            debug!("provider init complete for {}", inner.root.display());
        }
    }

    /// `run_once`, then watch for live events.
    pub fn start(&self) -> RtResult<()> {
        self.run_once();
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => inner.dispatch(event),
                Err(e) => warn!("watch error: {e}"),
            }
        })
        .map_err(|e| RtError::internal(format!("watcher: {e}")))?;
        let mode = if self.inner.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&self.inner.root, mode)
            .map_err(|e| RtError::internal(format!("watch {}: {e}", self.inner.root.display())))?;
        *slot = Some(watcher);
        debug!("watching {}", self.inner.root.display());
        Ok(())
    }

    pub fn stop(&self) {
        *self.watcher.lock() = None;
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }
}
