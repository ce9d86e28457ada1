// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Precompiled source handler.
//!
//! Binary format, little-endian throughout:
//! `u64 function_count`, then per function: length-prefixed symbol,
//! length-prefixed cross-compiler version, length-prefixed bytecode,
//! `u8 is_cheap`. A symbol whose first byte is `0x02` is an
//! initializer: executed immediately, never registered. Re-reads skip
//! symbols whose bytecode hash is unchanged; symbols missing from a
//! re-read unload.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ember_registry::{FuncBody, PatchList};
use ember_rt::{Runtime, Task};
use ember_value::{ErrorKind, RtError, RtResult, Value};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::handler::LanguageHandler;

const INITIALIZER_MARK: u8 = 0x02;

/// One decoded function record.
#[derive(Debug)]
pub struct PrecompiledFn {
    pub symbol: Vec<u8>,
    pub cross_compiler_version: Option<String>,
    pub bytecode: Vec<u8>,
    pub is_cheap: bool,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u64(&mut self) -> RtResult<u64> {
        let end = self.pos + 8;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| RtError::new(ErrorKind::InvalidInput, "truncated length field"))?;
        self.pos = end;
        Ok(u64::from_le_bytes(slice.try_into().unwrap()))
    }

    fn u8(&mut self) -> RtResult<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| RtError::new(ErrorKind::InvalidInput, "truncated flag"))?;
        self.pos += 1;
        Ok(b)
    }

    fn blob(&mut self) -> RtResult<Vec<u8>> {
        let len = self.u64()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| RtError::new(ErrorKind::InvalidInput, "truncated payload"))?;
        let out = self.bytes[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }
}

/// Decode a whole precompiled file.
pub fn parse_precompiled(bytes: &[u8]) -> RtResult<Vec<PrecompiledFn>> {
    let mut reader = Reader { bytes, pos: 0 };
    let count = reader.u64()?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let symbol = reader.blob()?;
        let version = reader.blob()?;
        let bytecode = reader.blob()?;
        let is_cheap = reader.u8()? != 0;
        let cross_compiler_version = if version.is_empty() {
            None
        } else {
            Some(String::from_utf8(version).map_err(|_| {
                RtError::new(ErrorKind::InvalidInput, "version is not UTF-8")
            })?)
        };
        out.push(PrecompiledFn {
            symbol,
            cross_compiler_version,
            bytecode,
            is_cheap,
        });
    }
    Ok(out)
}

/// Encode records in the same format. Used by build tooling and tests.
pub fn write_precompiled(fns: &[PrecompiledFn]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(fns.len() as u64).to_le_bytes());
    for f in fns {
        for blob in [
            f.symbol.as_slice(),
            f.cross_compiler_version
                .as_deref()
                .map(str::as_bytes)
                .unwrap_or(&[]),
            f.bytecode.as_slice(),
        ] {
            out.extend_from_slice(&(blob.len() as u64).to_le_bytes());
            out.extend_from_slice(blob);
        }
        out.push(f.is_cheap as u8);
    }
    out
}

type SymbolHashes = HashMap<String, [u8; 32]>;

pub struct PrecompiledHandler {
    rt: Runtime,
    /// Per-file symbol → bytecode hash, for re-read dedup.
    declared: Mutex<HashMap<PathBuf, SymbolHashes>>,
}

impl PrecompiledHandler {
    pub fn new(rt: &Runtime) -> Arc<Self> {
        Arc::new(Self {
            rt: rt.clone(),
            declared: Mutex::new(HashMap::new()),
        })
    }

    /// Run an initializer body to completion on the runtime.
    fn run_initializer(&self, body: FuncBody) -> RtResult<()> {
        let env = self.rt.env().clone();
        let body = Arc::new(body);
        let task = Task::from_future(Box::pin(async move {
            env.symbols.execute_detached(body, Value::None).await
        }));
        task.start(&self.rt)?;
        task.join().map(|_| ())
    }

    fn read_file(&self, path: &Path) -> RtResult<PatchList> {
        let bytes = std::fs::read(path).map_err(RtError::system)?;
        let functions = parse_precompiled(&bytes)?;

        let mut declared = self.declared.lock();
        let local = declared.entry(path.to_path_buf()).or_default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut patches = PatchList::new();

        for f in functions {
            if f.symbol.first() == Some(&INITIALIZER_MARK) {
                let body = FuncBody::il(f.bytecode, f.cross_compiler_version, f.is_cheap);
                if let Err(e) = self.run_initializer(body) {
                    warn!("initializer in {} failed: {e}", path.display());
                }
                continue;
            }

            let symbol = String::from_utf8(f.symbol)
                .map_err(|_| RtError::new(ErrorKind::Symbol, "symbol is not UTF-8"))?;
            let hash = *blake3::hash(&f.bytecode).as_bytes();

            seen.insert(symbol.clone());
            if local.get(&symbol) == Some(&hash) {
                // Unchanged since the last read of this file.
                continue;
            }
            local.insert(symbol.clone(), hash);
            patches.add_patch(
                &symbol,
                Some(Arc::new(FuncBody::il(
                    f.bytecode,
                    f.cross_compiler_version,
                    f.is_cheap,
                ))),
            )?;
        }

        // Symbols this file no longer defines unload. Collect first;
        // predicates cannot remove from the map mid-iteration.
        let vanished: Vec<String> = local
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in vanished {
            local.remove(&name);
            patches.add_patch(&name, None)?;
        }

        debug!("{}: {} staged patches", path.display(), patches.len());
        Ok(patches)
    }
}

impl LanguageHandler for PrecompiledHandler {
    fn handle_init(&self, path: &Path) -> RtResult<PatchList> {
        self.read_file(path)
    }

    fn handle_init_complete(&self) -> RtResult<PatchList> {
        Ok(PatchList::new())
    }

    fn handle_create(&self, path: &Path) -> RtResult<PatchList> {
        self.read_file(path)
    }

    fn handle_renamed(&self, old: &Path, new: &Path) -> RtResult<PatchList> {
        {
            let mut declared = self.declared.lock();
            if let Some(hashes) = declared.remove(old) {
                declared.insert(new.to_path_buf(), hashes);
            }
        }
        self.read_file(new)
    }

    fn handle_changed(&self, path: &Path) -> RtResult<PatchList> {
        self.read_file(path)
    }

    fn handle_removed(&self, path: &Path) -> RtResult<PatchList> {
        let mut patches = PatchList::new();
        if let Some(hashes) = self.declared.lock().remove(path) {
            for symbol in hashes.keys() {
                patches.add_patch(symbol, None)?;
            }
        }
        Ok(patches)
    }
}
