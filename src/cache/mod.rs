// Copyright 2024 Felix Engl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The KV cache half of C8 (§4.5): an embedded key-value engine (RocksDB,
//! the "badger"-class engine named in §6.1) mapping `source_url` to a
//! comma-joined id list. Calls are synchronous, the way the teacher's own
//! embedded-database layer calls RocksDB directly from async code without
//! wrapping it in `spawn_blocking`.

mod bloom;
mod error;

pub use bloom::BloomIndex;
pub use error::CacheError;

use crate::config::CacheConfig;
use crate::shutdown::Shutdown;
use rocksdb::{IteratorMode, Options, ReadOptions, WriteBatch, DB};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Above this many buffered bytes a `set` proactively commits the pending
/// batch before continuing, standing in for the engine signalling "write
/// batch too large" (§4.5).
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

pub struct KvCache {
    db: DB,
    pending: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    pending_bytes: AtomicUsize,
    /// Set when `config.in_memory` picked a throwaway directory under
    /// the system temp root rather than a caller-owned `badger_path`
    /// (rocksdb has no true in-memory mode); removed on drop so repeated
    /// opens in tests and short-lived processes don't leak directories.
    owned_temp_dir: Option<std::path::PathBuf>,
}

impl KvCache {
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let (path, owned_temp_dir) = if config.in_memory {
            let path = std::env::temp_dir().join(format!("vigil-kv-{}", Uuid::new_v4()));
            (path.clone(), Some(path))
        } else {
            (std::path::PathBuf::from(&config.badger_path), None)
        };

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open(&opts, &path).map_err(|source| CacheError::Open {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self {
            db,
            pending: Mutex::new(Vec::new()),
            pending_bytes: AtomicUsize::new(0),
            owned_temp_dir,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.db.get(key.as_bytes()).map_err(CacheError::Get)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| CacheError::InvalidUtf8),
            None => Ok(None),
        }
    }

    /// Buffers `key -> ids_raw`; transparently flushes the pending batch
    /// first if adding this entry would push it past the size ceiling.
    pub fn set(&self, key: &str, ids_raw: &str) -> Result<(), CacheError> {
        let entry_bytes = key.len() + ids_raw.len();
        let mut pending = self.pending.lock().unwrap();
        if self.pending_bytes.load(Ordering::SeqCst) + entry_bytes > MAX_PENDING_BYTES {
            self.flush_locked(&mut pending)?;
        }
        pending.push((key.as_bytes().to_vec(), ids_raw.as_bytes().to_vec()));
        self.pending_bytes.fetch_add(entry_bytes, Ordering::SeqCst);
        Ok(())
    }

    /// Finalizes any pending writes.
    pub fn commit(&self) -> Result<(), CacheError> {
        let mut pending = self.pending.lock().unwrap();
        self.flush_locked(&mut pending)
    }

    fn flush_locked(&self, pending: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), CacheError> {
        if pending.is_empty() {
            return Ok(());
        }
        let result = self.write_once(pending);
        if let Err(first) = result {
            log::warn!(
                "cache batch of {} entries failed to commit ({first}); retrying once",
                pending.len()
            );
            if let Err(second) = self.write_once(pending) {
                log::error!(
                    "cache batch of {} entries failed after retry, dropping: {second}",
                    pending.len()
                );
                pending.clear();
                self.pending_bytes.store(0, Ordering::SeqCst);
                return Err(CacheError::Commit(second));
            }
        }
        pending.clear();
        self.pending_bytes.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn write_once(&self, items: &[(Vec<u8>, Vec<u8>)]) -> Result<(), rocksdb::Error> {
        let mut batch = WriteBatch::default();
        for (key, value) in items {
            batch.put(key, value);
        }
        self.db.write(batch)
    }

    /// Keys-only scan in unspecified order, checked against `shutdown`
    /// between items so a long rebuild can be aborted.
    pub fn scan_keys(&self, shutdown: &Shutdown) -> Result<Vec<String>, CacheError> {
        if let Err(e) = self.db.flush() {
            log::warn!("failed to flush cache before scanning: {e}");
        }
        let mut opts = ReadOptions::default();
        opts.fill_cache(false);

        let mut keys = Vec::new();
        for item in self.db.iterator_opt(IteratorMode::Start, opts) {
            if shutdown.is_shutdown() {
                return Err(CacheError::Cancelled);
            }
            let (key, _value) = item.map_err(CacheError::Iterate)?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    pub fn len(&self, shutdown: &Shutdown) -> Result<usize, CacheError> {
        Ok(self.scan_keys(shutdown)?.len())
    }
}

impl Drop for KvCache {
    fn drop(&mut self) {
        if let Some(dir) = &self.owned_temp_dir {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                log::warn!("failed to remove temporary in-memory cache directory {dir:?}: {e}");
            }
        }
    }
}
