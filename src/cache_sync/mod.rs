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

//! The Cache Sync State Machine (C9, §4.6): rebuilds the KV cache and
//! bloom filter from the relational store, enforcing at most one active
//! sync and at most one queued follow-up.

use crate::cache::KvCache;
use crate::metrics::MetricsSink;
use crate::shutdown::Shutdown;
use crate::store::{Store, StoreError};
use futures::StreamExt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_QUEUED: u8 = 2;

/// One full sweep of the relational store into the KV cache, followed by a
/// bloom filter rebuild (§4.6 sync task algorithm).
async fn run_sync(
    store: &Store,
    kv: &KvCache,
    bloom: &crate::cache::BloomIndex,
    shutdown: Shutdown,
    use_bloom: bool,
) -> Result<u64, StoreError> {
    let mut stream = Box::pin(store.stream_entry_streams(shutdown.clone()));
    let mut synced: u64 = 0;

    while let Some(item) = stream.next().await {
        let entry_stream = item?;
        if let Err(e) = kv.set(&entry_stream.source_url, &entry_stream.ids_raw) {
            log::error!("cache sync failed to stage '{}': {e}", entry_stream.source_url);
            continue;
        }
        synced += 1;
    }

    if let Err(e) = kv.commit() {
        log::error!("cache sync failed to commit the final batch: {e}");
    }

    if use_bloom {
        match kv.scan_keys(&shutdown) {
            Ok(keys) => {
                let expected = keys.len();
                bloom.rebuild(keys, expected);
            }
            Err(e) => log::error!("cache sync could not rebuild the bloom filter: {e}"),
        }
    }

    Ok(synced)
}

/// Owns the Idle/Running/Queued state and the single `Arc<CacheSync>`
/// instance the rest of the app talks to (§4.6).
pub struct CacheSync {
    state: AtomicU8,
    store: Arc<Store>,
    kv: Arc<KvCache>,
    bloom: Arc<crate::cache::BloomIndex>,
    use_bloom: bool,
    metrics: Arc<dyn MetricsSink>,
    shutdown: Shutdown,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl CacheSync {
    pub fn new(
        store: Arc<Store>,
        kv: Arc<KvCache>,
        bloom: Arc<crate::cache::BloomIndex>,
        use_bloom: bool,
        metrics: Arc<dyn MetricsSink>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(STATE_IDLE),
            store,
            kv,
            bloom,
            use_bloom,
            metrics,
            shutdown,
            in_flight: Mutex::new(None),
        })
    }

    /// Requests a sync. Returns `true` if the request caused (or will
    /// cause) a sync to run, `false` if it was dropped (§4.6 transition
    /// table).
    ///
    /// - `Idle`, `immediate = true`: runs the sync synchronously, inline,
    ///   and only returns once it has finished.
    /// - `Idle`, `immediate = false`: spawns the sync task in the
    ///   background and returns immediately.
    /// - `Running`, `immediate = false` -> `Queued`: one follow-up is
    ///   registered.
    /// - `Running`, `immediate = true`: returns `false`, "could not
    ///   schedule immediate".
    /// - `Queued`, any: returns `false`, the request is dropped.
    pub async fn schedule(self: &Arc<Self>, immediate: bool) -> bool {
        loop {
            match self.state.load(Ordering::SeqCst) {
                STATE_IDLE => {
                    if self
                        .state
                        .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        if immediate {
                            self.run_and_report().await;
                            self.finish_run();
                        } else {
                            self.spawn_sync();
                        }
                        return true;
                    }
                    // lost the race to another scheduler; retry against the new state
                }
                STATE_RUNNING => {
                    if immediate {
                        return false;
                    }
                    return self
                        .state
                        .compare_exchange(STATE_RUNNING, STATE_QUEUED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                }
                STATE_QUEUED | _ => return false,
            }
        }
    }

    fn spawn_sync(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_and_report().await;
            this.finish_run();
        });
        *self.in_flight.lock().unwrap() = Some(handle);
    }

    async fn run_and_report(&self) {
        let outcome = run_sync(&self.store, &self.kv, &self.bloom, self.shutdown.clone(), self.use_bloom).await;
        match outcome {
            Ok(synced) => self.metrics.cache_sync_completed(synced),
            Err(e) => log::error!("cache sync aborted: {e}"),
        }
    }

    fn finish_run(self: &Arc<Self>) {
        // Running -> Queued->Running (rerun) or Running -> Idle.
        if self
            .state
            .compare_exchange(STATE_QUEUED, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.spawn_sync();
            return;
        }
        self.state
            .compare_exchange(STATE_RUNNING, STATE_IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .ok();
    }

    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_IDLE
    }

    /// Waits for whatever sync is currently in flight to finish. Used by
    /// `AppContext` shutdown so a running sync isn't silently abandoned.
    pub async fn join(&self) {
        let handle = self.in_flight.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::BloomIndex;
    use crate::config::CacheConfig;
    use crate::entry::Entry;
    use crate::url::NormalizedUrl;
    use std::time::Duration;
    use uuid::Uuid;

    async fn wire() -> (Arc<CacheSync>, Arc<Store>, Arc<KvCache>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let kv = Arc::new(KvCache::open(&CacheConfig { in_memory: true, ..Default::default() }).unwrap());
        let bloom = Arc::new(BloomIndex::empty());
        let shutdown = Shutdown::new();
        let sync = CacheSync::new(
            Arc::clone(&store),
            Arc::clone(&kv),
            bloom,
            true,
            Arc::new(crate::metrics::NoopMetricsSink),
            shutdown,
        );
        (sync, store, kv)
    }

    #[tokio::test]
    async fn immediate_schedule_from_idle_runs_synchronously() {
        let (sync, store, kv) = wire().await;
        let process_id = Uuid::new_v4();
        let entry = Entry::builder(NormalizedUrl::parse("https://example.com/").unwrap(), "oisd", process_id).build();
        store.batch_upsert(&[entry]).await.unwrap();

        let scheduled = sync.schedule(true).await;
        assert!(scheduled);
        assert!(sync.is_idle());
        assert!(kv.get("https://example.com/").unwrap().is_some());
    }

    #[tokio::test]
    async fn immediate_schedule_while_running_is_refused() {
        let (sync, _store, _kv) = wire().await;
        // Force into Running without completing, by scheduling a
        // background sync first.
        let scheduled = sync.schedule(false).await;
        assert!(scheduled);
        let refused = sync.schedule(true).await;
        assert!(!refused);
    }

    #[tokio::test]
    async fn queued_request_is_dropped() {
        let (sync, _store, _kv) = wire().await;
        assert!(sync.schedule(false).await);
        // Depending on scheduling, the background task may already be
        // Idle again by the time we get here; only assert the no-drop
        // contract when we can observe the Running state directly.
        if !sync.is_idle() {
            let queued = sync.schedule(false).await;
            assert!(queued);
            let dropped = sync.schedule(false).await;
            assert!(!dropped);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        sync.join().await;
    }
}
