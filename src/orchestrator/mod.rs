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

//! The ingestion orchestrator (§4.9, inside C6): fetch -> optional
//! response-cache -> parallel parse -> Collector.submit, fanned out across
//! providers and followed by a cache-sync request. Acquiring and
//! releasing the Process Manager's run lock is the caller's job (the
//! Scheduler, or the HTTP trigger handler) so that a bulk startup run can
//! cover many providers under one process id while an on-demand run
//! covers one.

use crate::cache_sync::CacheSync;
use crate::collector::{Collector, CollectorError};
use crate::metrics::MetricsSink;
use crate::parser::{self, EntrySink, ParserConfig};
use crate::provider::{Provider, ProviderError};
use crate::response_cache::ResponseCache;
use crate::shutdown::Shutdown;
use crate::store::Store;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Everything that can go wrong running one provider end to end; collapsed
/// to a string in [`ProviderRunOutcome`] since callers only need to report
/// it, not branch on it.
#[derive(Debug, Error)]
enum RunProviderError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
}

/// How an ingestion run should affect the KV cache / bloom filter
/// afterward (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCacheMode {
    /// Run the sync inline before returning.
    Immediate,
    /// Queue a background sync; don't wait for it.
    Deferred,
    /// Leave the cache as-is.
    None,
}

/// The result of fetching, parsing, and submitting one provider's feed.
#[derive(Debug, Clone)]
pub struct ProviderRunOutcome {
    pub provider: &'static str,
    pub processed: u64,
    /// Rows tombstoned by [`Store::soft_delete_older`] for this provider
    /// after a successful run (§4.2, §8.4 scenario 2); zero on failure,
    /// since a failed run never reaches the retention step.
    pub removed: u64,
    pub error: Option<String>,
}

pub struct Orchestrator {
    collector: Arc<Collector>,
    cache_sync: Arc<CacheSync>,
    store: Arc<Store>,
    response_cache: Option<Arc<ResponseCache>>,
    /// §6.1 `app.environment`: only `development` replays a cached payload
    /// across runs; outside development the cache is still written (so a
    /// later switch to `development` has something to replay) but never
    /// read back, so nothing is "retained" for reuse.
    retain_response_cache: bool,
    client: reqwest::Client,
    parser_config: ParserConfig,
    max_concurrent_providers: usize,
    shutdown: Shutdown,
    metrics: Arc<dyn MetricsSink>,
}

impl Orchestrator {
    pub fn new(
        collector: Arc<Collector>,
        cache_sync: Arc<CacheSync>,
        store: Arc<Store>,
        response_cache: Option<Arc<ResponseCache>>,
        retain_response_cache: bool,
        client: reqwest::Client,
        parser_config: ParserConfig,
        max_concurrent_providers: usize,
        shutdown: Shutdown,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            collector,
            cache_sync,
            store,
            response_cache,
            retain_response_cache,
            client,
            parser_config,
            max_concurrent_providers,
            shutdown,
            metrics,
        }
    }

    /// Runs `providers` under the already-acquired `process_id`, bounded
    /// by `max_concurrent_providers` (0 means unbounded), then drives the
    /// cache sync state machine according to `mode`.
    pub async fn run(
        &self,
        process_id: Uuid,
        providers: &[Arc<dyn Provider>],
        mode: UpdateCacheMode,
    ) -> Vec<ProviderRunOutcome> {
        let semaphore = (self.max_concurrent_providers > 0)
            .then(|| Arc::new(Semaphore::new(self.max_concurrent_providers)));

        let mut tasks = JoinSet::new();
        for provider in providers {
            let provider = Arc::clone(provider);
            let collector = Arc::clone(&self.collector);
            let store = Arc::clone(&self.store);
            let client = self.client.clone();
            let response_cache = self.response_cache.clone();
            let retain_response_cache = self.retain_response_cache;
            let parser_config = self.parser_config;
            let shutdown = self.shutdown.clone();
            let metrics = Arc::clone(&self.metrics);
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                run_one_provider(
                    provider.as_ref(),
                    process_id,
                    &collector,
                    &store,
                    &client,
                    response_cache.as_deref(),
                    retain_response_cache,
                    parser_config,
                    shutdown,
                    metrics.as_ref(),
                )
                .await
            });
        }

        let mut outcomes = Vec::with_capacity(providers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => log::error!("provider task panicked: {e}"),
            }
        }

        match mode {
            UpdateCacheMode::Immediate => {
                self.cache_sync.schedule(true).await;
            }
            UpdateCacheMode::Deferred => {
                self.cache_sync.schedule(false).await;
            }
            UpdateCacheMode::None => {}
        }

        outcomes
    }
}

async fn run_one_provider(
    provider: &dyn Provider,
    process_id: Uuid,
    collector: &Arc<Collector>,
    store: &Arc<Store>,
    client: &reqwest::Client,
    response_cache: Option<&ResponseCache>,
    retain_response_cache: bool,
    parser_config: ParserConfig,
    shutdown: Shutdown,
    metrics: &dyn MetricsSink,
) -> ProviderRunOutcome {
    let name = provider.name();
    collector.start(name, process_id);

    let outcome = run_one_provider_inner(
        provider,
        process_id,
        collector,
        client,
        response_cache,
        retain_response_cache,
        parser_config,
        shutdown,
    )
    .await;

    match outcome {
        Ok(processed) => {
            metrics.provider_run_completed(name, processed);
            // The sole retention mechanism (§4.2): anything this provider
            // didn't re-report under `process_id` is now stale.
            let removed = match store.soft_delete_older(name, process_id).await {
                Ok(removed) => removed,
                Err(e) => {
                    log::error!("soft delete of stale {name} rows failed: {e}");
                    0
                }
            };
            ProviderRunOutcome {
                provider: name,
                processed,
                removed,
                error: None,
            }
        }
        Err(e) => {
            metrics.provider_run_failed(name);
            let processed = collector.finish(name, process_id).await.unwrap_or(0);
            ProviderRunOutcome {
                provider: name,
                processed,
                removed: 0,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn run_one_provider_inner(
    provider: &dyn Provider,
    process_id: Uuid,
    collector: &Arc<Collector>,
    client: &reqwest::Client,
    response_cache: Option<&ResponseCache>,
    retain_response_cache: bool,
    parser_config: ParserConfig,
    shutdown: Shutdown,
) -> Result<u64, RunProviderError> {
    let name = provider.name();
    let raw = fetch_payload(provider, client, response_cache, retain_response_cache, process_id).await?;
    let normalized = provider.normalize_payload(&raw)?;
    let transform: Arc<dyn Fn(&str) -> crate::parser::LineResult + Send + Sync> =
        Arc::from(provider.line_transform(process_id));

    let reader = BufReader::new(std::io::Cursor::new(normalized.into_bytes()));
    let sink: Arc<dyn EntrySink> = Arc::clone(collector) as Arc<dyn EntrySink>;

    parser::run(reader, name, move |line: &str| transform(line), sink, parser_config, shutdown)
        .await
        .map_err(ProviderError::from)?;

    Ok(collector.finish(name, process_id).await?)
}

async fn fetch_payload(
    provider: &dyn Provider,
    client: &reqwest::Client,
    response_cache: Option<&ResponseCache>,
    retain_response_cache: bool,
    process_id: Uuid,
) -> Result<String, ProviderError> {
    let name = provider.name();

    if let Some(cache) = response_cache.filter(|_| retain_response_cache) {
        match cache.get(name).await {
            Ok(Some(cached)) => {
                return String::from_utf8(cached.payload).map_err(|_| ProviderError::Decode {
                    provider: name.to_string(),
                    message: "cached payload was not valid utf-8".to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => log::warn!("response cache read failed for {name}: {e}"),
        }
    }

    let raw = provider.fetch(client).await?;

    if let Some(cache) = response_cache {
        if let Err(e) = cache.put(name, raw.as_bytes(), process_id, format!("{name} fetch")).await {
            log::warn!("response cache write failed for {name}: {e}");
        }
    }

    Ok(raw)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::{BloomIndex, KvCache};
    use crate::config::CacheConfig;
    use crate::entry::Entry;
    use crate::parser::LineResult;
    use crate::store::Store;
    use crate::url::NormalizedUrl;
    use async_trait::async_trait;

    struct FixedProvider {
        name: &'static str,
        body: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Provider for FixedProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn source_url(&self) -> &str {
            "https://example.invalid/list.txt"
        }

        async fn fetch(&self, _client: &reqwest::Client) -> Result<String, ProviderError> {
            if self.fail {
                return Err(ProviderError::EmptyResponse {
                    provider: self.name.to_string(),
                });
            }
            Ok(self.body.to_string())
        }

        fn normalize_payload(&self, raw: &str) -> Result<String, ProviderError> {
            Ok(raw.to_string())
        }

        fn line_transform(&self, process_id: uuid::Uuid) -> Box<dyn Fn(&str) -> LineResult + Send + Sync> {
            let name = self.name;
            Box::new(move |line: &str| {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                let normalized = NormalizedUrl::parse(trimmed).map_err(|e| e.to_string())?;
                Ok(Some(Entry::builder(normalized, name, process_id).build()))
            })
        }
    }

    async fn wire() -> (Orchestrator, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let shutdown = Shutdown::new();
        let (collector, batch_rx) = Collector::new(10, shutdown.clone());
        let writer = Arc::clone(&collector).spawn_writer(
            Arc::clone(&store),
            Arc::new(crate::metrics::NoopMetricsSink),
            batch_rx,
        );
        std::mem::forget(writer);

        let kv = Arc::new(KvCache::open(&CacheConfig { in_memory: true, ..Default::default() }).unwrap());
        let bloom = Arc::new(BloomIndex::empty());
        let cache_sync = CacheSync::new(
            Arc::clone(&store),
            kv,
            bloom,
            false,
            Arc::new(crate::metrics::NoopMetricsSink),
            shutdown.clone(),
        );

        let orchestrator = Orchestrator::new(
            collector,
            cache_sync,
            Arc::clone(&store),
            None,
            true,
            reqwest::Client::new(),
            ParserConfig::new(Some(2), 10),
            0,
            shutdown,
            Arc::new(crate::metrics::NoopMetricsSink),
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn successful_run_persists_entries_and_reports_no_error() {
        let (orchestrator, store) = wire().await;
        let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(FixedProvider {
            name: "fixed",
            body: "https://a.example.com/\nhttps://b.example.com/\n",
            fail: false,
        })];

        let outcomes = orchestrator.run(Uuid::new_v4(), &providers, UpdateCacheMode::None).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].error.is_none());
        assert_eq!(outcomes[0].processed, 2);

        let hits = store
            .query_link(crate::entry::QueryType::Full, "https://a.example.com/")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    struct CountingProvider {
        name: &'static str,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn source_url(&self) -> &str {
            "https://example.invalid/list.txt"
        }

        async fn fetch(&self, _client: &reqwest::Client) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok("https://fresh.example.com/\n".to_string())
        }

        fn normalize_payload(&self, raw: &str) -> Result<String, ProviderError> {
            Ok(raw.to_string())
        }

        fn line_transform(&self, process_id: uuid::Uuid) -> Box<dyn Fn(&str) -> LineResult + Send + Sync> {
            let name = self.name;
            Box::new(move |line: &str| {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                let normalized = NormalizedUrl::parse(trimmed).map_err(|e| e.to_string())?;
                Ok(Some(Entry::builder(normalized, name, process_id).build()))
            })
        }
    }

    #[tokio::test]
    async fn development_replays_the_cached_response_instead_of_refetching() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(crate::response_cache::ResponseCache::new(
            camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
        ));
        cache
            .put("cached-provider", b"https://stale.example.com/\n", Uuid::new_v4(), "previous run")
            .await
            .unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let provider = CountingProvider {
            name: "cached-provider",
            calls: Arc::clone(&calls),
        };

        let raw = fetch_payload(&provider, &reqwest::Client::new(), Some(&cache), true, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(raw, "https://stale.example.com/\n");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_development_never_replays_a_cached_response() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(crate::response_cache::ResponseCache::new(
            camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
        ));
        cache
            .put("cached-provider", b"https://stale.example.com/\n", Uuid::new_v4(), "previous run")
            .await
            .unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let provider = CountingProvider {
            name: "cached-provider",
            calls: Arc::clone(&calls),
        };

        let raw = fetch_payload(&provider, &reqwest::Client::new(), Some(&cache), false, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(raw, "https://fresh.example.com/\n");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_without_panicking() {
        let (orchestrator, _store) = wire().await;
        let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(FixedProvider {
            name: "broken",
            body: "",
            fail: true,
        })];

        let outcomes = orchestrator.run(Uuid::new_v4(), &providers, UpdateCacheMode::None).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].error.is_some());
        assert_eq!(outcomes[0].processed, 0);
    }

    #[tokio::test]
    async fn reingest_under_new_process_id_soft_deletes_stale_rows() {
        let (orchestrator, store) = wire().await;
        let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(FixedProvider {
            name: "fixed",
            body: "https://a.example.com/\nhttps://b.example.com/\n",
            fail: false,
        })];

        let first = orchestrator.run(Uuid::new_v4(), &providers, UpdateCacheMode::None).await;
        assert_eq!(first[0].removed, 0);

        let stale_hits = store
            .query_link(crate::entry::QueryType::Full, "https://b.example.com/")
            .await
            .unwrap();
        let stale_id = stale_hits[0].0.id;

        let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(FixedProvider {
            name: "fixed",
            body: "https://a.example.com/\n",
            fail: false,
        })];
        let second = orchestrator.run(Uuid::new_v4(), &providers, UpdateCacheMode::None).await;
        assert!(second[0].error.is_none());
        assert_eq!(second[0].processed, 1);
        assert_eq!(second[0].removed, 1);

        // "b" is now tombstoned, so a lookup by source no longer finds it...
        let hits = store
            .query_link(crate::entry::QueryType::Full, "https://b.example.com/")
            .await
            .unwrap();
        assert!(hits.is_empty());
        // ...though the row itself still exists with `deleted_at` set.
        let row = store.get_entry_by_id(stale_id).await.unwrap().unwrap();
        assert!(row.deleted_at.is_some());

        // "a" was re-reported under the new process id, so it survives.
        let hits = store
            .query_link(crate::entry::QueryType::Full, "https://a.example.com/")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn immediate_cache_mode_populates_kv_before_returning() {
        let (orchestrator, _store) = wire().await;
        let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(FixedProvider {
            name: "fixed",
            body: "https://c.example.com/\n",
            fail: false,
        })];

        orchestrator.run(Uuid::new_v4(), &providers, UpdateCacheMode::Immediate).await;
        assert!(orchestrator.cache_sync.is_idle());
    }
}
