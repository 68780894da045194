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

//! Lifecycle wiring (A5): one `AppContext` built once at startup, owning
//! every shared collaborator. No package-level globals anywhere in this
//! crate -- everything a handler or a scheduled tick needs hangs off this
//! struct (or an `Arc` cloned out of it).

mod error;

pub use error::AppError;

use crate::cache::{BloomIndex, KvCache};
use crate::cache_sync::CacheSync;
use crate::collector::Collector;
use crate::config::Configs;
use crate::lookup::LookupPipeline;
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::orchestrator::Orchestrator;
use crate::process_manager::ProcessManager;
use crate::provider::ProviderRegistry;
use crate::response_cache::ResponseCache;
use crate::scheduler::Scheduler;
use crate::shutdown::{shutdown_pair, Shutdown, ShutdownSignal};
use crate::store::Store;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Fixed relational DB location (§6.3); not a configuration key in the
/// specification, so it is not one here either.
const DB_PATH: &str = "./blacked.db";

/// Everything the HTTP boundary and the scheduler share, built once by
/// [`AppContext::init`] and torn down once by [`AppContext::shutdown`].
pub struct AppContext {
    pub config: Configs,
    pub store: Arc<Store>,
    pub kv: Arc<KvCache>,
    pub bloom: Arc<BloomIndex>,
    pub collector: Arc<Collector>,
    pub cache_sync: Arc<CacheSync>,
    pub process_manager: Arc<ProcessManager>,
    pub registry: Arc<ProviderRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub lookup: Arc<LookupPipeline>,
    pub response_cache: Option<Arc<ResponseCache>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub scheduler: Scheduler,
    shutdown_signal: ShutdownSignal,
    shutdown: Shutdown,
    writer_handle: JoinHandle<()>,
    flush_handle: JoinHandle<()>,
}

impl AppContext {
    /// Builds every collaborator in dependency order (leaves first, per
    /// the component table): store, caches, collector (+ its writer and
    /// periodic-flush tasks), cache sync, process manager, providers,
    /// orchestrator, lookup pipeline, scheduler.
    pub async fn init(config: Configs) -> Result<Self, AppError> {
        let (shutdown_signal, shutdown) = shutdown_pair();
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetricsSink);

        let store = Arc::new(Store::open(DB_PATH).await?);

        let kv = Arc::new(KvCache::open(&config.cache)?);
        let bloom = Arc::new(BloomIndex::empty());

        let (collector, batch_rx) = Collector::new(config.collector.batch_size, shutdown.clone());
        let writer_handle =
            Arc::clone(&collector).spawn_writer(Arc::clone(&store), Arc::clone(&metrics), batch_rx);
        let flush_handle = Arc::clone(&collector).spawn_periodic_flush(None);

        let cache_sync = CacheSync::new(
            Arc::clone(&store),
            Arc::clone(&kv),
            Arc::clone(&bloom),
            config.cache.use_bloom,
            Arc::clone(&metrics),
            shutdown.clone(),
        );

        let process_manager = Arc::new(ProcessManager::new(Arc::clone(&store)));
        let registry = Arc::new(ProviderRegistry::new(&config.provider));

        let http_client = build_http_client(&config.colly).map_err(AppError::HttpClient)?;

        let response_cache = if config.collector.store_responses {
            Some(Arc::new(ResponseCache::new(config.collector.store_path.clone())))
        } else {
            None
        };

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&collector),
            Arc::clone(&cache_sync),
            Arc::clone(&store),
            response_cache.clone(),
            config.app.environment.retains_response_cache_between_runs(),
            http_client,
            crate::parser::ParserConfig::new(
                Some(config.collector.parser_workers()),
                config.collector.parser_batch_size,
            ),
            config.provider.max_concurrent_providers,
            shutdown.clone(),
            Arc::clone(&metrics),
        ));

        let lookup = Arc::new(LookupPipeline::new(
            Arc::clone(&store),
            Arc::clone(&kv),
            Arc::clone(&bloom),
            config.cache.use_bloom,
        ));

        let scheduler = Scheduler::new(
            Arc::clone(&process_manager),
            Arc::clone(&orchestrator),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            &config.provider.provider_crons,
            &config.scheduler,
        )
        .await?;

        Ok(Self {
            config,
            store,
            kv,
            bloom,
            collector,
            cache_sync,
            process_manager,
            registry,
            orchestrator,
            lookup,
            response_cache,
            metrics,
            scheduler,
            shutdown_signal,
            shutdown,
            writer_handle,
            flush_handle,
        })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Starts the cron scheduler and, if `provider.run_at_startup`, kicks
    /// off a bulk run of every registered provider in the background so
    /// startup is not blocked on a (potentially long) first ingestion.
    pub async fn start(&mut self) -> Result<(), AppError> {
        self.scheduler.start().await?;
        if self.config.provider.run_at_startup && !self.registry.is_empty() {
            let process_manager = Arc::clone(&self.process_manager);
            let orchestrator = Arc::clone(&self.orchestrator);
            let providers: Vec<_> = self.registry.iter().cloned().collect();
            tokio::spawn(async move {
                match process_manager.try_start() {
                    Ok(process_id) => {
                        let outcomes = orchestrator
                            .run(process_id, &providers, crate::orchestrator::UpdateCacheMode::Immediate)
                            .await;
                        let processed: i64 = outcomes.iter().map(|o| o.processed as i64).sum();
                        let removed: i64 = outcomes.iter().map(|o| o.removed as i64).sum();
                        let error = outcomes.iter().find_map(|o| o.error.clone());
                        if let Err(e) = process_manager.finish(process_id, processed, removed, error).await {
                            log::error!("failed to persist the startup bulk run's status: {e}");
                        }
                    }
                    Err(e) => log::error!("startup bulk run could not acquire the process gate: {e}"),
                }
            });
        }
        Ok(())
    }

    /// Cancels every cooperative task, waits for the collector's writer
    /// and periodic-flush tasks to drain, stops the cron scheduler, and
    /// joins any in-flight cache sync. Consumes `self`: there is nothing
    /// left to do with an `AppContext` after this returns.
    pub async fn shutdown(mut self) -> Result<(), AppError> {
        self.shutdown_signal.cancel();
        self.scheduler.shutdown().await?;
        self.cache_sync.join().await;
        let _ = self.writer_handle.await;
        let _ = self.flush_handle.await;
        Ok(())
    }
}

fn build_http_client(colly: &crate::config::CollyConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(&colly.user_agent)
        .timeout(colly.timeout())
        .redirect(reqwest::redirect::Policy::limited(colly.max_redirects as usize))
        .build()
}
