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

//! The cron-driven scheduler (C12, §4.8): wraps `tokio-cron-scheduler` in
//! UTC, registers one job per enabled provider, and serializes every run
//! -- scheduled or on-demand -- against the Process Manager's single
//! admission gate.
//!
//! "Singleton" job semantics (§4.8, Open Question resolution in
//! DESIGN.md): a tick that finds the gate already held does not drop its
//! run. Instead of re-registering a one-shot cron job, the tick's own
//! task loops: sleep `scheduler.singleton_retry_interval_secs`, try the
//! gate again, up to `scheduler.singleton_retry_ceiling` times, then log
//! and give up for that tick. The next scheduled tick is unaffected.

mod error;

pub use error::SchedulerError;

use crate::config::SchedulerConfig;
use crate::metrics::MetricsSink;
use crate::orchestrator::{Orchestrator, ProviderRunOutcome, UpdateCacheMode};
use crate::process_manager::{ProcessManager, ProcessManagerError};
use crate::provider::{Provider, ProviderRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Default cron baked in for a provider that declares neither a
/// `cron_schedule()` override nor a `provider.provider_crons` entry:
/// once a day, staggered off the hour to avoid a thundering herd against
/// all upstream feeds at once.
const FALLBACK_CRON: &str = "0 17 3 * * *";

pub struct Scheduler {
    inner: JobScheduler,
    process_manager: Arc<ProcessManager>,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<ProviderRegistry>,
    metrics: Arc<dyn MetricsSink>,
    retry_interval: Duration,
    retry_ceiling: u32,
}

impl Scheduler {
    /// Builds the underlying `JobScheduler` and registers one job per
    /// provider in `registry`, each resolving its cron expression as:
    /// `provider.cron_schedule()` override, else
    /// `provider.provider_crons[name]`, else [`FALLBACK_CRON`].
    pub async fn new(
        process_manager: Arc<ProcessManager>,
        orchestrator: Arc<Orchestrator>,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<dyn MetricsSink>,
        provider_crons: &std::collections::HashMap<String, String>,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let inner = JobScheduler::new().await.map_err(SchedulerError::Init)?;

        let mut scheduler = Self {
            inner,
            process_manager,
            orchestrator,
            registry,
            metrics,
            retry_interval: Duration::from_secs(config.singleton_retry_interval_secs),
            retry_ceiling: config.singleton_retry_ceiling,
        };

        let names: Vec<&'static str> = scheduler.registry.names().collect();
        for name in names {
            let provider = Arc::clone(scheduler.registry.get(name).expect("just listed"));
            let cron = provider
                .cron_schedule()
                .map(str::to_string)
                .or_else(|| provider_crons.get(name).cloned())
                .unwrap_or_else(|| FALLBACK_CRON.to_string());
            scheduler.register_job(name, &cron).await?;
        }

        Ok(scheduler)
    }

    async fn register_job(&mut self, name: &'static str, cron: &str) -> Result<(), SchedulerError> {
        let process_manager = Arc::clone(&self.process_manager);
        let orchestrator = Arc::clone(&self.orchestrator);
        let registry = Arc::clone(&self.registry);
        let metrics = Arc::clone(&self.metrics);
        let retry_interval = self.retry_interval;
        let retry_ceiling = self.retry_ceiling;

        let job = Job::new_async(cron, move |_uuid, _scheduler| {
            let process_manager = Arc::clone(&process_manager);
            let orchestrator = Arc::clone(&orchestrator);
            let registry = Arc::clone(&registry);
            let metrics = Arc::clone(&metrics);
            Box::pin(async move {
                tokio::spawn(run_with_singleton_retry(
                    process_manager,
                    orchestrator,
                    registry,
                    metrics,
                    name,
                    retry_interval,
                    retry_ceiling,
                ));
            })
        })
        .map_err(|source| SchedulerError::InvalidCron {
            provider: name.to_string(),
            expr: cron.to_string(),
            source,
        })?;

        self.inner
            .add(job)
            .await
            .map_err(|source| SchedulerError::Register { provider: name.to_string(), source })?;

        Ok(())
    }

    pub async fn start(&mut self) -> Result<(), SchedulerError> {
        self.inner.start().await.map_err(SchedulerError::Start)
    }

    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        self.inner.shutdown().await.map_err(SchedulerError::Shutdown)
    }

    /// On-demand run of a single provider (the HTTP trigger's path, and
    /// `run_provider_now` in §4.8), routed through the same Process
    /// Manager gate as scheduled ticks so the two never race.
    pub async fn run_provider_now(&self, name: &str) -> Result<Uuid, SchedulerError> {
        let provider = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownProvider(name.to_string()))?;
        let process_id = self.process_manager.try_start()?;
        let outcomes = self
            .orchestrator
            .run(process_id, std::slice::from_ref(&provider), UpdateCacheMode::Immediate)
            .await;
        self.finish_and_report(process_id, &outcomes).await;
        Ok(process_id)
    }

    /// Bulk startup run (`run_all_now`, §4.8): acquires the gate once and
    /// runs every registered provider under a single process id, finishing
    /// with one cache sync schedule rather than one per provider.
    pub async fn run_all_now(&self) -> Result<Uuid, SchedulerError> {
        let providers: Vec<Arc<dyn Provider>> = self.registry.iter().cloned().collect();
        let process_id = self.process_manager.try_start()?;
        let outcomes = self.orchestrator.run(process_id, &providers, UpdateCacheMode::Immediate).await;
        self.finish_and_report(process_id, &outcomes).await;
        Ok(process_id)
    }

    async fn finish_and_report(&self, process_id: Uuid, outcomes: &[ProviderRunOutcome]) {
        let processed: i64 = outcomes.iter().map(|o| o.processed as i64).sum();
        let removed: i64 = outcomes.iter().map(|o| o.removed as i64).sum();
        let error = outcomes.iter().find_map(|o| o.error.clone());
        if let Err(e) = self.process_manager.finish(process_id, processed, removed, error).await {
            log::error!("failed to persist process status for {process_id}: {e}");
        }
    }
}

/// One scheduled tick's worth of work, including the singleton-job retry
/// loop described in the module docs. Runs as its own spawned task so a
/// held gate never blocks the cron scheduler's own task.
async fn run_with_singleton_retry(
    process_manager: Arc<ProcessManager>,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<ProviderRegistry>,
    metrics: Arc<dyn MetricsSink>,
    name: &'static str,
    retry_interval: Duration,
    retry_ceiling: u32,
) {
    let Some(provider) = registry.get(name).cloned() else {
        log::warn!("scheduler tick fired for unregistered provider '{name}'");
        return;
    };

    let mut attempts_left = retry_ceiling;
    loop {
        match process_manager.try_start() {
            Ok(process_id) => {
                let outcomes = orchestrator
                    .run(process_id, std::slice::from_ref(&provider), UpdateCacheMode::Immediate)
                    .await;
                let processed = outcomes.first().map(|o| o.processed as i64).unwrap_or(0);
                let removed = outcomes.first().map(|o| o.removed as i64).unwrap_or(0);
                let error = outcomes.first().and_then(|o| o.error.clone());
                if error.is_none() {
                    metrics.provider_run_completed(name, processed.max(0) as u64);
                }
                if let Err(e) = process_manager.finish(process_id, processed, removed, error).await {
                    log::error!("failed to persist process status for {name} run {process_id}: {e}");
                }
                return;
            }
            Err(ProcessManagerError::AlreadyRunning) => {
                if attempts_left == 0 {
                    log::warn!(
                        "scheduler tick for '{name}' gave up after {retry_ceiling} retries; the gate is still held"
                    );
                    return;
                }
                attempts_left -= 1;
                log::debug!(
                    "scheduler tick for '{name}' found the gate held, rechecking in {retry_interval:?} \
                     ({attempts_left} attempts left)"
                );
                tokio::time::sleep(retry_interval).await;
            }
            Err(e) => {
                log::error!("scheduler tick for '{name}' could not start: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::{BloomIndex, KvCache};
    use crate::cache_sync::CacheSync;
    use crate::collector::Collector;
    use crate::config::CacheConfig;
    use crate::entry::Entry;
    use crate::parser::{LineResult, ParserConfig};
    use crate::provider::ProviderError;
    use crate::shutdown::Shutdown;
    use crate::store::Store;
    use crate::url::NormalizedUrl;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct CountingProvider {
        name: &'static str,
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
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
            Ok("https://scheduled.example.com/\n".to_string())
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

    async fn wire(
        provider_name: &'static str,
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    ) -> (Arc<ProcessManager>, Arc<Orchestrator>, Arc<ProviderRegistry>) {
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

        let orchestrator = Arc::new(Orchestrator::new(
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
        ));

        let process_manager = Arc::new(ProcessManager::new(store));
        let provider: Arc<dyn Provider> = Arc::new(CountingProvider { name: provider_name, calls });
        let registry = Arc::new(ProviderRegistry::from_providers(vec![provider]));

        (process_manager, orchestrator, registry)
    }

    #[tokio::test]
    async fn run_provider_now_invokes_fetch_and_persists_a_completed_run() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (process_manager, orchestrator, registry) = wire("scheduled", Arc::clone(&calls)).await;
        let scheduler = Scheduler::new(
            Arc::clone(&process_manager),
            orchestrator,
            registry,
            Arc::new(crate::metrics::NoopMetricsSink),
            &HashMap::new(),
            &SchedulerConfig::default(),
        )
        .await
        .unwrap();

        let process_id = scheduler.run_provider_now("scheduled").await.unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let status = process_manager.get_by_id(process_id).await.unwrap().unwrap();
        assert_eq!(status.status, crate::store::RunStatus::Completed);
    }

    #[tokio::test]
    async fn singleton_retry_gives_up_after_the_ceiling_when_the_gate_stays_held() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (process_manager, orchestrator, registry) = wire("scheduled", Arc::clone(&calls)).await;

        // hold the gate for the whole test
        let held_id = process_manager.try_start().unwrap();

        let mut config = SchedulerConfig::default();
        config.singleton_retry_interval_secs = 0;
        config.singleton_retry_ceiling = 2;

        run_with_singleton_retry(
            Arc::clone(&process_manager),
            orchestrator,
            registry,
            Arc::new(crate::metrics::NoopMetricsSink),
            "scheduled",
            Duration::from_millis(1),
            2,
        )
        .await;

        // the gate was held throughout, so fetch was never reached
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        process_manager.finish(held_id, 0, 0, None).await.unwrap();
    }
}
