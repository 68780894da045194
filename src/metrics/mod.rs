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

//! The metrics collaborator (A3): the concrete Prometheus/OpenTelemetry
//! wire exporter is out of scope; this trait stands in for it so the
//! Collector and orchestrator have somewhere to report counts.

/// Sink for the handful of counters the core emits. Implementations are
/// expected to be cheap and infallible; a slow or failing sink must never
/// hold up ingestion.
pub trait MetricsSink: Send + Sync {
    fn provider_run_completed(&self, provider: &str, processed: u64) {
        let _ = (provider, processed);
    }

    fn provider_run_failed(&self, provider: &str) {
        let _ = provider;
    }

    fn batch_committed(&self, provider: &str, size: usize) {
        let _ = (provider, size);
    }

    fn batch_failed(&self, provider: &str, size: usize) {
        let _ = (provider, size);
    }

    fn cache_sync_completed(&self, keys_synced: u64) {
        let _ = keys_synced;
    }
}

/// A sink that discards everything; the default when no observability
/// backend is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn noop_sink_accepts_every_call_without_panicking() {
        let sink = NoopMetricsSink;
        sink.provider_run_completed("oisd", 10);
        sink.provider_run_failed("oisd");
        sink.batch_committed("oisd", 5);
        sink.batch_failed("oisd", 5);
        sink.cache_sync_completed(100);
    }
}
