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

//! Provider abstraction (C6): one fetch-and-parse unit per upstream feed,
//! plus the registry that the scheduler and orchestrator iterate over.

mod error;
mod oisd;
mod phishtank;
mod urlhaus;

pub use error::ProviderError;
pub use oisd::OisdProvider;
pub use phishtank::PhishtankProvider;
pub use urlhaus::UrlhausProvider;

use crate::config::ProviderConfig;
use crate::parser::LineResult;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;

/// A fetch-and-parse unit for one upstream blacklist feed (§3.1, §4.9).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique registry key (§3.1 invariant: at most one registration per name).
    fn name(&self) -> &'static str;

    /// Upstream location this provider fetches from.
    fn source_url(&self) -> &str;

    /// Optional per-provider cron override; `None` defers to
    /// `provider.provider_crons[name]` or a baked-in default.
    fn cron_schedule(&self) -> Option<&str> {
        None
    }

    /// Retrieves the raw payload.
    async fn fetch(&self, client: &reqwest::Client) -> Result<String, ProviderError>;

    /// Normalizes a raw payload into a newline-delimited candidate-URL
    /// blob so every provider can be parsed by the same line-oriented
    /// parallel parser (C5), regardless of wire format. Plain-text feeds
    /// are effectively a no-op here; JSON feeds are flattened to one URL
    /// per line, dropping unverified entries.
    fn normalize_payload(&self, raw: &str) -> Result<String, ProviderError>;

    /// Per-line transform handed to the parallel parser: skip
    /// comments/blanks, normalize the URL, and tag category/confidence.
    /// Takes the current run's `process_id` since providers are registered
    /// once and reused across runs.
    fn line_transform(&self, process_id: uuid::Uuid) -> Box<dyn Fn(&str) -> LineResult + Send + Sync>;
}

/// The fixed set of providers known to the service, filtered by
/// `provider.enabled_providers` (§6.1: empty allow-list means all enabled).
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: IndexMap<&'static str, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new(config: &ProviderConfig) -> Self {
        let all: Vec<Arc<dyn Provider>> = vec![
            Arc::new(OisdProvider::default()),
            Arc::new(UrlhausProvider::default()),
            Arc::new(PhishtankProvider::default()),
        ];

        let providers = all
            .into_iter()
            .filter(|p| config.is_enabled(p.name()))
            .map(|p| (p.name(), p))
            .collect();

        Self { providers }
    }

    /// Builds a registry from an explicit provider list, bypassing the
    /// fixed production set. Used by tests that need a stand-in provider.
    #[cfg(test)]
    pub fn from_providers(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.name(), p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.providers.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_allow_list_enables_everything() {
        let config = ProviderConfig::default();
        let registry = ProviderRegistry::new(&config);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn allow_list_filters_registry() {
        let mut config = ProviderConfig::default();
        config.enabled_providers = vec!["oisd".to_string()];
        let registry = ProviderRegistry::new(&config);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("oisd").is_some());
        assert!(registry.get("urlhaus").is_none());
    }
}
