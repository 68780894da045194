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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `provider.*` — which providers run, on what cron, and how wide the
/// ingestion fan-out is allowed to be (§4.9).
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename(serialize = "Provider"))]
pub struct ProviderConfig {
    /// Allow-list of provider names; empty means "all registered providers".
    #[serde(default)]
    pub enabled_providers: Vec<String>,
    /// Per-provider cron override, keyed by provider name.
    #[serde(default)]
    pub provider_crons: HashMap<String, String>,
    #[serde(default)]
    pub run_at_startup: bool,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_concurrent_providers: usize,
}

impl ProviderConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled_providers.is_empty() || self.enabled_providers.iter().any(|p| p == name)
    }
}
