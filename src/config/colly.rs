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

/// `colly.*` — knobs for the concrete HTTP fetch client. The client's
/// retry/backoff policy itself is an out-of-scope collaborator (§1); this
/// config only carries the knobs the specification names.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename(serialize = "Colly"))]
pub struct CollyConfig {
    #[serde(default = "_default_user_agent")]
    pub user_agent: String,
    #[serde(default = "_default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "_default_max_size")]
    pub max_size: u64,
    #[serde(default = "_default_max_redirects")]
    pub max_redirects: u8,
}

fn _default_user_agent() -> String {
    "vigil-blacklist-fetcher/0.1".to_string()
}
const fn _default_timeout_secs() -> u64 {
    30
}
const fn _default_max_size() -> u64 {
    256 * 1024 * 1024
}
const fn _default_max_redirects() -> u8 {
    5
}

impl Default for CollyConfig {
    fn default() -> Self {
        Self {
            user_agent: _default_user_agent(),
            timeout_secs: _default_timeout_secs(),
            max_size: _default_max_size(),
            max_redirects: _default_max_redirects(),
        }
    }
}

impl CollyConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}
