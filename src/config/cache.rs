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

/// `cache.*` — the KV cache / bloom filter engine selection (§4.5, §6.1).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename(serialize = "Cache"))]
pub struct CacheConfig {
    /// Only the `badger`-class (embedded key-value) engine is supported by
    /// the core; this field is kept so deployments can see what was asked
    /// for even though a single engine (`rocksdb`) backs it today.
    #[serde(default = "_default_cache_type")]
    pub cache_type: String,
    #[serde(default)]
    pub in_memory: bool,
    #[serde(default = "_default_badger_path")]
    pub badger_path: String,
    #[serde(default = "_default_true")]
    pub use_bloom: bool,
}

fn _default_cache_type() -> String {
    "badger".to_string()
}
fn _default_badger_path() -> String {
    "./vigil_data/kv".to_string()
}
const fn _default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: _default_cache_type(),
            in_memory: false,
            badger_path: _default_badger_path(),
            use_bloom: true,
        }
    }
}
