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

/// `collector.*` — batcher (C7) and parallel-parser (C5) dimensions.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename(serialize = "Collector"))]
pub struct CollectorConfig {
    /// Worker parallelism for non-DB work (fetch/parse), not the writer.
    #[serde(default = "_default_concurrency")]
    pub concurrency: usize,
    /// Flush threshold for the single-writer batcher (§4.4.1).
    #[serde(default = "_default_batch_size")]
    pub batch_size: usize,
    /// Worker count for the parallel line parser (§4.3). `None` means
    /// "use the CPU count".
    #[serde(default)]
    pub parser_workers: Option<usize>,
    #[serde(default = "_default_parser_batch_size")]
    pub parser_batch_size: usize,
    #[serde(default)]
    pub store_responses: bool,
    #[serde(default = "_default_store_path")]
    pub store_path: String,
}

const fn _default_concurrency() -> usize {
    4
}
const fn _default_batch_size() -> usize {
    500
}
const fn _default_parser_batch_size() -> usize {
    1000
}
fn _default_store_path() -> String {
    "./vigil_data/responses".to_string()
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            concurrency: _default_concurrency(),
            batch_size: _default_batch_size(),
            parser_workers: None,
            parser_batch_size: _default_parser_batch_size(),
            store_responses: false,
            store_path: _default_store_path(),
        }
    }
}

impl CollectorConfig {
    pub fn parser_workers(&self) -> usize {
        self.parser_workers.unwrap_or_else(num_cpus::get)
    }
}
