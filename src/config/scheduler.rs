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

/// `scheduler.*` — singleton-job retry knobs for the cron scheduler (§4.8).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename(serialize = "Scheduler"))]
pub struct SchedulerConfig {
    /// Delay before re-checking a tick that found the Process Manager gate
    /// held, in seconds.
    #[serde(default = "_default_retry_interval_secs")]
    pub singleton_retry_interval_secs: u64,
    /// How many times a single tick will re-check before giving up.
    #[serde(default = "_default_retry_ceiling")]
    pub singleton_retry_ceiling: u32,
}

fn _default_retry_interval_secs() -> u64 {
    30
}
const fn _default_retry_ceiling() -> u32 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            singleton_retry_interval_secs: _default_retry_interval_secs(),
            singleton_retry_ceiling: _default_retry_ceiling(),
        }
    }
}
