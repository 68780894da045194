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

pub mod app;
pub mod cache;
pub mod collector;
pub mod colly;
pub mod provider;
pub mod scheduler;
pub mod server;

pub use app::AppConfig;
pub use cache::CacheConfig;
pub use collector::CollectorConfig;
pub use colly::CollyConfig;
pub use provider::ProviderConfig;
pub use scheduler::SchedulerConfig;
pub use server::ServerConfig;

use config::Config;
use serde::{Deserialize, Serialize};

/// The root configuration object, layered from defaults, an optional file
/// and environment variables (see [`Configs::load_from`]). Mirrors the
/// recognized-keys table in the specification one-to-one: each top-level
/// field here is one `server.*` / `cache.*` / ... namespace.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename(serialize = "Config"))]
pub struct Configs {
    pub server: ServerConfig,
    pub app: AppConfig,
    pub cache: CacheConfig,
    pub collector: CollectorConfig,
    pub provider: ProviderConfig,
    pub colly: CollyConfig,
    pub scheduler: SchedulerConfig,
}

impl Configs {
    /// Loads configuration layered as defaults -> `./vigil.{toml,yaml,json}`
    /// (if present) -> `VIGIL_*` environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(config::File::with_name("./vigil").required(false))
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// As [`Configs::load`] but rooted at an explicit config directory,
    /// used by the CLI's `--config <dir>` flag.
    pub fn load_from<P: AsRef<std::path::Path>>(folder: P) -> Result<Self, config::ConfigError> {
        let root = folder.as_ref();
        Config::builder()
            .add_source(config::File::with_name(&root.join("vigil").to_string_lossy()).required(false))
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = Configs::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: Configs = serde_json::from_str(&text).unwrap();
        assert_eq!(config, back);
    }
}
