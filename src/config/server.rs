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

/// `server.*` — the listen address of the HTTP boundary (§6.2).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename(serialize = "Server"))]
pub struct ServerConfig {
    #[serde(default = "_default_host")]
    pub host: String,
    #[serde(default = "_default_port")]
    pub port: u16,
    #[serde(default = "_default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default = "_default_true")]
    pub health_check: bool,
}

fn _default_host() -> String {
    "0.0.0.0".to_string()
}
const fn _default_port() -> u16 {
    8080
}
fn _default_scheme() -> String {
    "http".to_string()
}
const fn _default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: _default_host(),
            port: _default_port(),
            scheme: _default_scheme(),
            allow_origins: Vec::new(),
            health_check: true,
        }
    }
}
