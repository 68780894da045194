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

//! CLI surface (A1). Parsing beyond a config directory and a log-level
//! override is out of scope (§6.1 keys cover the rest); everything else
//! lives in `vigil.{toml,yaml,json}` or `VIGIL__*` environment variables.

use crate::config::Configs;
use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct VigilArgs {
    /// Directory to load `vigil.{toml,yaml,json}` from; defaults to the
    /// current working directory.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Overrides `app.log_level` regardless of what the config says.
    #[arg(long)]
    pub log_level: Option<log::LevelFilter>,
}

/// Loads configuration per `args.config`, then applies `args.log_level`
/// on top if present.
pub fn load_configs(args: &VigilArgs) -> Result<Configs, config::ConfigError> {
    let mut configs = match &args.config {
        Some(dir) => Configs::load_from(dir)?,
        None => Configs::load()?,
    };
    if let Some(level) = args.log_level {
        configs.app.log_level = level;
    }
    Ok(configs)
}
