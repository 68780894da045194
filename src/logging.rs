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

//! Logging setup (A2): a `log4rs` console appender with `app.log_level`
//! as the package threshold and a conservative root.

use crate::config::Configs;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Config;

/// Initializes the global logger from `configs.app.log_level`. Safe to
/// call once at startup; a second call would panic inside `log4rs`, which
/// is why `main` is the only caller.
pub fn configure_logging(configs: &Configs) {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{l}@Thread{I} - {d} - {m}{n}")))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("out", Box::new(console)))
        .logger(Logger::builder().build("vigil", configs.app.log_level))
        .build(Root::builder().appender("out").build(LevelFilter::Warn))
        .expect("static logging configuration is always valid");

    if let Err(e) = log4rs::init_config(config) {
        eprintln!("logging was already initialized: {e}");
    }
}
