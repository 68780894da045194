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

use clap::Parser;
use std::sync::Arc;

mod app_context;
mod args;
mod cache;
mod cache_sync;
mod collector;
mod config;
mod entry;
mod http;
mod logging;
mod lookup;
mod metrics;
mod orchestrator;
mod parser;
mod process_manager;
mod provider;
mod response_cache;
mod scheduler;
mod shutdown;
mod store;
mod url;

use app_context::AppContext;
use args::VigilArgs;

fn main() {
    let args = VigilArgs::parse();
    exec_args(args);
}

fn exec_args(args: VigilArgs) {
    let configs = match args::load_configs(&args) {
        Ok(configs) => configs,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::configure_logging(&configs);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    runtime.block_on(exec(configs));
}

async fn exec(configs: config::Configs) {
    let host = configs.server.host.clone();
    let port = configs.server.port;

    let mut app = match AppContext::init(configs).await {
        Ok(app) => app,
        Err(e) => {
            log::error!("failed to initialize the application: {e}");
            return;
        }
    };

    if let Err(e) = app.start().await {
        log::error!("failed to start the scheduler: {e}");
        return;
    }

    let app = Arc::new(app);
    let router = http::router(Arc::clone(&app));

    let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to bind {host}:{port}: {e}");
            return;
        }
    };
    log::info!("listening on {host}:{port}");

    tokio::select! {
        res = axum::serve(listener, router) => {
            if let Err(e) = res {
                log::error!("http server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
        }
    }

    let app = match Arc::try_unwrap(app) {
        Ok(app) => app,
        Err(_) => {
            log::warn!("http server handlers still held a reference at shutdown; skipping graceful teardown");
            return;
        }
    };
    if let Err(e) = app.shutdown().await {
        log::error!("error during shutdown: {e}");
    }
}
