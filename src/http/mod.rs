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

//! The HTTP boundary (A4, §6.2): a minimal `axum` router. Every handler
//! is a thin translation layer -- the actual work happens in the core
//! collaborators hanging off [`AppContext`].

mod error;

pub use error::ApiError;

use crate::app_context::AppContext;
use crate::entry::{Entry, Hit, QueryType};
use crate::orchestrator::UpdateCacheMode;
use crate::provider::Provider;
use crate::store::ProcessStatus;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

/// Recent-runs page size for `GET /provider/processes` (§6.2 names no
/// pagination contract, so this is a fixed, generous window).
const RECENT_PROCESSES_LIMIT: i64 = 100;

pub fn router(app: Arc<AppContext>) -> Router {
    Router::new()
        .route("/provider/process", post(start_process))
        .route("/provider/process/status/:id", get(process_status))
        .route("/provider/processes", get(recent_processes))
        .route("/query/entry", post(query_entry))
        .route("/entry/:id", get(entry_by_id))
        .route("/entry", get(entry_by_url))
        .route("/health/status", get(health_status))
        .layer(cors_layer(&app.config.server.allow_origins))
        .with_state(app)
}

fn cors_layer(allow_origins: &[String]) -> CorsLayer {
    if allow_origins.is_empty() {
        return CorsLayer::new();
    }
    if allow_origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_methods([Method::GET, Method::POST]).allow_origin(tower_http::cors::Any);
    }
    let origins: Vec<HeaderValue> = allow_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new().allow_methods([Method::GET, Method::POST]).allow_origin(origins)
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    #[serde(default)]
    providers_to_process: Vec<String>,
    #[serde(default)]
    providers_to_remove: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProcessAccepted {
    process_id: Uuid,
}

async fn start_process(
    State(app): State<Arc<AppContext>>,
    Json(body): Json<ProcessRequest>,
) -> Result<Json<ProcessAccepted>, ApiError> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::with_capacity(body.providers_to_process.len());
    for name in &body.providers_to_process {
        let provider = app
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::BadRequest(format!("unknown provider: {name}")))?;
        providers.push(provider);
    }

    let process_id = app.process_manager.try_start()?;

    let outcomes = if providers.is_empty() {
        Vec::new()
    } else {
        app.orchestrator.run(process_id, &providers, UpdateCacheMode::Immediate).await
    };

    for name in &body.providers_to_remove {
        if let Err(e) = app.store.remove_all_for_source(name).await {
            log::error!("failed to remove entries for provider '{name}': {e}");
        }
    }

    let processed: i64 = outcomes.iter().map(|o| o.processed as i64).sum();
    let removed: i64 = outcomes.iter().map(|o| o.removed as i64).sum();
    let error = outcomes.iter().find_map(|o| o.error.clone());
    app.process_manager.finish(process_id, processed, removed, error).await?;

    Ok(Json(ProcessAccepted { process_id }))
}

async fn process_status(
    State(app): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProcessStatus>, ApiError> {
    app.process_manager.get_by_id(id).await?.map(Json).ok_or(ApiError::NotFound)
}

async fn recent_processes(State(app): State<Arc<AppContext>>) -> Result<Json<Vec<ProcessStatus>>, ApiError> {
    Ok(Json(app.process_manager.list_recent(RECENT_PROCESSES_LIMIT).await?))
}

#[derive(Debug, Deserialize)]
struct QueryEntryRequest {
    url: String,
    query_type: QueryType,
}

#[derive(Debug, Serialize)]
struct QueryEntryResponse {
    url: String,
    exists: bool,
    hits: Vec<Hit>,
    query_type: QueryType,
    count: usize,
}

async fn query_entry(
    State(app): State<Arc<AppContext>>,
    Json(body): Json<QueryEntryRequest>,
) -> Result<Json<QueryEntryResponse>, ApiError> {
    let hits = match app.lookup.query(body.query_type, &body.url).await {
        Ok(hits) => hits,
        Err(crate::lookup::LookupError::BloomKeyNotFound) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(QueryEntryResponse {
        url: body.url,
        exists: !hits.is_empty(),
        count: hits.len(),
        query_type: body.query_type,
        hits,
    }))
}

async fn entry_by_id(
    State(app): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Entry>, ApiError> {
    app.store.get_entry_by_id(id).await?.map(Json).ok_or(ApiError::NotFound)
}

#[derive(Debug, Deserialize)]
struct EntryByUrlQuery {
    url: String,
}

async fn entry_by_url(
    State(app): State<Arc<AppContext>>,
    Query(q): Query<EntryByUrlQuery>,
) -> Result<Json<Entry>, ApiError> {
    let hits = app.store.query_link(QueryType::Full, &q.url).await?;
    hits.into_iter().next().map(|(entry, _)| Json(entry)).ok_or(ApiError::NotFound)
}

async fn health_status(State(app): State<Arc<AppContext>>) -> Result<Json<serde_json::Value>, StatusCode> {
    if app.config.server.health_check {
        Ok(Json(serde_json::json!({ "status": "ok" })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
