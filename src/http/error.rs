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

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::lookup::LookupError;
use crate::process_manager::ProcessManagerError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;

/// Maps every error a handler can produce to a status code (§6.2). A
/// `BloomKeyNotFound` is not an error at the boundary -- handlers turn it
/// into a normal "not found" response before this type ever sees it.
pub enum ApiError {
    NotFound,
    Conflict(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                log::error!("request failed: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::BloomKeyNotFound => ApiError::NotFound,
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<ProcessManagerError> for ApiError {
    fn from(err: ProcessManagerError) -> Self {
        match err {
            ProcessManagerError::AlreadyRunning => {
                ApiError::Conflict("another ingestion run is already in progress".to_string())
            }
            ProcessManagerError::Store(e) => e.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::UnknownProvider(name) => {
                ApiError::BadRequest(format!("unknown provider: {name}"))
            }
            SchedulerError::ProcessManager(e) => e.into(),
            other => ApiError::Internal(other.into()),
        }
    }
}
