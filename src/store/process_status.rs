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

//! The durable counterpart of a Process Manager run (§4.7, §6.2): one row
//! per ingestion run, persisted so `list_recent` survives a restart.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;
use uuid::Uuid;

/// The lifecycle state of one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// One row of `provider_processes` (§4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub id: Uuid,
    pub status: RunStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub providers_processed: i64,
    pub providers_removed: i64,
    pub error: Option<String>,
}

impl ProcessStatus {
    pub fn started(id: Uuid) -> Self {
        Self {
            id,
            status: RunStatus::Running,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            providers_processed: 0,
            providers_removed: 0,
            error: None,
        }
    }
}
