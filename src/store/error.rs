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

use thiserror::Error;

/// The typed error taxonomy of the relational store (§4.2, §7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to scan a row: {0}")]
    ToScan(#[source] sqlx::Error),
    #[error("failed to run a query: {0}")]
    ToQuery(#[source] sqlx::Error),
    #[error("failed while iterating rows: {0}")]
    RowsIteration(#[source] sqlx::Error),
    #[error("transaction failed: {0}")]
    Tx(#[source] sqlx::Error),
    #[error("upsert failed: {0}")]
    Upsert(#[source] sqlx::Error),
    #[error("delete failed: {0}")]
    Delete(#[source] sqlx::Error),
    #[error("unknown query type: {0}")]
    InvalidQueryType(String),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("could not open the database: {0}")]
    Open(#[source] sqlx::Error),
}
