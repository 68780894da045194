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

//! The relational store (C4): schema, migrations, and the read/write pool
//! split described in §4.2. All mutable access outside the Collector's
//! single writer goes through the read pool; the write pool has exactly
//! one connection, matching the "single-writer" invariant (§5).

mod error;
mod process_status;
mod queries;

pub use error::StoreError;
pub use process_status::{ProcessStatus, RunStatus};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Minimum page cache the specification requires (§4.2).
const MIN_CACHE_SIZE_KIB: i32 = -10 * 1024; // negative = KiB, per SQLite's PRAGMA cache_size

/// The relational store, holding the two pools mandated by §4.2.
#[derive(Debug, Clone)]
pub struct Store {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the database at `path`, applies pending
    /// migrations, and configures both pools per §4.2: WAL journaling,
    /// `synchronous = NORMAL`, a >=10MB cache, a non-zero busy timeout, and
    /// foreign-key enforcement.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let write_pool = Self::build_pool(path, 1).await?;
        let read_pool = Self::build_pool(path, 10).await?;

        sqlx::migrate!("./migrations")
            .run(&write_pool)
            .await?;

        Ok(Self {
            read_pool,
            write_pool,
        })
    }

    async fn build_pool(path: &str, max_connections: u32) -> Result<SqlitePool, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(StoreError::Open)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .pragma("cache_size", MIN_CACHE_SIZE_KIB.to_string());

        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(StoreError::Open)
    }

    /// An in-memory store for tests: a single named in-memory database
    /// shared by both pools (a bare `:memory:` would give each connection
    /// its own empty database).
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:?cache=shared").await
    }

    pub(crate) fn read_pool(&self) -> &SqlitePool {
        &self.read_pool
    }

    pub(crate) fn write_pool(&self) -> &SqlitePool {
        &self.write_pool
    }
}
