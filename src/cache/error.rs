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

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to open the cache engine at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rocksdb::Error,
    },
    #[error("cache get failed: {0}")]
    Get(rocksdb::Error),
    #[error("cached value was not valid utf-8")]
    InvalidUtf8,
    #[error("cache batch commit failed: {0}")]
    Commit(rocksdb::Error),
    #[error("cache key scan failed: {0}")]
    Iterate(rocksdb::Error),
    #[error("cache operation cancelled")]
    Cancelled,
}
