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
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("finish called for {provider} with process_id {given}, but the active run is {active}")]
    ProcessMismatch {
        provider: String,
        given: Uuid,
        active: Uuid,
    },
    #[error("finish called for {0} with no active stats")]
    NoActiveStats(String),
    #[error("underlying store operation failed: {0}")]
    Store(#[from] crate::store::StoreError),
}
