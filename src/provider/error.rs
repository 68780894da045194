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
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    Unknown(String),
    #[error("fetch of {provider} failed: {source}")]
    Fetch {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} responded with an empty body")]
    EmptyResponse { provider: String },
    #[error("{provider} feed could not be decoded: {message}")]
    Decode { provider: String, message: String },
    #[error(transparent)]
    Parse(#[from] crate::parser::ParseError),
}
