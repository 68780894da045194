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

//! On-disk cache of fetched provider payloads (C3, §6.3): a development
//! convenience that lets a run replay the last fetched body instead of
//! hitting the network, gated behind `collector.store_responses`.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

const TTL: time::Duration = time::Duration::hours(24);

#[derive(Debug, Error)]
pub enum ResponseCacheError {
    #[error("failed to read cached response for {provider}: {source}")]
    Read {
        provider: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write cached response for {provider}: {source}")]
    Write {
        provider: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialize metadata for {provider}: {source}")]
    Metadata {
        provider: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The sidecar metadata written next to a cached payload (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub process_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub description: String,
}

/// A cached payload read back from disk, with its age already checked
/// against the TTL.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub payload: Vec<u8>,
    pub meta: ResponseMeta,
}

/// The response cache root directory (`collector.store_path`).
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: Utf8PathBuf,
}

impl ResponseCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn payload_path(&self, provider: &str) -> Utf8PathBuf {
        self.root.join(format!("{provider}_response.dat"))
    }

    fn meta_path(&self, provider: &str) -> Utf8PathBuf {
        self.root.join(format!("{provider}_response.meta.json"))
    }

    /// Returns the cached response for `provider` if present and not yet
    /// past its 24h TTL (§6.3). A missing file, a missing sibling, or an
    /// expired entry are all treated as "no cache hit" rather than errors.
    pub async fn get(&self, provider: &str) -> Result<Option<CachedResponse>, ResponseCacheError> {
        let meta_path = self.meta_path(provider);
        let meta_bytes = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ResponseCacheError::Read {
                    provider: provider.to_string(),
                    source,
                })
            }
        };
        let meta: ResponseMeta =
            serde_json::from_slice(&meta_bytes).map_err(|source| ResponseCacheError::Metadata {
                provider: provider.to_string(),
                source,
            })?;

        if OffsetDateTime::now_utc() - meta.created_at > TTL {
            return Ok(None);
        }

        let payload_path = self.payload_path(provider);
        let payload = match tokio::fs::read(&payload_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ResponseCacheError::Read {
                    provider: provider.to_string(),
                    source,
                })
            }
        };

        Ok(Some(CachedResponse { payload, meta }))
    }

    /// Writes a fresh payload and its metadata, creating the store
    /// directory if needed.
    pub async fn put(
        &self,
        provider: &str,
        payload: &[u8],
        process_id: Uuid,
        description: impl Into<String>,
    ) -> Result<(), ResponseCacheError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| ResponseCacheError::Write {
                provider: provider.to_string(),
                source,
            })?;

        let meta = ResponseMeta {
            process_id,
            created_at: OffsetDateTime::now_utc(),
            description: description.into(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).map_err(|source| ResponseCacheError::Metadata {
            provider: provider.to_string(),
            source,
        })?;

        tokio::fs::write(self.payload_path(provider), payload)
            .await
            .map_err(|source| ResponseCacheError::Write {
                provider: provider.to_string(),
                source,
            })?;
        tokio::fs::write(self.meta_path(provider), meta_bytes)
            .await
            .map_err(|source| ResponseCacheError::Write {
                provider: provider.to_string(),
                source,
            })?;
        Ok(())
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}
