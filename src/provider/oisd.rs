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

//! OISD: a plain-text domain blocklist, one domain per line (§6.4).

use super::{Provider, ProviderError};
use crate::entry::Entry;
use crate::parser::LineResult;
use crate::url::NormalizedUrl;
use async_trait::async_trait;
use uuid::Uuid;

pub struct OisdProvider {
    source_url: String,
}

impl Default for OisdProvider {
    fn default() -> Self {
        Self {
            source_url: "https://big.oisd.nl/domainswild".to_string(),
        }
    }
}

#[async_trait]
impl Provider for OisdProvider {
    fn name(&self) -> &'static str {
        "oisd"
    }

    fn source_url(&self) -> &str {
        &self.source_url
    }

    fn cron_schedule(&self) -> Option<&str> {
        Some("0 0 4 * * *")
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<String, ProviderError> {
        let response = client
            .get(&self.source_url)
            .send()
            .await
            .map_err(|source| ProviderError::Fetch {
                provider: self.name().to_string(),
                source,
            })?;
        let body = response.text().await.map_err(|source| ProviderError::Fetch {
            provider: self.name().to_string(),
            source,
        })?;
        if body.trim().is_empty() {
            return Err(ProviderError::EmptyResponse {
                provider: self.name().to_string(),
            });
        }
        Ok(body)
    }

    fn normalize_payload(&self, raw: &str) -> Result<String, ProviderError> {
        Ok(raw.to_string())
    }

    fn line_transform(&self, process_id: Uuid) -> Box<dyn Fn(&str) -> LineResult + Send + Sync> {
        Box::new(move |line: &str| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                return Ok(None);
            }
            // OISD's wildcard entries are prefixed with `*.`; the leading
            // wildcard carries no normalizable host information.
            let candidate = trimmed.trim_start_matches("*.");
            let normalized = NormalizedUrl::parse(candidate).map_err(|e| e.to_string())?;
            Ok(Some(
                Entry::builder(normalized, "oisd", process_id)
                    .category("blocklist")
                    .build(),
            ))
        })
    }
}
