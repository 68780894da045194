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

//! PhishTank: a JSON feed, an array of objects carrying at least `url` and
//! a verification flag; unverified entries are dropped (§6.4). Flattened
//! to one URL per line in [`Provider::normalize_payload`] so it can ride
//! the same line-oriented parallel parser as the plain-text feeds.

use super::{Provider, ProviderError};
use crate::entry::Entry;
use crate::parser::LineResult;
use crate::url::NormalizedUrl;
use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct PhishtankRecord {
    url: String,
    #[serde(default)]
    verified: String,
}

pub struct PhishtankProvider {
    source_url: String,
}

impl Default for PhishtankProvider {
    fn default() -> Self {
        Self {
            source_url: "https://data.phishtank.com/data/online-valid.json".to_string(),
        }
    }
}

#[async_trait]
impl Provider for PhishtankProvider {
    fn name(&self) -> &'static str {
        "phishtank"
    }

    fn source_url(&self) -> &str {
        &self.source_url
    }

    fn cron_schedule(&self) -> Option<&str> {
        Some("0 0 */6 * * *")
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
        let records: Vec<PhishtankRecord> =
            serde_json::from_str(raw).map_err(|e| ProviderError::Decode {
                provider: self.name().to_string(),
                message: e.to_string(),
            })?;
        Ok(records
            .into_iter()
            .filter(|r| r.verified.eq_ignore_ascii_case("yes"))
            .map(|r| r.url)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn line_transform(&self, process_id: Uuid) -> Box<dyn Fn(&str) -> LineResult + Send + Sync> {
        Box::new(move |line: &str| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let normalized = NormalizedUrl::parse(trimmed).map_err(|e| e.to_string())?;
            Ok(Some(
                Entry::builder(normalized, "phishtank", process_id)
                    .category("phishing")
                    .confidence(1.0)
                    .build(),
            ))
        })
    }
}
