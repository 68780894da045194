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

//! The canonical entry model (C2) and the small value types that travel
//! with it through the rest of the pipeline.

use crate::url::NormalizedUrl;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumString};
use time::OffsetDateTime;
use uuid::Uuid;

/// One normalized, blacklisted-URL record (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: Uuid,
    pub process_id: Uuid,
    pub scheme: String,
    pub host: String,
    pub domain: String,
    pub sub_domains: Vec<String>,
    pub path: String,
    pub raw_query: String,
    pub source_url: String,
    pub source: String,
    pub category: Option<String>,
    pub confidence: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Entry {
    /// Starts a fluent builder seeded from a normalized URL and a source.
    pub fn builder(normalized: NormalizedUrl, source: impl Into<String>, process_id: Uuid) -> EntryBuilder {
        EntryBuilder::new(normalized, source, process_id)
    }

    /// Joins `sub_domains` the way the relational store persists them
    /// (§4.2): a comma-joined, left-to-right ordered list.
    pub fn sub_domains_raw(&self) -> String {
        self.sub_domains.join(",")
    }

    pub fn parse_sub_domains(raw: &str) -> Vec<String> {
        if raw.is_empty() {
            Vec::new()
        } else {
            raw.split(',').map(str::to_string).collect()
        }
    }
}

/// Fluent constructor for [`Entry`] (§3.1), grounded on the builder pattern
/// used throughout the pack for multi-field value objects.
#[derive(Debug)]
pub struct EntryBuilder {
    normalized: NormalizedUrl,
    source: String,
    process_id: Uuid,
    category: Option<String>,
    confidence: Option<f64>,
    now: Option<OffsetDateTime>,
}

impl EntryBuilder {
    fn new(normalized: NormalizedUrl, source: impl Into<String>, process_id: Uuid) -> Self {
        Self {
            normalized,
            source: source.into(),
            process_id,
            category: None,
            confidence: None,
            now: None,
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Overrides the creation timestamp; used by tests that need
    /// deterministic `created_at`/`updated_at` values.
    #[cfg(test)]
    pub fn created_at(mut self, now: OffsetDateTime) -> Self {
        self.now = Some(now);
        self
    }

    pub fn build(self) -> Entry {
        let now = self.now.unwrap_or_else(OffsetDateTime::now_utc);
        Entry {
            id: Uuid::new_v4(),
            process_id: self.process_id,
            scheme: self.normalized.scheme,
            host: self.normalized.host,
            domain: self.normalized.domain,
            sub_domains: self.normalized.sub_domains,
            path: self.normalized.path,
            raw_query: self.normalized.raw_query,
            source_url: self.normalized.source_url,
            source: self.source,
            category: self.category,
            confidence: self.confidence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// The `{source_url, ids}` projection streamed from the relational store
/// into the KV cache (§3.1, §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStream {
    pub source_url: String,
    pub ids: BTreeSet<Uuid>,
    pub ids_raw: String,
}

impl EntryStream {
    pub fn new(source_url: String, ids: BTreeSet<Uuid>) -> Self {
        let ids_raw = join_ids(&ids);
        Self {
            source_url,
            ids,
            ids_raw,
        }
    }

    pub fn parse_ids_raw(raw: &str) -> BTreeSet<Uuid> {
        raw.split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect()
    }
}

pub fn join_ids(ids: &BTreeSet<Uuid>) -> String {
    ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",")
}

/// The kind of equality probed by [`crate::lookup`] (§3.1, §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueryType {
    Full,
    Host,
    Domain,
    Path,
    Mixed,
}

/// The kind of match that produced a [`Hit`] (§3.1). `Full` and `Mixed`
/// additionally appear here because a caller may query with those types;
/// `ExactUrl` is what a `Full`/`Mixed` exact-source-url match is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    ExactUrl,
    Host,
    Domain,
    Path,
    Full,
    Mixed,
}

/// One row returned by the lookup pipeline (§3.1, §4.10).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    pub id: Uuid,
    pub match_type: MatchType,
    pub matched_value: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_produces_matching_created_and_updated_at() {
        let normalized = NormalizedUrl::parse("https://x.example.com/path?q=1").unwrap();
        let entry = Entry::builder(normalized, "oisd", Uuid::new_v4())
            .category("phishing")
            .confidence(1.5)
            .build();
        assert_eq!(entry.created_at, entry.updated_at);
        assert_eq!(entry.confidence, Some(1.0));
        assert_eq!(entry.domain, "example.com");
        assert!(entry.deleted_at.is_none());
    }

    #[test]
    fn sub_domains_round_trip_through_raw_join() {
        let normalized = NormalizedUrl::parse("a.b.example.com").unwrap();
        let entry = Entry::builder(normalized, "urlhaus", Uuid::new_v4()).build();
        let raw = entry.sub_domains_raw();
        assert_eq!(raw, "a,b");
        assert_eq!(Entry::parse_sub_domains(&raw), vec!["a", "b"]);
    }

    #[test]
    fn entry_stream_ids_raw_round_trips() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ids: BTreeSet<Uuid> = [a, b].into_iter().collect();
        let stream = EntryStream::new("https://example.com/".to_string(), ids.clone());
        assert_eq!(EntryStream::parse_ids_raw(&stream.ids_raw), ids);
    }
}
