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

//! The lookup pipeline (C10, §4.10): typed queries dispatch straight to
//! the relational store; `Full` queries additionally get the bloom/KV
//! accelerated fast-path, since that is the only index the KV cache keys
//! on (`source_url`).

use crate::cache::{BloomIndex, CacheError, KvCache};
use crate::entry::{join_ids, Entry, EntryStream, Hit, MatchType, QueryType};
use crate::store::{Store, StoreError};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("bloom filter reports the key is definitely absent")]
    BloomKeyNotFound,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct LookupPipeline {
    store: Arc<Store>,
    kv: Arc<KvCache>,
    bloom: Arc<BloomIndex>,
    use_bloom: bool,
}

impl LookupPipeline {
    pub fn new(store: Arc<Store>, kv: Arc<KvCache>, bloom: Arc<BloomIndex>, use_bloom: bool) -> Self {
        Self {
            store,
            kv,
            bloom,
            use_bloom,
        }
    }

    /// Dispatches on `query_type` (§4.10). `Full` goes through the
    /// cache-accelerated path; every other type is a direct, indexed
    /// equality lookup against the relational store.
    pub async fn query(&self, query_type: QueryType, value: &str) -> Result<Vec<Hit>, LookupError> {
        if query_type == QueryType::Full {
            return self.query_full_accelerated(value).await;
        }
        let rows = self.store.query_link(query_type, value).await?;
        Ok(rows.into_iter().map(|(entry, match_type)| to_hit(entry, match_type)).collect())
    }

    async fn query_full_accelerated(&self, value: &str) -> Result<Vec<Hit>, LookupError> {
        if self.use_bloom && !self.bloom.check(value) {
            return Err(LookupError::BloomKeyNotFound);
        }

        if let Some(ids_raw) = self.kv.get(value)? {
            let ids = EntryStream::parse_ids_raw(&ids_raw);
            return Ok(ids_to_hits(ids, value));
        }

        let rows = self.store.query_link(QueryType::Full, value).await?;
        self.backfill(value, &rows);
        Ok(rows.into_iter().map(|(entry, match_type)| to_hit(entry, match_type)).collect())
    }

    fn backfill(&self, value: &str, rows: &[(Entry, MatchType)]) {
        if rows.is_empty() {
            return;
        }
        let ids: BTreeSet<Uuid> = rows.iter().map(|(entry, _)| entry.id).collect();
        let ids_raw = join_ids(&ids);
        if let Err(e) = self.kv.set(value, &ids_raw) {
            log::error!("failed to backfill kv cache for '{value}': {e}");
            return;
        }
        if let Err(e) = self.kv.commit() {
            log::error!("failed to commit kv backfill for '{value}': {e}");
        }
    }
}

fn ids_to_hits(ids: BTreeSet<Uuid>, matched_value: &str) -> Vec<Hit> {
    ids.into_iter()
        .map(|id| Hit {
            id,
            match_type: MatchType::ExactUrl,
            matched_value: matched_value.to_string(),
        })
        .collect()
}

fn to_hit(entry: Entry, match_type: MatchType) -> Hit {
    let matched_value = match match_type {
        MatchType::ExactUrl | MatchType::Full | MatchType::Mixed => entry.source_url.clone(),
        MatchType::Host => entry.host.clone(),
        MatchType::Domain => entry.domain.clone(),
        MatchType::Path => entry.path.clone(),
    };
    Hit {
        id: entry.id,
        match_type,
        matched_value,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CacheConfig;
    use crate::url::NormalizedUrl;

    async fn wire() -> (LookupPipeline, Arc<Store>, Arc<KvCache>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let kv = Arc::new(KvCache::open(&CacheConfig { in_memory: true, ..Default::default() }).unwrap());
        let bloom = Arc::new(BloomIndex::empty());
        let pipeline = LookupPipeline::new(Arc::clone(&store), Arc::clone(&kv), bloom, false);
        (pipeline, store, kv)
    }

    #[tokio::test]
    async fn full_query_falls_through_to_store_and_backfills_kv_on_miss() {
        let (pipeline, store, kv) = wire().await;
        let process_id = Uuid::new_v4();
        let entry = Entry::builder(NormalizedUrl::parse("https://bad.example.com/").unwrap(), "oisd", process_id)
            .build();
        store.batch_upsert(&[entry]).await.unwrap();

        assert!(kv.get("https://bad.example.com/").unwrap().is_none());
        let hits = pipeline.query(QueryType::Full, "https://bad.example.com/").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].match_type, MatchType::ExactUrl);
        assert!(kv.get("https://bad.example.com/").unwrap().is_some());
    }

    #[tokio::test]
    async fn full_query_serves_from_kv_without_touching_store_ids() {
        let (pipeline, store, kv) = wire().await;
        let id = Uuid::new_v4();
        kv.set("https://cached.example.com/", &id.to_string()).unwrap();
        kv.commit().unwrap();

        let hits = pipeline.query(QueryType::Full, "https://cached.example.com/").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        // nothing was ever inserted into the store; a KV hit is authoritative
        assert!(store.get_entry_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bloom_miss_is_authoritative_and_skips_kv_and_store() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let kv = Arc::new(KvCache::open(&CacheConfig { in_memory: true, ..Default::default() }).unwrap());
        let bloom = Arc::new(BloomIndex::empty()); // nothing rebuilt in, so almost everything misses
        let pipeline = LookupPipeline::new(store, kv, bloom, true);

        let result = pipeline.query(QueryType::Full, "https://definitely-not-there.example.com/").await;
        assert!(matches!(result, Err(LookupError::BloomKeyNotFound)));
    }

    #[tokio::test]
    async fn host_query_dispatches_directly_to_store() {
        let (pipeline, store, _kv) = wire().await;
        let process_id = Uuid::new_v4();
        let entry = Entry::builder(
            NormalizedUrl::parse("https://sub.malware.example.com/path").unwrap(),
            "urlhaus",
            process_id,
        )
        .build();
        store.batch_upsert(&[entry]).await.unwrap();

        let hits = pipeline
            .query(QueryType::Host, "sub.malware.example.com")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].match_type, MatchType::Host);
    }
}
