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

//! The operations of [`super::Store`]: upserts, soft deletes, the entry
//! stream used to refill the KV cache, link queries, and process-status
//! persistence (§4.2, §4.7, §6.2).

use super::{ProcessStatus, RunStatus, Store, StoreError};
use crate::entry::{Entry, EntryStream, MatchType, QueryType};
use crate::shutdown::Shutdown;
use crate::url::NormalizedUrl;
use futures::{Stream, StreamExt};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeSet;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<Entry, StoreError> {
    let parse_time = |raw: &str| {
        OffsetDateTime::parse(raw, &Rfc3339).map_err(|_| StoreError::RowsIteration(sqlx::Error::Decode(
            "invalid rfc3339 timestamp".into(),
        )))
    };
    let parse_uuid = |raw: &str| {
        Uuid::parse_str(raw).map_err(|_| StoreError::RowsIteration(sqlx::Error::Decode(
            "invalid uuid".into(),
        )))
    };

    let id: String = row.try_get("id").map_err(StoreError::RowsIteration)?;
    let process_id: String = row.try_get("process_id").map_err(StoreError::RowsIteration)?;
    let created_at: String = row.try_get("created_at").map_err(StoreError::RowsIteration)?;
    let updated_at: String = row.try_get("updated_at").map_err(StoreError::RowsIteration)?;
    let deleted_at: Option<String> = row.try_get("deleted_at").map_err(StoreError::RowsIteration)?;
    let sub_domains: String = row.try_get("sub_domains").map_err(StoreError::RowsIteration)?;

    Ok(Entry {
        id: parse_uuid(&id)?,
        process_id: parse_uuid(&process_id)?,
        scheme: row.try_get("scheme").map_err(StoreError::RowsIteration)?,
        host: row.try_get("host").map_err(StoreError::RowsIteration)?,
        domain: row.try_get("domain").map_err(StoreError::RowsIteration)?,
        sub_domains: Entry::parse_sub_domains(&sub_domains),
        path: row.try_get("path").map_err(StoreError::RowsIteration)?,
        raw_query: row.try_get("raw_query").map_err(StoreError::RowsIteration)?,
        source_url: row.try_get("source_url").map_err(StoreError::RowsIteration)?,
        source: row.try_get("source").map_err(StoreError::RowsIteration)?,
        category: row.try_get("category").map_err(StoreError::RowsIteration)?,
        confidence: row.try_get("confidence").map_err(StoreError::RowsIteration)?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        deleted_at: deleted_at.as_deref().map(parse_time).transpose()?,
    })
}

impl Store {
    /// Upserts a batch of entries in one transaction (§4.2): a row matching
    /// `(source_url, source)` is refreshed in place (including clearing
    /// `deleted_at`, so a re-discovered URL un-deletes), anything else is
    /// inserted fresh.
    pub async fn batch_upsert(&self, entries: &[Entry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx: Transaction<'_, Sqlite> =
            self.write_pool().begin().await.map_err(StoreError::Tx)?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO blacklist_entries
                    (id, process_id, scheme, host, domain, sub_domains, path, raw_query,
                     source_url, source, category, confidence, created_at, updated_at, deleted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                ON CONFLICT(source_url, source) DO UPDATE SET
                    process_id = excluded.process_id,
                    scheme = excluded.scheme,
                    host = excluded.host,
                    domain = excluded.domain,
                    sub_domains = excluded.sub_domains,
                    path = excluded.path,
                    raw_query = excluded.raw_query,
                    category = excluded.category,
                    confidence = excluded.confidence,
                    updated_at = excluded.updated_at,
                    deleted_at = NULL
                "#,
            )
            .bind(entry.id.to_string())
            .bind(entry.process_id.to_string())
            .bind(&entry.scheme)
            .bind(&entry.host)
            .bind(&entry.domain)
            .bind(entry.sub_domains_raw())
            .bind(&entry.path)
            .bind(&entry.raw_query)
            .bind(&entry.source_url)
            .bind(&entry.source)
            .bind(&entry.category)
            .bind(entry.confidence)
            .bind(entry.created_at.format(&Rfc3339).expect("rfc3339 formats"))
            .bind(entry.updated_at.format(&Rfc3339).expect("rfc3339 formats"))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Upsert)?;
        }

        tx.commit().await.map_err(StoreError::Tx)
    }

    /// Soft-deletes every row of `source` not touched by `current_process_id`
    /// (§4.2, §5): the tombstone for entries a provider stopped reporting.
    pub async fn soft_delete_older(
        &self,
        source: &str,
        current_process_id: Uuid,
    ) -> Result<u64, StoreError> {
        let now = OffsetDateTime::now_utc().format(&Rfc3339).expect("rfc3339 formats");
        let result = sqlx::query(
            "UPDATE blacklist_entries SET deleted_at = ? \
             WHERE source = ? AND process_id != ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(source)
        .bind(current_process_id.to_string())
        .execute(self.write_pool())
        .await
        .map_err(StoreError::Delete)?;
        Ok(result.rows_affected())
    }

    /// Soft-deletes every non-tombstoned row of `source` outright, with no
    /// process-id exemption. Backs the HTTP boundary's `providers_to_remove`
    /// (§6.2): an explicit decommission of a feed, independent of whatever
    /// ingestion run is also requested in the same call.
    pub async fn remove_all_for_source(&self, source: &str) -> Result<u64, StoreError> {
        let now = OffsetDateTime::now_utc().format(&Rfc3339).expect("rfc3339 formats");
        let result = sqlx::query(
            "UPDATE blacklist_entries SET deleted_at = ? WHERE source = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(source)
        .execute(self.write_pool())
        .await
        .map_err(StoreError::Delete)?;
        Ok(result.rows_affected())
    }

    /// Streams the `{source_url, ids}` projection used to refill the KV
    /// cache (§4.2), ordered by descending id count so the busiest URLs
    /// arrive first. Cancels promptly on shutdown rather than draining to
    /// completion.
    pub fn stream_entry_streams(
        &self,
        shutdown: Shutdown,
    ) -> impl Stream<Item = Result<EntryStream, StoreError>> + '_ {
        let rows = sqlx::query(
            "SELECT source_url, GROUP_CONCAT(id) AS ids_raw, COUNT(*) AS ct \
             FROM blacklist_entries WHERE deleted_at IS NULL \
             GROUP BY source_url ORDER BY ct DESC",
        )
        .fetch(self.read_pool())
        .map(|row| {
            let row = row.map_err(StoreError::ToScan)?;
            let source_url: String = row.try_get("source_url").map_err(StoreError::RowsIteration)?;
            let ids_raw: String = row.try_get("ids_raw").map_err(StoreError::RowsIteration)?;
            let ids: BTreeSet<Uuid> = EntryStream::parse_ids_raw(&ids_raw);
            Ok(EntryStream { source_url, ids, ids_raw })
        });

        async_stream_take_until(rows, shutdown)
    }

    /// Looks up entries by one of the [`QueryType`] equality classes
    /// (§4.10). `Mixed` normalizes `value` through [`NormalizedUrl`] and
    /// unions exact source-url, host, domain, and (non-root) path matches;
    /// on a normalization failure it degrades to an exact source-url match
    /// rather than failing the whole query.
    pub async fn query_link(
        &self,
        query_type: QueryType,
        value: &str,
    ) -> Result<Vec<(Entry, MatchType)>, StoreError> {
        match query_type {
            QueryType::Full => self
                .exact_match(value, "source_url", MatchType::ExactUrl)
                .await,
            QueryType::Host => self.exact_match(value, "host", MatchType::Host).await,
            QueryType::Domain => self.exact_match(value, "domain", MatchType::Domain).await,
            QueryType::Path => self.exact_match(value, "path", MatchType::Path).await,
            QueryType::Mixed => self.mixed_match(value).await,
        }
    }

    async fn exact_match(
        &self,
        value: &str,
        column: &'static str,
        match_type: MatchType,
    ) -> Result<Vec<(Entry, MatchType)>, StoreError> {
        let sql = format!(
            "SELECT * FROM blacklist_entries WHERE {column} = ? AND deleted_at IS NULL"
        );
        let rows = sqlx::query(&sql)
            .bind(value)
            .fetch_all(self.read_pool())
            .await
            .map_err(StoreError::ToQuery)?;
        rows.iter()
            .map(|row| row_to_entry(row).map(|e| (e, match_type)))
            .collect()
    }

    async fn mixed_match(&self, value: &str) -> Result<Vec<(Entry, MatchType)>, StoreError> {
        let mut hits = self.exact_match(value, "source_url", MatchType::ExactUrl).await?;

        let Ok(normalized) = NormalizedUrl::parse(value) else {
            return Ok(hits);
        };

        hits.extend(self.exact_match(&normalized.host, "host", MatchType::Host).await?);
        hits.extend(self.exact_match(&normalized.domain, "domain", MatchType::Domain).await?);
        if !normalized.path.is_empty() && normalized.path != "/" {
            hits.extend(self.exact_match(&normalized.path, "path", MatchType::Path).await?);
        }
        Ok(hits)
    }

    pub async fn get_entry_by_id(&self, id: Uuid) -> Result<Option<Entry>, StoreError> {
        let row = sqlx::query("SELECT * FROM blacklist_entries WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.read_pool())
            .await
            .map_err(StoreError::ToQuery)?;
        row.as_ref().map(row_to_entry).transpose()
    }

    pub async fn get_entries_by_ids(&self, ids: &BTreeSet<Uuid>) -> Result<Vec<Entry>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("SELECT * FROM blacklist_entries WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query
            .fetch_all(self.read_pool())
            .await
            .map_err(StoreError::ToQuery)?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Persists a [`ProcessStatus`] row, upserting on `id` (§4.7): called on
    /// run start, on each status transition, and on completion.
    pub async fn persist_process_status(&self, status: &ProcessStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO provider_processes
                (id, status, start_time, end_time, providers_processed, providers_removed, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                end_time = excluded.end_time,
                providers_processed = excluded.providers_processed,
                providers_removed = excluded.providers_removed,
                error = excluded.error
            "#,
        )
        .bind(status.id.to_string())
        .bind(status.status.to_string())
        .bind(status.start_time.format(&Rfc3339).expect("rfc3339 formats"))
        .bind(
            status
                .end_time
                .map(|t| t.format(&Rfc3339).expect("rfc3339 formats")),
        )
        .bind(status.providers_processed)
        .bind(status.providers_removed)
        .bind(&status.error)
        .execute(self.write_pool())
        .await
        .map_err(StoreError::Upsert)?;
        Ok(())
    }

    pub async fn load_process_status(&self, id: Uuid) -> Result<Option<ProcessStatus>, StoreError> {
        let row = sqlx::query("SELECT * FROM provider_processes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.read_pool())
            .await
            .map_err(StoreError::ToQuery)?;
        row.as_ref().map(row_to_process_status).transpose()
    }

    /// The most recent runs, newest first, merged by the Process Manager
    /// with its in-memory history (§4.7).
    pub async fn list_recent_process_statuses(
        &self,
        limit: i64,
    ) -> Result<Vec<ProcessStatus>, StoreError> {
        let rows = sqlx::query("SELECT * FROM provider_processes ORDER BY start_time DESC LIMIT ?")
            .bind(limit)
            .fetch_all(self.read_pool())
            .await
            .map_err(StoreError::ToQuery)?;
        rows.iter().map(row_to_process_status).collect()
    }
}

fn row_to_process_status(row: &sqlx::sqlite::SqliteRow) -> Result<ProcessStatus, StoreError> {
    let id: String = row.try_get("id").map_err(StoreError::RowsIteration)?;
    let status: String = row.try_get("status").map_err(StoreError::RowsIteration)?;
    let start_time: String = row.try_get("start_time").map_err(StoreError::RowsIteration)?;
    let end_time: Option<String> = row.try_get("end_time").map_err(StoreError::RowsIteration)?;

    let parse_time = |raw: &str| {
        OffsetDateTime::parse(raw, &Rfc3339).map_err(|_| StoreError::RowsIteration(sqlx::Error::Decode(
            "invalid rfc3339 timestamp".into(),
        )))
    };

    Ok(ProcessStatus {
        id: Uuid::parse_str(&id).map_err(|_| {
            StoreError::RowsIteration(sqlx::Error::Decode("invalid uuid".into()))
        })?,
        status: RunStatus::from_str(&status).map_err(|_| {
            StoreError::RowsIteration(sqlx::Error::Decode("invalid run status".into()))
        })?,
        start_time: parse_time(&start_time)?,
        end_time: end_time.as_deref().map(parse_time).transpose()?,
        providers_processed: row.try_get("providers_processed").map_err(StoreError::RowsIteration)?,
        providers_removed: row.try_get("providers_removed").map_err(StoreError::RowsIteration)?,
        error: row.try_get("error").map_err(StoreError::RowsIteration)?,
    })
}

/// Adapts a row stream to stop promptly on shutdown, without requiring the
/// `async-stream` crate: polls the underlying stream and the shutdown
/// signal side by side via [`futures::stream::select`]-style manual polling
/// would need pinning gymnastics, so this instead rides `take_until` on the
/// shutdown future, which is already `Unpin`-friendly for a boxed stream.
fn async_stream_take_until<'a, S>(
    stream: S,
    shutdown: Shutdown,
) -> impl Stream<Item = Result<EntryStream, StoreError>> + 'a
where
    S: Stream<Item = Result<EntryStream, StoreError>> + Send + 'a,
{
    Box::pin(stream).take_until(async move { shutdown.wait().await })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::url::NormalizedUrl;
    use futures::pin_mut;

    async fn seeded_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn entry(url: &str, source: &str, process_id: Uuid) -> Entry {
        Entry::builder(NormalizedUrl::parse(url).unwrap(), source, process_id).build()
    }

    #[tokio::test]
    async fn upsert_then_query_round_trips() {
        let store = seeded_store().await;
        let process_id = Uuid::new_v4();
        let e = entry("https://bad.example.com/phish", "oisd", process_id);
        store.batch_upsert(&[e.clone()]).await.unwrap();

        let hits = store.query_link(QueryType::Full, &e.source_url).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, e.id);
        assert_eq!(hits[0].1, MatchType::ExactUrl);
    }

    #[tokio::test]
    async fn reupsert_clears_soft_delete() {
        let store = seeded_store().await;
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let e = entry("https://bad.example.com/x", "oisd", p1);
        store.batch_upsert(&[e.clone()]).await.unwrap();
        store.soft_delete_older("oisd", p2).await.unwrap();

        let after_delete = store.get_entry_by_id(e.id).await.unwrap().unwrap();
        assert!(after_delete.deleted_at.is_some());

        let mut e2 = entry("https://bad.example.com/x", "oisd", p2);
        e2.id = e.id;
        store.batch_upsert(&[e2]).await.unwrap();
        let after_reupsert = store.get_entry_by_id(e.id).await.unwrap().unwrap();
        assert!(after_reupsert.deleted_at.is_none());
    }

    #[tokio::test]
    async fn soft_delete_skips_current_process() {
        let store = seeded_store().await;
        let process_id = Uuid::new_v4();
        let e = entry("https://bad.example.com/keep", "oisd", process_id);
        store.batch_upsert(&[e.clone()]).await.unwrap();

        let removed = store.soft_delete_older("oisd", process_id).await.unwrap();
        assert_eq!(removed, 0);
        let still = store.get_entry_by_id(e.id).await.unwrap().unwrap();
        assert!(still.deleted_at.is_none());
    }

    #[tokio::test]
    async fn remove_all_for_source_tombstones_every_row_regardless_of_process_id() {
        let store = seeded_store().await;
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let a = entry("https://bad.example.com/a", "oisd", p1);
        let b = entry("https://bad.example.com/b", "oisd", p2);
        let other = entry("https://bad.example.com/c", "urlhaus", p2);
        store.batch_upsert(&[a.clone(), b.clone(), other.clone()]).await.unwrap();

        let removed = store.remove_all_for_source("oisd").await.unwrap();
        assert_eq!(removed, 2);

        assert!(store.get_entry_by_id(a.id).await.unwrap().unwrap().deleted_at.is_some());
        assert!(store.get_entry_by_id(b.id).await.unwrap().unwrap().deleted_at.is_some());
        assert!(store.get_entry_by_id(other.id).await.unwrap().unwrap().deleted_at.is_none());

        let again = store.remove_all_for_source("oisd").await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn mixed_query_unions_host_domain_and_path() {
        let store = seeded_store().await;
        let process_id = Uuid::new_v4();
        let e = entry("https://sub.example.com/path/a", "urlhaus", process_id);
        store.batch_upsert(&[e.clone()]).await.unwrap();

        let hits = store
            .query_link(QueryType::Mixed, "https://sub.example.com/path/a")
            .await
            .unwrap();
        let match_types: BTreeSet<MatchType> = hits.into_iter().map(|(_, m)| m).collect();
        assert!(match_types.contains(&MatchType::ExactUrl));
        assert!(match_types.contains(&MatchType::Host));
        assert!(match_types.contains(&MatchType::Domain));
        assert!(match_types.contains(&MatchType::Path));
    }

    #[tokio::test]
    async fn entry_stream_groups_by_source_url() {
        let store = seeded_store().await;
        let process_id = Uuid::new_v4();
        let e = entry("https://example.com/a", "oisd", process_id);
        store.batch_upsert(&[e]).await.unwrap();

        let (_signal, shutdown) = crate::shutdown::shutdown_pair();
        let stream = store.stream_entry_streams(shutdown);
        pin_mut!(stream);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.source_url, "https://example.com/a");
        assert_eq!(first.ids.len(), 1);
    }

    #[tokio::test]
    async fn process_status_persists_and_loads() {
        let store = seeded_store().await;
        let id = Uuid::new_v4();
        let mut status = ProcessStatus::started(id);
        store.persist_process_status(&status).await.unwrap();

        status.status = RunStatus::Completed;
        status.providers_processed = 3;
        store.persist_process_status(&status).await.unwrap();

        let loaded = store.load_process_status(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.providers_processed, 3);
    }
}
