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

//! The Process Manager (C11, §4.7): the only admission gate for a whole
//! ingestion run. Owned once by `AppContext`, never a package-level global.

mod error;

pub use error::ProcessManagerError;

use crate::store::{ProcessStatus, RunStatus, Store, StoreError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use uuid::Uuid;

/// Cap on the in-memory history ring (§4.7).
const HISTORY_CAPACITY: usize = 100;

pub struct ProcessManager {
    store: Arc<Store>,
    running: AtomicBool,
    current: Mutex<Option<ProcessStatus>>,
    history: Mutex<VecDeque<ProcessStatus>>,
}

impl ProcessManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            running: AtomicBool::new(false),
            current: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Atomically transitions running `false -> true`. Fails with
    /// [`ProcessManagerError::AlreadyRunning`] if a run is already in
    /// progress; this is the single admission gate the scheduler, the HTTP
    /// trigger, and the CLI all share.
    pub fn try_start(&self) -> Result<Uuid, ProcessManagerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProcessManagerError::AlreadyRunning);
        }
        let id = Uuid::new_v4();
        *self.current.lock().unwrap() = Some(ProcessStatus::started(id));
        Ok(id)
    }

    /// Marks the current run finished, moves it into history, and clears
    /// the running flag. Logs and returns without mutating state if `id`
    /// does not match the current run.
    pub async fn finish(
        &self,
        id: Uuid,
        providers_processed: i64,
        providers_removed: i64,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut status = {
            let mut current = self.current.lock().unwrap();
            match current.take() {
                Some(status) if status.id == id => status,
                Some(other) => {
                    log::warn!("finish({id}) called but the active run is {}", other.id);
                    *current = Some(other);
                    return Ok(());
                }
                None => {
                    log::warn!("finish({id}) called with no active run");
                    return Ok(());
                }
            }
        };

        status.end_time = Some(OffsetDateTime::now_utc());
        status.providers_processed = providers_processed;
        status.providers_removed = providers_removed;
        status.status = if error.is_some() { RunStatus::Failed } else { RunStatus::Completed };
        status.error = error;

        self.store.persist_process_status(&status).await?;

        {
            let mut history = self.history.lock().unwrap();
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(status);
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_current(&self) -> Option<ProcessStatus> {
        self.current.lock().unwrap().clone()
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<ProcessStatus>, StoreError> {
        if let Some(current) = self.get_current() {
            if current.id == id {
                return Ok(Some(current));
            }
        }
        if let Some(found) = self.history.lock().unwrap().iter().find(|s| s.id == id).cloned() {
            return Ok(Some(found));
        }
        self.store.load_process_status(id).await
    }

    /// Merges in-memory history with persisted rows, deduplicated by id,
    /// newest first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<ProcessStatus>, StoreError> {
        let mut merged: Vec<ProcessStatus> = self.history.lock().unwrap().iter().cloned().collect();
        if let Some(current) = self.get_current() {
            merged.push(current);
        }

        let persisted = self.store.list_recent_process_statuses(limit).await?;
        for status in persisted {
            if !merged.iter().any(|s| s.id == status.id) {
                merged.push(status);
            }
        }

        merged.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        merged.truncate(limit.max(0) as usize);
        Ok(merged)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn wire() -> ProcessManager {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        ProcessManager::new(store)
    }

    #[tokio::test]
    async fn try_start_twice_without_finish_fails() {
        let pm = wire().await;
        let id = pm.try_start().unwrap();
        let second = pm.try_start();
        assert!(matches!(second, Err(ProcessManagerError::AlreadyRunning)));
        pm.finish(id, 1, 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn finish_clears_the_gate_for_the_next_run() {
        let pm = wire().await;
        let id = pm.try_start().unwrap();
        pm.finish(id, 2, 0, None).await.unwrap();
        let id2 = pm.try_start().unwrap();
        assert_ne!(id, id2);
    }

    #[tokio::test]
    async fn finish_with_mismatched_id_is_a_noop() {
        let pm = wire().await;
        let id = pm.try_start().unwrap();
        pm.finish(Uuid::new_v4(), 0, 0, None).await.unwrap();
        // the real run is still active
        assert!(matches!(pm.try_start(), Err(ProcessManagerError::AlreadyRunning)));
        pm.finish(id, 0, 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn list_recent_merges_history_and_persisted_rows() {
        let pm = wire().await;
        for _ in 0..3 {
            let id = pm.try_start().unwrap();
            pm.finish(id, 1, 0, None).await.unwrap();
        }
        let recent = pm.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
    }

    #[tokio::test]
    async fn failed_run_is_recorded_with_its_error() {
        let pm = wire().await;
        let id = pm.try_start().unwrap();
        pm.finish(id, 0, 0, Some("fetch failed".to_string())).await.unwrap();
        let status = pm.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert_eq!(status.error.as_deref(), Some("fetch failed"));
    }
}
