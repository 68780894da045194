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

//! Per-provider in-memory bookkeeping (§3.1 `ProviderStats`, §4.4.3).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use uuid::Uuid;

/// Owned exclusively by the [`super::Collector`]; other components only
/// observe counts through its read methods.
pub struct ProviderStats {
    pub process_id: Uuid,
    pub start_time: time::OffsetDateTime,
    processed_count: AtomicU64,
    pending_operations: AtomicU64,
    active: AtomicBool,
    drained: Notify,
}

impl ProviderStats {
    pub fn new(process_id: Uuid) -> Self {
        Self {
            process_id,
            start_time: time::OffsetDateTime::now_utc(),
            processed_count: AtomicU64::new(0),
            pending_operations: AtomicU64::new(0),
            active: AtomicBool::new(true),
            drained: Notify::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count.load(Ordering::SeqCst)
    }

    pub fn pending_operations(&self) -> u64 {
        self.pending_operations.load(Ordering::SeqCst)
    }

    /// Called by `submit` for an active provider, once per entry.
    pub fn record_submitted(&self) {
        self.pending_operations.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by the writer once per entry after its batch transaction
    /// completes, success or failure alike.
    pub fn record_committed(&self, count: u64, succeeded: bool) {
        if succeeded {
            self.processed_count.fetch_add(count, Ordering::SeqCst);
        }
        if count > 0 {
            self.pending_operations.fetch_sub(count, Ordering::SeqCst);
        }
        self.drained.notify_waiters();
    }

    /// Waits until `pending_operations` reaches zero.
    ///
    /// `notify_waiters` stores no permit, so a `Notified` future only
    /// counts as listening once it has been polled at least once -- per
    /// tokio's documented pattern, `enable()` forces that registration
    /// before the zero-check runs, so a `record_committed` racing in
    /// between can't fire `notify_waiters` into a future that hasn't
    /// started listening yet.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_operations() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn drain_returns_immediately_when_nothing_pending() {
        let stats = ProviderStats::new(Uuid::new_v4());
        stats.wait_for_drain().await;
    }

    #[tokio::test]
    async fn drain_waits_for_commit() {
        let stats = std::sync::Arc::new(ProviderStats::new(Uuid::new_v4()));
        stats.record_submitted();
        stats.record_submitted();

        let waiter = {
            let stats = stats.clone();
            tokio::spawn(async move {
                stats.wait_for_drain().await;
            })
        };

        tokio::task::yield_now().await;
        stats.record_committed(2, true);
        waiter.await.unwrap();
        assert_eq!(stats.processed_count(), 2);
        assert_eq!(stats.pending_operations(), 0);
    }
}
