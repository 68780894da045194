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

//! The negative-lookup bloom filter half of C8 (§4.5). Kept separate from
//! [`super::KvCache`] since it has its own lifecycle: rebuilt wholesale
//! once per successful cache sync and swapped in atomically, rather than
//! mutated key-by-key.

use arc_swap::ArcSwap;
use growable_bloom_filter::GrowableBloom;
use std::sync::Arc;

/// Target false-positive rate (§4.5).
const TARGET_FALSE_POSITIVE_RATE: f64 = 0.01;
/// Floor on the sized capacity, regardless of how few keys a sync found.
const MIN_EXPECTED_KEYS: usize = 1000;

/// Negative-lookup fast path over the full KV key set. A miss is
/// authoritative; a hit proves nothing and must be confirmed downstream.
pub struct BloomIndex {
    inner: ArcSwap<GrowableBloom>,
}

impl BloomIndex {
    /// An index with no keys; every lookup misses until the first sync
    /// rebuilds it.
    pub fn empty() -> Self {
        Self {
            inner: ArcSwap::from_pointee(GrowableBloom::new(
                TARGET_FALSE_POSITIVE_RATE,
                MIN_EXPECTED_KEYS,
            )),
        }
    }

    /// `true` means "maybe present"; `false` means "definitely absent".
    pub fn check(&self, key: &str) -> bool {
        self.inner.load().contains(&key)
    }

    /// Rebuilds the filter from scratch over `keys` and swaps it in.
    /// Readers observe either the prior filter or the fully-built one,
    /// never a partially-populated one, because the swap is a single
    /// atomic pointer store.
    pub fn rebuild<I: IntoIterator<Item = String>>(&self, keys: I, expected_keys: usize) {
        let mut fresh = GrowableBloom::new(
            TARGET_FALSE_POSITIVE_RATE,
            expected_keys.max(MIN_EXPECTED_KEYS),
        );
        for key in keys {
            fresh.insert(&key);
        }
        self.inner.store(Arc::new(fresh));
    }
}

impl Default for BloomIndex {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_index_does_not_panic_on_check() {
        let index = BloomIndex::empty();
        // An empty filter may still report false positives at random, but
        // must not crash and must not be depended on for a guaranteed hit.
        let _ = index.check("https://example.com/");
    }

    #[test]
    fn rebuilt_index_reports_hits_for_every_inserted_key() {
        let index = BloomIndex::empty();
        let keys = vec![
            "https://a.example.com/".to_string(),
            "https://b.example.com/".to_string(),
        ];
        index.rebuild(keys.clone(), keys.len());
        for key in keys {
            assert!(index.check(&key));
        }
    }

    #[test]
    fn rebuild_replaces_rather_than_merges() {
        let index = BloomIndex::empty();
        index.rebuild(vec!["https://old.example.com/".to_string()], 1);
        index.rebuild(vec!["https://new.example.com/".to_string()], 1);
        // The old key is very likely gone now; we only assert the new one
        // is definitely present, since bloom filters never guarantee
        // negatives for keys that happen to collide.
        assert!(index.check("https://new.example.com/"));
    }
}
