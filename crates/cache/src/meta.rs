// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Size and recency bookkeeping consumed by eviction. The store itself lives
//! outside the engine; [`MemoryMetaStore`] is the in-process implementation.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use jiff::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use snafu::OptionExt;

use crate::error::{MetaStoreSnafu, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetaKey {
    pub entity_id: String,
    pub kind:      String,
}

impl MetaKey {
    #[must_use]
    pub fn new(entity_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind:      kind.into(),
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.kind, self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub key:             MetaKey,
    pub size:            u64,
    pub partial:         bool,
    pub preserved:       bool,
    pub created:         Timestamp,
    pub last_accessed:   Timestamp,
    /// Remote modification time, unix seconds
    pub remote_modified: Option<i64>,
}

impl MetaRecord {
    fn new(key: MetaKey) -> Self {
        let now = Timestamp::now();
        Self {
            key,
            size: 0,
            partial: true,
            preserved: false,
            created: now,
            last_accessed: now,
            remote_modified: None,
        }
    }
}

#[async_trait]
pub trait MetaStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &MetaKey) -> Result<Option<MetaRecord>>;

    /// Touch the record, creating it on first access.
    async fn access(&self, key: &MetaKey) -> Result<()>;

    async fn set_partial(&self, key: &MetaKey, partial: bool) -> Result<()>;

    /// Pinned records are never offered for eviction. Fails for keys the
    /// store has never seen.
    async fn set_preserved(&self, key: &MetaKey, preserved: bool) -> Result<()>;

    async fn update_info(
        &self,
        key: &MetaKey,
        size: u64,
        remote_modified: Option<i64>,
        created: Timestamp,
    ) -> Result<()>;

    async fn delete(&self, key: &MetaKey) -> Result<()>;

    /// Unpinned records of `kind`, least recently accessed first.
    async fn list_eviction_candidates(&self, kind: &str) -> Result<Vec<MetaRecord>>;

    /// Total recorded size of `kind`.
    async fn summarize_size(&self, kind: &str) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    // The sequence number orders accesses that share a timestamp.
    records: Mutex<BTreeMap<MetaKey, (MetaRecord, u64)>>,
    seq:     Mutex<u64>,
}

impl MemoryMetaStore {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn next_seq(&self) -> u64 {
        let mut seq = self.seq.lock();
        *seq += 1;
        *seq
    }

    fn upsert(&self, key: &MetaKey, update: impl FnOnce(&mut MetaRecord)) {
        let seq = self.next_seq();
        let mut records = self.records.lock();
        let (record, _) = records
            .entry(key.clone())
            .or_insert_with(|| (MetaRecord::new(key.clone()), seq));
        update(record);
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &MetaKey) -> Result<Option<MetaRecord>> {
        Ok(self.records.lock().get(key).map(|(r, _)| r.clone()))
    }

    async fn access(&self, key: &MetaKey) -> Result<()> {
        let seq = self.next_seq();
        let mut records = self.records.lock();
        let slot = records
            .entry(key.clone())
            .or_insert_with(|| (MetaRecord::new(key.clone()), seq));
        slot.0.last_accessed = Timestamp::now();
        slot.1 = seq;
        Ok(())
    }

    async fn set_partial(&self, key: &MetaKey, partial: bool) -> Result<()> {
        self.upsert(key, |r| r.partial = partial);
        Ok(())
    }

    async fn set_preserved(&self, key: &MetaKey, preserved: bool) -> Result<()> {
        let mut records = self.records.lock();
        let (record, _) = records.get_mut(key).context(MetaStoreSnafu {
            message: format!("no record for {key}"),
        })?;
        record.preserved = preserved;
        Ok(())
    }

    async fn update_info(
        &self,
        key: &MetaKey,
        size: u64,
        remote_modified: Option<i64>,
        created: Timestamp,
    ) -> Result<()> {
        self.upsert(key, |r| {
            r.size = size;
            r.remote_modified = remote_modified;
            r.created = created;
        });
        Ok(())
    }

    async fn delete(&self, key: &MetaKey) -> Result<()> {
        self.records.lock().remove(key);
        Ok(())
    }

    async fn list_eviction_candidates(&self, kind: &str) -> Result<Vec<MetaRecord>> {
        let records = self.records.lock();
        let mut candidates: Vec<_> = records
            .values()
            .filter(|(r, _)| r.key.kind == kind && !r.preserved)
            .map(|(r, seq)| (r.last_accessed, *seq, r.clone()))
            .collect();
        candidates.sort_by_key(|(at, seq, _)| (*at, *seq));
        Ok(candidates.into_iter().map(|(_, _, r)| r).collect())
    }

    async fn summarize_size(&self, kind: &str) -> Result<u64> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|(r, _)| r.key.kind == kind)
            .map(|(r, _)| r.size)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn candidates_follow_access_order_and_skip_pinned() {
        let store = MemoryMetaStore::new();
        let a = MetaKey::new("a", "video");
        let b = MetaKey::new("b", "video");
        let c = MetaKey::new("c", "video");
        let other = MetaKey::new("x", "audio");
        for key in [&a, &b, &c, &other] {
            store.access(key).await.unwrap();
            store
                .update_info(key, 100, None, Timestamp::now())
                .await
                .unwrap();
        }
        store.access(&a).await.unwrap();
        store.set_preserved(&b, true).await.unwrap();

        let ids: Vec<_> = store
            .list_eviction_candidates("video")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key.entity_id)
            .collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(store.summarize_size("video").await.unwrap(), 300);

        store.delete(&c).await.unwrap();
        assert_eq!(store.summarize_size("video").await.unwrap(), 200);
        assert!(store.get(&c).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_flag_round_trips() {
        let store = MemoryMetaStore::new();
        let key = MetaKey::new("1", "video");
        store.access(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().unwrap().partial);
        store.set_partial(&key, false).await.unwrap();
        assert!(!store.get(&key).await.unwrap().unwrap().partial);
    }

    #[tokio::test]
    async fn pinning_unknown_key_fails() {
        let store = MemoryMetaStore::new();
        let key = MetaKey::new("ghost", "video");
        assert!(matches!(
            store.set_preserved(&key, true).await,
            Err(crate::error::CacheError::MetaStore { .. })
        ));
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
