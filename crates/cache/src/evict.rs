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

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::ResultExt;
use tokio::fs;
use tracing::{debug, info};

use crate::{
    error::{FileReadSnafu, FileWriteSnafu, Result},
    meta::{MetaKey, MetaStore},
    metrics::EVICTIONS,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub kind:    String,
    pub budget:  u64,
    pub before:  u64,
    pub after:   u64,
    /// Entity ids whose files were deleted
    pub evicted: Vec<String>,
    /// Candidates left alone because they were in use
    pub skipped: usize,
}

/// Keeps each entity type under its size budget by deleting the least
/// recently accessed entries.
#[derive(Debug)]
pub struct Evictor {
    cache_dir:      PathBuf,
    meta:           Arc<dyn MetaStore>,
    budgets:        HashMap<String, u64>,
    default_budget: u64,
}

impl Evictor {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        meta: Arc<dyn MetaStore>,
        budgets: HashMap<String, u64>,
        default_budget: u64,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            meta,
            budgets,
            default_budget,
        }
    }

    #[must_use]
    pub fn budget_for(&self, kind: &str) -> u64 {
        self.budgets.get(kind).copied().unwrap_or(self.default_budget)
    }

    /// Evict `kind` entries until under budget or out of candidates.
    /// `is_active` marks entries that are open and must survive.
    pub async fn enforce(
        &self,
        kind: &str,
        is_active: impl Fn(&MetaKey) -> bool + Send + Sync,
    ) -> Result<EvictionReport> {
        let budget = self.budget_for(kind);
        let before = self.meta.summarize_size(kind).await?;
        let mut report = EvictionReport {
            kind: kind.to_string(),
            budget,
            before,
            after: before,
            ..EvictionReport::default()
        };
        if before <= budget {
            return Ok(report);
        }

        let mut total = before;
        for candidate in self.meta.list_eviction_candidates(kind).await? {
            if total <= budget {
                break;
            }
            if is_active(&candidate.key) {
                report.skipped += 1;
                continue;
            }
            let removed = remove_entity_files(&self.cache_dir, kind, &candidate.key.entity_id).await?;
            self.meta.delete(&candidate.key).await?;
            EVICTIONS.with_label_values(&[kind]).inc();
            debug!(key = %candidate.key, size = candidate.size, files = removed, "evicted entry");
            total = total.saturating_sub(candidate.size);
            report.evicted.push(candidate.key.entity_id);
        }
        report.after = total;
        info!(
            kind,
            budget,
            before,
            after = total,
            evicted = report.evicted.len(),
            skipped = report.skipped,
            "eviction pass finished"
        );
        Ok(report)
    }
}

/// Whether `file_name` is one of the files kept for entity `id` of `kind`:
/// the trunk file and its plain copy, the legacy pair, or the etag sidecar.
#[must_use]
pub fn belongs_to(file_name: &str, kind: &str, id: &str) -> bool {
    if file_name == format!("etag${id}.txt") {
        return true;
    }
    if file_name.starts_with(&format!("{kind}${id}.")) {
        return true;
    }
    file_name
        .strip_prefix(&format!("{id}."))
        .map(|rest| rest.strip_suffix(".dl").unwrap_or(rest))
        .is_some_and(|ext| !ext.is_empty() && !ext.contains('.'))
}

/// Delete every file of one entity; returns how many were removed.
pub async fn remove_entity_files(dir: &Path, kind: &str, id: &str) -> Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).context(FileReadSnafu),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.context(FileReadSnafu)? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if belongs_to(name, kind, id) {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context(FileWriteSnafu),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use jiff::Timestamp;

    use super::*;
    use crate::meta::MemoryMetaStore;

    #[test]
    fn file_ownership() {
        assert!(belongs_to("video$42.mp4", "video", "42"));
        assert!(belongs_to("video$42.plain.mp4", "video", "42"));
        assert!(belongs_to("42.mp4", "video", "42"));
        assert!(belongs_to("42.mp4.dl", "video", "42"));
        assert!(belongs_to("etag$42.txt", "video", "42"));
        assert!(!belongs_to("video$420.mp4", "video", "42"));
        assert!(!belongs_to("audio$42.mp4", "video", "42"));
        assert!(!belongs_to("42.5.mp4", "video", "42"));
    }

    #[tokio::test]
    async fn evicts_oldest_until_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryMetaStore::new());
        for id in ["1", "2", "3", "4"] {
            let key = MetaKey::new(id, "video");
            store.access(&key).await.unwrap();
            store
                .update_info(&key, 100, None, Timestamp::now())
                .await
                .unwrap();
            std::fs::write(dir.path().join(format!("video${id}.mp4")), b"x").unwrap();
            std::fs::write(dir.path().join(format!("etag${id}.txt")), b"x").unwrap();
        }
        store
            .set_preserved(&MetaKey::new("1", "video"), true)
            .await
            .unwrap();

        let evictor = Evictor::new(dir.path(), store.clone(), HashMap::new(), 150);
        let report = evictor
            .enforce("video", |key| key.entity_id == "2")
            .await
            .unwrap();

        assert_eq!(report.before, 400);
        assert_eq!(report.evicted, vec!["3", "4"]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.after, 200);
        assert!(dir.path().join("video$1.mp4").exists());
        assert!(dir.path().join("video$2.mp4").exists());
        assert!(!dir.path().join("video$3.mp4").exists());
        assert!(!dir.path().join("etag$3.txt").exists());
        assert!(!dir.path().join("video$4.mp4").exists());
    }

    #[tokio::test]
    async fn under_budget_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryMetaStore::new());
        let key = MetaKey::new("1", "video");
        store.update_info(&key, 10, None, Timestamp::now()).await.unwrap();
        let evictor = Evictor::new(dir.path(), store, HashMap::new(), 100);
        let report = evictor.enforce("video", |_| false).await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.after, 10);
    }
}
