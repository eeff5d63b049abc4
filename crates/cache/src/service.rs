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

use std::{collections::HashMap, sync::Arc};

use bon::bon;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    config::CacheConfig,
    download::{DownloadManager, DownloadTask},
    entry::{ActiveSet, Entry, EntryContext, EntryRequest},
    error::{ClosedSnafu, FileWriteSnafu, NotSupportedSnafu, Result},
    evict::{EvictionReport, Evictor, remove_entity_files},
    meta::{MemoryMetaStore, MetaKey, MetaStore},
    source::RemoteSource,
};

/// Entry table plus one download manager per remote service.
#[derive(Debug)]
pub struct CacheService {
    ctx:      Arc<EntryContext>,
    sources:  HashMap<String, Arc<dyn RemoteSource>>,
    managers: HashMap<String, Arc<DownloadManager>>,
    entries:  Mutex<HashMap<MetaKey, Arc<Entry>>>,
    checkers: Mutex<Vec<JoinHandle<()>>>,
}

#[bon]
impl CacheService {
    /// Stall checkers are started when a tokio runtime is available.
    #[builder]
    pub fn new(
        config: CacheConfig,
        #[builder(default)] sources: Vec<Arc<dyn RemoteSource>>,
        meta: Option<Arc<dyn MetaStore>>,
    ) -> Result<Self> {
        config.validate_all()?;
        std::fs::create_dir_all(&config.cache_dir).context(FileWriteSnafu)?;

        let meta = meta.unwrap_or_else(|| Arc::new(MemoryMetaStore::new()));
        let evictor = Arc::new(Evictor::new(
            &config.cache_dir,
            Arc::clone(&meta),
            config.budgets.clone(),
            config.default_budget,
        ));

        let mut managers = HashMap::new();
        let mut checkers = Vec::new();
        let sources: HashMap<String, Arc<dyn RemoteSource>> = sources
            .into_iter()
            .map(|source| (source.name().to_string(), source))
            .collect();
        for client in sources.keys() {
            let manager = Arc::new(DownloadManager::new(
                client.clone(),
                config.scheduler.clone(),
                config.limiter.clone(),
            ));
            if tokio::runtime::Handle::try_current().is_ok() {
                checkers.push(manager.spawn_stall_checker());
            }
            managers.insert(client.clone(), manager);
        }
        info!(
            cache_dir = %config.cache_dir.display(),
            clients = ?sources.keys().collect::<Vec<_>>(),
            "cache service started"
        );

        Ok(Self {
            ctx: Arc::new(EntryContext {
                config,
                meta,
                evictor,
                active: ActiveSet::default(),
            }),
            sources,
            managers,
            entries: Mutex::new(HashMap::new()),
            checkers: Mutex::new(checkers),
        })
    }
}

impl CacheService {
    #[must_use]
    pub fn config(&self) -> &CacheConfig { &self.ctx.config }

    #[must_use]
    pub fn meta(&self) -> &Arc<dyn MetaStore> { &self.ctx.meta }

    #[must_use]
    pub fn manager(&self, client: &str) -> Option<&Arc<DownloadManager>> { self.managers.get(client) }

    /// Open (creating if needed) the entry for `request`. Pair with
    /// [`Entry::release`].
    pub async fn open(&self, request: EntryRequest) -> Result<Arc<Entry>> {
        let source = self
            .sources
            .get(&request.client)
            .cloned()
            .context(NotSupportedSnafu {
                client: request.client.clone(),
            })?;
        let manager = self
            .managers
            .get(&request.client)
            .cloned()
            .context(NotSupportedSnafu {
                client: request.client.clone(),
            })?;

        let entry = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(request.key()).or_insert_with(|| {
                debug!(key = %request.key(), client = %request.client, "new entry");
                Arc::new(Entry::new(
                    request,
                    Arc::clone(&self.ctx),
                    source,
                    manager,
                ))
            }))
        };
        entry.open().await?;
        Ok(entry)
    }

    #[must_use]
    pub fn entry(&self, kind: &str, id: &str) -> Option<Arc<Entry>> {
        self.entries.lock().get(&MetaKey::new(id, kind)).cloned()
    }

    /// Start, or join, the download of an open entry.
    pub fn download(&self, kind: &str, id: &str) -> Result<Arc<DownloadTask>> {
        self.entry(kind, id).context(ClosedSnafu)?.download()
    }

    /// Put the downloads of `ids`, in order, at the front of `client`'s
    /// queue.
    pub fn reprioritize(&self, client: &str, ids: &[MetaKey]) -> Result<()> {
        let manager = self.managers.get(client).context(NotSupportedSnafu { client })?;
        let entries = self.entries.lock();
        let tasks: Vec<_> = ids
            .iter()
            .filter_map(|key| entries.get(key))
            .map(|entry| entry.task_id().clone())
            .collect();
        drop(entries);
        manager.reprioritize(&tasks);
        Ok(())
    }

    /// Pin or unpin an entity against eviction.
    pub async fn set_preserved(&self, key: &MetaKey, preserved: bool) -> Result<()> {
        self.ctx.meta.set_preserved(key, preserved).await
    }

    /// Drop idle entries from the table and bring `kind` under its budget.
    pub async fn evict(&self, kind: &str) -> Result<EvictionReport> {
        let pruned = self.prune();
        if pruned > 0 {
            debug!(pruned, "pruned idle entries");
        }
        let active = &self.ctx.active;
        self.ctx
            .evictor
            .enforce(kind, |key| active.contains(key))
            .await
    }

    /// Close the entity's entry and delete its files and metadata.
    pub async fn remove(&self, kind: &str, id: &str) -> Result<usize> {
        let key = MetaKey::new(id, kind);
        let entry = self.entries.lock().remove(&key);
        if let Some(entry) = entry {
            entry.close()?;
        }
        let removed = remove_entity_files(&self.ctx.config.cache_dir, kind, id).await?;
        self.ctx.meta.delete(&key).await?;
        info!(%key, files = removed, "removed entity");
        Ok(removed)
    }

    fn prune(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_idle());
        before - entries.len()
    }

    /// Close every entry and stop every download manager.
    pub fn shutdown(&self) {
        let entries: Vec<Arc<Entry>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            if let Err(e) = entry.close() {
                warn!(key = %entry.key(), error = %e, "failed to close entry");
            }
        }
        for manager in self.managers.values() {
            manager.shutdown();
        }
        self.checkers.lock().clear();
        info!("cache service stopped");
    }
}
