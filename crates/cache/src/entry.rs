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

//! Per-resource coordinator: remote resolution, cache validity and the
//! reference-counted open/close lifecycle of one cache file.

use std::{
    collections::HashSet,
    fmt,
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use bon::Builder;
use jiff::Timestamp;
use parking_lot::{Mutex, RwLock};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::{fs, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{CacheConfig, FileFormat},
    download::{DownloadManager, DownloadTask, TaskId, transfer},
    error::{CacheError, ClosedSnafu, EntryFailedSnafu, FileWriteSnafu, Result},
    evict::Evictor,
    file::{CacheFile, FileName, open_cache_file},
    meta::{MetaKey, MetaStore},
    reader::StreamReader,
    source::{RemoteInfo, RemoteSource},
};

#[derive(Debug, Clone, Builder)]
pub struct EntryRequest {
    #[builder(into)]
    pub id:      String,
    /// Entity type, e.g. `video`; prefixes file names and selects the budget
    #[builder(into)]
    pub kind:    String,
    /// Remote service name; selects the source and download manager
    #[builder(into)]
    pub client:  String,
    #[builder(into)]
    pub url:     String,
    #[builder(into, default = String::from("mp4"))]
    pub ext:     String,
    #[builder(into)]
    pub referer: Option<String>,
    /// Overrides the configured format for a new cache file
    pub format:  Option<FileFormat>,
}

impl EntryRequest {
    #[must_use]
    pub fn key(&self) -> MetaKey { MetaKey::new(&self.id, &self.kind) }
}

/// Keys of entries that currently hold an open file.
#[derive(Debug, Default)]
pub struct ActiveSet(Mutex<HashSet<MetaKey>>);

impl ActiveSet {
    pub fn insert(&self, key: &MetaKey) { self.0.lock().insert(key.clone()); }

    pub fn remove(&self, key: &MetaKey) { self.0.lock().remove(key); }

    #[must_use]
    pub fn contains(&self, key: &MetaKey) -> bool { self.0.lock().contains(key) }
}

/// Collaborators shared by every entry of one service.
#[derive(Debug)]
pub struct EntryContext {
    pub config:  CacheConfig,
    pub meta:    Arc<dyn MetaStore>,
    pub evictor: Arc<Evictor>,
    pub active:  ActiveSet,
}

pub struct Entry {
    request:     EntryRequest,
    name:        FileName,
    key:         MetaKey,
    task_id:     TaskId,
    ctx:         Arc<EntryContext>,
    source:      Arc<dyn RemoteSource>,
    manager:     Arc<DownloadManager>,
    file:        RwLock<Option<Arc<dyn CacheFile>>>,
    remote:      RwLock<Option<RemoteInfo>>,
    open_count:  AtomicUsize,
    generation:  AtomicU64,
    failed:      AtomicBool,
    resolving:   tokio::sync::Mutex<()>,
    transfer:    Mutex<Option<Arc<DownloadTask>>>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("client", &self.request.client)
            .field("open_count", &self.open_count())
            .finish_non_exhaustive()
    }
}

impl Entry {
    pub fn new(
        request: EntryRequest,
        ctx: Arc<EntryContext>,
        source: Arc<dyn RemoteSource>,
        manager: Arc<DownloadManager>,
    ) -> Self {
        let name = FileName::new(&request.kind, &request.id, &request.ext);
        let key = request.key();
        let task_id = TaskId::new(name.to_string());
        Self {
            request,
            name,
            key,
            task_id,
            ctx,
            source,
            manager,
            file: RwLock::new(None),
            remote: RwLock::new(None),
            open_count: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            resolving: tokio::sync::Mutex::new(()),
            transfer: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn key(&self) -> &MetaKey { &self.key }

    #[must_use]
    pub const fn task_id(&self) -> &TaskId { &self.task_id }

    #[must_use]
    pub const fn request(&self) -> &EntryRequest { &self.request }

    #[must_use]
    pub fn open_count(&self) -> usize { self.open_count.load(Ordering::Acquire) }

    #[must_use]
    pub fn remote(&self) -> Option<RemoteInfo> { self.remote.read().clone() }

    pub(crate) fn source(&self) -> &Arc<dyn RemoteSource> { &self.source }

    pub(crate) fn manager(&self) -> &Arc<DownloadManager> { &self.manager }

    pub(crate) fn context(&self) -> &Arc<EntryContext> { &self.ctx }

    /// The open cache file, `Closed` when there is none.
    pub fn file(&self) -> Result<Arc<dyn CacheFile>> {
        self.file
            .read()
            .as_ref()
            .filter(|file| !file.is_closed())
            .cloned()
            .context(ClosedSnafu)
    }

    /// Idle entries hold no file and no references.
    #[must_use]
    pub fn is_idle(&self) -> bool { self.open_count() == 0 && self.file.read().is_none() }

    /// Take a reference, opening the file and re-validating it against the
    /// remote on the first one.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        {
            // Serializes with the idle check in `close_if_idle`.
            let _slot = self.file.write();
            self.open_count.fetch_add(1, Ordering::AcqRel);
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        match self.open_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.open_count.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    async fn open_inner(self: &Arc<Self>) -> Result<()> {
        let (_, reopened) = self.ensure_file()?;
        self.resolve(reopened).await?;
        self.ctx.meta.access(&self.key).await?;
        Ok(())
    }

    fn ensure_file(&self) -> Result<(Arc<dyn CacheFile>, bool)> {
        let mut slot = self.file.write();
        if let Some(file) = slot.as_ref().filter(|file| !file.is_closed()) {
            return Ok((Arc::clone(file), false));
        }
        let config = &self.ctx.config;
        let file = open_cache_file(
            &config.cache_dir,
            &self.name,
            self.request.format.unwrap_or(config.default_format),
            config.materialize_on_complete,
            config.request_slack,
        )
        .inspect_err(|e| {
            error!(key = %self.key, error = %e, "failed to open cache file");
            self.failed.store(true, Ordering::Release);
        })?;
        *slot = Some(Arc::clone(&file));
        self.failed.store(false, Ordering::Release);
        self.ctx.active.insert(&self.key);
        Ok((file, true))
    }

    /// Probe the remote when forced or never probed, then reconcile the
    /// local file with what was found.
    pub async fn resolve(&self, force: bool) -> Result<RemoteInfo> {
        let _guard = self.resolving.lock().await;
        if !force && let Some(info) = self.remote() {
            return Ok(info);
        }
        let file = self.file()?;
        let info = match self
            .source
            .probe(&self.request.url, self.request.referer.as_deref())
            .await
        {
            Ok(info) => info,
            Err(e) if file.is_complete() && e.is_retryable() => {
                warn!(key = %self.key, error = %e, "remote unreachable, serving complete local copy");
                RemoteInfo {
                    url:           self.request.url.clone(),
                    size:          file.full_size(),
                    etag:          self.read_etag().await,
                    last_modified: Some(file.last_modified()),
                    referer:       self.request.referer.clone(),
                }
            }
            Err(e) => return Err(e),
        };
        self.validate(file.as_ref(), &info).await?;
        *self.remote.write() = Some(info.clone());
        Ok(info)
    }

    fn etag_path(&self) -> PathBuf { self.ctx.config.cache_dir.join(self.name.etag_sidecar()) }

    async fn read_etag(&self) -> Option<String> {
        fs::read_to_string(self.etag_path())
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Keep, or wipe and resize, the local bytes for the remote content.
    async fn validate(&self, file: &dyn CacheFile, info: &RemoteInfo) -> Result<()> {
        let local_etag = self.read_etag().await;
        let remote_modified = info
            .last_modified
            .unwrap_or_else(|| Timestamp::now().as_second());

        if file.full_size() == 0 && !file.is_complete() {
            file.init(info.size, remote_modified)?;
            info!(key = %self.key, size = info.size, url = %info.url, "initialized cache file");
            self.record_info(info.size, info.last_modified).await?;
        } else {
            let same_etag = matches!((&info.etag, &local_etag), (Some(r), Some(l)) if r == l);
            let changed = !same_etag
                && (matches!((&info.etag, &local_etag), (Some(_), Some(_)))
                    || info.last_modified.is_some_and(|m| m > file.last_modified())
                    || info.size != file.full_size());
            if changed {
                info!(
                    key = %self.key,
                    local_etag = ?local_etag,
                    remote_etag = ?info.etag,
                    local_size = file.full_size(),
                    remote_size = info.size,
                    "remote content changed, discarding local data"
                );
                file.clear()?;
                file.init(info.size, remote_modified)?;
                self.record_info(info.size, info.last_modified).await?;
            } else {
                debug!(key = %self.key, "local data is current");
            }
        }

        if let Some(etag) = &info.etag
            && local_etag.as_ref() != Some(etag)
        {
            fs::write(self.etag_path(), etag)
                .await
                .context(FileWriteSnafu)?;
        }
        Ok(())
    }

    async fn record_info(&self, size: u64, remote_modified: Option<i64>) -> Result<()> {
        let created = self
            .ctx
            .meta
            .get(&self.key)
            .await?
            .map_or_else(Timestamp::now, |record| record.created);
        self.ctx
            .meta
            .update_info(&self.key, size, remote_modified, created)
            .await?;
        self.ctx.meta.set_partial(&self.key, true).await
    }

    /// A reader positioned at 0. Misses ask the entry to download from the
    /// reader's cursor.
    pub fn get_read_seeker(self: &Arc<Self>, cancel: CancellationToken) -> Result<StreamReader> {
        ensure!(
            !self.failed.load(Ordering::Acquire),
            EntryFailedSnafu {
                id: self.key.to_string(),
            }
        );
        ensure!(self.open_count() > 0, ClosedSnafu);
        let file = self.file()?;
        let entry: Weak<Self> = Arc::downgrade(self);
        Ok(StreamReader::new(file, cancel).with_miss_hook(Box::new(move |offset| {
            if let Some(entry) = entry.upgrade() {
                entry.request_from(offset);
            }
        })))
    }

    /// Point the file at `offset` and make sure a transfer is running.
    pub fn request_from(self: &Arc<Self>, offset: u64) {
        let Ok(file) = self.file() else {
            return;
        };
        let resume = file.notify_request_start(offset);
        debug!(key = %self.key, offset, resume, "read miss");
        if file.is_complete() {
            return;
        }
        if let Err(e) = self.download() {
            if e.is_quiet() {
                debug!(key = %self.key, error = %e, "not starting download");
            } else {
                warn!(key = %self.key, error = %e, "failed to start download");
            }
        }
    }

    /// The running download task, starting one if needed.
    pub fn download(self: &Arc<Self>) -> Result<Arc<DownloadTask>> {
        let file = self.file()?;
        let mut slot = self.transfer.lock();
        if let Some(task) = slot.as_ref()
            && !task.state().is_terminal()
            && !task.is_cancelled()
        {
            return Ok(Arc::clone(task));
        }
        let task = self.manager.register(self.task_id.clone());
        if task.try_start() {
            debug!(key = %self.key, priority = task.priority(), complete = file.is_complete(), "starting transfer");
            tokio::spawn(transfer::run(Arc::clone(self), Arc::clone(&task)));
        }
        *slot = Some(Arc::clone(&task));
        Ok(task)
    }

    /// Content up to `goal` is needed by `deadline`.
    pub fn set_deadline(self: &Arc<Self>, deadline: Instant, goal: u64) -> Result<()> {
        self.download()?.set_deadline(deadline, goal);
        Ok(())
    }

    /// Called by the transfer on its way out.
    pub(crate) fn finish_transfer(&self, task: &Arc<DownloadTask>) {
        let mut slot = self.transfer.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, task)) {
            slot.take();
        }
        drop(slot);
        self.manager.remove_task(task);
    }

    /// A non-retryable transfer error: wake readers and refuse new ones
    /// until the entry is reopened.
    pub(crate) fn mark_failed(&self, error: &CacheError) {
        error!(key = %self.key, error = %error, "entry failed");
        self.failed.store(true, Ordering::Release);
        self.ctx.active.remove(&self.key);
        if let Some(file) = self.file.read().as_ref()
            && let Err(e) = file.close()
        {
            warn!(key = %self.key, error = %e, "failed to close cache file");
        }
    }

    /// Drop a reference; the last one closes the file after the grace
    /// period unless the entry is opened again meanwhile.
    pub fn release(self: &Arc<Self>) {
        let previous = self
            .open_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
        match previous {
            Err(_) => warn!(key = %self.key, "release without matching open"),
            Ok(1) => {
                let generation = self.generation.load(Ordering::Acquire);
                let grace = self.ctx.config.close_grace;
                let entry = Arc::clone(self);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            tokio::time::sleep(grace).await;
                            entry.close_if_idle(generation);
                        });
                    }
                    Err(_) => entry.close_if_idle(generation),
                }
            }
            Ok(_) => {}
        }
    }

    fn close_if_idle(&self, generation: u64) {
        let mut slot = self.file.write();
        if self.open_count() == 0 && self.generation.load(Ordering::Acquire) == generation {
            if let Err(e) = self.close_locked(&mut slot) {
                warn!(key = %self.key, error = %e, "failed to close idle entry");
            }
        } else {
            debug!(key = %self.key, "entry reopened during grace period");
        }
    }

    /// Cancel the transfer and close the file, waking blocked readers.
    pub fn close(&self) -> Result<()> { self.close_locked(&mut self.file.write()) }

    fn close_locked(&self, slot: &mut Option<Arc<dyn CacheFile>>) -> Result<()> {
        if let Some(task) = self.transfer.lock().take() {
            task.cancel();
            self.manager.remove_task(&task);
        }
        let Some(file) = slot.take() else {
            return Ok(());
        };
        self.ctx.active.remove(&self.key);
        info!(key = %self.key, "closing entry");
        file.close()
    }
}
