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

//! Sequential copy of a completed trunk file. Reads switch to it once the
//! copy has been fully written and renamed into place.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::{
    error::{FileOpenSnafu, FileReadSnafu, FileWriteSnafu, Result},
    pio,
    trunk::TrunkStore,
};

const COPY_BUFFER: usize = 1024 * 1024;

/// Handle to the copy; clones share the slot. `remove` bumps the
/// generation so copies started before it are never installed.
#[derive(Debug, Clone)]
pub(crate) struct PlainCopy {
    path:       PathBuf,
    slot:       Arc<RwLock<Option<File>>>,
    generation: Arc<AtomicU64>,
}

impl PlainCopy {
    /// Use an existing copy only when the trunk says it is complete and the
    /// copy has the expected length.
    pub(crate) fn open(path: PathBuf, trunk: &TrunkStore) -> Self {
        let existing = trunk
            .is_completed()
            .then(|| File::open(&path).ok())
            .flatten()
            .filter(|file| {
                file.metadata()
                    .is_ok_and(|meta| meta.len() == trunk.full_size())
            });
        if existing.is_some() {
            debug!(path = %path.display(), "reading from plain copy");
        }
        Self {
            path,
            slot: Arc::new(RwLock::new(existing)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn path(&self) -> &Path { &self.path }

    pub(crate) fn is_ready(&self) -> bool { self.slot.read().is_some() }

    /// `None` while no copy is in place.
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> Option<Result<usize>> {
        let slot = self.slot.read();
        slot.as_ref()
            .map(|file| pio::read_at(file, buf, offset).context(FileReadSnafu))
    }

    /// Copy the trunk body in the background; without a runtime the copy
    /// runs inline.
    pub(crate) fn materialize(&self, trunk: Arc<TrunkStore>) {
        let copy = self.clone();
        let generation = self.generation.load(Ordering::Acquire);
        let job = move || {
            let installed = write_copy(&copy.path, &trunk, generation)
                .and_then(|tmp| copy.install(&tmp, generation, &trunk));
            match installed {
                Ok(true) => info!(path = %copy.path.display(), "materialized plain copy"),
                Ok(false) => debug!(path = %copy.path.display(), "content changed while copying, copy discarded"),
                Err(e) => warn!(path = %copy.path.display(), error = %e, "failed to materialize plain copy"),
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    /// Move a finished copy into place unless the content was cleared since
    /// `generation` was taken.
    fn install(&self, tmp: &Path, generation: u64, trunk: &TrunkStore) -> Result<bool> {
        let mut slot = self.slot.write();
        if self.generation.load(Ordering::Acquire) != generation || !trunk.is_completed() {
            drop(slot);
            if let Err(e) = std::fs::remove_file(tmp) {
                debug!(path = %tmp.display(), error = %e, "failed to remove stale copy");
            }
            return Ok(false);
        }
        std::fs::rename(tmp, &self.path).context(FileWriteSnafu)?;
        *slot = Some(File::open(&self.path).context(FileOpenSnafu { path: &self.path })?);
        Ok(true)
    }

    pub(crate) fn remove(&self) -> Result<()> {
        let mut slot = self.slot.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        slot.take();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(FileWriteSnafu),
        }
    }
}

/// Write the trunk body to a temporary file next to `path`.
fn write_copy(path: &Path, trunk: &TrunkStore, generation: u64) -> Result<PathBuf> {
    let tmp = path.with_extension(format!(
        "{}.{generation}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or_default()
    ));
    let out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)
        .context(FileOpenSnafu { path: &tmp })?;

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut offset = 0;
    let full_size = trunk.full_size();
    while offset < full_size {
        let n = trunk.read_at(&mut buf, offset)?;
        if n == 0 {
            break;
        }
        pio::write_all_at(&out, &buf[..n], offset).context(FileWriteSnafu)?;
        offset += n as u64;
    }
    out.sync_all().context(FileWriteSnafu)?;
    Ok(tmp)
}
