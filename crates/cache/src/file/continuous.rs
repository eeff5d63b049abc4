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
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;
use snafu::ensure;
use tokio::sync::watch;
use tracing::info;

use super::{AppendOutcome, CacheFile, FileKind, FileName, FileSignal, Notifier, plain::PlainCopy};
use crate::{
    error::{ClosedSnafu, Result},
    fragment::Fragment,
    metrics::BYTES_APPENDED,
    trunk::TrunkStore,
};

/// Trunk file grown strictly from offset 0. Seeks never move the transfer;
/// readers past the end simply wait for it.
#[derive(Debug)]
pub struct ContinuousFile {
    name:        FileName,
    trunk:       Arc<TrunkStore>,
    plain:       PlainCopy,
    head:        RwLock<Fragment>,
    notifier:    Notifier,
    closed:      AtomicBool,
    materialize: bool,
}

impl ContinuousFile {
    pub fn open(dir: &Path, name: &FileName, materialize: bool) -> Result<Self> {
        let trunk = Arc::new(TrunkStore::open(dir.join(name.trunk()))?);
        let plain = PlainCopy::open(dir.join(name.plain()), &trunk);
        let head = Self::restore_head(&trunk);
        Ok(Self {
            name: name.clone(),
            trunk,
            plain,
            head: RwLock::new(head),
            notifier: Notifier::new(),
            closed: AtomicBool::new(false),
            materialize,
        })
    }

    /// Only the run starting at offset 0 is usable.
    fn restore_head(trunk: &TrunkStore) -> Fragment {
        trunk
            .to_fragments()
            .into_iter()
            .find(|f| f.start == 0)
            .unwrap_or_default()
    }

    fn done(&self, head: &Fragment) -> bool {
        let full_size = self.trunk.full_size();
        full_size > 0 && head.end() >= full_size
    }
}

impl CacheFile for ContinuousFile {
    fn kind(&self) -> FileKind { FileKind::Continuous }

    fn path(&self) -> &Path { self.trunk.path() }

    fn paths(&self) -> Vec<PathBuf> {
        vec![self.trunk.path().to_path_buf(), self.plain.path().to_path_buf()]
    }

    fn full_size(&self) -> u64 { self.trunk.full_size() }

    fn last_modified(&self) -> i64 { self.trunk.last_modified() }

    fn is_complete(&self) -> bool { self.done(&self.head.read()) }

    fn init(&self, content_length: u64, last_modified: i64) -> Result<()> {
        let mut head = self.head.write();
        self.trunk.init(content_length, last_modified)?;
        *head = Self::restore_head(&self.trunk);
        drop(head);
        self.notifier.bump();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut head = self.head.write();
        self.trunk.clear_trunks()?;
        self.plain.remove()?;
        *head = Fragment::default();
        drop(head);
        info!(name = %self.name, "cleared cache file");
        self.notifier.bump();
        Ok(())
    }

    fn notify_request_start(&self, _offset: u64) -> u64 { self.head.read().end() }

    fn begin_transfer(&self) -> Option<u64> {
        let head = self.head.read();
        (!self.done(&head)).then(|| head.end())
    }

    fn append(&self, position: u64, data: &[u8]) -> Result<AppendOutcome> {
        ensure!(!self.is_closed(), ClosedSnafu);
        let mut head = self.head.write();
        if self.done(&head) {
            return Ok(AppendOutcome::Finished);
        }
        if head.end() != position {
            return Ok(AppendOutcome::RestartAt(head.end()));
        }
        let room = self.trunk.full_size().saturating_sub(head.end());
        let len = (data.len() as u64).min(room) as usize;
        self.trunk.append_to(&mut head, &data[..len])?;
        BYTES_APPENDED
            .with_label_values(&[self.name.kind.as_str()])
            .inc_by(len as u64);

        let outcome = if self.done(&head) {
            if self.trunk.mark_completed()? {
                self.trunk.sync()?;
                info!(name = %self.name, size = head.length, "cache file complete");
                if self.materialize && !self.plain.is_ready() {
                    self.plain.materialize(Arc::clone(&self.trunk));
                }
            }
            AppendOutcome::Finished
        } else {
            AppendOutcome::Continue
        };
        drop(head);
        self.notifier.bump();
        Ok(outcome)
    }

    fn end_transfer(&self) {}

    fn available(&self, offset: u64) -> u64 {
        let head = self.head.read();
        if offset <= head.end() { head.end() - offset } else { 0 }
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        ensure!(!self.is_closed(), ClosedSnafu);
        match self.plain.read_at(buf, offset) {
            Some(result) => result,
            None => self.trunk.read_at(buf, offset),
        }
    }

    fn fragments(&self) -> Vec<Fragment> { vec![*self.head.read()] }

    fn subscribe(&self) -> watch::Receiver<FileSignal> { self.notifier.subscribe() }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.notifier.close();
        self.trunk.sync()
    }

    fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }
}
