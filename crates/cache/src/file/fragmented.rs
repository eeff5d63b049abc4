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

use parking_lot::{Mutex, RwLock};
use snafu::ensure;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{AppendOutcome, CacheFile, FileKind, FileName, FileSignal, Notifier, plain::PlainCopy};
use crate::{
    error::{ClosedSnafu, Result},
    fragment::{Absorbed, Fragment, FragmentId, FragmentTracker},
    metrics::BYTES_APPENDED,
    trunk::TrunkStore,
};

/// Which fragment readers want extended and which one the transfer is
/// writing. Always locked before the tracker.
#[derive(Debug, Default)]
struct Cursors {
    active:      Option<FragmentId>,
    downloading: Option<FragmentId>,
}

impl Cursors {
    fn remap(&mut self, absorbed: &[Absorbed]) {
        for merge in absorbed {
            if self.active == Some(merge.absorbed) {
                self.active = Some(merge.into);
            }
            if self.downloading == Some(merge.absorbed) {
                self.downloading = Some(merge.into);
            }
        }
    }
}

/// Random-access trunk file tracking any number of downloaded ranges.
#[derive(Debug)]
pub struct FragmentedFile {
    name:          FileName,
    trunk:         Arc<TrunkStore>,
    plain:         PlainCopy,
    cursors:       Mutex<Cursors>,
    tracker:       RwLock<FragmentTracker>,
    notifier:      Notifier,
    closed:        AtomicBool,
    materialize:   bool,
    request_slack: u64,
}

impl FragmentedFile {
    pub fn open(dir: &Path, name: &FileName, materialize: bool, request_slack: u64) -> Result<Self> {
        let trunk = Arc::new(TrunkStore::open(dir.join(name.trunk()))?);
        let plain = PlainCopy::open(dir.join(name.plain()), &trunk);
        let tracker = FragmentTracker::new(trunk.full_size(), trunk.to_fragments());
        debug!(name = %name, fragments = ?tracker.fragments(), "restored fragments");
        Ok(Self {
            name: name.clone(),
            trunk,
            plain,
            cursors: Mutex::new(Cursors::default()),
            tracker: RwLock::new(tracker),
            notifier: Notifier::new(),
            closed: AtomicBool::new(false),
            materialize,
            request_slack,
        })
    }

    /// Resume point: the active fragment's end, wrapping to the end of the
    /// head fragment once the active one reached the end of the file.
    fn next_position(cursors: &mut Cursors, tracker: &mut FragmentTracker) -> Option<u64> {
        if tracker.is_complete() {
            return None;
        }
        let mut id = cursors
            .active
            .filter(|id| tracker.get(*id).is_some())
            .unwrap_or_else(|| tracker.insert(0));
        if tracker
            .get(id)
            .is_some_and(|f| f.end() >= tracker.full_size())
        {
            id = tracker.head().unwrap_or_else(|| tracker.insert(0));
        }
        cursors.active = Some(id);
        cursors.downloading = Some(id);
        tracker.get(id).map(|f| f.end())
    }

    fn check_complete(&self, tracker: &FragmentTracker) -> Result<bool> {
        if !tracker.is_complete() {
            return Ok(false);
        }
        if self.trunk.mark_completed()? {
            self.trunk.sync()?;
            info!(name = %self.name, size = tracker.full_size(), "cache file complete");
            if self.materialize && !self.plain.is_ready() {
                self.plain.materialize(Arc::clone(&self.trunk));
            }
        }
        Ok(true)
    }
}

impl CacheFile for FragmentedFile {
    fn kind(&self) -> FileKind { FileKind::Fragmented }

    fn path(&self) -> &Path { self.trunk.path() }

    fn paths(&self) -> Vec<PathBuf> {
        vec![self.trunk.path().to_path_buf(), self.plain.path().to_path_buf()]
    }

    fn full_size(&self) -> u64 { self.trunk.full_size() }

    fn last_modified(&self) -> i64 { self.trunk.last_modified() }

    fn is_complete(&self) -> bool { self.tracker.read().is_complete() }

    fn init(&self, content_length: u64, last_modified: i64) -> Result<()> {
        let mut cursors = self.cursors.lock();
        let mut tracker = self.tracker.write();
        self.trunk.init(content_length, last_modified)?;
        tracker.reset(content_length, self.trunk.to_fragments());
        *cursors = Cursors::default();
        drop(tracker);
        drop(cursors);
        self.notifier.bump();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut cursors = self.cursors.lock();
        let mut tracker = self.tracker.write();
        self.trunk.clear_trunks()?;
        self.plain.remove()?;
        tracker.reset(self.trunk.full_size(), []);
        *cursors = Cursors::default();
        drop(tracker);
        drop(cursors);
        info!(name = %self.name, "cleared cache file");
        self.notifier.bump();
        Ok(())
    }

    fn notify_request_start(&self, offset: u64) -> u64 {
        let mut cursors = self.cursors.lock();
        let mut tracker = self.tracker.write();

        let keep = cursors
            .active
            .and_then(|id| tracker.get(id))
            .is_some_and(|f| offset >= f.start && offset <= f.end() + self.request_slack);
        if !keep {
            let id = tracker.insert(offset);
            if cursors.active != Some(id) {
                debug!(
                    name = %self.name,
                    offset,
                    fragment = ?tracker.get(id),
                    "switching active fragment"
                );
            }
            cursors.active = Some(id);
        }
        cursors
            .active
            .and_then(|id| tracker.get(id))
            .map_or(offset, |f| f.end())
    }

    fn begin_transfer(&self) -> Option<u64> {
        let mut cursors = self.cursors.lock();
        let mut tracker = self.tracker.write();
        Self::next_position(&mut cursors, &mut tracker)
    }

    fn append(&self, position: u64, data: &[u8]) -> Result<AppendOutcome> {
        ensure!(!self.is_closed(), ClosedSnafu);
        let mut cursors = self.cursors.lock();
        let mut tracker = self.tracker.write();

        let current = cursors
            .downloading
            .filter(|id| cursors.active == Some(*id))
            .and_then(|id| tracker.get(id).map(|f| (id, f)))
            .filter(|(_, f)| f.end() == position);
        let Some((id, _)) = current else {
            return Ok(Self::next_position(&mut cursors, &mut tracker)
                .map_or(AppendOutcome::Finished, AppendOutcome::RestartAt));
        };

        let len = (data.len() as u64).min(tracker.room_after(id)) as usize;
        if let Some(fragment) = tracker.get_mut(id) {
            self.trunk.append_to(fragment, &data[..len])?;
        }
        let absorbed = tracker.merge_in_loop(id);
        cursors.remap(&absorbed);
        BYTES_APPENDED
            .with_label_values(&[self.name.kind.as_str()])
            .inc_by(len as u64);

        let complete = self.check_complete(&tracker)?;
        let end = cursors
            .downloading
            .and_then(|id| tracker.get(id))
            .map_or(0, |f| f.end());
        let outcome = if complete {
            AppendOutcome::Finished
        } else if len == data.len() && end == position + len as u64 && end < tracker.full_size() {
            AppendOutcome::Continue
        } else {
            Self::next_position(&mut cursors, &mut tracker)
                .map_or(AppendOutcome::Finished, AppendOutcome::RestartAt)
        };
        drop(tracker);
        drop(cursors);

        self.notifier.bump();
        Ok(outcome)
    }

    fn end_transfer(&self) {
        self.cursors.lock().downloading = None;
        debug!(name = %self.name, covered = self.tracker.read().covered_len(), "transfer detached");
    }

    fn available(&self, offset: u64) -> u64 { self.tracker.read().available_from(offset) }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        ensure!(!self.is_closed(), ClosedSnafu);
        match self.plain.read_at(buf, offset) {
            Some(result) => result,
            None => self.trunk.read_at(buf, offset),
        }
    }

    fn fragments(&self) -> Vec<Fragment> { self.tracker.read().fragments() }

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

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path, full_size: u64) -> FragmentedFile {
        let file = FragmentedFile::open(dir, &FileName::new("video", "42", "mp4"), false, 0).unwrap();
        file.init(full_size, 0).unwrap();
        file
    }

    #[test]
    fn two_halves_complete_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = open(dir.path(), 1_000_000);

        assert_eq!(file.notify_request_start(0), 0);
        assert_eq!(file.begin_transfer(), Some(0));
        let outcome = file.append(0, &vec![1u8; 500_000]).unwrap();
        assert_eq!(outcome, AppendOutcome::Continue);
        assert_eq!(file.fragments(), vec![Fragment::new(0, 500_000)]);

        let outcome = file.append(500_000, &vec![2u8; 500_000]).unwrap();
        assert_eq!(outcome, AppendOutcome::Finished);
        assert_eq!(file.fragments(), vec![Fragment::new(0, 1_000_000)]);
        assert!(file.is_complete());
        assert_eq!(file.begin_transfer(), None);
    }

    #[test]
    fn seek_elsewhere_restarts_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let file = open(dir.path(), 1000);

        assert_eq!(file.begin_transfer(), Some(0));
        assert_eq!(file.append(0, &[0u8; 100]).unwrap(), AppendOutcome::Continue);

        assert_eq!(file.notify_request_start(600), 600);
        assert_eq!(
            file.append(100, &[0u8; 100]).unwrap(),
            AppendOutcome::RestartAt(600)
        );
        // Nothing was written by the refused append.
        assert_eq!(
            file.fragments(),
            vec![Fragment::new(0, 100), Fragment::new(600, 0)]
        );
        assert_eq!(file.append(600, &[0u8; 100]).unwrap(), AppendOutcome::Continue);
    }

    #[test]
    fn request_within_slack_keeps_active_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let file =
            FragmentedFile::open(dir.path(), &FileName::new("video", "1", "mp4"), false, 500).unwrap();
        file.init(10_000, 0).unwrap();
        file.notify_request_start(0);
        file.begin_transfer();
        file.append(0, &[0u8; 100]).unwrap();

        assert_eq!(file.notify_request_start(400), 100);
        assert_eq!(file.append(100, &[0u8; 100]).unwrap(), AppendOutcome::Continue);
        assert_eq!(file.notify_request_start(5000), 5000);
    }

    #[test]
    fn reaching_the_end_wraps_to_head() {
        let dir = tempfile::tempdir().unwrap();
        let file = open(dir.path(), 1000);

        file.begin_transfer();
        file.append(0, &[0u8; 200]).unwrap();
        file.notify_request_start(800);
        assert_eq!(file.append(200, &[0u8; 10]).unwrap(), AppendOutcome::RestartAt(800));
        assert_eq!(
            file.append(800, &[0u8; 200]).unwrap(),
            AppendOutcome::RestartAt(200)
        );
        assert_eq!(
            file.append(200, &[0u8; 600]).unwrap(),
            AppendOutcome::Finished
        );
        assert!(file.is_complete());
    }

    #[test]
    fn running_into_next_fragment_jumps_past_it() {
        let dir = tempfile::tempdir().unwrap();
        let file = open(dir.path(), 1000);

        file.notify_request_start(300);
        file.begin_transfer();
        file.append(300, &[0u8; 100]).unwrap();

        file.notify_request_start(0);
        assert_eq!(file.begin_transfer(), Some(0));
        // Clipped at 300, merged with [300, 400), resumes at 400.
        assert_eq!(
            file.append(0, &[0u8; 350]).unwrap(),
            AppendOutcome::RestartAt(400)
        );
        assert_eq!(file.fragments(), vec![Fragment::new(0, 400)]);
    }

    #[test]
    fn reopen_restores_block_aligned_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let block = crate::trunk::TRUNK_SIZE;
        {
            let file = open(dir.path(), 4 * block);
            file.begin_transfer();
            file.append(0, &vec![3u8; (block + 10) as usize]).unwrap();
            file.close().unwrap();
        }
        let file =
            FragmentedFile::open(dir.path(), &FileName::new("video", "42", "mp4"), false, 0).unwrap();
        assert_eq!(file.fragments(), vec![Fragment::new(0, block)]);
        assert_eq!(file.begin_transfer(), Some(block));
    }

    #[test]
    fn closed_file_refuses_io() {
        let dir = tempfile::tempdir().unwrap();
        let file = open(dir.path(), 100);
        let rx = file.subscribe();
        file.close().unwrap();
        assert!(rx.borrow().closed);
        assert!(file.append(0, &[0u8; 1]).is_err());
        let mut buf = [0u8; 1];
        assert!(file.read_at(&mut buf, 0).is_err());
    }

    #[test]
    fn clear_drops_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let file = open(dir.path(), 100);
        file.begin_transfer();
        file.append(0, &[0u8; 100]).unwrap();
        assert!(file.is_complete());
        file.clear().unwrap();
        assert!(!file.is_complete());
        assert_eq!(file.available(0), 0);
        assert_eq!(file.begin_transfer(), Some(0));
    }

    #[test]
    fn cleared_file_reads_new_content_not_old_copy() {
        let dir = tempfile::tempdir().unwrap();
        let name = FileName::new("video", "7", "mp4");
        let file = FragmentedFile::open(dir.path(), &name, true, 0).unwrap();
        file.init(1000, 0).unwrap();
        file.begin_transfer();
        assert_eq!(file.append(0, &[1u8; 1000]).unwrap(), AppendOutcome::Finished);
        assert!(dir.path().join(name.plain()).exists());

        file.clear().unwrap();
        file.init(1000, 1).unwrap();
        assert_eq!(file.notify_request_start(500), 500);
        assert_eq!(file.begin_transfer(), Some(500));
        file.append(500, &[2u8; 100]).unwrap();

        assert_eq!(file.available(500), 100);
        let mut buf = [0u8; 4];
        file.read_at(&mut buf, 500).unwrap();
        assert_eq!(buf, [2, 2, 2, 2]);
        assert!(!dir.path().join(name.plain()).exists());
    }
}
