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
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::UNIX_EPOCH,
};

use parking_lot::RwLock;
use snafu::{ResultExt, ensure};
use tokio::sync::watch;
use tracing::info;

use super::{AppendOutcome, CacheFile, FileKind, FileName, FileSignal, Notifier};
use crate::{
    error::{ClosedSnafu, FileOpenSnafu, FileReadSnafu, FileWriteSnafu, Result},
    fragment::Fragment,
    metrics::BYTES_APPENDED,
    pio,
};

#[derive(Debug)]
struct LegacyState {
    file:          File,
    complete:      bool,
    written:       u64,
    full_size:     u64,
    last_modified: i64,
}

/// Pre-existing `<id>.<ext>.dl` / `<id>.<ext>` pair. No bitmap: the partial
/// file holds exactly the bytes downloaded from offset 0.
#[derive(Debug)]
pub struct LegacyFile {
    name:     FileName,
    partial:  PathBuf,
    complete: PathBuf,
    state:    RwLock<LegacyState>,
    notifier: Notifier,
    closed:   AtomicBool,
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .context(FileOpenSnafu { path })
}

fn modified_secs(file: &File) -> i64 {
    file.metadata()
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

impl LegacyFile {
    pub fn open(dir: &Path, name: &FileName) -> Result<Self> {
        let partial = dir.join(name.legacy_partial());
        let complete = dir.join(name.legacy_complete());
        let state = if complete.exists() {
            let file = File::open(&complete).context(FileOpenSnafu { path: &complete })?;
            let len = file.metadata().context(FileReadSnafu)?.len();
            LegacyState {
                last_modified: modified_secs(&file),
                file,
                complete: true,
                written: len,
                full_size: len,
            }
        } else {
            let file = open_rw(&partial)?;
            let len = file.metadata().context(FileReadSnafu)?.len();
            LegacyState {
                last_modified: modified_secs(&file),
                file,
                complete: false,
                written: len,
                full_size: 0,
            }
        };
        Ok(Self {
            name: name.clone(),
            partial,
            complete,
            state: RwLock::new(state),
            notifier: Notifier::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn finish(&self, state: &mut LegacyState) -> Result<()> {
        state.file.sync_all().context(FileWriteSnafu)?;
        std::fs::rename(&self.partial, &self.complete).context(FileWriteSnafu)?;
        state.file = File::open(&self.complete).context(FileOpenSnafu {
            path: &self.complete,
        })?;
        state.complete = true;
        info!(name = %self.name, size = state.full_size, "legacy cache file complete");
        Ok(())
    }

    /// Back to an empty partial file.
    fn restart(&self, state: &mut LegacyState) -> Result<()> {
        if state.complete {
            std::fs::rename(&self.complete, &self.partial).context(FileWriteSnafu)?;
            state.file = open_rw(&self.partial)?;
            state.complete = false;
        }
        state.file.set_len(0).context(FileWriteSnafu)?;
        state.written = 0;
        Ok(())
    }
}

impl CacheFile for LegacyFile {
    fn kind(&self) -> FileKind { FileKind::Legacy }

    fn path(&self) -> &Path {
        if self.state.read().complete {
            &self.complete
        } else {
            &self.partial
        }
    }

    fn paths(&self) -> Vec<PathBuf> { vec![self.partial.clone(), self.complete.clone()] }

    fn full_size(&self) -> u64 { self.state.read().full_size }

    fn last_modified(&self) -> i64 { self.state.read().last_modified }

    fn is_complete(&self) -> bool { self.state.read().complete }

    fn init(&self, content_length: u64, last_modified: i64) -> Result<()> {
        let mut state = self.state.write();
        if state.written > content_length || (state.complete && state.written != content_length) {
            self.restart(&mut state)?;
        }
        state.full_size = content_length;
        state.last_modified = last_modified;
        if !state.complete && content_length > 0 && state.written == content_length {
            self.finish(&mut state)?;
        }
        drop(state);
        self.notifier.bump();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        self.restart(&mut state)?;
        drop(state);
        info!(name = %self.name, "cleared legacy cache file");
        self.notifier.bump();
        Ok(())
    }

    fn notify_request_start(&self, _offset: u64) -> u64 { self.state.read().written }

    fn begin_transfer(&self) -> Option<u64> {
        let state = self.state.read();
        (!state.complete).then_some(state.written)
    }

    fn append(&self, position: u64, data: &[u8]) -> Result<AppendOutcome> {
        ensure!(!self.is_closed(), ClosedSnafu);
        let mut state = self.state.write();
        if state.complete {
            return Ok(AppendOutcome::Finished);
        }
        if state.written != position {
            return Ok(AppendOutcome::RestartAt(state.written));
        }
        let room = state.full_size.saturating_sub(state.written);
        let len = (data.len() as u64).min(room) as usize;
        pio::write_all_at(&state.file, &data[..len], position).context(FileWriteSnafu)?;
        state.written += len as u64;
        BYTES_APPENDED
            .with_label_values(&[self.name.kind.as_str()])
            .inc_by(len as u64);

        let outcome = if state.full_size > 0 && state.written >= state.full_size {
            self.finish(&mut state)?;
            AppendOutcome::Finished
        } else {
            AppendOutcome::Continue
        };
        drop(state);
        self.notifier.bump();
        Ok(outcome)
    }

    fn end_transfer(&self) {}

    fn available(&self, offset: u64) -> u64 { self.state.read().written.saturating_sub(offset) }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        ensure!(!self.is_closed(), ClosedSnafu);
        let state = self.state.read();
        let len = buf.len().min(state.written.saturating_sub(offset) as usize);
        pio::read_at(&state.file, &mut buf[..len], offset).context(FileReadSnafu)
    }

    fn fragments(&self) -> Vec<Fragment> { vec![Fragment::new(0, self.state.read().written)] }

    fn subscribe(&self) -> watch::Receiver<FileSignal> { self.notifier.subscribe() }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.notifier.close();
        let state = self.state.read();
        if state.complete {
            Ok(())
        } else {
            state.file.sync_data().context(FileWriteSnafu)
        }
    }

    fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_is_renamed_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let name = FileName::new("video", "5", "mp4");
        std::fs::write(dir.path().join(name.legacy_partial()), b"hello").unwrap();

        let file = LegacyFile::open(dir.path(), &name).unwrap();
        assert_eq!(file.available(0), 5);
        file.init(11, 0).unwrap();
        assert_eq!(file.begin_transfer(), Some(5));
        assert_eq!(
            file.append(3, b"xx").unwrap(),
            AppendOutcome::RestartAt(5)
        );
        assert_eq!(file.append(5, b" world").unwrap(), AppendOutcome::Finished);

        assert!(file.is_complete());
        assert!(dir.path().join(name.legacy_complete()).exists());
        assert!(!dir.path().join(name.legacy_partial()).exists());
        assert_eq!(
            std::fs::read(dir.path().join(name.legacy_complete())).unwrap(),
            b"hello world"
        );

        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn complete_file_reopens_complete() {
        let dir = tempfile::tempdir().unwrap();
        let name = FileName::new("video", "6", "mp4");
        std::fs::write(dir.path().join(name.legacy_complete()), b"done").unwrap();
        let file = LegacyFile::open(dir.path(), &name).unwrap();
        assert!(file.is_complete());
        assert_eq!(file.full_size(), 4);
        assert_eq!(file.begin_transfer(), None);

        file.clear().unwrap();
        assert!(!file.is_complete());
        assert_eq!(file.available(0), 0);
        assert!(dir.path().join(name.legacy_partial()).exists());
    }
}
