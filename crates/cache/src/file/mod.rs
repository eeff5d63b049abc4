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

//! Cache file variants behind one append/read contract.
//!
//! Exactly one transfer appends to a file at a time. It asks
//! [`CacheFile::begin_transfer`] where to start, then feeds bytes through
//! [`CacheFile::append`] until told to restart elsewhere or that the file is
//! complete. Readers check [`CacheFile::available`] and wait on
//! [`CacheFile::subscribe`] for more.

mod continuous;
mod fragmented;
mod legacy;
mod plain;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

pub use continuous::ContinuousFile;
pub use fragmented::FragmentedFile;
pub use legacy::LegacyFile;
use strum_macros::{Display, EnumString};
use tokio::sync::watch;
use tracing::debug;

use crate::{config::FileFormat, error::Result, fragment::Fragment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FileKind {
    Fragmented,
    Continuous,
    Legacy,
}

/// What the transfer feeding a file should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Keep streaming; the next chunk lands right after this one.
    Continue,
    /// Drop the current response and request again from this offset.
    RestartAt(u64),
    /// Every byte is present.
    Finished,
}

/// Broadcast to readers whenever coverage changes or the file closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSignal {
    pub version: u64,
    pub closed:  bool,
}

#[derive(Debug)]
pub(crate) struct Notifier {
    tx: watch::Sender<FileSignal>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(FileSignal::default());
        Self { tx }
    }

    pub(crate) fn bump(&self) { self.tx.send_modify(|signal| signal.version += 1); }

    pub(crate) fn close(&self) {
        self.tx.send_modify(|signal| {
            signal.version += 1;
            signal.closed = true;
        });
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<FileSignal> { self.tx.subscribe() }
}

/// Names of every file that may belong to one cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileName {
    pub kind: String,
    pub id:   String,
    pub ext:  String,
}

impl FileName {
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>, ext: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id:   id.into(),
            ext:  ext.into(),
        }
    }

    /// `<kind>$<id>.<ext>`
    #[must_use]
    pub fn trunk(&self) -> String { format!("{}${}.{}", self.kind, self.id, self.ext) }

    /// `<kind>$<id>.plain.<ext>`
    #[must_use]
    pub fn plain(&self) -> String { format!("{}${}.plain.{}", self.kind, self.id, self.ext) }

    /// `<id>.<ext>`
    #[must_use]
    pub fn legacy_complete(&self) -> String { format!("{}.{}", self.id, self.ext) }

    /// `<id>.<ext>.dl`
    #[must_use]
    pub fn legacy_partial(&self) -> String { format!("{}.{}.dl", self.id, self.ext) }

    /// `etag$<id>.txt`
    #[must_use]
    pub fn etag_sidecar(&self) -> String { format!("etag${}.txt", self.id) }

    #[must_use]
    pub fn all(&self) -> Vec<String> {
        vec![
            self.trunk(),
            self.plain(),
            format!("{}.tmp", self.plain()),
            self.legacy_complete(),
            self.legacy_partial(),
            self.etag_sidecar(),
        ]
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}${}", self.kind, self.id) }
}

pub trait CacheFile: Send + Sync + fmt::Debug {
    fn kind(&self) -> FileKind;

    /// Primary backing file.
    fn path(&self) -> &Path;

    /// Every file on disk this cache file owns.
    fn paths(&self) -> Vec<PathBuf>;

    fn full_size(&self) -> u64;

    /// Remote modification time, unix seconds, as of the last `init`.
    fn last_modified(&self) -> i64;

    fn is_complete(&self) -> bool;

    /// Size the file for content of `content_length` bytes.
    fn init(&self, content_length: u64, last_modified: i64) -> Result<()>;

    /// Forget every downloaded byte.
    fn clear(&self) -> Result<()>;

    /// A reader wants data at `offset`. Returns the offset the transfer will
    /// write next on the reader's behalf.
    fn notify_request_start(&self, offset: u64) -> u64;

    /// Pick where the next request should start. `None` once complete.
    fn begin_transfer(&self) -> Option<u64>;

    /// Store bytes received at `position`.
    fn append(&self, position: u64, data: &[u8]) -> Result<AppendOutcome>;

    /// The transfer stopped feeding this file.
    fn end_transfer(&self);

    /// Contiguous bytes present starting at `offset`.
    fn available(&self, offset: u64) -> u64;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn fragments(&self) -> Vec<Fragment>;

    fn subscribe(&self) -> watch::Receiver<FileSignal>;

    /// Wake every reader with `Closed` and flush to disk.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Open the file for `name`, honoring a pre-existing legacy pair over the
/// configured format.
pub fn open_cache_file(
    dir: &Path,
    name: &FileName,
    format: FileFormat,
    materialize: bool,
    request_slack: u64,
) -> Result<Arc<dyn CacheFile>> {
    let legacy_exists = dir.join(name.legacy_complete()).exists()
        || dir.join(name.legacy_partial()).exists();
    let file: Arc<dyn CacheFile> = if legacy_exists {
        Arc::new(LegacyFile::open(dir, name)?)
    } else {
        match format {
            FileFormat::Fragmented => Arc::new(FragmentedFile::open(
                dir,
                name,
                materialize,
                request_slack,
            )?),
            FileFormat::Continuous => Arc::new(ContinuousFile::open(dir, name, materialize)?),
        }
    };
    debug!(name = %name, kind = %file.kind(), "opened cache file");
    Ok(file)
}
