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

use std::{fmt, io::SeekFrom, sync::Arc};

use snafu::ensure;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CancelledSnafu, ClosedSnafu, Result, SeekOutOfRangeSnafu},
    file::CacheFile,
};

/// Called with the cursor when a read finds its range missing.
pub type MissHook = Box<dyn Fn(u64) + Send + Sync>;

/// Cursor over a cache file that waits for missing bytes instead of
/// returning short reads.
pub struct StreamReader {
    file:    Arc<dyn CacheFile>,
    cursor:  u64,
    cancel:  CancellationToken,
    on_miss: Option<MissHook>,
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("path", &self.file.path())
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl StreamReader {
    #[must_use]
    pub fn new(file: Arc<dyn CacheFile>, cancel: CancellationToken) -> Self {
        Self {
            file,
            cursor: 0,
            cancel,
            on_miss: None,
        }
    }

    #[must_use]
    pub fn with_miss_hook(mut self, hook: MissHook) -> Self {
        self.on_miss = Some(hook);
        self
    }

    #[must_use]
    pub const fn position(&self) -> u64 { self.cursor }

    #[must_use]
    pub fn len(&self) -> u64 { self.file.full_size() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Wait until `[offset, offset + len)` is present, clamped to the file
    /// size. Unrelated coverage changes only re-check the range.
    pub async fn request_range(&self, offset: u64, len: u64) -> Result<()> {
        let want = len.min(self.len().saturating_sub(offset));
        let mut rx = self.file.subscribe();
        let mut asked = false;
        loop {
            ensure!(!rx.borrow_and_update().closed, ClosedSnafu);
            if self.file.available(offset) >= want {
                return Ok(());
            }
            if !asked {
                if let Some(hook) = &self.on_miss {
                    hook(offset);
                }
                asked = true;
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return CancelledSnafu.fail(),
                changed = rx.changed() => ensure!(changed.is_ok(), ClosedSnafu),
            }
        }
    }

    /// Fill as much of `buf` as the file allows; `Ok(0)` at the end.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let total = self.len();
        if self.cursor >= total || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(total - self.cursor);
        self.request_range(self.cursor, len).await?;
        let n = self.file.read_at(&mut buf[..len as usize], self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }

    /// Move the cursor. A target outside `[0, len]` resets the cursor to 0
    /// and fails.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let total = self.len();
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(delta) => i128::from(self.cursor) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(total) + i128::from(delta),
        };
        if target < 0 || target > i128::from(total) {
            self.cursor = 0;
            return SeekOutOfRangeSnafu {
                offset: i64::try_from(target).unwrap_or(i64::MAX),
                total,
            }
            .fail();
        }
        self.cursor = target as u64;
        Ok(self.cursor)
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len().saturating_sub(self.cursor) as usize);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}
