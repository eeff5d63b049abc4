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

//! Fixed-layout partial file: header, presence bitmap, body.
//!
//! ```text
//! offset  size   field
//! 0       8      magic "RCTRUNK1"
//! 8       8      full size (LE i64)
//! 16      8      last modified, unix seconds (LE i64)
//! 24      1      state, bit0 = completed
//! 25      16384  bitmap, one byte per 16KB block
//! 16409   ...    body
//! ```
//!
//! A block is marked present only once it is fully covered by a single
//! fragment, so the bitmap may under-report the trailing bytes of a
//! fragment. That loss is accepted on reopen.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use snafu::{ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    error::{CorruptFormatSnafu, FileOpenSnafu, FileReadSnafu, FileWriteSnafu, Result, TooLargeSnafu},
    fragment::Fragment,
    pio,
};

pub const TRUNK_MAGIC: &[u8; 8] = b"RCTRUNK1";
pub const TRUNK_SIZE: u64 = 16 * 1024;
pub const TRUNK_CAPACITY: u64 = 256 * 1024 * 1024;
pub const BITMAP_LEN: usize = (TRUNK_CAPACITY / TRUNK_SIZE) as usize;

const FULL_SIZE_OFFSET: u64 = 8;
const STATE_OFFSET: u64 = 24;
const BITMAP_OFFSET: u64 = 25;
pub const BODY_OFFSET: u64 = BITMAP_OFFSET + BITMAP_LEN as u64;

const STATE_COMPLETED: u8 = 0b1;

#[derive(Debug, Clone)]
struct Header {
    full_size:     u64,
    last_modified: i64,
    completed:     bool,
    bitmap:        Vec<u8>,
}

impl Header {
    fn empty() -> Self {
        Self {
            full_size:     0,
            last_modified: 0,
            completed:     false,
            bitmap:        vec![0; BITMAP_LEN],
        }
    }

    fn encode_meta(&self) -> [u8; 17] {
        let mut buf = [0u8; 17];
        buf[..8].copy_from_slice(&(self.full_size as i64).to_le_bytes());
        buf[8..16].copy_from_slice(&self.last_modified.to_le_bytes());
        buf[16] = if self.completed { STATE_COMPLETED } else { 0 };
        buf
    }

    fn decode(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < BODY_OFFSET as usize {
            return Err(format!("short header of {} bytes", buf.len()));
        }
        if &buf[..8] != TRUNK_MAGIC {
            return Err("magic mismatch".to_string());
        }
        let read_i64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            i64::from_le_bytes(raw)
        };
        let full_size = read_i64(FULL_SIZE_OFFSET as usize);
        if !(0..=TRUNK_CAPACITY as i64).contains(&full_size) {
            return Err(format!("full size {full_size} out of range"));
        }
        let bitmap = buf[BITMAP_OFFSET as usize..BODY_OFFSET as usize].to_vec();
        if bitmap.iter().any(|b| *b > 1) {
            return Err("bitmap holds values other than 0/1".to_string());
        }
        Ok(Self {
            full_size: full_size as u64,
            last_modified: read_i64(16),
            completed: buf[STATE_OFFSET as usize] & STATE_COMPLETED != 0,
            bitmap,
        })
    }

    const fn block_count(&self) -> usize { self.full_size.div_ceil(TRUNK_SIZE) as usize }

    /// Blocks `[first, last)` fully covered by `[start, end)`.
    fn covered_blocks(&self, start: u64, end: u64) -> (usize, usize) {
        let first = start.div_ceil(TRUNK_SIZE) as usize;
        let last = if end >= self.full_size {
            self.block_count()
        } else {
            (end / TRUNK_SIZE) as usize
        };
        (first, last.max(first))
    }
}

#[derive(Debug)]
pub struct TrunkStore {
    path:   PathBuf,
    file:   File,
    header: RwLock<Header>,
}

impl TrunkStore {
    /// Open or create a trunk file.
    ///
    /// A short file or a magic mismatch is treated as corruption: the file is
    /// reinitialized and prior partial progress is dropped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(FileOpenSnafu { path: parent })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(FileOpenSnafu { path: &path })?;
        let len = file.metadata().context(FileReadSnafu)?.len();

        let header = if len == 0 {
            Self::write_fresh(&file)?
        } else {
            let mut buf = vec![0u8; BODY_OFFSET.min(len) as usize];
            pio::read_at(&file, &mut buf, 0).context(FileReadSnafu)?;
            match Header::decode(&buf) {
                Ok(header) => header,
                Err(reason) => {
                    let corrupt = CorruptFormatSnafu { path: &path, reason }.build();
                    warn!(error = %corrupt, "reinitializing trunk file");
                    Self::write_fresh(&file)?
                }
            }
        };

        debug!(
            path = %path.display(),
            full_size = header.full_size,
            completed = header.completed,
            "opened trunk file"
        );
        Ok(Self {
            path,
            file,
            header: RwLock::new(header),
        })
    }

    fn write_fresh(file: &File) -> Result<Header> {
        let header = Header::empty();
        file.set_len(0).context(FileWriteSnafu)?;
        let mut buf = Vec::with_capacity(BODY_OFFSET as usize);
        buf.extend_from_slice(TRUNK_MAGIC);
        buf.extend_from_slice(&header.encode_meta());
        buf.extend_from_slice(&header.bitmap);
        pio::write_all_at(file, &buf, 0).context(FileWriteSnafu)?;
        Ok(header)
    }

    #[must_use]
    pub fn path(&self) -> &Path { &self.path }

    #[must_use]
    pub fn full_size(&self) -> u64 { self.header.read().full_size }

    #[must_use]
    pub fn last_modified(&self) -> i64 { self.header.read().last_modified }

    #[must_use]
    pub fn is_completed(&self) -> bool { self.header.read().completed }

    /// Size the body for new content and persist its metadata. A changed
    /// length invalidates the bitmap.
    pub fn init(&self, content_length: u64, last_modified: i64) -> Result<()> {
        ensure!(
            content_length <= TRUNK_CAPACITY,
            TooLargeSnafu {
                size:     content_length,
                capacity: TRUNK_CAPACITY,
            }
        );
        let mut header = self.header.write();
        let resized = header.full_size != content_length;
        if resized {
            header.bitmap.fill(0);
            header.completed = false;
        }
        header.full_size = content_length;
        header.last_modified = last_modified;

        self.file
            .set_len(BODY_OFFSET + content_length)
            .context(FileWriteSnafu)?;
        pio::write_all_at(&self.file, &header.encode_meta(), FULL_SIZE_OFFSET)
            .context(FileWriteSnafu)?;
        if resized {
            pio::write_all_at(&self.file, &header.bitmap, BITMAP_OFFSET).context(FileWriteSnafu)?;
        }
        Ok(())
    }

    /// Write `data` at the end of `fragment`, grow it, and mark the blocks it
    /// now fully covers.
    pub fn append_to(&self, fragment: &mut Fragment, data: &[u8]) -> Result<()> {
        let old_end = fragment.end();
        pio::write_all_at(&self.file, data, BODY_OFFSET + old_end).context(FileWriteSnafu)?;
        fragment.length += data.len() as u64;

        let mut header = self.header.write();
        let (first, last) = header.covered_blocks(fragment.start, fragment.end());
        let first = first.max((old_end / TRUNK_SIZE) as usize);
        let last = last.min(BITMAP_LEN);
        if first >= last {
            return Ok(());
        }
        let mut changed: Option<(usize, usize)> = None;
        for idx in first..last {
            if header.bitmap[idx] == 0 {
                header.bitmap[idx] = 1;
                changed = Some(changed.map_or((idx, idx + 1), |(lo, _)| (lo, idx + 1)));
            }
        }
        if let Some((lo, hi)) = changed {
            pio::write_all_at(
                &self.file,
                &header.bitmap[lo..hi],
                BITMAP_OFFSET + lo as u64,
            )
            .context(FileWriteSnafu)?;
        }
        Ok(())
    }

    /// Positional read from the body, clamped to the full size.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let full_size = self.full_size();
        if offset >= full_size {
            return Ok(0);
        }
        let len = buf.len().min((full_size - offset) as usize);
        pio::read_at(&self.file, &mut buf[..len], BODY_OFFSET + offset).context(FileReadSnafu)
    }

    /// Block-aligned fragments reconstructed from the bitmap.
    #[must_use]
    pub fn to_fragments(&self) -> Vec<Fragment> {
        let header = self.header.read();
        if header.completed && header.full_size > 0 {
            return vec![Fragment::new(0, header.full_size)];
        }
        let blocks = header.block_count().min(BITMAP_LEN);
        let mut fragments = Vec::new();
        let mut run_start: Option<usize> = None;
        for idx in 0..=blocks {
            let present = idx < blocks && header.bitmap[idx] == 1;
            match (present, run_start) {
                (true, None) => run_start = Some(idx),
                (false, Some(start)) => {
                    let begin = start as u64 * TRUNK_SIZE;
                    let end = (idx as u64 * TRUNK_SIZE).min(header.full_size);
                    fragments.push(Fragment::new(begin, end - begin));
                    run_start = None;
                }
                _ => {}
            }
        }
        if fragments.is_empty() {
            fragments.push(Fragment::new(0, 0));
        }
        fragments
    }

    /// Forget every downloaded block; body bytes are left in place.
    pub fn clear_trunks(&self) -> Result<()> {
        let mut header = self.header.write();
        header.bitmap.fill(0);
        header.completed = false;
        pio::write_all_at(&self.file, &header.encode_meta(), FULL_SIZE_OFFSET)
            .context(FileWriteSnafu)?;
        pio::write_all_at(&self.file, &header.bitmap, BITMAP_OFFSET).context(FileWriteSnafu)
    }

    /// Flip the completed bit; returns whether this call flipped it.
    pub fn mark_completed(&self) -> Result<bool> {
        let mut header = self.header.write();
        if header.completed {
            return Ok(false);
        }
        header.completed = true;
        pio::write_all_at(&self.file, &[STATE_COMPLETED], STATE_OFFSET).context(FileWriteSnafu)?;
        Ok(true)
    }

    pub fn sync(&self) -> Result<()> { self.file.sync_data().context(FileWriteSnafu) }
}
