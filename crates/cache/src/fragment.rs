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

//! In-memory tracking of the downloaded byte ranges of one cache file.
//!
//! Fragments are byte exact, sorted by `start` and never overlap. Adjacent
//! fragments are merged as soon as one grows into the other, so the list is
//! always the minimal set of contiguous ranges.

use std::fmt;

/// A contiguous downloaded range `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fragment {
    pub start:  u64,
    pub length: u64,
}

impl Fragment {
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self { Self { start, length } }

    #[must_use]
    pub const fn end(&self) -> u64 { self.start + self.length }

    /// `offset` lies inside the fragment or exactly at its end, where the
    /// next append would land.
    #[must_use]
    pub const fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset <= self.end()
    }

    #[must_use]
    pub const fn covers(&self, offset: u64, len: u64) -> bool {
        offset >= self.start && offset + len <= self.end()
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Stable handle to a fragment; survives growth but not absorption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(u64);

/// Records that `absorbed` was merged into `into`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Absorbed {
    pub absorbed: FragmentId,
    pub into:     FragmentId,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    id:       FragmentId,
    fragment: Fragment,
}

#[derive(Debug)]
pub struct FragmentTracker {
    full_size: u64,
    slots:     Vec<Slot>,
    next_id:   u64,
}

impl FragmentTracker {
    /// Build a tracker from fragments recovered from disk.
    ///
    /// Input may be unsorted or touching; it is normalized. An empty input
    /// yields a single zero-length fragment at offset 0.
    #[must_use]
    pub fn new(full_size: u64, fragments: impl IntoIterator<Item = Fragment>) -> Self {
        let mut tracker = Self {
            full_size,
            slots: Vec::new(),
            next_id: 0,
        };
        tracker.reset(full_size, fragments);
        tracker
    }

    pub fn reset(&mut self, full_size: u64, fragments: impl IntoIterator<Item = Fragment>) {
        self.full_size = full_size;
        let mut fragments: Vec<Fragment> = fragments.into_iter().collect();
        fragments.sort_by_key(|f| f.start);
        self.slots.clear();
        for fragment in fragments {
            let id = self.allocate_id();
            self.slots.push(Slot { id, fragment });
        }
        if self.slots.is_empty() {
            let id = self.allocate_id();
            self.slots.push(Slot {
                id,
                fragment: Fragment::new(0, 0),
            });
        }
        let mut idx = 0;
        while idx < self.slots.len() {
            let id = self.slots[idx].id;
            self.merge_forward(id);
            idx += 1;
        }
    }

    const fn allocate_id(&mut self) -> FragmentId {
        let id = FragmentId(self.next_id);
        self.next_id += 1;
        id
    }

    #[must_use]
    pub const fn full_size(&self) -> u64 { self.full_size }

    #[must_use]
    pub fn fragments(&self) -> Vec<Fragment> { self.slots.iter().map(|s| s.fragment).collect() }

    #[must_use]
    pub fn get(&self, id: FragmentId) -> Option<Fragment> {
        self.slots.iter().find(|s| s.id == id).map(|s| s.fragment)
    }

    pub fn get_mut(&mut self, id: FragmentId) -> Option<&mut Fragment> {
        self.slots
            .iter_mut()
            .find(|s| s.id == id)
            .map(|s| &mut s.fragment)
    }

    fn index_of(&self, id: FragmentId) -> Option<usize> {
        self.slots.iter().position(|s| s.id == id)
    }

    /// The fragment whose range contains `offset` (its end included).
    #[must_use]
    pub fn find_containing(&self, offset: u64) -> Option<FragmentId> {
        self.slots
            .iter()
            .rev()
            .find(|s| s.fragment.start <= offset)
            .filter(|s| s.fragment.contains(offset))
            .map(|s| s.id)
    }

    /// Fragment containing offset 0, where a looping playback resumes.
    #[must_use]
    pub fn head(&self) -> Option<FragmentId> { self.find_containing(0) }

    /// Reuse the fragment containing `offset` or open a zero-length one there.
    pub fn insert(&mut self, offset: u64) -> FragmentId {
        if let Some(id) = self.find_containing(offset) {
            return id;
        }
        let id = self.allocate_id();
        let idx = self.slots.partition_point(|s| s.fragment.start < offset);
        self.slots.insert(
            idx,
            Slot {
                id,
                fragment: Fragment::new(offset, 0),
            },
        );
        id
    }

    /// Bytes that can be appended to `id` before it runs into the next
    /// non-empty fragment or the end of the file. Empty fragments in the way
    /// are absorbed by the following merge.
    #[must_use]
    pub fn room_after(&self, id: FragmentId) -> u64 {
        let Some(idx) = self.index_of(id) else {
            return 0;
        };
        let end = self.slots[idx].fragment.end();
        let limit = self.slots[idx + 1..]
            .iter()
            .find(|next| next.fragment.length > 0)
            .map_or(self.full_size, |next| next.fragment.start.min(self.full_size));
        limit.saturating_sub(end)
    }

    /// Absorb every following fragment that `id` now reaches.
    pub fn merge_forward(&mut self, id: FragmentId) -> Vec<Absorbed> {
        let mut absorbed = Vec::new();
        let Some(idx) = self.index_of(id) else {
            return absorbed;
        };
        while idx + 1 < self.slots.len() {
            let current = self.slots[idx].fragment;
            if self.slots[idx + 1].fragment.start > current.end() {
                break;
            }
            let next = self.slots.remove(idx + 1);
            self.slots[idx].fragment.length =
                current.end().max(next.fragment.end()) - current.start;
            absorbed.push(Absorbed {
                absorbed: next.id,
                into:     id,
            });
        }
        absorbed
    }

    /// `merge_forward`, plus a head merge when `id` reached the end of the
    /// file, since looping playback continues at offset 0.
    pub fn merge_in_loop(&mut self, id: FragmentId) -> Vec<Absorbed> {
        let mut absorbed = self.merge_forward(id);
        let reached_end = self
            .get(id)
            .is_some_and(|f| self.full_size > 0 && f.end() >= self.full_size);
        if reached_end
            && let Some(first) = self.slots.first().map(|s| s.id)
            && first != id
        {
            absorbed.extend(self.merge_forward(first));
        }
        absorbed
    }

    /// Exactly one fragment spanning `[0, full_size)`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.full_size > 0
            && self.slots.len() == 1
            && self.slots[0].fragment.start == 0
            && self.slots[0].fragment.length >= self.full_size
    }

    /// Contiguous bytes available starting at `offset`.
    #[must_use]
    pub fn available_from(&self, offset: u64) -> u64 {
        self.find_containing(offset)
            .and_then(|id| self.get(id))
            .map_or(0, |f| f.end() - offset)
    }

    #[must_use]
    pub fn covered_len(&self) -> u64 { self.slots.iter().map(|s| s.fragment.length).sum() }
}
