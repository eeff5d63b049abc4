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

//! Resumable byte-range cache for streaming large remote media files.
//!
//! Readers block on byte ranges of a local cache file while prioritized,
//! rate-limited transfers fill it from the remote.

mod config;
pub mod download;
mod entry;
mod error;
mod evict;
pub mod file;
mod fragment;
mod meta;
pub mod metrics;
mod pio;
mod reader;
mod service;
mod source;
mod trunk;

pub use config::{CacheConfig, FileFormat, LimiterConfig, SchedulerConfig};
pub use entry::{Entry, EntryRequest};
pub use error::{CacheError, Result};
pub use evict::{EvictionReport, Evictor};
pub use fragment::Fragment;
pub use meta::{MemoryMetaStore, MetaKey, MetaRecord, MetaStore};
pub use reader::{MissHook, StreamReader};
pub use service::CacheService;
pub use source::{
    FetchRequest, HttpSource, MemoryResource, MemorySource, RemoteBody, RemoteInfo, RemoteSource,
};
pub use trunk::{TRUNK_CAPACITY, TRUNK_SIZE, TrunkStore};
