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

use std::sync::LazyLock;

use prometheus::{IntCounterVec, IntGaugeVec, register_int_counter_vec, register_int_gauge_vec};

pub const KIND_LABEL: &str = "kind";
pub const CLIENT_LABEL: &str = "client";
pub const REASON_LABEL: &str = "reason";

pub static BYTES_APPENDED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "reelcache_bytes_appended_total",
        "Total number of bytes appended to cache files",
        &[KIND_LABEL]
    )
    .unwrap()
});

pub static TRANSFER_RESTARTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "reelcache_transfer_restarts_total",
        "Total number of transfers reissued at a new or the same offset",
        &[CLIENT_LABEL, REASON_LABEL]
    )
    .unwrap()
});

pub static THROTTLED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "reelcache_throttled_total",
        "Total number of 429 responses",
        &[CLIENT_LABEL]
    )
    .unwrap()
});

pub static EVICTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "reelcache_evictions_total",
        "Total number of entries evicted to stay under budget",
        &[KIND_LABEL]
    )
    .unwrap()
});

pub static ACTIVE_TRANSFERS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "reelcache_active_transfers",
        "Number of transfers currently running",
        &[CLIENT_LABEL]
    )
    .unwrap()
});
