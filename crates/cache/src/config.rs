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

use std::{collections::HashMap, path::PathBuf, time::Duration};

use bon::Builder;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ResultExt;
use strum_macros::{Display, EnumString};
use validator::Validate;

use crate::error::{InvalidConfigSnafu, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// On-disk format used for entries that have no cache file yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileFormat {
    /// Trunk file with a fragment list; supports seeking anywhere.
    #[default]
    Fragmented,
    /// Trunk file grown strictly from offset 0.
    Continuous,
}

/// Configuration for the cache engine
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault, Builder, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding trunk files, legacy files and sidecars
    #[default(default_cache_dir())]
    #[builder(default = default_cache_dir(), into)]
    pub cache_dir: PathBuf,

    /// Format for newly created cache files
    #[builder(default)]
    pub default_format: FileFormat,

    /// Size budget applied to entity types without an explicit entry in
    /// `budgets` (default: 10GB)
    #[default(10 * GIB)]
    #[builder(default = 10 * GIB)]
    pub default_budget: u64,

    /// Per entity type size budgets
    #[builder(default)]
    pub budgets: HashMap<String, u64>,

    /// How long a released entry keeps its file open (default: 1s)
    #[default(Duration::from_secs(1))]
    #[builder(default = Duration::from_secs(1))]
    pub close_grace: Duration,

    /// Resolved targets smaller than this are rejected as error pages
    /// (default: 1MB)
    #[default(MIB)]
    #[builder(default = MIB)]
    pub min_video_size: u64,

    /// A request this close past the active fragment's end keeps extending
    /// it instead of opening a new fragment (default: 100KB)
    #[default(100 * KIB)]
    #[builder(default = 100 * KIB)]
    pub request_slack: u64,

    /// Maximum redirect hops followed while probing
    #[default = 10]
    #[builder(default = 10)]
    #[validate(range(min = 1))]
    pub max_redirects: usize,

    /// Timeout for metadata probes (default: 30s)
    #[default(Duration::from_secs(30))]
    #[builder(default = Duration::from_secs(30))]
    pub request_timeout: Duration,

    /// Custom User-Agent header
    pub user_agent: Option<String>,

    /// Write a plain sequential copy once a trunk file completes
    #[default = true]
    #[builder(default = true)]
    pub materialize_on_complete: bool,

    #[builder(default)]
    #[validate(nested)]
    pub scheduler: SchedulerConfig,

    #[builder(default)]
    #[validate(nested)]
    pub limiter: LimiterConfig,
}

impl CacheConfig {
    pub fn validate_all(&self) -> Result<()> { self.validate().context(InvalidConfigSnafu) }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("reelcache")
}

/// Download scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault, Builder, Validate)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tasks whose priority is below this value may transfer
    #[default = 2]
    #[builder(default = 2)]
    #[validate(range(min = 1))]
    pub max_parallel: usize,

    /// Period of the stall checker (default: 2s)
    #[default(Duration::from_secs(2))]
    #[builder(default = Duration::from_secs(2))]
    pub check_interval: Duration,

    /// An attempt must run this long before it can be restarted
    #[default(Duration::from_secs(5))]
    #[builder(default = Duration::from_secs(5))]
    pub min_run: Duration,

    /// Attempts running longer than this are restarted outright
    #[default(Duration::from_secs(300))]
    #[builder(default = Duration::from_secs(300))]
    pub too_slow: Duration,

    /// Allowed overrun of the projected finish past the deadline
    #[default(Duration::from_secs(3))]
    #[builder(default = Duration::from_secs(3))]
    pub deadline_bias: Duration,

    /// Number of samples in the ETA window
    #[default = 10]
    #[builder(default = 10)]
    #[validate(range(min = 1))]
    pub eta_window: usize,

    /// First delay of the network retry backoff
    #[default(Duration::from_secs(1))]
    #[builder(default = Duration::from_secs(1))]
    pub retry_min_delay: Duration,

    /// Upper bound of the network retry backoff
    #[default(Duration::from_secs(30))]
    #[builder(default = Duration::from_secs(30))]
    pub retry_max_delay: Duration,
}

/// Request pacing shared by all tasks of one download manager
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault, Builder, Validate)]
#[serde(default)]
pub struct LimiterConfig {
    /// Delay before the first request may start
    #[builder(default)]
    pub min_delay: Duration,

    /// Minimum spacing between request starts (default: 200ms)
    #[default(Duration::from_millis(200))]
    #[builder(default = Duration::from_millis(200))]
    pub min_interval: Duration,

    /// Spacing used while a 429 cooldown is active (default: 5s)
    #[default(Duration::from_secs(5))]
    #[builder(default = Duration::from_secs(5))]
    pub throttled_interval: Duration,

    /// How long a 429 keeps the stretched spacing (default: 60s)
    #[default(Duration::from_secs(60))]
    #[builder(default = Duration::from_secs(60))]
    pub throttle_cooldown: Duration,

    /// One-time extra delay after a 5xx (default: 5s)
    #[default(Duration::from_secs(5))]
    #[builder(default = Duration::from_secs(5))]
    pub server_error_delay: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate_all().unwrap();
        assert_eq!(config.default_format, FileFormat::Fragmented);
        assert_eq!(config.close_grace, Duration::from_secs(1));
        assert_eq!(config.scheduler.eta_window, 10);
    }

    #[test]
    fn budget_override() {
        let config = CacheConfig::builder()
            .cache_dir("/tmp/reelcache")
            .default_budget(100)
            .budgets(HashMap::from([("video".to_string(), 42)]))
            .build();
        assert_eq!(config.budgets.get("video"), Some(&42));
        assert_eq!(config.default_budget, 100);
    }

    #[test]
    fn zero_parallelism_rejected() {
        let config = CacheConfig {
            scheduler: SchedulerConfig {
                max_parallel: 0,
                ..SchedulerConfig::default()
            },
            ..CacheConfig::default()
        };
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn format_parses_from_snake_case() {
        assert_eq!(
            "continuous".parse::<FileFormat>().unwrap(),
            FileFormat::Continuous
        );
        let json = serde_json::to_string(&FileFormat::Fragmented).unwrap();
        assert_eq!(json, "\"fragmented\"");
    }
}
