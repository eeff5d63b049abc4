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

use std::path::PathBuf;

use snafu::Snafu;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CacheError {
    #[snafu(display("No remote source registered for client {client}"))]
    NotSupported { client: String },

    #[snafu(display("Throttled (429) by {url}"))]
    Throttled { url: String },

    #[snafu(display("Resource unavailable ({status}) at {url}"))]
    ResourceUnavailable { status: u16, url: String },

    #[snafu(display("Range starting at {offset} not satisfiable for {url}"))]
    RangeNotSatisfiable { offset: u64, url: String },

    #[snafu(display("Operation cancelled"))]
    Cancelled,

    #[snafu(display("Cache file closed"))]
    Closed,

    #[snafu(display("Corrupt cache file {}: {reason}", path.display()))]
    CorruptFormat { path: PathBuf, reason: String },

    #[snafu(display("Network error: {source}"))]
    Network {
        source: reqwest::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("HTTP error {status} for URL: {url}"))]
    Http { status: u16, url: String },

    #[snafu(display("{url} resolved to {size} bytes, too small to be a video"))]
    NotAVideo { url: String, size: u64 },

    #[snafu(display("Failed to get content length from {url}"))]
    FileSizeUnknown { url: String },

    #[snafu(display("Too many redirects starting at {url}"))]
    TooManyRedirects { url: String },

    #[snafu(display("Failed to open cache file {}: {source}", path.display()))]
    FileOpen {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("File write error: {source}"))]
    FileWrite {
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("File read error: {source}"))]
    FileRead {
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Content of {size} bytes exceeds trunk capacity of {capacity} bytes"))]
    TooLarge { size: u64, capacity: u64 },

    #[snafu(display("Seek to {offset} is outside [0, {total}]"))]
    SeekOutOfRange { offset: i64, total: u64 },

    #[snafu(display("Entry {id} failed and must be reopened"))]
    EntryFailed { id: String },

    #[snafu(display("Invalid configuration: {source}"))]
    InvalidConfig { source: validator::ValidationErrors },

    #[snafu(display("Metadata store error: {message}"))]
    MetaStore { message: String },
}

impl CacheError {
    /// Whether the scheduler's backoff loop should try the request again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Throttled { .. } | Self::ResourceUnavailable { .. }
        )
    }

    /// The consumer went away; callers log these at debug level only.
    #[must_use]
    pub const fn is_quiet(&self) -> bool { matches!(self, Self::Cancelled | Self::Closed) }

    /// HTTP status carried by the error, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Throttled { .. } => Some(429),
            Self::RangeNotSatisfiable { .. } => Some(416),
            Self::ResourceUnavailable { status, .. } | Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let throttled = CacheError::Throttled {
            url: "http://cdn/v".to_string(),
        };
        assert!(throttled.is_retryable());
        assert_eq!(throttled.status(), Some(429));

        let unavailable = CacheError::ResourceUnavailable {
            status: 503,
            url:    "http://cdn/v".to_string(),
        };
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.status(), Some(503));

        assert!(CacheError::Cancelled.is_quiet());
        assert!(CacheError::Closed.is_quiet());
        assert!(!CacheError::Closed.is_retryable());

        let range = CacheError::RangeNotSatisfiable {
            offset: 10,
            url:    "http://cdn/v".to_string(),
        };
        assert!(!range.is_retryable());
        assert_eq!(range.status(), Some(416));
    }
}
