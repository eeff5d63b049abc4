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

//! Remote byte sources. [`HttpSource`] talks to real servers,
//! [`MemorySource`] serves in-process content for embedders' tests.

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::RwLock;
use reqwest::{StatusCode, Url, header, redirect::Policy};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::debug;

use crate::{
    config::CacheConfig,
    error::{
        CacheError, FileSizeUnknownSnafu, HttpSnafu, NetworkSnafu, NotAVideoSnafu,
        RangeNotSatisfiableSnafu, ResourceUnavailableSnafu, Result, ThrottledSnafu,
        TooManyRedirectsSnafu,
    },
};

/// What a probe learned about the final target of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    /// URL after following redirects
    pub url:           String,
    pub size:          u64,
    pub etag:          Option<String>,
    /// Unix seconds from `Last-Modified`
    pub last_modified: Option<i64>,
    /// `Referer` sent on the final hop, to be replayed on body requests
    pub referer:       Option<String>,
}

#[derive(Debug, Clone, Builder)]
pub struct FetchRequest {
    #[builder(into)]
    pub url:     String,
    #[builder(into)]
    pub referer: Option<String>,
    #[builder(default)]
    pub offset:  u64,
}

/// Streaming response body starting exactly at `offset`.
pub struct RemoteBody {
    offset: u64,
    skip:   u64,
    stream: BoxStream<'static, Result<Bytes>>,
}

impl fmt::Debug for RemoteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBody")
            .field("offset", &self.offset)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

impl RemoteBody {
    #[must_use]
    pub fn new(offset: u64, stream: BoxStream<'static, Result<Bytes>>) -> Self {
        Self {
            offset,
            skip: 0,
            stream,
        }
    }

    /// Drop the first `skip` bytes, for servers that ignore `Range`.
    #[must_use]
    pub const fn skipping(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// Offset of the first byte yielded by [`Self::next_chunk`].
    #[must_use]
    pub const fn offset(&self) -> u64 { self.offset }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        while let Some(chunk) = self.stream.next().await {
            let mut chunk = chunk?;
            if self.skip > 0 {
                let drop = self.skip.min(chunk.len() as u64);
                self.skip -= drop;
                chunk = chunk.slice(drop as usize..);
            }
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}

#[async_trait]
pub trait RemoteSource: Send + Sync + fmt::Debug {
    /// Client name; selects the download manager and rate limiter.
    fn name(&self) -> &str;

    async fn probe(&self, url: &str, referer: Option<&str>) -> Result<RemoteInfo>;

    async fn fetch(&self, request: &FetchRequest) -> Result<RemoteBody>;
}

/// Map a response status onto the error taxonomy; 2xx passes.
pub fn check_status(status: u16, url: &str, offset: u64) -> Result<()> {
    match status {
        200..=299 => Ok(()),
        416 => RangeNotSatisfiableSnafu { offset, url }.fail(),
        429 => ThrottledSnafu { url }.fail(),
        500..=599 => ResourceUnavailableSnafu { status, url }.fail(),
        _ => HttpSnafu { status, url }.fail(),
    }
}

/// Parse an HTTP date into unix seconds.
#[must_use]
pub fn parse_http_date(value: &str) -> Option<i64> {
    jiff::fmt::rfc2822::DateTimeParser::new()
        .parse_timestamp(value)
        .ok()
        .map(|ts| ts.as_second())
}

/// `bytes start-end/total` → `(start, total)`
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _) = range.split_once('-')?;
    Some((start.trim().parse().ok()?, total.trim().parse().ok()))
}

fn header_str<'a>(headers: &'a header::HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[derive(Debug)]
pub struct HttpSource {
    name:           String,
    client:         reqwest::Client,
    max_redirects:  usize,
    min_video_size: u64,
    probe_timeout:  Duration,
}

impl HttpSource {
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().redirect(Policy::none());
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        let client = builder.build().context(NetworkSnafu)?;
        Ok(Self {
            name: name.into(),
            client,
            max_redirects: config.max_redirects,
            min_video_size: config.min_video_size,
            probe_timeout: config.request_timeout,
        })
    }

    async fn head(&self, url: &str, referer: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.client.head(url).timeout(self.probe_timeout);
        if let Some(referer) = referer {
            request = request.header(header::REFERER, referer);
        }
        request.send().await.context(NetworkSnafu)
    }

    /// Size from a one-byte ranged GET, for servers that reject `HEAD`.
    async fn size_by_range(&self, url: &str, referer: Option<&str>) -> Result<Option<u64>> {
        let mut request = self
            .client
            .get(url)
            .timeout(self.probe_timeout)
            .header(header::RANGE, "bytes=0-0");
        if let Some(referer) = referer {
            request = request.header(header::REFERER, referer);
        }
        let response = request.send().await.context(NetworkSnafu)?;
        check_status(response.status().as_u16(), url, 0)?;
        Ok(header_str(response.headers(), header::CONTENT_RANGE)
            .and_then(parse_content_range)
            .and_then(|(_, total)| total))
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn name(&self) -> &str { &self.name }

    async fn probe(&self, url: &str, referer: Option<&str>) -> Result<RemoteInfo> {
        let mut current = url.to_string();
        let mut hop_referer = referer.map(str::to_string);

        for _ in 0..=self.max_redirects {
            let response = self.head(&current, hop_referer.as_deref()).await?;
            let status = response.status();

            if status.is_redirection() {
                let location = header_str(response.headers(), header::LOCATION)
                    .and_then(|loc| Url::parse(&current).ok()?.join(loc).ok())
                    .context(HttpSnafu {
                        status: status.as_u16(),
                        url:    &current,
                    })?;
                debug!(from = %current, to = %location, "following redirect");
                if referer.is_none() {
                    hop_referer = Some(current.clone());
                }
                current = location.to_string();
                continue;
            }

            let headers = response.headers();
            let etag = header_str(headers, header::ETAG).map(str::to_string);
            let last_modified = header_str(headers, header::LAST_MODIFIED).and_then(parse_http_date);
            let size = if matches!(
                status,
                StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
            ) {
                self.size_by_range(&current, hop_referer.as_deref()).await?
            } else {
                check_status(status.as_u16(), &current, 0)?;
                header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.parse().ok())
            };
            let size = size.context(FileSizeUnknownSnafu { url: &current })?;
            ensure!(
                size >= self.min_video_size,
                NotAVideoSnafu {
                    url: &current,
                    size,
                }
            );

            debug!(url = %current, size, etag = ?etag, "probed remote resource");
            return Ok(RemoteInfo {
                url: current,
                size,
                etag,
                last_modified,
                referer: hop_referer,
            });
        }
        TooManyRedirectsSnafu { url }.fail()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RemoteBody> {
        let mut builder = self
            .client
            .get(&request.url)
            .header(header::RANGE, format!("bytes={}-", request.offset));
        if let Some(referer) = &request.referer {
            builder = builder.header(header::REFERER, referer);
        }
        let response = builder.send().await.context(NetworkSnafu)?;
        let status = response.status();
        check_status(status.as_u16(), &request.url, request.offset)?;

        let start = if status == StatusCode::PARTIAL_CONTENT {
            header_str(response.headers(), header::CONTENT_RANGE)
                .and_then(parse_content_range)
                .map_or(request.offset, |(start, _)| start)
        } else {
            0
        };
        ensure!(
            start <= request.offset,
            HttpSnafu {
                status: status.as_u16(),
                url:    &request.url,
            }
        );

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.context(NetworkSnafu))
            .boxed();
        Ok(RemoteBody::new(request.offset, stream).skipping(request.offset - start))
    }
}

/// Content held by a [`MemorySource`].
#[derive(Debug, Clone)]
pub struct MemoryResource {
    pub data:          Bytes,
    pub etag:          Option<String>,
    pub last_modified: Option<i64>,
}

/// In-process source keyed by URL. Bodies are cut into `chunk_size` pieces.
#[derive(Debug)]
pub struct MemorySource {
    name:       String,
    chunk_size: usize,
    resources:  RwLock<HashMap<String, MemoryResource>>,
}

impl MemorySource {
    #[must_use]
    pub fn new(name: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            name:       name.into(),
            chunk_size: chunk_size.max(1),
            resources:  RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace the content at `url`.
    pub fn insert(&self, url: impl Into<String>, resource: MemoryResource) {
        self.resources.write().insert(url.into(), resource);
    }

    fn resource(&self, url: &str) -> Result<MemoryResource> {
        self.resources
            .read()
            .get(url)
            .cloned()
            .context(HttpSnafu { status: 404u16, url })
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    fn name(&self) -> &str { &self.name }

    async fn probe(&self, url: &str, referer: Option<&str>) -> Result<RemoteInfo> {
        let resource = self.resource(url)?;
        Ok(RemoteInfo {
            url:           url.to_string(),
            size:          resource.data.len() as u64,
            etag:          resource.etag,
            last_modified: resource.last_modified,
            referer:       referer.map(str::to_string),
        })
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RemoteBody> {
        let resource = self.resource(&request.url)?;
        let len = resource.data.len() as u64;
        if request.offset >= len {
            return Err(CacheError::RangeNotSatisfiable {
                offset: request.offset,
                url:    request.url.clone(),
            });
        }
        let rest = resource.data.slice(request.offset as usize..);
        let chunks: Vec<Result<Bytes>> = (0..rest.len())
            .step_by(self.chunk_size)
            .map(|at| Ok(rest.slice(at..(at + self.chunk_size).min(rest.len()))))
            .collect();
        Ok(RemoteBody::new(
            request.offset,
            futures::stream::iter(chunks).boxed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(check_status(206, "u", 0).is_ok());
        assert!(matches!(
            check_status(416, "u", 9),
            Err(CacheError::RangeNotSatisfiable { offset: 9, .. })
        ));
        assert!(matches!(
            check_status(429, "u", 0),
            Err(CacheError::Throttled { .. })
        ));
        assert!(matches!(
            check_status(503, "u", 0),
            Err(CacheError::ResourceUnavailable { status: 503, .. })
        ));
        assert!(matches!(
            check_status(404, "u", 0),
            Err(CacheError::Http { status: 404, .. })
        ));
    }

    #[test]
    fn http_dates_and_ranges() {
        assert_eq!(
            parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(1_445_412_480)
        );
        assert_eq!(parse_http_date("yesterday"), None);
        assert_eq!(
            parse_content_range("bytes 100-199/1000"),
            Some((100, Some(1000)))
        );
        assert_eq!(parse_content_range("bytes 0-0/*"), Some((0, None)));
        assert_eq!(parse_content_range("items 1-2/3"), None);
    }

    #[tokio::test]
    async fn body_skips_leading_bytes() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defg")),
        ];
        let mut body = RemoteBody::new(5, futures::stream::iter(chunks).boxed()).skipping(5);
        assert_eq!(body.offset(), 5);
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), "fg");
        assert!(body.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_source_serves_ranges() {
        let source = MemorySource::new("mem", 4);
        source.insert(
            "mem://a",
            MemoryResource {
                data:          Bytes::from_static(b"0123456789"),
                etag:          Some("\"v1\"".to_string()),
                last_modified: None,
            },
        );
        let info = source.probe("mem://a", None).await.unwrap();
        assert_eq!(info.size, 10);

        let request = FetchRequest::builder().url("mem://a").offset(3).build();
        let mut body = source.fetch(&request).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            assert!(chunk.len() <= 4);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"3456789");

        let request = FetchRequest::builder().url("mem://a").offset(10).build();
        assert!(matches!(
            source.fetch(&request).await,
            Err(CacheError::RangeNotSatisfiable { .. })
        ));
    }
}
