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
    collections::VecDeque,
    io::SeekFrom,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::head,
};
use axum_test::TestServer;
use jiff::{Timestamp, fmt::rfc2822::DateTimePrinter};
use reelcache::{
    CacheConfig, CacheError, CacheService, EntryRequest, HttpSource, LimiterConfig, MemoryResource,
    MemorySource, RemoteSource, SchedulerConfig, StreamReader,
};
use reelcache_common_telemetry::logging::init_default_ut_logging;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Content {
    data:     Bytes,
    etag:     String,
    modified: Timestamp,
}

#[derive(Clone)]
struct AppState {
    content:   Arc<Mutex<Content>>,
    gets:      Arc<AtomicUsize>,
    fail_next: Arc<Mutex<VecDeque<StatusCode>>>,
    broken:    Arc<AtomicBool>,
    /// HEAD and GET answer 503
    offline:   Arc<AtomicBool>,
    /// The next GET sends this many bytes, then drops the connection
    cut_next:  Arc<Mutex<Option<usize>>>,
}

impl AppState {
    fn new(data: Vec<u8>, etag: &str) -> Self {
        Self {
            content:   Arc::new(Mutex::new(Content {
                data:     data.into(),
                etag:     etag.to_string(),
                modified: "2025-01-01T00:00:00Z".parse().unwrap(),
            })),
            gets:      Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(Mutex::new(VecDeque::new())),
            broken:    Arc::new(AtomicBool::new(false)),
            offline:   Arc::new(AtomicBool::new(false)),
            cut_next:  Arc::new(Mutex::new(None)),
        }
    }

    fn replace(&self, data: Vec<u8>, etag: &str) {
        let mut content = self.content.lock().unwrap();
        content.data = data.into();
        content.etag = etag.to_string();
        content.modified = "2025-06-01T00:00:00Z".parse().unwrap();
    }

    fn gets(&self) -> usize { self.gets.load(Ordering::SeqCst) }
}

fn validators(content: &Content) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(&content.etag).unwrap(),
    );
    let modified = DateTimePrinter::new()
        .timestamp_to_rfc9110_string(&content.modified)
        .unwrap();
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&modified).unwrap(),
    );
    headers
}

async fn handle_head(State(state): State<AppState>) -> Response {
    if state.offline.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let content = state.content.lock().unwrap();
    let mut headers = validators(&content);
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&content.data.len().to_string()).unwrap(),
    );
    (StatusCode::OK, headers).into_response()
}

async fn handle_get(headers: HeaderMap, State(state): State<AppState>) -> Response {
    state.gets.fetch_add(1, Ordering::SeqCst);
    if state.broken.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.offline.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Some(status) = state.fail_next.lock().unwrap().pop_front() {
        return status.into_response();
    }

    let content = state.content.lock().unwrap();
    let total = content.data.len();
    let start = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.split('-').next())
        .and_then(|start| start.parse::<usize>().ok())
        .unwrap_or(0);
    if start >= total {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }

    let mut response_headers = validators(&content);
    response_headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {}-{}/{}", start, total - 1, total)).unwrap(),
    );
    if let Some(cut) = state.cut_next.lock().unwrap().take() {
        let sent = content.data.slice(start..(start + cut).min(total));
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(sent),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
        ];
        return (
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            Body::from_stream(futures::stream::iter(chunks)),
        )
            .into_response();
    }
    (
        StatusCode::PARTIAL_CONTENT,
        response_headers,
        content.data.slice(start..),
    )
        .into_response()
}

async fn handle_redirect() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, HeaderValue::from_static("/video"));
    (StatusCode::FOUND, headers).into_response()
}

fn create_test_server(state: AppState) -> TestServer {
    let app = Router::new()
        .route("/video", head(handle_head).get(handle_get))
        .route("/redirect", head(handle_redirect).get(handle_redirect))
        .with_state(state);

    TestServer::builder()
        .http_transport()
        .try_build(app)
        .expect("failed to create test server")
}

fn url_of(server: &TestServer, path: &str) -> String {
    let base = server
        .server_address()
        .expect("server should have HTTP address")
        .to_string();
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i % 251) as u8).wrapping_add(seed))
        .collect()
}

fn config(dir: &Path) -> CacheConfig {
    CacheConfig::builder()
        .cache_dir(dir)
        .min_video_size(1)
        .close_grace(Duration::from_millis(50))
        .limiter(
            LimiterConfig::builder()
                .min_interval(Duration::from_millis(1))
                .throttled_interval(Duration::from_millis(20))
                .throttle_cooldown(Duration::from_millis(100))
                .server_error_delay(Duration::from_millis(20))
                .build(),
        )
        .scheduler(
            SchedulerConfig::builder()
                .retry_min_delay(Duration::from_millis(10))
                .retry_max_delay(Duration::from_millis(100))
                .build(),
        )
        .build()
}

fn http_service(dir: &Path) -> CacheService {
    let config = config(dir);
    let source = HttpSource::new("cdn", &config).unwrap();
    CacheService::builder()
        .config(config)
        .sources(vec![Arc::new(source) as Arc<dyn RemoteSource>])
        .build()
        .unwrap()
}

fn request(id: &str, url: String) -> EntryRequest {
    EntryRequest::builder()
        .id(id)
        .kind("video")
        .client("cdn")
        .url(url)
        .build()
}

fn create_temp_dir(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("reelcache-{prefix}-"))
        .tempdir()
        .expect("failed to create temp dir")
}

async fn read_exact(reader: &mut StreamReader, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut out[filled..]).await.unwrap();
        assert!(n > 0, "unexpected end of stream");
        filled += n;
    }
    out
}

#[tokio::test]
async fn streams_over_http_and_reuses_cache() {
    init_default_ut_logging();
    let data = content(3 * 1024 * 1024, 0);
    let state = AppState::new(data.clone(), "\"v1\"");
    let server = create_test_server(state.clone());
    let dir = create_temp_dir("reuse");

    let service = http_service(dir.path());
    let entry = service
        .open(request("1", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    entry.release();
    service.shutdown();

    let gets = state.gets();
    assert!(gets >= 1);

    // Same ETag on a fresh service: served from disk without a body request.
    let service = http_service(dir.path());
    let entry = service
        .open(request("1", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    assert_eq!(state.gets(), gets);
    entry.release();
    service.shutdown();
}

#[tokio::test]
async fn seek_then_read_from_start() {
    init_default_ut_logging();
    let data = content(2 * 1024 * 1024, 7);
    let state = AppState::new(data.clone(), "\"seek\"");
    let server = create_test_server(state);
    let dir = create_temp_dir("seek");
    let service = http_service(dir.path());

    let entry = service
        .open(request("2", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();

    let tail = 1_500_000;
    assert_eq!(reader.seek(SeekFrom::Start(tail)).unwrap(), tail);
    let got = read_exact(&mut reader, 4096).await;
    assert_eq!(got, &data[tail as usize..tail as usize + 4096]);

    // A second reader starting at 0 is served too.
    let mut head = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(head.read_to_end().await.unwrap(), data);

    entry.release();
    service.shutdown();
}

#[tokio::test]
async fn etag_change_discards_local_data() {
    init_default_ut_logging();
    let old = content(1024 * 1024, 1);
    let state = AppState::new(old.clone(), "\"v1\"");
    let server = create_test_server(state.clone());
    let dir = create_temp_dir("etag");
    let service = http_service(dir.path());

    let entry = service
        .open(request("3", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), old);
    entry.release();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let new = content(1024 * 1024 + 100, 2);
    state.replace(new.clone(), "\"v2\"");

    let entry = service
        .open(request("3", url_of(&server, "video")))
        .await
        .unwrap();
    assert_eq!(entry.remote().unwrap().etag.as_deref(), Some("\"v2\""));
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.len(), new.len() as u64);
    assert_eq!(reader.read_to_end().await.unwrap(), new);
    let sidecar = std::fs::read_to_string(dir.path().join("etag$3.txt")).unwrap();
    assert_eq!(sidecar, "\"v2\"");
    entry.release();
    service.shutdown();
}

#[tokio::test]
async fn throttling_and_server_errors_are_retried() {
    init_default_ut_logging();
    let data = content(1024 * 1024, 3);
    let state = AppState::new(data.clone(), "\"t\"");
    state.fail_next.lock().unwrap().extend([
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::SERVICE_UNAVAILABLE,
    ]);
    let server = create_test_server(state.clone());
    let dir = create_temp_dir("throttle");
    let service = http_service(dir.path());

    let entry = service
        .open(request("4", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    assert!(state.gets() >= 3);
    assert!(state.fail_next.lock().unwrap().is_empty());
    entry.release();
    service.shutdown();
}

#[tokio::test]
async fn permanent_error_fails_entry_until_reopened() {
    init_default_ut_logging();
    let data = content(1024 * 1024, 4);
    let state = AppState::new(data.clone(), "\"e\"");
    state.broken.store(true, Ordering::SeqCst);
    let server = create_test_server(state.clone());
    let dir = create_temp_dir("fail");
    let service = http_service(dir.path());

    let entry = service
        .open(request("5", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(reader.read(&mut buf).await, Err(CacheError::Closed)));
    assert!(matches!(
        entry.get_read_seeker(CancellationToken::new()),
        Err(CacheError::EntryFailed { .. })
    ));
    entry.release();
    tokio::time::sleep(Duration::from_millis(200)).await;

    state.broken.store(false, Ordering::SeqCst);
    let entry = service
        .open(request("5", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    entry.release();
    service.shutdown();
}

#[tokio::test]
async fn redirect_is_followed_and_referer_recorded() {
    init_default_ut_logging();
    let data = content(1024 * 1024, 5);
    let state = AppState::new(data.clone(), "\"r\"");
    let server = create_test_server(state);
    let dir = create_temp_dir("redirect");
    let service = http_service(dir.path());

    let start = url_of(&server, "redirect");
    let entry = service.open(request("6", start.clone())).await.unwrap();
    let remote = entry.remote().unwrap();
    assert!(remote.url.ends_with("/video"), "{}", remote.url);
    assert_eq!(remote.referer.as_deref(), Some(start.as_str()));
    assert_eq!(remote.size, data.len() as u64);

    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    entry.release();
    service.shutdown();
}

#[tokio::test]
async fn eviction_spares_open_entries() {
    init_default_ut_logging();
    let dir = create_temp_dir("evict");
    let source = Arc::new(MemorySource::new("mem", 1024));
    for id in ["1", "2", "3"] {
        source.insert(
            format!("mem://{id}"),
            MemoryResource {
                data:          content(4000, 9).into(),
                etag:          Some(format!("\"{id}\"")),
                last_modified: None,
            },
        );
    }
    let mut config = config(dir.path());
    config.budgets.insert("video".to_string(), 8000);
    config.materialize_on_complete = false;
    let service = CacheService::builder()
        .config(config)
        .sources(vec![source as Arc<dyn RemoteSource>])
        .build()
        .unwrap();
    let open = |id: &str| {
        EntryRequest::builder()
            .id(id)
            .kind("video")
            .client("mem")
            .url(format!("mem://{id}"))
            .build()
    };

    let first = service.open(open("1")).await.unwrap();
    first
        .get_read_seeker(CancellationToken::new())
        .unwrap()
        .read_to_end()
        .await
        .unwrap();
    first.release();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut kept = Vec::new();
    for id in ["2", "3"] {
        let entry = service.open(open(id)).await.unwrap();
        entry
            .get_read_seeker(CancellationToken::new())
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        kept.push(entry);
    }

    let report = service.evict("video").await.unwrap();
    assert!(report.after <= 8000, "{report:?}");
    assert!(!dir.path().join("video$1.mp4").exists());
    assert!(dir.path().join("video$2.mp4").exists());
    assert!(dir.path().join("video$3.mp4").exists());
    assert!(service.entry("video", "1").is_none());

    for entry in kept {
        entry.release();
    }
    service.shutdown();
}

#[tokio::test]
async fn dropped_connection_mid_body_is_resumed() {
    init_default_ut_logging();
    let data = content(1024 * 1024, 6);
    let state = AppState::new(data.clone(), "\"cut\"");
    *state.cut_next.lock().unwrap() = Some(100_000);
    let server = create_test_server(state.clone());
    let dir = create_temp_dir("cut");
    let service = http_service(dir.path());

    let entry = service
        .open(request("8", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    assert!(state.gets() >= 2);
    assert!(state.cut_next.lock().unwrap().is_none());
    assert!(entry.get_read_seeker(CancellationToken::new()).is_ok());
    entry.release();
    service.shutdown();
}

#[tokio::test]
async fn complete_file_plays_while_remote_is_down() {
    init_default_ut_logging();
    let data = content(1024 * 1024, 10);
    let state = AppState::new(data.clone(), "\"off\"");
    let server = create_test_server(state.clone());
    let dir = create_temp_dir("offline");

    let service = http_service(dir.path());
    let entry = service
        .open(request("9", url_of(&server, "video")))
        .await
        .unwrap();
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    entry.release();
    service.shutdown();

    state.offline.store(true, Ordering::SeqCst);
    let gets = state.gets();
    let service = http_service(dir.path());
    let entry = service
        .open(request("9", url_of(&server, "video")))
        .await
        .unwrap();
    let remote = entry.remote().unwrap();
    assert_eq!(remote.size, data.len() as u64);
    assert_eq!(remote.etag.as_deref(), Some("\"off\""));
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    assert_eq!(state.gets(), gets);
    entry.release();
    service.shutdown();

    // Nothing local to fall back on: the probe failure surfaces.
    let service = http_service(dir.path());
    assert!(matches!(
        service.open(request("10", url_of(&server, "video"))).await,
        Err(CacheError::ResourceUnavailable { status: 503, .. })
    ));
    service.shutdown();
}

#[tokio::test]
async fn range_rejection_re_resolves_once() {
    init_default_ut_logging();
    let old = content(1024 * 1024, 11);
    let state = AppState::new(old, "\"a\"");
    let server = create_test_server(state.clone());
    let dir = create_temp_dir("range");
    let service = http_service(dir.path());

    // Content replaced between the probe and the first body request.
    let entry = service
        .open(request("11", url_of(&server, "video")))
        .await
        .unwrap();
    let new = content(1024 * 1024 + 500, 12);
    state.replace(new.clone(), "\"b\"");
    state
        .fail_next
        .lock()
        .unwrap()
        .push_back(StatusCode::RANGE_NOT_SATISFIABLE);
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), new);
    assert_eq!(entry.remote().unwrap().etag.as_deref(), Some("\"b\""));
    entry.release();

    // Rejected again after re-resolving: the entry fails.
    let entry = service
        .open(request("12", url_of(&server, "video")))
        .await
        .unwrap();
    state.fail_next.lock().unwrap().extend([
        StatusCode::RANGE_NOT_SATISFIABLE,
        StatusCode::RANGE_NOT_SATISFIABLE,
    ]);
    let mut reader = entry.get_read_seeker(CancellationToken::new()).unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(reader.read(&mut buf).await, Err(CacheError::Closed)));
    assert!(matches!(
        entry.get_read_seeker(CancellationToken::new()),
        Err(CacheError::EntryFailed { .. })
    ));
    assert!(state.fail_next.lock().unwrap().is_empty());
    entry.release();
    service.shutdown();
}
