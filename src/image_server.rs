//! Image Server Module
//!
//! Serves `/data/{chapter}/{file}` and `/data-saver/{chapter}/{file}` from the
//! disk cache, fetching misses from the session's upstream image server and
//! caching them while they stream to the client. Both shapes may carry a
//! leading `/{token}` segment, which is accepted but not verified.
//!
//! Entries use two slots: the image bytes and a small JSON record of the
//! response headers needed to serve a hit.

use crate::caching_stream::{CacheOutcome, CachingStream};
use crate::coordinator::NodeSession;
use crate::disk_cache::{DiskCache, Editor, Snapshot};
use crate::lifecycle::{RequestActivity, ServingEngine, SessionHandle};
use crate::shutdown::StopSignal;
use crate::statistics::Statistics;
use crate::upstream_connector::UpstreamConnector;
use crate::{NodeError, Result};
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Slot holding the image bytes.
pub const PAYLOAD_SLOT: usize = 0;
/// Slot holding [`ImageMetadata`] as JSON.
pub const METADATA_SLOT: usize = 1;
/// Slots per cache entry.
pub const VALUE_COUNT: usize = 2;
/// Version recorded in the cache journal header. Bump only when the entry
/// layout changes; a mismatch makes the existing cache unreadable.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const CACHE_CONTROL: &str = "public, max-age=1209600";
const X_CACHE: &str = "x-cache";

pub type BodyError = Box<dyn std::error::Error + Send + Sync>;
pub type ResponseBody = UnsyncBoxBody<Bytes, BodyError>;

/// Read size for streaming a cached payload.
const HIT_CHUNK_SIZE: usize = 64 * 1024;

/// Response headers kept alongside a cached image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub content_type: String,
    pub last_modified: String,
    pub size: u64,
}

/// A parsed image request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub data_saver: bool,
    pub chapter: String,
    pub file: String,
}

impl ImageRequest {
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.trim_start_matches('/').split('/').peekable();
        if !matches!(parts.peek(), Some(&"data" | &"data-saver")) {
            // tokenized form: /{token}/data/...
            parts.next().filter(|token| !token.is_empty())?;
        }
        let data_saver = match parts.next()? {
            "data" => false,
            "data-saver" => true,
            _ => return None,
        };
        let chapter = parts.next().filter(|s| !s.is_empty())?;
        let file = parts.next().filter(|s| !s.is_empty())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            data_saver,
            chapter: chapter.to_string(),
            file: file.to_string(),
        })
    }

    /// Cache key: hex digest of `{chapter}.{file}`, prefixed with `saver`
    /// for data-saver images.
    pub fn cache_key(&self) -> String {
        let source = if self.data_saver {
            format!("saver{}.{}", self.chapter, self.file)
        } else {
            format!("{}.{}", self.chapter, self.file)
        };
        blake3::hash(source.as_bytes()).to_hex().to_string()
    }

    fn upstream_path(&self) -> String {
        let prefix = if self.data_saver { "data-saver" } else { "data" };
        format!("/{}/{}/{}", prefix, self.chapter, self.file)
    }
}

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Stream `slot` of `snapshot` in chunks read on the blocking pool. The
/// snapshot, and with it the entry's pin, lives as long as the body.
fn snapshot_body(snapshot: Snapshot, slot: usize) -> ResponseBody {
    let chunks = futures::stream::try_unfold((snapshot, 0u64), move |(snapshot, offset)| {
        read_hit_chunk(snapshot, slot, offset)
    });
    StreamBody::new(chunks).boxed_unsync()
}

async fn read_hit_chunk(
    mut snapshot: Snapshot,
    slot: usize,
    offset: u64,
) -> std::result::Result<Option<(Frame<Bytes>, (Snapshot, u64))>, BodyError> {
    let length = snapshot.length(slot);
    if offset >= length {
        return Ok(None);
    }

    let (snapshot, read) = tokio::task::spawn_blocking(move || {
        let read = snapshot.read_slot_at(slot, offset, HIT_CHUNK_SIZE);
        (snapshot, read)
    })
    .await
    .map_err(|e| format!("Cache read task failed: {}", e))?;

    let chunk = read?;
    if chunk.is_empty() {
        return Err(format!(
            "Cached payload of {} ended at {} of {} bytes",
            snapshot.key(),
            offset,
            length
        )
        .into());
    }
    let next = offset + chunk.len() as u64;
    Ok(Some((Frame::data(Bytes::from(chunk)), (snapshot, next))))
}

fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    add_common_headers(&mut response);
    response
}

fn add_common_headers(response: &mut Response<ResponseBody>) {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
}

/// Whether `referer` is blank or names a host under one of `allowed`.
/// An empty allow-list admits everything.
pub fn referer_allowed(referer: Option<&str>, allowed: &[String]) -> bool {
    let referer = match referer {
        Some(r) if !r.is_empty() && !allowed.is_empty() => r,
        _ => return true,
    };
    let without_scheme = referer.split_once("//").map_or(referer, |(_, rest)| rest);
    let host = without_scheme
        .split('/')
        .next()
        .and_then(|authority| authority.split(':').next())
        .unwrap_or_default()
        .to_ascii_lowercase();
    allowed.iter().any(|domain| host.ends_with(domain.as_str()))
}

fn http_date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Request handler shared by every connection.
pub struct ImageServer {
    cache: Arc<DiskCache>,
    statistics: Arc<Statistics>,
    activity: RequestActivity,
    session: SessionHandle,
    client: Client<UpstreamConnector, Empty<Bytes>>,
    permits: Arc<Semaphore>,
    upstream_timeout: Duration,
    allowed_referers: Vec<String>,
}

impl ImageServer {
    /// # Arguments
    /// * `max_concurrent` - Requests served at once; a miss keeps its slot
    ///   until its cache write finishes
    /// * `upstream_timeout` - Time allowed for the upstream response headers
    pub fn new(
        cache: Arc<DiskCache>,
        statistics: Arc<Statistics>,
        activity: RequestActivity,
        session: SessionHandle,
        max_concurrent: usize,
        upstream_timeout: Duration,
    ) -> Result<Self> {
        let connector = UpstreamConnector::new(upstream_timeout)?;
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            cache,
            statistics,
            activity,
            session,
            client,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            upstream_timeout,
            allowed_referers: Vec::new(),
        })
    }

    /// Reject requests whose Referer host is outside `domains` with 403.
    /// Requests without a Referer are always served.
    pub fn with_allowed_referers(mut self, domains: Vec<String>) -> Self {
        self.allowed_referers = domains
            .into_iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        self
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Serve one request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody> {
        self.activity.mark();

        if req.method() != Method::GET {
            return empty_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        let Some(image) = ImageRequest::parse(req.uri().path()) else {
            return empty_response(StatusCode::NOT_FOUND);
        };

        let referer = req
            .headers()
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok());
        if !referer_allowed(referer, &self.allowed_referers) {
            info!(
                "Request for {} rejected due to non-allowed referer {:?}",
                image.upstream_path(),
                referer
            );
            return empty_response(StatusCode::FORBIDDEN);
        }

        self.statistics.record_request();

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return empty_response(StatusCode::SERVICE_UNAVAILABLE),
        };

        let browser_cached = req.headers().contains_key(header::IF_MODIFIED_SINCE);
        let key = image.cache_key();

        match self.cache.get(&key) {
            Ok(Some(snapshot)) => match self.serve_hit(snapshot, browser_cached).await {
                Ok(response) => return response,
                Err(e) => {
                    warn!("Unreadable cache entry, refetching: key={}: {}", key, e);
                    if let Err(e) = self.cache.remove(&key) {
                        warn!("Failed to remove unreadable entry: key={}: {}", key, e);
                    }
                }
            },
            Ok(None) => {}
            Err(e) => warn!("Cache lookup failed: key={}: {}", key, e),
        }

        self.serve_miss(&image, &key, permit).await
    }

    async fn serve_hit(
        &self,
        mut snapshot: Snapshot,
        browser_cached: bool,
    ) -> Result<Response<ResponseBody>> {
        let raw = snapshot.read_slot(METADATA_SLOT)?;
        let metadata: ImageMetadata = serde_json::from_slice(&raw)?;

        if browser_cached {
            self.statistics.record_browser_cached();
            let mut response = empty_response(StatusCode::NOT_MODIFIED);
            if let Ok(value) = HeaderValue::from_str(&metadata.last_modified) {
                response.headers_mut().insert(header::LAST_MODIFIED, value);
            }
            return Ok(response);
        }

        let length = snapshot.length(PAYLOAD_SLOT);
        self.statistics.record_hit();
        self.statistics.add_bytes_sent(length);

        let mut response = Response::new(snapshot_body(snapshot, PAYLOAD_SLOT));
        add_common_headers(&mut response);
        let headers = response.headers_mut();
        headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        if let Ok(value) = HeaderValue::from_str(&metadata.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&metadata.last_modified) {
            headers.insert(header::LAST_MODIFIED, value);
        }
        Ok(response)
    }

    async fn serve_miss(
        &self,
        image: &ImageRequest,
        key: &str,
        permit: OwnedSemaphorePermit,
    ) -> Response<ResponseBody> {
        self.statistics.record_miss();

        let Some(session) = self.session.get() else {
            return empty_response(StatusCode::SERVICE_UNAVAILABLE);
        };
        let uri = format!(
            "{}{}",
            session.image_server.trim_end_matches('/'),
            image.upstream_path()
        );

        let request = match Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .body(Empty::new())
        {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid upstream URI {}: {}", uri, e);
                return empty_response(StatusCode::BAD_GATEWAY);
            }
        };

        let upstream =
            match tokio::time::timeout(self.upstream_timeout, self.client.request(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!("Upstream fetch failed: {}: {}", uri, e);
                    return empty_response(StatusCode::BAD_GATEWAY);
                }
                Err(_) => {
                    warn!("Upstream fetch timed out: {}", uri);
                    return empty_response(StatusCode::GATEWAY_TIMEOUT);
                }
            };

        if upstream.status() != StatusCode::OK {
            debug!("Upstream returned {} for {}", upstream.status(), uri);
            return empty_response(upstream.status());
        }

        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content_length = upstream
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let last_modified = upstream
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(http_date_now);

        if let Some(length) = content_length {
            self.statistics.add_bytes_sent(length);
        }

        let data = upstream.into_body().into_data_stream();
        let editor = match content_length {
            Some(size) => self.open_editor(key, &content_type, &last_modified, size),
            None => None,
        };

        let (body, cached) = match (editor, content_length) {
            (Some(editor), Some(length)) => {
                let key = key.to_string();
                let stream = CachingStream::new(
                    data,
                    editor,
                    PAYLOAD_SLOT,
                    Some(length),
                    Box::new(move |outcome: CacheOutcome| {
                        drop(permit);
                        debug!("Cache write finished: key={}, outcome={:?}", key, outcome);
                    }),
                );
                let body = StreamBody::new(stream.map_ok(Frame::data).map_err(BodyError::from))
                    .boxed_unsync();
                (body, true)
            }
            _ => {
                drop(permit);
                let body = StreamBody::new(data.map_ok(Frame::data).map_err(BodyError::from))
                    .boxed_unsync();
                (body, false)
            }
        };

        let mut response = Response::new(body);
        add_common_headers(&mut response);
        let headers = response.headers_mut();
        if cached {
            headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
        }
        if let Some(length) = content_length {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&last_modified) {
            headers.insert(header::LAST_MODIFIED, value);
        }
        response
    }

    /// Start an edit with the metadata slot already written.
    fn open_editor(
        &self,
        key: &str,
        content_type: &str,
        last_modified: &str,
        size: u64,
    ) -> Option<Editor> {
        let mut editor = match self.cache.edit(key) {
            Ok(Some(editor)) => editor,
            Ok(None) => {
                debug!("Entry already being cached: key={}", key);
                return None;
            }
            Err(e) => {
                warn!("Cache edit failed: key={}: {}", key, e);
                return None;
            }
        };

        let metadata = ImageMetadata {
            content_type: content_type.to_string(),
            last_modified: last_modified.to_string(),
            size,
        };
        let written = serde_json::to_vec(&metadata)
            .map_err(NodeError::from)
            .and_then(|json| editor.set(METADATA_SLOT, &json));
        match written {
            Ok(()) => Some(editor),
            Err(e) => {
                warn!("Failed to write cache metadata: key={}: {}", key, e);
                None
            }
        }
    }
}

/// [`ServingEngine`] that listens for plain HTTP.
pub struct HttpServingEngine {
    server: Arc<ImageServer>,
    hostname: String,
    port: u16,
    local_addr: Option<SocketAddr>,
    running: Option<(broadcast::Sender<()>, JoinHandle<()>)>,
}

impl HttpServingEngine {
    pub fn new(server: Arc<ImageServer>, hostname: String, port: u16) -> Self {
        Self {
            server,
            hostname,
            port,
            local_addr: None,
            running: None,
        }
    }

    /// Address of the listener while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl ServingEngine for HttpServingEngine {
    async fn start(&mut self, session: Arc<NodeSession>) -> Result<()> {
        if self.running.is_some() {
            self.stop().await;
        }

        let listener = TcpListener::bind((self.hostname.as_str(), self.port))
            .await
            .map_err(|e| {
                NodeError::IoError(format!(
                    "Failed to bind {}:{}: {}",
                    self.hostname, self.port, e
                ))
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let signal = StopSignal::new(shutdown_rx);
        let server = Arc::clone(&self.server);
        let task = tokio::spawn(accept_loop(listener, server, signal));

        info!(
            "Image server listening on {}, upstream {}",
            local_addr, session.image_server
        );
        self.local_addr = Some(local_addr);
        self.running = Some((shutdown_tx, task));
        Ok(())
    }

    async fn stop(&mut self) {
        let Some((shutdown_tx, task)) = self.running.take() else {
            return;
        };
        let _ = shutdown_tx.send(());
        if let Err(e) = task.await {
            error!("Image server task failed: {}", e);
        }
        self.local_addr = None;
        info!("Image server stopped");
    }
}

async fn accept_loop(listener: TcpListener, server: Arc<ImageServer>, mut signal: StopSignal) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let server = Arc::clone(&server);
                                async move { Ok::<_, hyper::Error>(server.handle(req).await) }
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                debug!("Connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
            _ = signal.stopped() => {
                debug!("Image server accept loop stopping");
                break;
            }
        }
    }
}
