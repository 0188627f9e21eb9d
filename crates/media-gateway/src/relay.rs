//! Upstream relay behind `GET /api/proxy?url=…`.
//!
//! Opens one upstream connection per request with a fixed header set (client
//! headers are never copied through) and either returns a rewritten HLS
//! manifest or streams the body chunk by chunk.
//!
//! The chunk loop is driven by a `CancellationToken`. The response body owns
//! a drop guard for that token, so when the client goes away and hyper drops
//! the body, the token fires and no further upstream read is issued.
use std::future::Future;
use std::io;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::stream::{self, Stream};
use media_proto::config::ProxyConfig;
use reqwest::Client;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::allowlist::AllowList;
use crate::error::{GatewayError, GatewayResult};
use crate::manifest::{
    has_manifest_header, is_manifest_candidate, rewrite_manifest, HEADER_PEEK_BYTES,
    MANIFEST_CONTENT_TYPE,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The only parts of the inbound request that reach the upstream.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub accept: Option<String>,
    pub range: Option<String>,
}

impl InboundRequest {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            accept: get(header::ACCEPT),
            range: get(header::RANGE),
        }
    }
}

/// Something the relay can pull body chunks from.
pub trait ChunkSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Bytes>, Self::Error>> + Send;
}

impl ChunkSource for reqwest::Response {
    type Error = reqwest::Error;

    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Bytes>, Self::Error>> + Send {
        self.chunk()
    }
}

struct RelayState<S> {
    source: S,
    prefix: Option<Bytes>,
    cancel: CancellationToken,
    _guard: DropGuard,
    chunks: u64,
    bytes: u64,
    done: bool,
}

/// Body stream that yields `prefix` (bytes already read while sniffing) and
/// then forwards chunks from `source` until EOF, error, or cancellation.
///
/// Cancellation is checked before every read and raced against the read in
/// flight. Dropping the stream cancels `cancel`.
pub fn relay_body<S>(
    source: S,
    prefix: Option<Bytes>,
    cancel: CancellationToken,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: ChunkSource + Send + 'static,
{
    let state = RelayState {
        source,
        prefix: prefix.filter(|p| !p.is_empty()),
        _guard: cancel.clone().drop_guard(),
        cancel,
        chunks: 0,
        bytes: 0,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if let Some(prefix) = st.prefix.take() {
            st.bytes += prefix.len() as u64;
            return Some((Ok(prefix), st));
        }
        if st.done {
            return None;
        }
        if st.cancel.is_cancelled() {
            debug!(
                "proxy: client disconnected after {} chunks, {} bytes",
                st.chunks, st.bytes
            );
            return None;
        }

        let next = tokio::select! {
            biased;
            _ = st.cancel.cancelled() => {
                debug!(
                    "proxy: client disconnected mid-read after {} chunks, {} bytes",
                    st.chunks, st.bytes
                );
                return None;
            }
            next = st.source.next_chunk() => next,
        };

        match next {
            Ok(Some(chunk)) => {
                st.chunks += 1;
                st.bytes += chunk.len() as u64;
                if st.chunks <= 3 || st.chunks % 500 == 0 {
                    debug!(
                        "proxy: chunk #{}, {} bytes (total: {})",
                        st.chunks,
                        chunk.len(),
                        st.bytes
                    );
                }
                Some((Ok(chunk), st))
            }
            Ok(None) => {
                debug!(
                    "proxy: upstream finished, {} chunks, {} bytes",
                    st.chunks, st.bytes
                );
                None
            }
            Err(e) => {
                warn!(
                    "proxy: upstream read error after {} chunks, {} bytes: {}",
                    st.chunks, st.bytes, e
                );
                st.done = true;
                Some((Err(io::Error::other(e)), st))
            }
        }
    })
}

pub struct Relay {
    client: Client,
    config: ProxyConfig,
}

impl Relay {
    pub fn new(config: ProxyConfig, allow: &AllowList) -> anyhow::Result<Self> {
        let client = Client::builder()
            // Follow redirects (common for HLS playlists and Icecast streams),
            // but only within the allow-list
            .redirect(allow.redirect_policy(config.redirect_limit))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    fn upstream_request(&self, url: &Url, inbound: &InboundRequest) -> reqwest::RequestBuilder {
        let origin = url.origin().ascii_serialization();
        let mut req = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, &self.config.user_agent)
            .header(header::ACCEPT, inbound.accept.as_deref().unwrap_or("*/*"))
            .header(header::ACCEPT_LANGUAGE, &self.config.accept_language)
            .header(header::ORIGIN, &origin)
            .header(header::REFERER, format!("{}/", origin));
        if let Some(range) = &inbound.range {
            req = req.header(header::RANGE, range);
        }
        req
    }

    /// Fetches `url` and turns the upstream response into the client response.
    /// `cancel` stops the chunk loop; the returned body also cancels it when
    /// dropped.
    ///
    /// Waiting for response headers and buffering a manifest share one
    /// deadline. Once streaming starts, the body is not time-bounded.
    pub async fn forward(
        &self,
        url: Url,
        inbound: &InboundRequest,
        cancel: CancellationToken,
    ) -> GatewayResult<Response> {
        info!("proxy: opening upstream → {}", url);
        let deadline = Instant::now() + self.config.response_timeout();

        let mut upstream = match timeout_at(deadline, self.upstream_request(&url, inbound).send())
            .await
        {
            Err(_) => {
                warn!("proxy: no response headers from {} in time", url);
                return Err(GatewayError::Timeout);
            }
            Ok(Err(e)) => {
                warn!("proxy: upstream connect failed for {}: {}", url, e);
                return Err(GatewayError::from_fetch(e));
            }
            Ok(Ok(r)) => r,
        };

        let status = upstream.status();
        if !status.is_success() {
            warn!("proxy: upstream returned {} for {}", status, url);
            return Err(GatewayError::UpstreamStatus(status));
        }
        if status == StatusCode::NO_CONTENT || upstream.content_length() == Some(0) {
            warn!("proxy: upstream sent no body for {}", url);
            return Err(GatewayError::NoBody);
        }

        let content_type = header_str(upstream.headers(), header::CONTENT_TYPE);
        let final_url = upstream.url().clone();
        let mut prefix = None;

        if is_manifest_candidate(content_type.as_deref(), &final_url)
            || is_manifest_candidate(content_type.as_deref(), &url)
        {
            let head = within(deadline, &url, read_at_least(&mut upstream, HEADER_PEEK_BYTES))
                .await?;
            if has_manifest_header(&head.bytes) {
                let body = within(
                    deadline,
                    &url,
                    read_to_end(
                        &mut upstream,
                        head.bytes,
                        head.eof,
                        self.config.max_manifest_bytes,
                    ),
                )
                .await?;
                let text = String::from_utf8_lossy(&body);
                let rewritten = rewrite_manifest(&text, &final_url, &self.config.proxy_path);
                debug!(
                    "proxy: rewrote manifest {} ({} → {} bytes)",
                    final_url,
                    body.len(),
                    rewritten.len()
                );
                return manifest_response(rewritten);
            }
            debug!(
                "proxy: {} looked like a manifest but has no #EXTM3U header, streaming raw",
                final_url
            );
            if head.eof && head.bytes.is_empty() {
                return Err(GatewayError::NoBody);
            }
            prefix = Some(Bytes::from(head.bytes));
        }

        let upstream_headers = upstream.headers().clone();
        let body = relay_body(upstream, prefix, cancel);
        build_stream_response(status, &upstream_headers, body)
    }
}

async fn within<T>(
    deadline: Instant,
    url: &Url,
    read: impl Future<Output = GatewayResult<T>>,
) -> GatewayResult<T> {
    timeout_at(deadline, read).await.unwrap_or_else(|_| {
        warn!("proxy: manifest from {} not read in time", url);
        Err(GatewayError::Timeout)
    })
}

struct Head {
    bytes: Vec<u8>,
    eof: bool,
}

async fn read_at_least(upstream: &mut reqwest::Response, want: usize) -> GatewayResult<Head> {
    let mut bytes = Vec::with_capacity(want);
    while bytes.len() < want {
        match upstream.chunk().await.map_err(GatewayError::from_fetch)? {
            Some(chunk) => bytes.extend_from_slice(&chunk),
            None => return Ok(Head { bytes, eof: true }),
        }
    }
    Ok(Head { bytes, eof: false })
}

async fn read_to_end(
    upstream: &mut reqwest::Response,
    mut body: Vec<u8>,
    eof: bool,
    limit: usize,
) -> GatewayResult<Vec<u8>> {
    if !eof {
        while let Some(chunk) = upstream.chunk().await.map_err(GatewayError::from_fetch)? {
            if body.len() + chunk.len() > limit {
                warn!("proxy: manifest larger than {} bytes, giving up", limit);
                return Err(GatewayError::ManifestTooLarge(limit));
            }
            body.extend_from_slice(&chunk);
        }
    }
    if body.len() > limit {
        return Err(GatewayError::ManifestTooLarge(limit));
    }
    Ok(body)
}

fn header_str(headers: &reqwest::header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn manifest_response(text: String) -> GatewayResult<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(text))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

fn build_stream_response<B>(
    status: StatusCode,
    upstream_headers: &reqwest::header::HeaderMap,
    body: B,
) -> GatewayResult<Response>
where
    B: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let mut builder = Response::builder().status(status);
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
    ] {
        if let Some(value) = upstream_headers.get(&name) {
            if let Ok(hv) = HeaderValue::from_bytes(value.as_bytes()) {
                builder = builder.header(name, hv);
            }
        }
    }
    builder
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from_stream(body))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}
