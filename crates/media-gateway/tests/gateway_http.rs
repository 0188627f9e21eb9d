//! End-to-end tests for the gateway router.
//!
//! A mock upstream runs on 127.0.0.1 with an ephemeral port; the gateway
//! router is driven in-process with `tower::ServiceExt::oneshot`.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use media_gateway::http::{router, AppState};
use media_proto::catalog::Catalog;
use media_proto::config::Config;
use media_proto::protocol::{Categories, StreamSource};
use tower::ServiceExt;

const SEGMENT: [u8; 376] = [0x47; 376];

struct Upstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Upstream {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn count_hits(State(hits): State<Arc<AtomicUsize>>, req: Request, next: Next) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    next.run(req).await
}

fn audio_bytes() -> Vec<u8> {
    (0..4096u32).map(|i| (i % 251) as u8).collect()
}

fn icy_body() -> Vec<u8> {
    let meta = b"StreamTitle='Mock Artist - Mock Song';";
    let padded = meta.len().div_ceil(16) * 16;
    let mut block = meta.to_vec();
    block.resize(padded, 0);

    let mut body = vec![0xAAu8; 100];
    body.push((padded / 16) as u8);
    body.extend_from_slice(&block);
    body.extend_from_slice(&[0xBB; 200]);
    body
}

async fn echo_headers(headers: HeaderMap) -> Json<BTreeMap<String, String>> {
    Json(
        headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect(),
    )
}

/// One chunk, then a body that never progresses.
fn stalled_body(first: &'static [u8]) -> Body {
    let first = stream::once(async move { Ok::<_, io::Error>(Bytes::from_static(first)) });
    Body::from_stream(first.chain(stream::pending()))
}

fn huge_manifest() -> String {
    let mut text = String::from("#EXTM3U\n");
    for i in 0..1000 {
        text.push_str(&format!("#EXTINF:6.0,\nseg{i}.ts\n"));
    }
    text
}

async fn spawn_upstream() -> Upstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new()
        .route(
            "/live/index.m3u8",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
                    "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-KEY:METHOD=AES-128,URI=\"keys/k.bin\"\n#EXTINF:6.0,\nseg1.ts\n",
                )
            }),
        )
        .route(
            "/live/seg1.ts",
            get(|| async { ([(header::CONTENT_TYPE, "video/mp2t")], SEGMENT.to_vec()) }),
        )
        .route(
            "/fake.m3u8",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/x-mpegurl")],
                    audio_bytes(),
                )
            }),
        )
        .route(
            "/audio.mp3",
            get(|| async { ([(header::CONTENT_TYPE, "audio/mpeg")], audio_bytes()) }),
        )
        .route(
            "/icy",
            get(|| async {
                (
                    [
                        ("icy-metaint", "100"),
                        ("icy-name", "Mock FM"),
                        ("icy-br", "96"),
                        ("content-type", "audio/mpeg"),
                    ],
                    icy_body(),
                )
            }),
        )
        .route(
            "/plain",
            get(|| async {
                (
                    [("icy-name", "Plain FM"), ("content-type", "audio/aac")],
                    vec![0u8; 1000],
                )
            }),
        )
        .route("/empty", get(|| async { StatusCode::NO_CONTENT }))
        .route("/echo", get(echo_headers))
        .route(
            "/ranged",
            get(|| async {
                (
                    StatusCode::PARTIAL_CONTENT,
                    [
                        (header::CONTENT_TYPE, "audio/mpeg"),
                        (header::CONTENT_RANGE, "bytes 0-9/4096"),
                        (header::ACCEPT_RANGES, "bytes"),
                    ],
                    audio_bytes()[..10].to_vec(),
                )
            }),
        )
        .route(
            "/huge.m3u8",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
                    huge_manifest(),
                )
            }),
        )
        .route(
            "/trickle.m3u8",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
                    stalled_body(b"#EXTM3U\n"),
                )
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "too late"
            }),
        )
        .route(
            "/stall-icy",
            get(|| async {
                (
                    [
                        ("icy-metaint", "16000"),
                        ("icy-name", "Stall FM"),
                        ("content-type", "audio/mpeg"),
                    ],
                    stalled_body(&[0u8; 10]),
                )
            }),
        )
        .route(
            "/redirect/same-host",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/audio.mp3")]) }),
        )
        .route(
            "/redirect/elsewhere",
            get(move || async move {
                (
                    StatusCode::FOUND,
                    [(
                        header::LOCATION,
                        format!("http://localhost:{}/audio.mp3", addr.port()),
                    )],
                )
            }),
        )
        .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Upstream { addr, hits }
}

/// Address nothing is listening on.
async fn closed_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn gateway(allowed: &[&str], catalog: Catalog) -> Router {
    let mut config = Config::default();
    config.proxy.allowed_domains = allowed.iter().map(|d| d.to_string()).collect();
    config.probe.head_timeout_ms = 500;
    config.probe.get_timeout_ms = 500;
    config.now_playing.timeout_ms = 2000;
    config.proxy.response_timeout_ms = 1000;
    config.proxy.max_manifest_bytes = 4096;
    router(AppState::new(&config, catalog).unwrap())
}

fn encode(url: &str) -> String {
    url::form_urlencoded::byte_serialize(url.as_bytes()).collect()
}

async fn send(app: Router, uri: &str, headers: &[(&str, &str)]) -> Response {
    let mut req = Request::builder().uri(uri);
    for (k, v) in headers {
        req = req.header(*k, *v);
    }
    app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn header_value<'a>(response: &'a Response, name: header::HeaderName) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

// ── proxy ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn proxy_rejects_unlisted_domain_without_contacting_upstream() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["radio.example"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/audio.mp3")));
    let response = send(app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "policy");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn proxy_rejects_missing_or_invalid_url() {
    let app = gateway(&["127.0.0.1"], Catalog::default());
    for uri in [
        "/api/proxy".to_string(),
        "/api/proxy?url=".to_string(),
        format!("/api/proxy?url={}", encode("not a url")),
        format!("/api/proxy?url={}", encode("ftp://127.0.0.1/file")),
    ] {
        let response = send(app.clone(), &uri, &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body_json(response).await["error"], "validation");
    }
}

#[tokio::test]
async fn proxy_streams_binary_body() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/audio.mp3")));
    let response = send(app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_value(&response, header::CONTENT_TYPE), Some("audio/mpeg"));
    assert_eq!(header_value(&response, header::CACHE_CONTROL), Some("no-cache"));
    assert_eq!(header_value(&response, header::CONTENT_LENGTH), Some("4096"));
    assert_eq!(body_bytes(response).await, audio_bytes());
}

#[tokio::test]
async fn proxy_rewrites_manifest_and_serves_segments() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/live/index.m3u8")));
    let response = send(app.clone(), &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_value(&response, header::CONTENT_TYPE),
        Some("application/vnd.apple.mpegurl")
    );
    assert_eq!(
        header_value(&response, header::ACCESS_CONTROL_ALLOW_ORIGIN),
        Some("*")
    );

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let lines: Vec<&str> = text.split('\n').collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "#EXTM3U");
    assert_eq!(lines[1], "#EXT-X-TARGETDURATION:6");
    assert_eq!(
        lines[2],
        format!(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"/api/proxy?url={}\"",
            encode(&upstream.url("/live/keys/k.bin"))
        )
    );
    assert_eq!(lines[3], "#EXTINF:6.0,");
    assert_eq!(
        lines[4],
        format!("/api/proxy?url={}", encode(&upstream.url("/live/seg1.ts")))
    );

    // The rewritten segment link works through the gateway.
    let segment = send(app, lines[4], &[]).await;
    assert_eq!(segment.status(), StatusCode::OK);
    assert_eq!(body_bytes(segment).await, SEGMENT.to_vec());
}

#[tokio::test]
async fn proxy_passes_through_mislabelled_manifest() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/fake.m3u8")));
    let response = send(app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_value(&response, header::CONTENT_TYPE),
        Some("application/x-mpegurl")
    );
    assert_eq!(body_bytes(response).await, audio_bytes());
}

#[tokio::test]
async fn proxy_propagates_upstream_status() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/missing")));
    let response = send(app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"], "upstream");
    assert_eq!(json["status"], 404);
}

#[tokio::test]
async fn proxy_maps_no_body_and_unreachable_to_bad_gateway() {
    let upstream = spawn_upstream().await;
    let closed = closed_addr().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/empty")));
    assert_eq!(send(app.clone(), &uri, &[]).await.status(), StatusCode::BAD_GATEWAY);

    let uri = format!("/api/proxy?url={}", encode(&format!("http://{}/x", closed)));
    assert_eq!(send(app, &uri, &[]).await.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn proxy_sends_only_fixed_headers() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/echo")));
    let response = send(
        app,
        &uri,
        &[
            ("cookie", "session=secret"),
            ("authorization", "Bearer token"),
            ("x-forwarded-for", "10.0.0.1"),
            ("accept", "audio/*"),
            ("range", "bytes=0-9"),
        ],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let seen = body_json(response).await;
    let origin = format!("http://{}", upstream.addr);
    assert!(seen.get("cookie").is_none());
    assert!(seen.get("authorization").is_none());
    assert!(seen.get("x-forwarded-for").is_none());
    assert_eq!(seen["accept"], "audio/*");
    assert_eq!(seen["range"], "bytes=0-9");
    assert_eq!(seen["origin"], origin.as_str());
    assert_eq!(seen["referer"], format!("{origin}/").as_str());
    assert!(seen["accept-language"].as_str().is_some());
    assert!(seen["user-agent"]
        .as_str()
        .unwrap()
        .starts_with("media-gateway/"));
}

#[tokio::test]
async fn proxy_passes_partial_content_through() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/ranged")));
    let response = send(app, &uri, &[("range", "bytes=0-9")]).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_value(&response, header::CONTENT_RANGE),
        Some("bytes 0-9/4096")
    );
    assert_eq!(header_value(&response, header::ACCEPT_RANGES), Some("bytes"));
    assert_eq!(body_bytes(response).await, audio_bytes()[..10].to_vec());
}

#[tokio::test]
async fn proxy_refuses_oversized_manifest() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/huge.m3u8")));
    let response = send(app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["error"], "upstream");
}

#[tokio::test]
async fn proxy_follows_redirects_inside_allow_list() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/redirect/same-host")));
    let response = send(app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, audio_bytes());
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn proxy_blocks_redirect_to_unlisted_host() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/redirect/elsewhere")));
    let response = send(app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"], "policy");
    // Only the redirecting hop reached the upstream.
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxy_times_out_waiting_for_headers() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/slow")));
    let response = tokio::time::timeout(Duration::from_secs(10), send(app, &uri, &[]))
        .await
        .expect("proxy should give up on a silent upstream");

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["error"], "timeout");
}

#[tokio::test]
async fn proxy_times_out_on_trickling_manifest() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/proxy?url={}", encode(&upstream.url("/trickle.m3u8")));
    let response = tokio::time::timeout(Duration::from_secs(10), send(app, &uri, &[]))
        .await
        .expect("manifest buffering should be bounded");

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

// ── now playing ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn now_playing_decodes_icy_title() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/now-playing?url={}", encode(&upstream.url("/icy")));
    let response = send(app, &uri, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["stationName"], "Mock FM");
    assert_eq!(json["bitrateKbps"], 96);
    assert_eq!(json["contentType"], "audio/mpeg");
    assert_eq!(json["rawTitle"], "Mock Artist - Mock Song");
    assert_eq!(json["artist"], "Mock Artist");
    assert_eq!(json["title"], "Mock Song");
}

#[tokio::test]
async fn now_playing_without_metadata_returns_headers_only() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/now-playing?url={}", encode(&upstream.url("/plain")));
    let response = send(app, &uri, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["stationName"], "Plain FM");
    assert_eq!(json["contentType"], "audio/aac");
    assert!(json["rawTitle"].is_null());
    assert!(json["artist"].is_null());
    assert!(json["title"].is_null());
    assert!(json["genre"].is_null());
}

#[tokio::test]
async fn now_playing_applies_allow_list() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["radio.example"], Catalog::default());

    let uri = format!("/api/now-playing?url={}", encode(&upstream.url("/icy")));
    let response = send(app.clone(), &uri, &[]).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);

    let response = send(app, "/api/now-playing", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn now_playing_upstream_error_is_500() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/now-playing?url={}", encode(&upstream.url("/missing")));
    let response = send(app, &uri, &[]).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn now_playing_stalled_stream_is_gateway_timeout() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/now-playing?url={}", encode(&upstream.url("/stall-icy")));
    let response = tokio::time::timeout(Duration::from_secs(10), send(app, &uri, &[]))
        .await
        .expect("now-playing should honour its deadline");

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["error"], "timeout");
}

#[tokio::test]
async fn now_playing_silent_upstream_is_gateway_timeout() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!("/api/now-playing?url={}", encode(&upstream.url("/slow")));
    let response = tokio::time::timeout(Duration::from_secs(10), send(app, &uri, &[]))
        .await
        .expect("now-playing should honour its deadline");

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn now_playing_blocks_redirect_to_unlisted_host() {
    let upstream = spawn_upstream().await;
    let app = gateway(&["127.0.0.1"], Catalog::default());

    let uri = format!(
        "/api/now-playing?url={}",
        encode(&upstream.url("/redirect/elsewhere"))
    );
    let response = send(app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

// ── directory ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn directory_promotes_fallbacks_and_keeps_dead_sources() {
    let upstream = spawn_upstream().await;
    let closed = closed_addr().await;

    let mut radio = Categories::new();
    radio.insert(
        "Music".into(),
        vec![
            StreamSource {
                name: "Promoted".into(),
                primary_url: upstream.url("/missing"),
                fallback_urls: vec![upstream.url("/audio.mp3"), upstream.url("/icy")],
                logo: Some("https://logo.example/p.png".into()),
            },
            StreamSource {
                name: "Direct".into(),
                primary_url: upstream.url("/icy"),
                fallback_urls: vec![],
                logo: None,
            },
        ],
    );
    let mut tv = Categories::new();
    tv.insert(
        "News".into(),
        vec![StreamSource {
            name: "Dark".into(),
            primary_url: format!("http://{}/live.m3u8", closed),
            fallback_urls: vec![format!("http://{}/backup.m3u8", closed)],
            logo: None,
        }],
    );

    let app = gateway(&["127.0.0.1"], Catalog { radio, tv });

    let radio = body_json(send(app.clone(), "/api/radio/stations", &[]).await).await;
    let music = radio["Music"].as_array().unwrap();
    assert_eq!(music.len(), 2);
    assert_eq!(music[0]["name"], "Promoted");
    assert_eq!(music[0]["url"], upstream.url("/audio.mp3").as_str());
    assert_eq!(
        music[0]["fallbackUrls"],
        serde_json::json!([upstream.url("/icy"), upstream.url("/missing")])
    );
    assert_eq!(music[0]["logo"], "https://logo.example/p.png");
    assert_eq!(music[1]["url"], upstream.url("/icy").as_str());
    assert!(music[1].get("fallbackUrls").is_none());

    let tv = body_json(send(app, "/api/tv/channels", &[]).await).await;
    let news = tv["News"].as_array().unwrap();
    assert_eq!(news.len(), 1);
    assert_eq!(news[0]["url"], format!("http://{}/live.m3u8", closed).as_str());
}

#[tokio::test]
async fn health_reports_catalog_size() {
    let app = gateway(&["127.0.0.1"], Catalog::default());
    let response = send(app, "/api/health", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["sources"], 0);
}
