use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use media_proto::catalog::Catalog;
use media_proto::config::Config;
use media_proto::protocol::{Directory, NowPlayingInfo};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::allowlist::AllowList;
use crate::error::{GatewayError, GatewayResult};
use crate::now_playing::NowPlaying;
use crate::probe::{HttpCheck, Prober};
use crate::relay::{InboundRequest, Relay};

/// Everything a request handler needs. Built once at startup, never mutated.
pub struct Gateway {
    allow: AllowList,
    relay: Relay,
    now_playing: NowPlaying,
    prober: Prober<HttpCheck>,
    catalog: Catalog,
    proxy_path: String,
}

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(config: &Config, catalog: Catalog) -> anyhow::Result<Self> {
        let allow = AllowList::new(&config.proxy.allowed_domains);
        let gateway = Gateway {
            relay: Relay::new(config.proxy.clone(), &allow)?,
            now_playing: NowPlaying::new(&config.proxy, config.now_playing.clone(), &allow)?,
            allow,
            prober: Prober::new(HttpCheck::new(&config.proxy.user_agent)?, &config.probe),
            catalog,
            proxy_path: config.proxy.proxy_path.clone(),
        };
        Ok(Self {
            gateway: Arc::new(gateway),
        })
    }

    fn checked_url(&self, query: UrlQuery, component: &str) -> GatewayResult<Url> {
        let raw = query
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or(GatewayError::MissingUrl)?;
        self.gateway.allow.check(&raw).inspect_err(|e| {
            warn!("{}: rejected {:?}: {}", component, raw, e);
        })
    }
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    sources: usize,
}

pub fn router(state: AppState) -> Router {
    let proxy_path = state.gateway.proxy_path.clone();

    let api = Router::new()
        .route("/api/now-playing", get(now_playing))
        .route("/api/radio/stations", get(radio_directory))
        .route("/api/tv/channels", get(tv_directory))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive());

    Router::new()
        .route(&proxy_path, get(proxy))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn proxy(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    let url = state.checked_url(query, "proxy")?;
    let inbound = InboundRequest::from_headers(&headers);
    state
        .gateway
        .relay
        .forward(url, &inbound, CancellationToken::new())
        .await
}

async fn now_playing(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> GatewayResult<Json<NowPlayingInfo>> {
    let url = state.checked_url(query, "now-playing")?;
    state.gateway.now_playing.lookup(url).await.map(Json)
}

async fn radio_directory(State(state): State<AppState>) -> Json<Directory> {
    let gateway = &state.gateway;
    Json(gateway.prober.directory(&gateway.catalog.radio).await)
}

async fn tv_directory(State(state): State<AppState>) -> Json<Directory> {
    let gateway = &state.gateway;
    Json(gateway.prober.directory(&gateway.catalog.tv).await)
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        sources: state.gateway.catalog.source_count(),
    })
}

pub async fn serve(bind_address: &str, port: u16, state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Media gateway listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Media gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
