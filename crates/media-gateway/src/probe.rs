use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use media_proto::config::ProbeConfig;
use media_proto::protocol::{directory_from_results, Categories, Directory, ProbeResult, StreamSource};
use reqwest::Client;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Statuses that count as alive for the lightweight check. 405 means the
/// endpoint exists but refuses HEAD.
const HEAD_OK: [u16; 3] = [200, 302, 405];
const GET_OK: [u16; 2] = [200, 302];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMethod {
    Head,
    Get,
}

/// One request against a candidate URL. `None` means no response at all.
pub trait LivenessCheck: Send + Sync {
    fn status(&self, url: &str, method: CheckMethod) -> impl Future<Output = Option<u16>> + Send;
}

/// Real checker. Redirects are not followed so a 302 is seen as-is, and the
/// GET body is never read.
pub struct HttpCheck {
    client: Client,
}

impl HttpCheck {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

impl LivenessCheck for HttpCheck {
    fn status(&self, url: &str, method: CheckMethod) -> impl Future<Output = Option<u16>> + Send {
        let request = match method {
            CheckMethod::Head => self.client.head(url),
            CheckMethod::Get => self.client.get(url),
        };
        let url = url.to_string();
        async move {
            match request.send().await {
                Ok(response) => Some(response.status().as_u16()),
                Err(e) => {
                    debug!("probe: {:?} {} failed: {}", method, url, e);
                    None
                }
            }
        }
    }
}

pub struct Prober<C> {
    checker: C,
    head_timeout: Duration,
    get_timeout: Duration,
}

impl<C: LivenessCheck> Prober<C> {
    pub fn new(checker: C, config: &ProbeConfig) -> Self {
        Self {
            checker,
            head_timeout: config.head_timeout(),
            get_timeout: config.get_timeout(),
        }
    }

    /// HEAD first, then a full GET, each with its own timeout.
    pub async fn url_alive(&self, url: &str) -> bool {
        match timeout(self.head_timeout, self.checker.status(url, CheckMethod::Head)).await {
            Ok(Some(status)) if HEAD_OK.contains(&status) => return true,
            Ok(Some(status)) => debug!("probe: HEAD {} → {}", url, status),
            Ok(None) => debug!("probe: HEAD {} failed", url),
            Err(_) => debug!("probe: HEAD {} timed out", url),
        }

        match timeout(self.get_timeout, self.checker.status(url, CheckMethod::Get)).await {
            Ok(Some(status)) if GET_OK.contains(&status) => true,
            Ok(Some(status)) => {
                debug!("probe: GET {} → {}", url, status);
                false
            }
            Ok(None) => false,
            Err(_) => {
                debug!("probe: GET {} timed out", url);
                false
            }
        }
    }

    /// Walks primary then fallbacks in order and stops at the first URL that
    /// answers.
    pub async fn probe_source(&self, source: &StreamSource) -> ProbeResult {
        if self.url_alive(&source.primary_url).await {
            return ProbeResult::primary(source.clone());
        }
        for (idx, fallback) in source.fallback_urls.iter().enumerate() {
            if self.url_alive(fallback).await {
                info!(
                    "probe: {} primary down, promoting fallback #{} {}",
                    source.name,
                    idx + 1,
                    fallback
                );
                return ProbeResult::promoted(source.clone(), idx);
            }
        }
        warn!(
            "probe: {} unreachable ({} candidates), listing anyway",
            source.name,
            1 + source.fallback_urls.len()
        );
        ProbeResult::unreachable(source.clone())
    }

    /// Probes every source of every category at once. Only a source's own
    /// fallback chain is sequential.
    pub async fn probe_categories(
        &self,
        categories: &Categories,
    ) -> BTreeMap<String, Vec<ProbeResult>> {
        let chains = categories.iter().map(|(category, sources)| async move {
            let results = join_all(sources.iter().map(|s| self.probe_source(s))).await;
            (category.clone(), results)
        });
        join_all(chains).await.into_iter().collect()
    }

    pub async fn directory(&self, categories: &Categories) -> Directory {
        let results = self.probe_categories(categories).await;
        let total: usize = results.values().map(Vec::len).sum();
        let reachable = results
            .values()
            .flatten()
            .filter(|r| r.reachable_url.is_some())
            .count();
        info!("probe: {}/{} sources reachable", reachable, total);
        directory_from_results(&results)
    }
}
