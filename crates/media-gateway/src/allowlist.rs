use reqwest::redirect::Policy;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::error::{GatewayError, GatewayResult};

/// A redirect hop that left the allow-list. Carried as the source of the
/// reqwest error so handlers can answer 403 instead of 502.
#[derive(Debug, Error)]
#[error("redirect to {0} is not allowed")]
pub struct RedirectBlocked(pub String);

/// Static set of upstream domains the gateway will fetch on a client's behalf.
#[derive(Debug, Clone)]
pub struct AllowList {
    domains: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    /// Parses `raw` and admits it only if it is http(s) and its host is an
    /// allowed domain or a subdomain of one. Makes no network calls.
    pub fn check(&self, raw: &str) -> GatewayResult<Url> {
        let url = Url::parse(raw.trim()).map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::InvalidUrl("missing host".into()))?
            .trim_end_matches('.')
            .to_ascii_lowercase();

        if self.allows_host(&host) {
            Ok(url)
        } else {
            Err(GatewayError::DomainNotAllowed(host))
        }
    }

    /// Same rule as [`check`](Self::check), applied to a redirect target.
    pub fn check_hop(&self, url: &Url) -> Result<(), RedirectBlocked> {
        self.check(url.as_str())
            .map(|_| ())
            .map_err(|_| RedirectBlocked(url.host_str().unwrap_or_default().to_string()))
    }

    /// Redirect policy for upstream clients. Every hop passes through
    /// [`check_hop`](Self::check_hop) before it is requested, and at most
    /// `limit` hops are followed.
    pub fn redirect_policy(&self, limit: usize) -> Policy {
        let allow = self.clone();
        Policy::custom(move |attempt| {
            if attempt.previous().len() > limit {
                return attempt.error("too many redirects");
            }
            let verdict = allow.check_hop(attempt.url());
            match verdict {
                Ok(()) => attempt.follow(),
                Err(blocked) => {
                    warn!("upstream redirect blocked: {}", blocked);
                    attempt.error(blocked)
                }
            }
        })
    }

    fn allows_host(&self, host: &str) -> bool {
        self.domains.iter().any(|d| {
            host == d
                || host
                    .strip_suffix(d.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}
