use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::allowlist::RedirectBlocked;

/// Everything a gateway request can fail with.
///
/// Manifest and metadata parse failures never appear here; those are
/// recovered where they happen.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing url parameter")]
    MissingUrl,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),
    #[error("upstream returned {0}")]
    UpstreamStatus(StatusCode),
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),
    #[error("upstream returned no body")]
    NoBody,
    #[error("manifest exceeds {0} bytes")]
    ManifestTooLarge(usize),
    #[error("upstream timed out")]
    Timeout,
    #[error("metadata lookup failed: {0}")]
    MetadataUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingUrl | GatewayError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            GatewayError::DomainNotAllowed(_) => StatusCode::FORBIDDEN,
            GatewayError::UpstreamStatus(status) => *status,
            GatewayError::UpstreamFetch(_)
            | GatewayError::NoBody
            | GatewayError::ManifestTooLarge(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::MetadataUnavailable(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::MissingUrl | GatewayError::InvalidUrl(_) => "validation",
            GatewayError::DomainNotAllowed(_) => "policy",
            GatewayError::UpstreamStatus(_)
            | GatewayError::UpstreamFetch(_)
            | GatewayError::NoBody
            | GatewayError::ManifestTooLarge(_)
            | GatewayError::MetadataUnavailable(_) => "upstream",
            GatewayError::Timeout => "timeout",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Maps a reqwest failure, keeping timeouts and blocked redirects
    /// distinguishable.
    pub fn from_fetch(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return GatewayError::Timeout;
        }
        if let Some(blocked) = blocked_redirect(&err) {
            return GatewayError::DomainNotAllowed(blocked.0.clone());
        }
        GatewayError::UpstreamFetch(err.to_string())
    }
}

fn blocked_redirect(err: &reqwest::Error) -> Option<&RedirectBlocked> {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(blocked) = e.downcast_ref::<RedirectBlocked>() {
            return Some(blocked);
        }
        source = e.source();
    }
    None
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
