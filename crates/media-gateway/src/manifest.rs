//! HLS manifest rewriting.
//!
//! Every URI a manifest references (variant playlists, media segments, keys,
//! init sections) is resolved against the manifest's own URL and replaced by
//! a proxy-relative `…?url=<absolute>` link, so the player keeps fetching
//! through the gateway. Line count, order and line endings are preserved.

use std::borrow::Cow;
use std::ops::Range;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Content type served for rewritten manifests.
pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const COMMENT: char = '#';
const HEADER_TOKEN: &[u8] = b"#EXTM3U";
const URI_ATTR: &str = "URI=\"";

/// Same set `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// One manifest line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLine<'a> {
    Blank,
    /// A `#` line. `uri` is the byte range of the quoted `URI="…"` value.
    Directive {
        raw: &'a str,
        uri: Option<Range<usize>>,
    },
    MediaReference(&'a str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestParseError {
    #[error("unterminated URI attribute")]
    UnterminatedAttribute,
    #[error("empty URI")]
    EmptyUri,
    #[error("unsupported URI scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("cannot resolve {uri:?}: {reason}")]
    Unresolvable { uri: String, reason: String },
}

pub fn parse_line(line: &str) -> Result<ManifestLine<'_>, ManifestParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ManifestLine::Blank);
    }
    if !trimmed.starts_with(COMMENT) {
        return Ok(ManifestLine::MediaReference(trimmed));
    }

    let Some(start) = find_uri_attribute(line) else {
        return Ok(ManifestLine::Directive {
            raw: line,
            uri: None,
        });
    };
    let value_start = start + URI_ATTR.len();
    let value_len = line[value_start..]
        .find('"')
        .ok_or(ManifestParseError::UnterminatedAttribute)?;
    if value_len == 0 {
        return Err(ManifestParseError::EmptyUri);
    }
    Ok(ManifestLine::Directive {
        raw: line,
        uri: Some(value_start..value_start + value_len),
    })
}

/// Position of the first `URI="` that starts an attribute (follows `:` or `,`).
fn find_uri_attribute(line: &str) -> Option<usize> {
    line.match_indices(URI_ATTR)
        .map(|(idx, _)| idx)
        .find(|&idx| matches!(line[..idx].chars().next_back(), Some(':' | ',')))
}

/// Absolute http(s) references pass through untouched; relative ones are
/// joined onto the manifest URL.
pub fn resolve(uri: &str, base: &Url) -> Result<String, ManifestParseError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(ManifestParseError::EmptyUri);
    }
    match Url::parse(uri) {
        Ok(abs) if matches!(abs.scheme(), "http" | "https") => Ok(uri.to_string()),
        Ok(abs) => Err(ManifestParseError::UnsupportedScheme(abs.scheme().to_string())),
        Err(url::ParseError::RelativeUrlWithoutBase) => base
            .join(uri)
            .map(|u| u.to_string())
            .map_err(|e| ManifestParseError::Unresolvable {
                uri: uri.to_string(),
                reason: e.to_string(),
            }),
        Err(e) => Err(ManifestParseError::Unresolvable {
            uri: uri.to_string(),
            reason: e.to_string(),
        }),
    }
}

pub fn proxied_url(proxy_path: &str, absolute: &str) -> String {
    format!("{}?url={}", proxy_path, utf8_percent_encode(absolute, COMPONENT))
}

/// Rewrites `body`, fetched from `base`, so all references go through
/// `proxy_path`. Lines that fail to parse or resolve are kept verbatim.
pub fn rewrite_manifest(body: &str, base: &Url, proxy_path: &str) -> String {
    let mut out = String::with_capacity(body.len() + body.len() / 2);
    for (i, segment) in body.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let (line, ending) = match segment.strip_suffix('\r') {
            Some(line) => (line, "\r"),
            None => (segment, ""),
        };
        out.push_str(&rewrite_line(line, base, proxy_path));
        out.push_str(ending);
    }
    out
}

fn rewrite_line<'a>(line: &'a str, base: &Url, proxy_path: &str) -> Cow<'a, str> {
    let rewritten = parse_line(line).and_then(|parsed| match parsed {
        ManifestLine::Blank | ManifestLine::Directive { uri: None, .. } => Ok(None),
        ManifestLine::Directive {
            raw,
            uri: Some(span),
        } => {
            let absolute = resolve(&raw[span.clone()], base)?;
            Ok(Some(format!(
                "{}{}{}",
                &raw[..span.start],
                proxied_url(proxy_path, &absolute),
                &raw[span.end..]
            )))
        }
        ManifestLine::MediaReference(uri) => {
            let absolute = resolve(uri, base)?;
            Ok(Some(proxied_url(proxy_path, &absolute)))
        }
    });

    match rewritten {
        Ok(Some(line)) => Cow::Owned(line),
        Ok(None) => Cow::Borrowed(line),
        Err(e) => {
            debug!("manifest: leaving line unmodified ({}): {:?}", e, line);
            Cow::Borrowed(line)
        }
    }
}

/// A response is a manifest candidate by content type or by `.m3u8` suffix.
pub fn is_manifest_candidate(content_type: Option<&str>, url: &Url) -> bool {
    let by_type = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("mpegurl"))
        .unwrap_or(false);
    by_type || url.path().to_ascii_lowercase().ends_with(".m3u8")
}

/// True when `head` opens with the `#EXTM3U` header, after an optional BOM
/// and leading whitespace.
pub fn has_manifest_header(head: &[u8]) -> bool {
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    head[start..].starts_with(HEADER_TOKEN)
}

/// Bytes that must be buffered before [`has_manifest_header`] can decide.
pub const HEADER_PEEK_BYTES: usize = 64;
