//! ICY "now playing" lookup.
//!
//! Shoutcast/Icecast servers that honour `Icy-MetaData: 1` interleave a
//! metadata block after every `icy-metaint` audio bytes:
//!
//! ```text
//! [ metaint audio bytes ][ len ][ len * 16 bytes: StreamTitle='…'; ][ audio … ]
//! ```
//!
//! Only the first block is read. The read stops at `metaint + READ_MARGIN`
//! bytes or at the wall-clock deadline, whichever comes first, and the
//! upstream connection is dropped on every exit path. Running out of bytes
//! means "no metadata"; running out of time is a timeout.

use axum::body::Bytes;
use axum::http::{header, HeaderMap};
use media_proto::config::{NowPlayingConfig, ProxyConfig};
use media_proto::protocol::NowPlayingInfo;
use reqwest::Client;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::allowlist::AllowList;
use crate::error::{GatewayError, GatewayResult};
use crate::relay::ChunkSource;

/// A metadata length byte counts units of this many bytes.
pub const METADATA_BLOCK_UNIT: usize = 16;
pub const MAX_METADATA_BLOCK: usize = u8::MAX as usize * METADATA_BLOCK_UNIT;
/// Bytes read past the declared interval before giving up: one length byte
/// plus the largest possible block.
pub const READ_MARGIN: usize = 1 + MAX_METADATA_BLOCK;

/// Where the first metadata block sits relative to a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataBlock<'a> {
    /// The block's text, fully contained in the chunk (may be empty).
    Complete(&'a [u8]),
    /// Bytes from the length byte to the end of the chunk; the block
    /// continues in later chunks.
    Partial(&'a [u8]),
}

/// Offset arithmetic for the first metadata block.
///
/// `consumed` is how many stream bytes came before `chunk`. Returns the block
/// if `chunk` reaches the interval boundary, and the consumed count after
/// `chunk`.
pub fn locate_metadata(
    consumed: usize,
    chunk: &[u8],
    interval: usize,
) -> (Option<MetadataBlock<'_>>, usize) {
    let after = consumed + chunk.len();
    if consumed > interval || after <= interval {
        return (None, after);
    }
    let tail = &chunk[interval - consumed..];
    (Some(classify_block(tail)), after)
}

/// `tail` starts at the length byte.
fn classify_block(tail: &[u8]) -> MetadataBlock<'_> {
    match complete_block(tail) {
        Some(block) => MetadataBlock::Complete(block),
        None => MetadataBlock::Partial(tail),
    }
}

fn complete_block(tail: &[u8]) -> Option<&[u8]> {
    let len = *tail.first()? as usize * METADATA_BLOCK_UNIT;
    tail.get(1..1 + len)
}

/// Pulls the `StreamTitle` value out of a metadata block.
pub fn parse_stream_title(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let text = text.trim_matches(char::from(0)).trim();
    if text.is_empty() {
        return None;
    }

    for (open, close) in [("StreamTitle='", "';"), ("StreamTitle=\"", "\";")] {
        if let Some(start) = text.find(open) {
            let rest = &text[start + open.len()..];
            // The last field may lack the terminating `;`.
            let end = rest.find(close).or_else(|| rest.rfind(&close[..1]))?;
            let title = rest[..end].trim();
            return if title.is_empty() {
                None
            } else {
                Some(title.to_string())
            };
        }
    }
    None
}

/// Splits "Artist - Title" on the first separator; without one the whole
/// string is the title.
pub fn split_artist_title(raw: &str) -> (Option<String>, Option<String>) {
    let s = raw.trim();
    if let Some(pos) = s.find(" - ") {
        let artist = s[..pos].trim().to_string();
        let title = s[pos + 3..].trim().to_string();
        (
            Some(artist).filter(|a| !a.is_empty()),
            Some(title).filter(|t| !t.is_empty()),
        )
    } else {
        (None, Some(s.to_string()).filter(|t| !t.is_empty()))
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Descriptive `icy-*` headers plus content type. Always read, whether or not
/// the stream interleaves metadata.
pub fn descriptive_headers(headers: &HeaderMap) -> NowPlayingInfo {
    NowPlayingInfo {
        station_name: header_text(headers, "icy-name"),
        description: header_text(headers, "icy-description"),
        genre: header_text(headers, "icy-genre"),
        // Some servers send "128,128"
        bitrate_kbps: header_text(headers, "icy-br")
            .and_then(|v| v.split(',').next().and_then(|b| b.trim().parse().ok())),
        homepage_url: header_text(headers, "icy-url"),
        content_type: header_text(headers, header::CONTENT_TYPE.as_str()),
        ..NowPlayingInfo::default()
    }
}

/// Declared metadata interval, if usable.
pub fn metadata_interval(headers: &HeaderMap, max_metaint: usize) -> Option<usize> {
    let metaint = header_text(headers, "icy-metaint")?.parse::<usize>().ok()?;
    if !(1..=max_metaint).contains(&metaint) {
        debug!("now-playing: ignoring icy-metaint={}", metaint);
        return None;
    }
    Some(metaint)
}

/// How the search for the first metadata block ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Raw block text, NUL padding included.
    Block(Vec<u8>),
    /// Byte budget spent, stream ended, or a read failed.
    Exhausted,
    /// The deadline passed first.
    TimedOut,
}

/// Reads up to the first metadata block of `body`.
pub async fn read_metadata_block<S: ChunkSource>(
    body: &mut S,
    interval: usize,
    deadline: Instant,
) -> ReadOutcome {
    let budget = interval + READ_MARGIN;
    let mut consumed = 0usize;
    let mut partial: Option<Vec<u8>> = None;

    while consumed < budget {
        let chunk: Bytes = match timeout_at(deadline, body.next_chunk()).await {
            Err(_) => {
                debug!("now-playing: deadline hit after {} bytes", consumed);
                return ReadOutcome::TimedOut;
            }
            Ok(Err(e)) => {
                debug!("now-playing: read error after {} bytes: {}", consumed, e);
                return ReadOutcome::Exhausted;
            }
            Ok(Ok(None)) => {
                debug!("now-playing: stream ended after {} bytes", consumed);
                return ReadOutcome::Exhausted;
            }
            Ok(Ok(Some(chunk))) => chunk,
        };

        if let Some(tail) = partial.as_mut() {
            consumed += chunk.len();
            tail.extend_from_slice(&chunk);
            if let Some(block) = complete_block(tail) {
                return ReadOutcome::Block(block.to_vec());
            }
            continue;
        }

        let (found, after) = locate_metadata(consumed, &chunk, interval);
        consumed = after;
        match found {
            Some(MetadataBlock::Complete(block)) => return ReadOutcome::Block(block.to_vec()),
            Some(MetadataBlock::Partial(tail)) => partial = Some(tail.to_vec()),
            None => {}
        }
    }

    debug!(
        "now-playing: no metadata block within {} bytes (interval {})",
        budget, interval
    );
    ReadOutcome::Exhausted
}

/// Builds the full now-playing answer from an open response. Fails only when
/// the deadline passes before the first block arrives.
pub async fn extract<S: ChunkSource>(
    headers: &HeaderMap,
    mut body: S,
    max_metaint: usize,
    deadline: Instant,
) -> GatewayResult<NowPlayingInfo> {
    let mut info = descriptive_headers(headers);

    let Some(interval) = metadata_interval(headers, max_metaint) else {
        return Ok(info);
    };

    let outcome = read_metadata_block(&mut body, interval, deadline).await;
    drop(body);

    let block = match outcome {
        ReadOutcome::Block(block) => block,
        ReadOutcome::Exhausted => return Ok(info),
        ReadOutcome::TimedOut => return Err(GatewayError::Timeout),
    };
    if let Some(raw) = parse_stream_title(&block) {
        let (artist, title) = split_artist_title(&raw);
        info.artist = artist;
        info.title = title;
        info.raw_title = Some(raw);
    }
    Ok(info)
}

pub struct NowPlaying {
    client: Client,
    user_agent: String,
    config: NowPlayingConfig,
}

impl NowPlaying {
    pub fn new(
        proxy: &ProxyConfig,
        config: NowPlayingConfig,
        allow: &AllowList,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(allow.redirect_policy(proxy.redirect_limit))
            .build()?;
        Ok(Self {
            client,
            user_agent: proxy.user_agent.clone(),
            config,
        })
    }

    /// Connects to `url` asking for interleaved metadata. The deadline covers
    /// connect and read; passing it is a timeout whichever phase it hits.
    pub async fn lookup(&self, url: Url) -> GatewayResult<NowPlayingInfo> {
        let deadline = Instant::now() + self.config.timeout();
        info!("now-playing: querying {}", url);

        let request = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, &self.user_agent)
            .header("Icy-MetaData", "1")
            .send();

        let response = match timeout_at(deadline, request).await {
            Err(_) => {
                warn!("now-playing: connect to {} timed out", url);
                return Err(GatewayError::Timeout);
            }
            Ok(Err(e)) => {
                warn!("now-playing: request to {} failed: {}", url, e);
                return Err(match GatewayError::from_fetch(e) {
                    GatewayError::UpstreamFetch(msg) => GatewayError::MetadataUnavailable(msg),
                    other => other,
                });
            }
            Ok(Ok(r)) => r,
        };

        if !response.status().is_success() {
            warn!(
                "now-playing: upstream returned {} for {}",
                response.status(),
                url
            );
            return Err(GatewayError::MetadataUnavailable(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        let headers = response.headers().clone();
        let info = extract(&headers, response, self.config.max_metaint, deadline)
            .await
            .inspect_err(|_| warn!("now-playing: no metadata block from {} in time", url))?;
        if info.has_track() {
            debug!("now-playing: {} → {:?}", url, info.raw_title);
        } else {
            debug!("now-playing: {} → station={:?}, no track", url, info.station_name);
        }
        Ok(info)
    }
}
