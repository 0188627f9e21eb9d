use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One playable stream in the catalog: a primary URL plus ordered
/// alternates to try when the primary is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamSource {
    pub name: String,
    pub primary_url: String,
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    #[serde(default)]
    pub logo: Option<String>,
}

/// Category name → ordered sources.
pub type Categories = BTreeMap<String, Vec<StreamSource>>;

/// Everything the now-playing endpoint can report. Every field is optional;
/// a stream without interleaved metadata still yields its descriptive headers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NowPlayingInfo {
    pub station_name: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub homepage_url: Option<String>,
    pub content_type: Option<String>,
    pub raw_title: Option<String>,
    pub artist: Option<String>,
    pub title: Option<String>,
}

impl NowPlayingInfo {
    /// True when an in-band track title was decoded.
    pub fn has_track(&self) -> bool {
        self.raw_title.is_some()
    }
}

/// Outcome of probing one source.
///
/// `reachable_url` is `None` only when every candidate failed; `source`
/// always keeps its configured URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub source: StreamSource,
    pub reachable_url: Option<String>,
    pub promoted_fallbacks: Vec<String>,
}

impl ProbeResult {
    /// Result for a source whose primary answered.
    pub fn primary(source: StreamSource) -> Self {
        let promoted_fallbacks = source.fallback_urls.clone();
        let reachable_url = Some(source.primary_url.clone());
        Self {
            source,
            reachable_url,
            promoted_fallbacks,
        }
    }

    /// Result for a source where fallback `idx` answered. The untried
    /// fallbacks stay in order and the original primary goes last.
    pub fn promoted(source: StreamSource, idx: usize) -> Self {
        let reachable_url = source.fallback_urls.get(idx).cloned();
        let mut promoted_fallbacks: Vec<String> = source
            .fallback_urls
            .iter()
            .skip(idx + 1)
            .cloned()
            .collect();
        promoted_fallbacks.push(source.primary_url.clone());
        Self {
            source,
            reachable_url,
            promoted_fallbacks,
        }
    }

    /// Result for a source where nothing answered.
    pub fn unreachable(source: StreamSource) -> Self {
        Self {
            source,
            reachable_url: None,
            promoted_fallbacks: Vec::new(),
        }
    }

    /// The entry advertised in the directory. Unreachable sources keep their
    /// original configuration.
    pub fn to_entry(&self) -> DirectoryEntry {
        match &self.reachable_url {
            Some(url) => DirectoryEntry {
                name: self.source.name.clone(),
                url: url.clone(),
                logo: self.source.logo.clone(),
                fallback_urls: self.promoted_fallbacks.clone(),
            },
            None => DirectoryEntry {
                name: self.source.name.clone(),
                url: self.source.primary_url.clone(),
                logo: self.source.logo.clone(),
                fallback_urls: self.source.fallback_urls.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_urls: Vec<String>,
}

/// Category name → entries, as served by the directory endpoints.
pub type Directory = BTreeMap<String, Vec<DirectoryEntry>>;

pub fn directory_from_results(results: &BTreeMap<String, Vec<ProbeResult>>) -> Directory {
    results
        .iter()
        .map(|(category, probes)| {
            (
                category.clone(),
                probes.iter().map(ProbeResult::to_entry).collect(),
            )
        })
        .collect()
}
