use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::protocol::{Categories, StreamSource};

/// Catalog compiled into the binary, used when no catalog file is on disk.
pub const EMBEDDED_CATALOG: &str = include_str!("../catalog.toml");

/// Process-wide stream directory configuration. Built once at startup and
/// shared read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub radio: Categories,
    pub tv: Categories,
}

impl Catalog {
    pub fn source_count(&self) -> usize {
        self.radio
            .values()
            .chain(self.tv.values())
            .map(Vec::len)
            .sum()
    }
}

// ── TOML catalog loader ───────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[radio]]` / `[[tv]]` tables.
/// Kept separate from `StreamSource` so the file schema stays flat.
#[derive(Debug, serde::Deserialize)]
struct TomlCatalogFile {
    #[serde(default)]
    radio: Vec<TomlSource>,
    #[serde(default)]
    tv: Vec<TomlSource>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlSource {
    category: String,
    name: String,
    url: String,
    #[serde(default)]
    fallbacks: Vec<String>,
    #[serde(default)]
    logo: Option<String>,
}

pub fn parse_catalog_from_toml_str(content: &str) -> anyhow::Result<Catalog> {
    let file: TomlCatalogFile = toml::from_str(content)?;
    Ok(Catalog {
        radio: group(file.radio)?,
        tv: group(file.tv)?,
    })
}

pub fn load_catalog(path: &std::path::Path) -> anyhow::Result<Catalog> {
    if !path.exists() {
        info!("catalog: {:?} not found, using embedded catalog", path);
        return parse_catalog_from_toml_str(EMBEDDED_CATALOG);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let catalog = parse_catalog_from_toml_str(&content)
        .with_context(|| format!("failed to parse catalog {}", path.display()))?;
    if catalog.source_count() == 0 {
        warn!("catalog: {:?} defines no sources", path);
    }
    Ok(catalog)
}

fn group(entries: Vec<TomlSource>) -> anyhow::Result<Categories> {
    let mut categories = Categories::new();
    for entry in entries {
        check_url(&entry.name, &entry.url)?;
        for fallback in &entry.fallbacks {
            check_url(&entry.name, fallback)?;
        }
        categories
            .entry(entry.category)
            .or_default()
            .push(StreamSource {
                name: entry.name,
                primary_url: entry.url,
                fallback_urls: entry.fallbacks,
                logo: entry.logo,
            });
    }
    Ok(categories)
}

fn check_url(name: &str, raw: &str) -> anyhow::Result<()> {
    let parsed = url::Url::parse(raw).with_context(|| format!("source {name:?}: bad url {raw:?}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("source {name:?}: unsupported scheme in {raw:?}");
    }
    Ok(())
}
