use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub now_playing: NowPlayingConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Upstream fetch policy shared by the proxy and now-playing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Hostnames the gateway may contact. A host matches an entry when it is
    /// equal to it or ends with `.` + entry.
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
    /// Path prefix that rewritten manifest URIs point at.
    #[serde(default = "default_proxy_path")]
    pub proxy_path: String,
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: usize,
    #[serde(default = "default_redirect_limit")]
    pub redirect_limit: usize,
    /// Ceiling on waiting for upstream response headers, and for buffering a
    /// whole manifest. Streamed bodies are not bounded.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowPlayingConfig {
    /// Wall-clock ceiling for one metadata lookup, connect included.
    #[serde(default = "default_now_playing_timeout_ms")]
    pub timeout_ms: u64,
    /// Declared metadata intervals above this are treated as unsupported.
    #[serde(default = "default_max_metaint")]
    pub max_metaint: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_head_timeout_ms")]
    pub head_timeout_ms: u64,
    #[serde(default = "default_get_timeout_ms")]
    pub get_timeout_ms: u64,
}

/// Stream catalog source. Falls back to the catalog compiled into the binary
/// when the file does not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_toml")]
    pub catalog_toml: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allowed_domains: default_allowed_domains(),
            user_agent: default_user_agent(),
            accept_language: default_accept_language(),
            proxy_path: default_proxy_path(),
            max_manifest_bytes: default_max_manifest_bytes(),
            redirect_limit: default_redirect_limit(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl Default for NowPlayingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_now_playing_timeout_ms(),
            max_metaint: default_max_metaint(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            head_timeout_ms: default_head_timeout_ms(),
            get_timeout_ms: default_get_timeout_ms(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            catalog_toml: default_catalog_toml(),
        }
    }
}

impl ProxyConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl NowPlayingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ProbeConfig {
    pub fn head_timeout(&self) -> Duration {
        Duration::from_millis(self.head_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_allowed_domains() -> Vec<String> {
    [
        "radiofrance.fr",
        "bbc.co.uk",
        "akamaized.net",
        "streamtheworld.com",
        "somafm.com",
        "radioparadise.com",
        "nts.live",
        "ntslive.net",
        "france24.com",
        "francetv.fr",
        "cloudfront.net",
    ]
    .iter()
    .map(|d| d.to_string())
    .collect()
}

fn default_user_agent() -> String {
    concat!("media-gateway/", env!("CARGO_PKG_VERSION"), " (household dashboard stream proxy)")
        .to_string()
}

fn default_accept_language() -> String {
    "en-US,en;q=0.9".to_string()
}

fn default_proxy_path() -> String {
    "/api/proxy".to_string()
}

fn default_max_manifest_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_redirect_limit() -> usize {
    10
}

fn default_response_timeout_ms() -> u64 {
    15000
}

fn default_now_playing_timeout_ms() -> u64 {
    5000
}

fn default_max_metaint() -> usize {
    256_000
}

fn default_head_timeout_ms() -> u64 {
    3500
}

fn default_get_timeout_ms() -> u64 {
    4000
}

fn default_catalog_toml() -> PathBuf {
    platform::config_dir().join("catalog.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        match std::env::var_os(platform::CONFIG_ENV) {
            Some(p) => PathBuf::from(p),
            None => platform::config_dir().join("config.toml"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            proxy: ProxyConfig::default(),
            now_playing: NowPlayingConfig::default(),
            probe: ProbeConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}
