use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::store::MAX_TTL;
use crate::upstream::DEFAULT_UPSTREAM_PROVIDER;

/// Runtime configuration parsed from `rabbitdns.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub features: FeatureSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub profiles: ProfileSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_doh_path")]
    pub doh_path: String,
    #[serde(default = "default_profile_path")]
    pub profile_path: String,
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

/// Capability set shared by every deployment variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSection {
    #[serde(default = "enabled")]
    pub caching: bool,
    #[serde(default = "enabled")]
    pub profiles: bool,
    /// Advertise `Access-Control-Max-Age` on DNS answers.
    #[serde(default = "enabled")]
    pub cors_max_age: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_response_ttl")]
    pub response_ttl_seconds: u64,
    #[serde(default = "default_edge_capacity")]
    pub edge_capacity: usize,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSection {
    #[serde(default = "default_profile_edge_ttl")]
    pub edge_ttl_seconds: u64,
    #[serde(default = "default_profile_refill_ttl")]
    pub refill_ttl_seconds: u64,
    #[serde(default)]
    pub store_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_upstream_provider")]
    pub default_provider: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Inbound host -> provider name.
    #[serde(default = "default_host_aliases")]
    pub hosts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn enabled() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:8053".into()
}

fn default_doh_path() -> String {
    "/dns-query".into()
}

fn default_profile_path() -> String {
    "/createProfile".into()
}

fn default_response_ttl() -> u64 {
    60
}

fn default_edge_capacity() -> usize {
    10_000
}

fn default_profile_edge_ttl() -> u64 {
    60
}

fn default_profile_refill_ttl() -> u64 {
    3600
}

fn default_upstream_provider() -> String {
    DEFAULT_UPSTREAM_PROVIDER.into()
}

fn default_upstream_timeout() -> u64 {
    5
}

fn default_user_agent() -> String {
    concat!("rabbitdns/", env!("CARGO_PKG_VERSION")).into()
}

fn default_host_aliases() -> BTreeMap<String, String> {
    [
        ("dns.rabbitdns.org", "cloudflare"),
        ("family.rabbitdns.org", "cloudflare-family"),
        ("security.rabbitdns.org", "cloudflare-security"),
    ]
    .into_iter()
    .map(|(host, provider)| (host.to_string(), provider.to_string()))
    .collect()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            doh_path: default_doh_path(),
            profile_path: default_profile_path(),
            metrics_listen: None,
        }
    }
}

impl Default for FeatureSection {
    fn default() -> Self {
        Self {
            caching: true,
            profiles: true,
            cors_max_age: true,
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            response_ttl_seconds: default_response_ttl(),
            edge_capacity: default_edge_capacity(),
            store_path: None,
        }
    }
}

impl CacheSection {
    pub fn response_ttl(&self) -> Duration {
        bounded_ttl(self.response_ttl_seconds)
    }

    pub fn resolve_store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => default_store_path(),
        }
    }
}

impl Default for ProfileSection {
    fn default() -> Self {
        Self {
            edge_ttl_seconds: default_profile_edge_ttl(),
            refill_ttl_seconds: default_profile_refill_ttl(),
            store_ttl_seconds: None,
        }
    }
}

impl ProfileSection {
    pub fn edge_ttl(&self) -> Duration {
        bounded_ttl(self.edge_ttl_seconds)
    }

    pub fn refill_ttl(&self) -> Duration {
        bounded_ttl(self.refill_ttl_seconds)
    }

    pub fn store_ttl(&self) -> Option<Duration> {
        self.store_ttl_seconds
            .filter(|secs| *secs > 0)
            .map(bounded_ttl)
    }
}

fn bounded_ttl(seconds: u64) -> Duration {
    Duration::from_secs(seconds).clamp(Duration::from_secs(1), MAX_TTL)
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            default_provider: default_upstream_provider(),
            timeout_seconds: default_upstream_timeout(),
            user_agent: default_user_agent(),
            hosts: default_host_aliases(),
        }
    }
}

impl RuntimeConfig {
    pub fn load_config_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read rabbitdns config at {}", path.display()))?;
        let cfg: Self = toml::from_str(&raw)
            .with_context(|| format!("Malformed rabbitdns config at {}", path.display()))?;
        Ok(cfg)
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_config_file(path);
        }

        let config = Self::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let rendered = toml::to_string_pretty(&config).context("Failed to render default config")?;
        fs::write(path, rendered)
            .with_context(|| format!("Failed to write default config to {}", path.display()))?;
        Ok(config)
    }
}

/// Normalise a route path so it always starts with `/`.
pub fn normalise_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        "/".into()
    } else if trimmed.starts_with('/') {
        trimmed.into()
    } else {
        format!("/{trimmed}")
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "rabbitdns", "RabbitDNS")
        .context("Unable to resolve platform config directory")
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("rabbitdns.toml"))
}

pub fn default_store_path() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("store.sqlite"))
}
