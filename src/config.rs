use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{CachePolicy, Namespace};

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Address the interception host binds to
  pub listen: String,
  /// Path that accepts control messages instead of being proxied
  pub control_path: String,
  pub upstream: UpstreamConfig,
  pub cache: CacheConfig,
  pub precache: PrecacheConfig,
  pub routing: RoutingConfig,
  pub lifecycle: LifecycleConfig,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:3000".to_string(),
      control_path: "/__sw/message".to_string(),
      upstream: UpstreamConfig::default(),
      cache: CacheConfig::default(),
      precache: PrecacheConfig::default(),
      routing: RoutingConfig::default(),
      lifecycle: LifecycleConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  /// Origin that same-origin paths are resolved against
  pub origin: String,
  /// Per-request timeout; none means wait as long as the network does
  pub timeout_secs: Option<u64>,
  pub user_agent: String,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      origin: "http://127.0.0.1:8080".to_string(),
      timeout_secs: None,
      user_agent: concat!("storefront-cache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

impl UpstreamConfig {
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid upstream origin '{}': {}", self.origin, e))
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite database on disk
  #[default]
  Sqlite,
  /// Process memory, gone on exit
  Memory,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
  pub max_entries: usize,
  pub max_age_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
  #[serde(rename = "static")]
  pub static_assets: PolicyConfig,
  pub dynamic: PolicyConfig,
  pub images: PolicyConfig,
}

impl Default for PoliciesConfig {
  fn default() -> Self {
    Self {
      static_assets: PolicyConfig {
        max_entries: 30,
        max_age_seconds: 7 * DAY_SECS,
      },
      dynamic: PolicyConfig {
        max_entries: 20,
        max_age_seconds: DAY_SECS,
      },
      images: PolicyConfig {
        max_entries: 50,
        max_age_seconds: 30 * DAY_SECS,
      },
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Leading part of every namespace name
  pub prefix: String,
  /// Trailing part of every namespace name; bump it to discard old caches
  pub version: String,
  pub storage: StorageBackend,
  /// SQLite file (default: $XDG_DATA_HOME/storefront-cache/cache.db)
  pub path: Option<PathBuf>,
  /// Images declaring this many bytes or more are served but not cached
  pub image_max_bytes: u64,
  /// Expire entries older than their namespace's `max_age_seconds`
  pub enforce_max_age: bool,
  pub policies: PoliciesConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "sublime".to_string(),
      version: "v2".to_string(),
      storage: StorageBackend::default(),
      path: None,
      image_max_bytes: 500_000,
      enforce_max_age: true,
      policies: PoliciesConfig::default(),
    }
  }
}

impl CacheConfig {
  fn namespace(&self, kind: &str, policy: &PolicyConfig) -> Namespace {
    let max_age_secs = i64::try_from(policy.max_age_seconds).unwrap_or(i64::MAX);
    Namespace::new(
      format!("{}-{}-{}", self.prefix, kind, self.version),
      CachePolicy {
        max_entries: policy.max_entries,
        max_age: self
          .enforce_max_age
          .then(|| chrono::Duration::try_seconds(max_age_secs).unwrap_or(chrono::Duration::MAX)),
      },
    )
  }

  pub fn static_namespace(&self) -> Namespace {
    self.namespace("static", &self.policies.static_assets)
  }

  pub fn dynamic_namespace(&self) -> Namespace {
    self.namespace("dynamic", &self.policies.dynamic)
  }

  pub fn image_namespace(&self) -> Namespace {
    self.namespace("images", &self.policies.images)
  }
}

/// Resources stored while the worker installs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrecacheConfig {
  /// Same-origin paths, stored in the static namespace
  pub critical: Vec<String>,
  /// Absolute URLs, stored in the dynamic namespace
  pub external: Vec<String>,
}

impl Default for PrecacheConfig {
  fn default() -> Self {
    Self {
      critical: [
        "/",
        "/index.html",
        "/styles.css",
        "/script.js",
        "/performance-optimizer.js",
        "/img/logomarcasublime.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      external: [
        "https://fonts.googleapis.com/css2?family=Poppins:wght@300;400;500;600;700&display=swap",
        "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
    }
  }
}

/// Rules that decide which strategy a request gets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Path extensions served stale-while-revalidate (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
  /// Hosts whose every resource is static
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_hosts: BTreeSet<String>,
  /// Path extensions treated as images when the request does not say so
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub image_extensions: BTreeSet<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    fn set(items: &[&str]) -> BTreeSet<String> {
      items.iter().map(|s| s.to_string()).collect()
    }

    Self {
      static_extensions: set(&["css", "js"]),
      static_hosts: set(&[
        "fonts.googleapis.com",
        "fonts.gstatic.com",
        "cdnjs.cloudflare.com",
      ]),
      image_extensions: set(&["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"]),
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate right after installing instead of waiting for FORCE_UPDATE
  pub skip_waiting: bool,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self { skip_waiting: true }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-cache/config.yaml
  ///
  /// Without a file every setting keeps its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("storefront-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.upstream.origin_url()?;
    Ok(config)
  }
}
