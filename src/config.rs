use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::strategy::StrategyKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin server that relative routes and queued mutations resolve against
  pub origin: String,
  /// Cache generation tag
  pub version: String,
  /// Prefix shared by every named cache store
  pub cache_prefix: String,
  /// Route of the page served to navigations when offline
  pub offline_page: String,
  /// Routes precached on install
  pub core_assets: Vec<String>,
  /// How many core assets are fetched concurrently during install
  pub install_batch_size: usize,
  /// Fraction of max age after which cache-first refreshes in the background
  pub refresh_threshold: f64,
  /// Absolute age ceiling applied to every store by the optimize pass
  pub optimize_max_age_secs: u64,
  /// Interval of the periodic optimize pass (0 disables it)
  pub optimize_interval_secs: u64,
  /// Prefix that queued form submissions and uploads are replayed under
  pub api_prefix: String,
  /// Endpoint telemetry batches are posted to
  pub telemetry_endpoint: String,
  /// SQLite database location (defaults to the user data directory)
  pub database_path: Option<PathBuf>,
  pub routes: RoutesConfig,
  pub strategies: StrategiesConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000/".to_string(),
      version: "v1".to_string(),
      cache_prefix: "shelter".to_string(),
      offline_page: "/offline".to_string(),
      core_assets: ["/", "/offline", "/dashboard", "/manifest.json"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      install_batch_size: 6,
      refresh_threshold: 0.7,
      optimize_max_age_secs: 24 * 60 * 60,
      optimize_interval_secs: 60 * 60,
      api_prefix: "/api".to_string(),
      telemetry_endpoint: "/api/logs".to_string(),
      database_path: None,
      routes: RoutesConfig::default(),
      strategies: StrategiesConfig::default(),
    }
  }
}

/// Patterns used by the route classifier, evaluated in a fixed order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Path prefixes that must never be cached
  pub sensitive_prefixes: Vec<String>,
  pub static_pattern: String,
  pub font_pattern: String,
  pub image_pattern: String,
  pub api_pattern: String,
  pub data_pattern: String,
  /// Known application pages (the root path always counts)
  pub page_prefixes: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      sensitive_prefixes: [
        "/api/auth",
        "/auth/callback",
        "/api/payment",
        "/api/upload",
        "/api/sync",
        "/api/logs",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      static_pattern: r"^/(_next/static|static|assets|build)/.+\.(js|mjs|css|map)$".to_string(),
      font_pattern: r"(?i)\.(woff2?|ttf|otf|eot)$".to_string(),
      image_pattern: r"(?i)\.(png|jpe?g|gif|svg|webp|avif|ico)$".to_string(),
      api_pattern: r"^/api/".to_string(),
      data_pattern: r"(?i)\.json$".to_string(),
      page_prefixes: ["/dashboard", "/records", "/reports", "/settings", "/offline"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
  }
}

/// Caching policy for one category.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PolicyConfig {
  pub strategy: StrategyKind,
  pub max_age_secs: u64,
  pub max_entries: usize,
  pub network_timeout_ms: Option<u64>,
}

impl PolicyConfig {
  fn new(strategy: StrategyKind, max_age_secs: u64, max_entries: usize) -> Self {
    Self {
      strategy,
      max_age_secs,
      max_entries,
      network_timeout_ms: None,
    }
  }

  fn with_timeout(mut self, ms: u64) -> Self {
    self.network_timeout_ms = Some(ms);
    self
  }
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
  #[serde(rename = "static")]
  pub static_assets: PolicyConfig,
  pub images: PolicyConfig,
  pub fonts: PolicyConfig,
  pub api: PolicyConfig,
  pub data: PolicyConfig,
  pub pages: PolicyConfig,
  pub network_only: PolicyConfig,
}

impl Default for StrategiesConfig {
  fn default() -> Self {
    Self {
      static_assets: PolicyConfig::new(StrategyKind::CacheFirst, 30 * DAY, 100),
      images: PolicyConfig::new(StrategyKind::CacheFirst, 7 * DAY, 60),
      fonts: PolicyConfig::new(StrategyKind::CacheFirst, 365 * DAY, 30),
      api: PolicyConfig::new(StrategyKind::NetworkFirst, 5 * 60, 50).with_timeout(3_000),
      data: PolicyConfig::new(StrategyKind::NetworkFirst, HOUR, 30).with_timeout(5_000),
      pages: PolicyConfig::new(StrategyKind::StaleWhileRevalidate, DAY, 50),
      network_only: PolicyConfig::new(StrategyKind::NetworkOnly, 0, 0).with_timeout(10_000),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shelter.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shelter/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        tracing::info!("no configuration file found, using defaults");
        Config::default()
      }
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shelter.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shelter").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  /// Apply `SHELTER_ORIGIN` if set.
  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("SHELTER_ORIGIN") {
      self.origin = origin;
      self.origin_url()?;
    }
    Ok(self)
  }

  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if !(0.0..=1.0).contains(&self.refresh_threshold) {
      return Err(eyre!(
        "refresh_threshold must be between 0 and 1, got {}",
        self.refresh_threshold
      ));
    }
    if self.install_batch_size == 0 {
      return Err(eyre!("install_batch_size must be at least 1"));
    }
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    Ok(())
  }

  /// The origin as a parsed URL.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Where the SQLite database lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database_path {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("shelter.db"))
  }
}

/// Per-user data directory for the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("shelter"))
}
