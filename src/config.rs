use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::db::Database;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the single origin the engine fronts
  pub origin: String,
  /// Database file (default: $XDG_DATA_HOME/offline-engine/store.db)
  pub database: Option<PathBuf>,
  pub request_timeout_secs: u64,
  pub default_ttl_secs: u64,
  /// Enables the periodic sweep of expired cache entries
  pub sweep_interval_secs: Option<u64>,
  pub routes: RoutesConfig,
  /// Paths fetched into the static partition at install
  pub precache: Vec<String>,
  /// Document served to offline navigations
  pub offline_page: String,
  /// Application partitions kept across activation
  pub partitions: Vec<PartitionConfig>,
  pub sync: SyncConfig,
  pub notifications: NotificationsConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Hosts serving map tiles (cache-first)
  pub tile_hosts: Vec<String>,
  /// Same-origin tile path prefixes (cache-first)
  pub tile_prefixes: Vec<String>,
  /// Same-origin API path prefixes (network-first)
  pub api_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
  pub name: String,
  #[serde(default = "default_primary_key")]
  pub primary_key: String,
  #[serde(default)]
  pub indexes: Vec<String>,
}

fn default_primary_key() -> String {
  "id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background trigger tag that drains the queue
  pub tag: String,
  /// Partition name to API path its queued records are POSTed to
  pub endpoints: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
  /// Title used when a push payload has none
  pub default_title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Write a daily rolling log file here
  pub directory: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000/".into(),
      database: None,
      request_timeout_secs: 10,
      default_ttl_secs: 60 * 60,
      sweep_interval_secs: None,
      routes: RoutesConfig::default(),
      precache: vec!["/".into(), "/index.html".into(), "/offline.html".into()],
      offline_page: "/offline.html".into(),
      partitions: vec![
        PartitionConfig {
          name: "stores".into(),
          primary_key: "id".into(),
          indexes: vec!["name".into()],
        },
        PartitionConfig {
          name: "prices".into(),
          primary_key: "id".into(),
          indexes: vec!["storeId".into(), "productId".into()],
        },
        PartitionConfig {
          name: "reports".into(),
          primary_key: "id".into(),
          indexes: vec!["storeId".into()],
        },
      ],
      sync: SyncConfig::default(),
      notifications: NotificationsConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      tile_hosts: vec!["tile.openstreetmap.org".into()],
      tile_prefixes: vec!["/tiles/".into()],
      api_prefixes: vec!["/api/".into()],
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: crate::sync::DEFAULT_SYNC_TAG.into(),
      endpoints: HashMap::from([("reports".to_string(), "/api/reports".to_string())]),
    }
  }
}

impl Default for NotificationsConfig {
  fn default() -> Self {
    Self {
      default_title: "Price Watch".into(),
    }
  }
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".into(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-engine.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-engine/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-engine.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-engine").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config.origin_url()?;

    Ok(config)
  }

  pub fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// The origin as a parsed URL.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {:?}: {}", self.origin, e))
  }

  /// Database file to open.
  pub fn database_path(&self) -> Result<PathBuf> {
    self
      .database
      .clone()
      .or_else(Database::default_path)
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  pub fn sweep_interval(&self) -> Option<Duration> {
    self.sweep_interval_secs.filter(|s| *s > 0).map(Duration::from_secs)
  }
}
