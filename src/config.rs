use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Bound on the runtime partition when not configured.
pub const DEFAULT_RUNTIME_MAX_ENTRIES: usize = 50;
/// Bound on the api partition when not configured.
pub const DEFAULT_API_MAX_ENTRIES: usize = 30;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
  /// Use SQLite when it is usable, else the flat file
  #[default]
  Auto,
  Sqlite,
  Flat,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: BackendPreference,
  /// Directory holding records.db / records.json
  pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
  /// Configured data directory, else `$XDG_DATA_HOME/lifevault`.
  pub fn data_dir(&self) -> PathBuf {
    self
      .data_dir
      .clone()
      .or_else(|| dirs::data_dir().map(|d| d.join("lifevault")))
      .unwrap_or_else(|| PathBuf::from(".lifevault"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Deployment version; partitions are named after it
  pub version: String,
  pub prefix: String,
  /// Origin the precache paths resolve against
  pub origin: String,
  pub precache: Vec<String>,
  /// Document served to offline navigations
  pub shell: String,
  pub static_extensions: Vec<String>,
  /// Hosts routed network-first into the api partition
  pub api_hosts: Vec<String>,
  pub runtime_max_entries: usize,
  pub api_max_entries: usize,
  pub skip_waiting_on_install: bool,
  pub navigation_preload: bool,
  /// Where the cache database lives; defaults next to the record store
  pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    Self {
      version: "v3.0.0".to_string(),
      prefix: "lv".to_string(),
      origin: "http://localhost:8080/".to_string(),
      precache: strings(&[
        "./",
        "./index.html",
        "./styles.css",
        "./app.js",
        "./db.js",
        "./manifest.webmanifest",
        "./icons/icon-192.png",
        "./icons/icon-512.png",
        "./icons/icon-192-maskable.png",
        "./icons/icon-512-maskable.png",
      ]),
      shell: "./index.html".to_string(),
      static_extensions: strings(&[
        ".css", ".js", ".png", ".jpg", ".jpeg", ".webp", ".svg", ".ico", ".json", ".woff",
        ".woff2", ".ttf",
      ]),
      api_hosts: strings(&["api.open-meteo.com", "api.quotable.io"]),
      runtime_max_entries: DEFAULT_RUNTIME_MAX_ENTRIES,
      api_max_entries: DEFAULT_API_MAX_ENTRIES,
      skip_waiting_on_install: true,
      navigation_preload: true,
      dir: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive, overridden by RUST_LOG
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lifevault.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lifevault/config.yaml
  ///
  /// Defaults are used when no file is found.
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
    let local = PathBuf::from("lifevault.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lifevault").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    // An empty file deserializes to `null`
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Directory for the cache database.
  pub fn cache_dir(&self) -> PathBuf {
    self
      .cache
      .dir
      .clone()
      .unwrap_or_else(|| self.storage.data_dir())
  }
}
