use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::engine::EngineConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin whose same-origin GET requests are cached
  pub origin: String,
  /// Build identifier of the version to install
  pub version: String,
  #[serde(default = "default_prefix")]
  pub prefix: String,
  /// Path to the JSON precache manifest
  pub manifest: Option<PathBuf>,
  #[serde(default = "default_fallback_document")]
  pub fallback_document: String,
  #[serde(default = "default_metadata_manifest")]
  pub metadata_manifest: String,
  #[serde(default = "default_static_prefixes")]
  pub static_prefixes: Vec<String>,
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
  /// Verbose diagnostics. Never changes caching behavior.
  #[serde(default)]
  pub dev_mode: bool,
  /// SQLite database path (default: $XDG_DATA_HOME/offcache/cache.db)
  pub database: Option<PathBuf>,
  /// Directory for rolling log files
  pub log_dir: Option<PathBuf>,
}

fn default_prefix() -> String {
  "offcache-".to_string()
}

fn default_fallback_document() -> String {
  "/offline.html".to_string()
}

fn default_metadata_manifest() -> String {
  "/manifest.json".to_string()
}

fn default_static_prefixes() -> Vec<String> {
  vec!["/assets/".to_string(), "/icons/".to_string()]
}

fn default_max_entries() -> usize {
  100
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/offcache/config.yaml\n\
                 See offcache.example.yaml for the format."
        ))
      }
    };

    if Self::dev_mode_from_env() {
      config.dev_mode = true;
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// `OFFCACHE_DEV=1` (or `true`) turns on development mode.
  fn dev_mode_from_env() -> bool {
    std::env::var("OFFCACHE_DEV")
      .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
      .unwrap_or(false)
  }

  /// Engine settings for the configured version.
  pub fn engine_config(&self) -> Result<EngineConfig> {
    self.engine_config_for(&self.version)
  }

  /// Engine settings for an arbitrary version of the same deployment.
  pub fn engine_config_for(&self, version: &str) -> Result<EngineConfig> {
    let origin = Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))?;
    if origin.cannot_be_a_base() {
      return Err(eyre!("Origin {} cannot be used as a base URL", self.origin));
    }

    Ok(EngineConfig {
      fallback_document: self.fallback_document.clone(),
      metadata_manifest: self.metadata_manifest.clone(),
      static_prefixes: self.static_prefixes.clone(),
      max_entries: self.max_entries,
      ..EngineConfig::new(origin, &self.prefix, version)
    })
  }
}
