use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the ontology service, e.g. https://stack.example.com
  pub url: String,
  /// Ontology api name or rid
  pub ontology: String,
}

/// The `cache` section of the config file. Durations are plain integers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub bulk_load_max_entries: usize,
  pub bulk_load_window_ms: u64,
  pub dedupe_interval_ms: u64,
  pub key_ttl_secs: u64,
  pub gc_interval_secs: u64,
  pub settle_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let store = StoreConfig::default();
    Self {
      bulk_load_max_entries: store.bulk_load_max_entries,
      bulk_load_window_ms: store.bulk_load_window.as_millis() as u64,
      dedupe_interval_ms: store.dedupe_interval.as_millis() as u64,
      key_ttl_secs: store.key_ttl.as_secs(),
      gc_interval_secs: store.gc_interval.as_secs(),
      settle_delay_ms: store.settle_delay.as_millis() as u64,
    }
  }
}

/// Tuning knobs for a [`crate::cache::Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
  /// Flush a bulk load batch once it holds this many keys.
  pub bulk_load_max_entries: usize,
  /// Flush a bulk load batch this long after its first key.
  pub bulk_load_window: Duration,
  /// A loaded query younger than this is served without refetching.
  pub dedupe_interval: Duration,
  /// How long an unreferenced cache key survives before GC.
  pub key_ttl: Duration,
  pub gc_interval: Duration,
  /// Pause after a remote action before invalidating.
  pub settle_delay: Duration,
  /// Page size for collection queries that do not set one.
  pub page_size: Option<usize>,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      bulk_load_max_entries: 100,
      bulk_load_window: Duration::from_millis(25),
      dedupe_interval: Duration::ZERO,
      key_ttl: Duration::from_secs(60),
      gc_interval: Duration::from_secs(1),
      settle_delay: Duration::ZERO,
      page_size: None,
    }
  }
}

impl StoreConfig {
  pub fn with_bulk_load_max_entries(mut self, max_entries: usize) -> Self {
    self.bulk_load_max_entries = max_entries;
    self
  }

  pub fn with_bulk_load_window(mut self, window: Duration) -> Self {
    self.bulk_load_window = window;
    self
  }

  pub fn with_dedupe_interval(mut self, interval: Duration) -> Self {
    self.dedupe_interval = interval;
    self
  }

  pub fn with_key_ttl(mut self, ttl: Duration) -> Self {
    self.key_ttl = ttl;
    self
  }

  pub fn with_gc_interval(mut self, interval: Duration) -> Self {
    self.gc_interval = interval;
    self
  }

  pub fn with_settle_delay(mut self, delay: Duration) -> Self {
    self.settle_delay = delay;
    self
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = Some(page_size);
    self
  }
}

impl From<&CacheConfig> for StoreConfig {
  fn from(c: &CacheConfig) -> Self {
    Self {
      bulk_load_max_entries: c.bulk_load_max_entries,
      bulk_load_window: Duration::from_millis(c.bulk_load_window_ms),
      dedupe_interval: Duration::from_millis(c.dedupe_interval_ms),
      key_ttl: Duration::from_secs(c.key_ttl_secs),
      gc_interval: Duration::from_secs(c.gc_interval_secs.max(1)),
      settle_delay: Duration::from_millis(c.settle_delay_ms),
      page_size: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ontosync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ontosync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ontosync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ontosync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ontosync").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  pub fn store_config(&self) -> StoreConfig {
    StoreConfig::from(&self.cache)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks ONTOSYNC_TOKEN first, then FOUNDRY_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("ONTOSYNC_TOKEN")
      .or_else(|_| std::env::var("FOUNDRY_TOKEN"))
      .map_err(|_| eyre!("API token not found. Set ONTOSYNC_TOKEN or FOUNDRY_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_with_defaults() {
    let config = Config::parse(
      "remote:\n  url: https://stack.example.com\n  ontology: my-ontology\n",
    )
    .expect("config");
    assert_eq!(config.remote.ontology, "my-ontology");
    let store = config.store_config();
    assert_eq!(store.bulk_load_max_entries, 100);
    assert_eq!(store.bulk_load_window, Duration::from_millis(25));
    assert_eq!(store.key_ttl, Duration::from_secs(60));
  }

  #[test]
  fn test_parse_cache_section() {
    let config = Config::parse(
      "remote:\n  url: http://localhost:8080\n  ontology: o\ncache:\n  bulk_load_max_entries: 2\n  settle_delay_ms: 250\n",
    )
    .expect("config");
    let store = config.store_config();
    assert_eq!(store.bulk_load_max_entries, 2);
    assert_eq!(store.settle_delay, Duration::from_millis(250));
    assert_eq!(store.dedupe_interval, Duration::ZERO);
  }
}
