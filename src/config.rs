use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheVersion;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the worker serves (scheme + host + port)
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routing: RoutingConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub notifications: NotificationConfig,
  #[serde(default)]
  pub push: PushConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub lifecycle: LifecycleConfig,
  /// Database path (defaults to the data directory)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Overrides the version baked into the binary
  pub version: Option<String>,
  /// Root-relative paths pre-cached at install time
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Base document served when an asset is unreachable
  #[serde(default = "default_offline_shell")]
  pub offline_shell: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: None,
      manifest: default_manifest(),
      offline_shell: default_offline_shell(),
    }
  }
}

fn default_manifest() -> Vec<String> {
  ["/", "/index.html", "/manifest.json", "/icon-192.png", "/icon-512.png"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_offline_shell() -> String {
  "/index.html".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
  /// Path prefixes served network-first (API and realtime channel)
  #[serde(default = "default_network_first")]
  pub network_first_prefixes: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      network_first_prefixes: default_network_first(),
    }
  }
}

fn default_network_first() -> Vec<String> {
  vec!["/api/".to_string(), "/ws".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Sync tag that triggers message replay
  #[serde(default = "default_sync_tag")]
  pub tag: String,
  /// Outbound message endpoint
  #[serde(default = "default_message_endpoint")]
  pub message_endpoint: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
      message_endpoint: default_message_endpoint(),
    }
  }
}

fn default_sync_tag() -> String {
  "sync-messages".to_string()
}

fn default_message_endpoint() -> String {
  "/api/messages".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
  #[serde(default = "default_title")]
  pub default_title: String,
  #[serde(default = "default_body")]
  pub default_body: String,
  #[serde(default = "default_icon")]
  pub icon: String,
  /// Page focused or opened when a notification is clicked
  #[serde(default = "default_app_root")]
  pub app_root: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: default_title(),
      default_body: default_body(),
      icon: default_icon(),
      app_root: default_app_root(),
    }
  }
}

fn default_title() -> String {
  "ClawApp".to_string()
}

fn default_body() -> String {
  "You have a new message".to_string()
}

fn default_icon() -> String {
  "/icon-192.png".to_string()
}

fn default_app_root() -> String {
  "/".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushConfig {
  /// Platform push service that issues subscriptions
  pub service_url: Option<Url>,
  /// Application backend that receives the subscription
  pub backend_url: Option<Url>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
  /// Take over immediately after install instead of waiting for pages to close
  #[serde(default = "default_skip_waiting")]
  pub skip_waiting: bool,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self {
      skip_waiting: default_skip_waiting(),
    }
  }
}

fn default_skip_waiting() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./relay-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/relay-sw/config.yaml
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
        "No configuration file found. Create one at ~/.config/relay-sw/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("relay-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("relay-sw").join("config.yaml");
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
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.origin.cannot_be_a_base() || self.origin.host().is_none() {
      return Err(eyre!("origin must be an absolute http(s) URL"));
    }
    if !self
      .cache
      .manifest
      .iter()
      .any(|p| p == &self.cache.offline_shell)
    {
      return Err(eyre!(
        "cache.manifest must include the offline shell {}",
        self.cache.offline_shell
      ));
    }
    if let Some(bad) = self.cache.manifest.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("manifest entry '{}' must be root-relative", bad));
    }
    Ok(())
  }

  /// The cache generation this process serves.
  pub fn cache_version(&self) -> CacheVersion {
    match &self.cache.version {
      Some(tag) => CacheVersion::new(tag.clone()),
      None => CacheVersion::built_in(),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.network.timeout_secs)
  }

  /// Resolve a root-relative path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  /// Get the push server key from environment variables.
  ///
  /// Checks RELAY_SW_SERVER_KEY.
  pub fn get_server_key() -> Result<String> {
    std::env::var("RELAY_SW_SERVER_KEY").map_err(|_| {
      eyre!("Push server key not found. Pass --key or set RELAY_SW_SERVER_KEY.")
    })
  }
}

#[cfg(test)]
impl Config {
  /// Defaults for `https://chat.example.com`.
  pub fn for_tests() -> Self {
    Self::from_yaml("origin: https://chat.example.com").unwrap()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("origin: https://chat.example.com").unwrap();
    assert_eq!(config.cache.offline_shell, "/index.html");
    assert_eq!(config.cache.manifest.len(), 5);
    assert_eq!(config.routing.network_first_prefixes, vec!["/api/", "/ws"]);
    assert_eq!(config.sync.tag, "sync-messages");
    assert!(config.lifecycle.skip_waiting);
    assert_eq!(config.cache_version(), CacheVersion::built_in());
  }

  #[test]
  fn test_manifest_must_contain_offline_shell() {
    let yaml = "origin: https://chat.example.com\ncache:\n  manifest: [\"/app.js\"]\n";
    assert!(Config::from_yaml(yaml).is_err());
  }

  #[test]
  fn test_version_override() {
    let yaml = "origin: https://chat.example.com\ncache:\n  version: clawapp-v3\n";
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.cache_version().as_str(), "clawapp-v3");
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::for_tests();
    assert_eq!(
      config.resolve("/api/messages").unwrap().as_str(),
      "https://chat.example.com/api/messages"
    );
  }
}
