use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::SqliteBackend;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// API base URL; resources resolve relative to it
  pub base_url: String,
  /// Liveness endpoint, relative to `base_url`. Must not require auth.
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

fn default_health_path() -> String {
  "health".to_string()
}

fn default_request_timeout() -> u64 {
  30
}

impl RemoteConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 10,
      probe_timeout_secs: 3,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    // tokio intervals panic on a zero period
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL applied to values refreshed from the network
  pub ttl_secs: u64,
  /// SQLite file (default: $XDG_DATA_HOME/offsync/store.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 24 * 60 * 60,
      path: None,
    }
  }
}

impl CacheConfig {
  pub fn store_path(&self) -> Option<PathBuf> {
    self.path.clone().or_else(SqliteBackend::default_path)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
  /// Cookie jar holding the bearer credential; takes precedence over `token_env`
  pub cookie_file: Option<PathBuf>,
  pub cookie_name: String,
  pub token_env: String,
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      cookie_file: None,
      cookie_name: "auth_token".to_string(),
      token_env: "OFFSYNC_TOKEN".to_string(),
    }
  }
}

impl Config {
  /// Configuration with defaults for everything but the API location.
  pub fn for_base_url(base_url: impl Into<String>) -> Self {
    Self {
      remote: RemoteConfig {
        base_url: base_url.into(),
        health_path: default_health_path(),
        request_timeout_secs: default_request_timeout(),
      },
      connectivity: ConnectivityConfig::default(),
      cache: CacheConfig::default(),
      auth: AuthConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    match Self::locate(explicit_path)? {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offsync/config.yaml \
         or pass --base-url."
      )),
    }
  }

  /// Resolve the config file to use, if any.
  pub fn locate(explicit_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(p) = explicit_path {
      return if p.exists() {
        Ok(Some(p.to_path_buf()))
      } else {
        Err(eyre!("Config file not found: {}", p.display()))
      };
    }
    Ok(Self::find_config_file())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("remote:\n  base_url: https://api.example.com/v1\n").unwrap();
    assert_eq!(config.remote.health_path, "health");
    assert_eq!(config.remote.request_timeout(), Duration::from_secs(30));
    assert_eq!(config.connectivity.probe_interval(), Duration::from_secs(10));
    assert_eq!(config.connectivity.probe_timeout(), Duration::from_secs(3));
    assert_eq!(config.cache.ttl_secs, 86_400);
    assert_eq!(config.auth.cookie_name, "auth_token");
    assert_eq!(config.auth.token_env, "OFFSYNC_TOKEN");
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
remote:
  base_url: http://localhost:8080/api
  health_path: /status
connectivity:
  probe_interval_secs: 5
cache:
  ttl_secs: 60
  path: /tmp/offsync-test.db
auth:
  cookie_file: /tmp/cookies.txt
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.remote.health_path, "/status");
    assert_eq!(config.connectivity.probe_interval_secs, 5);
    assert_eq!(config.connectivity.probe_timeout_secs, 3);
    assert_eq!(config.cache.ttl_secs, 60);
    assert_eq!(
      config.cache.store_path(),
      Some(PathBuf::from("/tmp/offsync-test.db"))
    );
    assert_eq!(
      config.auth.cookie_file,
      Some(PathBuf::from("/tmp/cookies.txt"))
    );
  }

  #[test]
  fn test_missing_base_url_is_an_error() {
    assert!(Config::parse("cache:\n  ttl_secs: 5\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_zero_interval_is_clamped() {
    let config = ConnectivityConfig {
      probe_interval_secs: 0,
      probe_timeout_secs: 0,
    };
    assert_eq!(config.probe_interval(), Duration::from_secs(1));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offsync.yaml");
    std::fs::write(&path, "remote:\n  base_url: http://example.test\n").unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.remote.base_url, "http://example.test");
  }
}
