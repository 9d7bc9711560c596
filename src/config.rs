use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{MergePolicy, ReadFallback, UserId};
use crate::gate::ReconcileOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub session: SessionConfig,
  #[serde(default)]
  pub entitlements: EntitlementsConfig,
  /// Directory for daily log files (logs go to stderr if not set)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Base URL of the storefront API
  #[serde(default = "default_server_url")]
  pub url: String,
  /// Timeout applied to every remote call
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Session cookie sent with every request (e.g. "connect.sid=...")
  pub session_cookie: Option<String>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: default_server_url(),
      timeout_secs: default_timeout_secs(),
      session_cookie: None,
    }
  }
}

impl ServerConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

fn default_server_url() -> String {
  "http://localhost:3000/".to_string()
}

fn default_timeout_secs() -> u64 {
  15
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
  /// Signed-in account; absent means logged out
  pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntitlementsConfig {
  /// Database path (defaults to the platform data directory)
  pub database: Option<PathBuf>,
  /// additive-only or mirror-remote
  #[serde(default)]
  pub merge_policy: MergePolicy,
  /// What to answer when the database cannot be read: `none`, `error`, or
  /// `{ policy: fixed-set, courses: [..] }`
  #[serde(default)]
  pub read_fallback: ReadFallback,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./course-gate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/course-gate/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
    let local = PathBuf::from("course-gate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("course-gate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes as null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Self = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.server.timeout_secs == 0 {
      return Err(eyre!("server.timeout_secs must be at least 1"));
    }
    Ok(())
  }

  /// Reconciliation settings derived from this configuration.
  pub fn reconcile_options(&self) -> ReconcileOptions {
    ReconcileOptions {
      merge_policy: self.entitlements.merge_policy,
      fetch_timeout: self.server.timeout(),
    }
  }

  /// Get the storefront session cookie from the environment.
  ///
  /// Checks COURSE_GATE_SESSION.
  pub fn get_session_cookie() -> Option<String> {
    std::env::var("COURSE_GATE_SESSION")
      .ok()
      .filter(|cookie| !cookie.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::parse("").unwrap();

    assert_eq!(config.server.timeout(), Duration::from_secs(15));
    assert_eq!(config.session.user_id, None);
    assert_eq!(config.entitlements.merge_policy, MergePolicy::AdditiveOnly);
    assert_eq!(config.entitlements.read_fallback, ReadFallback::None);
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
server:
  url: http://10.163.118.129:3000/
  timeout_secs: 10
session:
  user_id: 42
entitlements:
  database: /tmp/entitlements.db
  merge_policy: mirror-remote
  read_fallback:
    policy: fixed-set
    courses: [1, 2, 3]
"#,
    )
    .unwrap();

    assert_eq!(config.server.url, "http://10.163.118.129:3000/");
    assert_eq!(config.reconcile_options().fetch_timeout, Duration::from_secs(10));
    assert_eq!(config.session.user_id, Some(42));
    assert_eq!(config.entitlements.merge_policy, MergePolicy::MirrorRemote);
    assert_eq!(
      config.entitlements.read_fallback,
      ReadFallback::FixedSet {
        courses: vec![1, 2, 3]
      }
    );
  }

  #[test]
  fn test_zero_timeout_is_rejected() {
    let err = Config::parse("server:\n  timeout_secs: 0\n").unwrap_err();
    assert!(err.to_string().contains("timeout_secs"));
  }

  #[test]
  fn test_bare_read_fallback() {
    let config = Config::parse("entitlements:\n  read_fallback: error\n").unwrap();
    assert_eq!(config.entitlements.read_fallback, ReadFallback::Error);
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/course-gate.yaml"))).is_err());
  }
}
