//! Process configuration
//!
//! The proxy reads a single TOML file, by default
//! `<user config dir>/hat/config.toml`:
//!
//! ```toml
//! addr = "127.0.0.1:8080"
//!
//! [mitm]
//! certificate_file = "/etc/hat/ca.pem"
//! key_file = "/etc/hat/ca.key"
//! certificate_lifetime = 24
//!
//! [store]
//! file = "/etc/hat/store.json"
//! ```
//!
//! `addr` and every `mitm` key except `enabled` are required.

use crate::errors::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Directory under the user configuration directory holding `config.toml`
pub const CONFIG_DIR: &str = "hat";
/// File name of the configuration file
pub const CONFIG_FILE: &str = "config.toml";
/// Longest accepted leaf certificate lifetime, in hours (ten years)
pub const MAX_CERTIFICATE_LIFETIME: u64 = 10 * 365 * 24;

/// Validated proxy configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  /// Address to listen on
  pub addr: SocketAddr,
  /// Certificate authority settings
  pub mitm: MitmConfig,
  /// Where users, devices and rules come from
  #[serde(default)]
  pub store: StoreConfig,
}

/// Certificate authority settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MitmConfig {
  /// PEM encoded X.509 root certificate
  pub certificate_file: PathBuf,
  /// PEM encoded PKCS#8 private key of the root certificate
  pub key_file: PathBuf,
  /// Lifetime of forged leaf certificates, in hours
  pub certificate_lifetime: u64,
  /// Intercept CONNECT tunnels; when false tunnels are relayed blind
  #[serde(default = "default_enabled")]
  pub enabled: bool,
}

/// Persistence settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
  /// JSON snapshot of users, devices and rules
  pub file: Option<PathBuf>,
}

fn default_enabled() -> bool {
  true
}

impl Config {
  /// Default configuration path: `<user config dir>/hat/config.toml`
  pub fn default_path() -> Result<PathBuf> {
    dirs::config_dir()
      .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
      .ok_or_else(|| Error::config_error("could not determine the user config directory"))
  }

  /// Read and validate the configuration file at `path`
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    if !path.exists() {
      return Err(Error::config_error(format!(
        "config file does not exist: {}",
        path.display()
      )));
    }
    let raw = std::fs::read_to_string(path)
      .map_err(|e| Error::config_error(format!("read config file {}: {}", path.display(), e)))?;
    Self::from_toml(&raw)
  }

  /// Parse and validate a configuration document
  pub fn from_toml(raw: &str) -> Result<Self> {
    let config: Config =
      toml::from_str(raw).map_err(|e| Error::config_error(format!("parse config file: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.mitm.certificate_file.as_os_str().is_empty() || self.mitm.key_file.as_os_str().is_empty()
    {
      return Err(Error::config_error(
        "certificate file or key file not provided",
      ));
    }
    if self.mitm.certificate_lifetime == 0 {
      return Err(Error::config_error(
        "certificate_lifetime must be at least one hour",
      ));
    }
    if self.mitm.certificate_lifetime > MAX_CERTIFICATE_LIFETIME {
      return Err(Error::config_error(format!(
        "certificate_lifetime must be at most {} hours",
        MAX_CERTIFICATE_LIFETIME
      )));
    }
    Ok(())
  }

  /// Lifetime of forged leaf certificates
  pub fn certificate_lifetime(&self) -> time::Duration {
    let hours = self.mitm.certificate_lifetime.min(MAX_CERTIFICATE_LIFETIME) as i64;
    time::Duration::hours(hours)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const FULL: &str = r#"
addr = "127.0.0.1:8080"

[mitm]
certificate_file = "ca.pem"
key_file = "ca.key"
certificate_lifetime = 24
"#;

  #[test]
  fn parses_required_fields() {
    let config = Config::from_toml(FULL).unwrap();
    assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
    assert_eq!(config.mitm.certificate_file, PathBuf::from("ca.pem"));
    assert!(config.mitm.enabled);
    assert!(config.store.file.is_none());
    assert_eq!(config.certificate_lifetime(), time::Duration::hours(24));
  }

  #[test]
  fn missing_lifetime_is_rejected() {
    let raw = r#"
addr = "127.0.0.1:8080"

[mitm]
certificate_file = "ca.pem"
key_file = "ca.key"
"#;
    assert!(matches!(Config::from_toml(raw), Err(Error::Config(_))));
  }

  #[test]
  fn missing_addr_is_rejected() {
    let raw = r#"
[mitm]
certificate_file = "ca.pem"
key_file = "ca.key"
certificate_lifetime = 1
"#;
    assert!(matches!(Config::from_toml(raw), Err(Error::Config(_))));
  }

  #[test]
  fn unknown_keys_are_rejected() {
    let raw = format!("verbose = true\n{}", FULL);
    assert!(matches!(Config::from_toml(&raw), Err(Error::Config(_))));
  }

  #[test]
  fn empty_paths_are_rejected() {
    let raw = FULL.replace("\"ca.key\"", "\"\"");
    assert!(matches!(Config::from_toml(&raw), Err(Error::Config(_))));
  }

  #[test]
  fn lifetime_is_capped() {
    let raw = FULL.replace("certificate_lifetime = 24", "certificate_lifetime = 100000000000000");
    assert!(matches!(Config::from_toml(&raw), Err(Error::Config(_))));
    let raw = FULL.replace(
      "certificate_lifetime = 24",
      &format!("certificate_lifetime = {}", MAX_CERTIFICATE_LIFETIME),
    );
    let config = Config::from_toml(&raw).unwrap();
    assert_eq!(
      config.certificate_lifetime(),
      time::Duration::hours(MAX_CERTIFICATE_LIFETIME as i64)
    );
  }

  #[test]
  fn missing_file_is_a_config_error() {
    let err = Config::load("/nonexistent/hat/config.toml").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
  }
}
