// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Settings layers: command-line flags over an optional JSON file over built-in defaults

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use revex::{
  client::AgentConfig,
  common::protocol::handshake::HandshakeFlavor,
  server::{front::DEFAULT_DIAL_TIMEOUT, DEFAULT_DATA_PLANE_CONCURRENCY},
};
use serde::Deserialize;

pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9090";
pub const DEFAULT_DATA_PLANE_ADDR: &str = "127.0.0.1:9091";
pub const DEFAULT_FRONT_ADDR: &str = "127.0.0.1:1080";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config file {path:?}: {error}")]
  Read {
    path: PathBuf,
    #[source]
    error: std::io::Error,
  },
  #[error("Failed to parse config file {path:?}: {error}")]
  Parse {
    path: PathBuf,
    #[source]
    error: serde_json::Error,
  },
  #[error("Missing required setting {0:?}")]
  Missing(&'static str),
}

/// The shape of a `--config` file; each section is optional
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
  pub exchange: ExchangeLayer,
  pub revproxy: RevproxyLayer,
}

impl ConfigFile {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read(path).map_err(|error| ConfigError::Read {
      path: path.to_path_buf(),
      error,
    })?;
    serde_json::from_slice(&raw).map_err(|error| ConfigError::Parse {
      path: path.to_path_buf(),
      error,
    })
  }
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeLayer {
  pub control_addr: Option<String>,
  pub data_plane_addr: Option<String>,
  pub front_addr: Option<String>,
  pub handshake: Option<HandshakeFlavor>,
  pub concurrency: Option<usize>,
  pub dial_timeout_ms: Option<u64>,
}

impl ExchangeLayer {
  /// Fills every setting unset in `self` from `lower`
  pub fn over(self, lower: Self) -> Self {
    Self {
      control_addr: self.control_addr.or(lower.control_addr),
      data_plane_addr: self.data_plane_addr.or(lower.data_plane_addr),
      front_addr: self.front_addr.or(lower.front_addr),
      handshake: self.handshake.or(lower.handshake),
      concurrency: self.concurrency.or(lower.concurrency),
      dial_timeout_ms: self.dial_timeout_ms.or(lower.dial_timeout_ms),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSettings {
  pub control_addr: String,
  pub data_plane_addr: String,
  pub front_addr: String,
  pub flavor: HandshakeFlavor,
  pub concurrency: usize,
  pub dial_timeout: Duration,
}

impl From<ExchangeLayer> for ExchangeSettings {
  fn from(layer: ExchangeLayer) -> Self {
    Self {
      control_addr: layer
        .control_addr
        .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.into()),
      data_plane_addr: layer
        .data_plane_addr
        .unwrap_or_else(|| DEFAULT_DATA_PLANE_ADDR.into()),
      front_addr: layer.front_addr.unwrap_or_else(|| DEFAULT_FRONT_ADDR.into()),
      flavor: layer.handshake.unwrap_or_default(),
      concurrency: layer
        .concurrency
        .unwrap_or(DEFAULT_DATA_PLANE_CONCURRENCY),
      dial_timeout: layer
        .dial_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_DIAL_TIMEOUT),
    }
  }
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RevproxyLayer {
  pub namespace: Option<String>,
  pub control_addr: Option<String>,
  pub data_plane_addr: Option<String>,
  pub handshake: Option<HandshakeFlavor>,
  /// Service name to local `host:port`
  pub services: Option<BTreeMap<String, String>>,
}

impl RevproxyLayer {
  pub fn over(self, lower: Self) -> Self {
    Self {
      namespace: self.namespace.or(lower.namespace),
      control_addr: self.control_addr.or(lower.control_addr),
      data_plane_addr: self.data_plane_addr.or(lower.data_plane_addr),
      handshake: self.handshake.or(lower.handshake),
      services: self.services.or(lower.services),
    }
  }
}

impl TryFrom<RevproxyLayer> for AgentConfig {
  type Error = ConfigError;

  fn try_from(layer: RevproxyLayer) -> Result<Self, Self::Error> {
    let services = layer
      .services
      .filter(|services| !services.is_empty())
      .ok_or(ConfigError::Missing("services"))?;
    Ok(AgentConfig {
      namespace: layer.namespace.ok_or(ConfigError::Missing("namespace"))?,
      control_addr: layer
        .control_addr
        .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.into()),
      data_plane_addr: layer
        .data_plane_addr
        .unwrap_or_else(|| DEFAULT_DATA_PLANE_ADDR.into()),
      flavor: layer.handshake.unwrap_or_default(),
      services,
    })
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use revex::{client::AgentConfig, common::protocol::handshake::HandshakeFlavor};

  use super::{ConfigError, ConfigFile, ExchangeLayer, ExchangeSettings, RevproxyLayer};

  #[test]
  fn flags_override_file_which_overrides_defaults() {
    let file: ConfigFile = serde_json::from_str(
      r#"{ "exchange": { "control_addr": "0.0.0.0:7000", "front_addr": "0.0.0.0:7002", "handshake": "forward" } }"#,
    )
    .unwrap();
    let flags = ExchangeLayer {
      front_addr: Some("127.0.0.1:8002".into()),
      ..Default::default()
    };
    let settings = ExchangeSettings::from(flags.over(file.exchange));
    assert_eq!(settings.control_addr, "0.0.0.0:7000");
    assert_eq!(settings.front_addr, "127.0.0.1:8002");
    assert_eq!(settings.data_plane_addr, "127.0.0.1:9091");
    assert_eq!(settings.flavor, HandshakeFlavor::Forward);
    assert_eq!(settings.concurrency, 25);
    assert_eq!(settings.dial_timeout, Duration::from_secs(10));
  }

  #[test]
  fn unknown_keys_are_refused() {
    assert!(serde_json::from_str::<ConfigFile>(r#"{ "exchange": { "port": 1 } }"#).is_err());
  }

  #[test]
  fn revproxy_requires_namespace_and_services() {
    let file: ConfigFile = serde_json::from_str(
      r#"{ "revproxy": { "services": { "web": "127.0.0.1:8080" } } }"#,
    )
    .unwrap();
    assert!(matches!(
      AgentConfig::try_from(file.revproxy.clone()),
      Err(ConfigError::Missing("namespace"))
    ));
    let flags = RevproxyLayer {
      namespace: Some("example".into()),
      ..Default::default()
    };
    let config = AgentConfig::try_from(flags.over(file.revproxy)).unwrap();
    assert_eq!(config.namespace, "example");
    assert_eq!(config.services["web"], "127.0.0.1:8080");
    assert_eq!(config.flavor, HandshakeFlavor::Reverse);

    assert!(matches!(
      AgentConfig::try_from(RevproxyLayer {
        namespace: Some("example".into()),
        ..Default::default()
      }),
      Err(ConfigError::Missing("services"))
    ));
  }
}
