//! Server configuration.

use std::net::SocketAddr;

use prodline_sync::SyncConfig;

use crate::error::{Error, Result};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq)]
pub struct VisConfig {
    /// Address the HTTP and WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// Engine and scene tuning
    pub sync: SyncConfig,
}

impl Default for VisConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            sync: SyncConfig::default(),
        }
    }
}

impl VisConfig {
    /// Read `PRODLINE_BIND_ADDR` plus every `PRODLINE_*` engine variable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let raw = lookup("PRODLINE_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid PRODLINE_BIND_ADDR: {raw:?}")))?;
        Ok(Self {
            bind_addr,
            sync: SyncConfig::from_lookup(lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_all_interfaces() {
        let config = VisConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, VisConfig::default());
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn bind_addr_override() {
        let config = VisConfig::from_lookup(|key| match key {
            "PRODLINE_BIND_ADDR" => Some("127.0.0.1:9000".into()),
            "PRODLINE_SEED" => Some("11".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.sync.seed, Some(11));
    }

    #[test]
    fn bad_values_are_config_errors() {
        let err = VisConfig::from_lookup(|key| {
            (key == "PRODLINE_BIND_ADDR").then(|| "localhost".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = VisConfig::from_lookup(|key| {
            (key == "PRODLINE_TICK_MS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Sync(prodline_sync::Error::Config(_))));
    }
}
