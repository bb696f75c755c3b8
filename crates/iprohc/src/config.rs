// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server configuration file.
//!
//! `key = value` lines, `#` comments, no sections. Unknown keys are a
//! hard error so a typo cannot silently run with a default. The tunnel
//! parameter keys mirror the fields negotiated over the control channel.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::tunnel::params::{CompatVersion, TunnelParams};

/// Default location of the server configuration.
pub const DEFAULT_CONF_PATH: &str = "/etc/iprohc_server.conf";

/// Default control port.
pub const DEFAULT_PORT: u16 = 3126;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected 'key = value'")]
    BadLine { line: usize },
    #[error("line {line}: unknown key '{key}'")]
    UnknownKey { line: usize, key: String },
    #[error("line {line}: invalid value for '{key}': {value}")]
    BadValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("invalid tunnel parameters: {0}")]
    BadParams(#[from] crate::tunnel::params::ParamsError),
}

/// Complete server configuration with the deployed defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub max_clients: usize,
    pub port: u16,
    /// Credential bundle (historically a PKCS#12 container, hence the
    /// key name).
    pub pkcs12_file: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    /// Server's own tunnel address.
    pub local_address: Ipv4Addr,
    /// Prefix length of the tunnel subnet.
    pub prefix: u8,
    pub params: TunnelParams,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 50,
            port: DEFAULT_PORT,
            pkcs12_file: None,
            pidfile: None,
            local_address: Ipv4Addr::new(192, 168, 99, 1),
            prefix: 24,
            params: TunnelParams::default(),
        }
    }
}

impl ServerConfig {
    /// Parse the configuration file at `path` over the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse configuration text over the defaults.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let Some((key, value)) = content.split_once('=') else {
                return Err(ConfigError::BadLine { line });
            };
            let key = key.trim();
            let value = value.trim();
            cfg.apply(line, key, value)?;
        }
        cfg.params.validate()?;
        Ok(cfg)
    }

    fn apply(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_clients" => self.max_clients = parse(line, key, value)?,
            "port" => self.port = parse(line, key, value)?,
            "pkcs12_file" => self.pkcs12_file = Some(PathBuf::from(value)),
            "pidfile" => self.pidfile = Some(PathBuf::from(value)),
            "local_address" => {
                let (addr, prefix) = value.split_once('/').ok_or_else(|| bad(line, key, value))?;
                self.local_address =
                    Ipv4Addr::from_str(addr.trim()).map_err(|_| bad(line, key, value))?;
                self.prefix = prefix
                    .trim()
                    .parse()
                    .map_err(|_| bad(line, key, value))?;
            }
            "packing" => self.params.packing = parse(line, key, value)?,
            "max_cid" => self.params.max_cid = parse(line, key, value)?,
            "unidirectional" => {
                self.params.is_unidirectional = parse::<u8>(line, key, value)? != 0;
            }
            "wlsb_window_width" => self.params.wlsb_window_width = parse(line, key, value)?,
            "refresh" => self.params.refresh = parse(line, key, value)?,
            "keepalive_timeout" => self.params.keepalive_timeout = parse(line, key, value)?,
            "rohc_compat_version" => {
                let raw: u8 = parse(line, key, value)?;
                self.params.compat =
                    CompatVersion::from_wire(raw).ok_or_else(|| bad(line, key, value))?;
            }
            _ => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Log the effective configuration, the way operators expect to see
    /// it at boot.
    pub fn dump(&self) {
        log::info!("[CONFIG] max clients : {}", self.max_clients);
        log::info!("[CONFIG] port        : {}", self.port);
        log::info!(
            "[CONFIG] credentials : {}",
            self.pkcs12_file
                .as_deref()
                .map_or_else(|| "<unset>".into(), |p| p.display().to_string())
        );
        log::info!(
            "[CONFIG] pidfile     : {}",
            self.pidfile
                .as_deref()
                .map_or_else(|| "<unset>".into(), |p| p.display().to_string())
        );
        log::info!("[CONFIG] tunnel params:");
        log::info!(
            "[CONFIG]  . local ip  : {}/{}",
            self.local_address,
            self.prefix
        );
        log::info!("[CONFIG]  . packing   : {}", self.params.packing);
        log::info!("[CONFIG]  . max cid   : {}", self.params.max_cid);
        log::info!(
            "[CONFIG]  . unid      : {}",
            u8::from(self.params.is_unidirectional)
        );
        log::info!(
            "[CONFIG]  . keepalive : {}",
            self.params.keepalive_timeout
        );
    }
}

fn parse<T: FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| bad(line, key, value))
}

fn bad(line: usize, key: &str, value: &str) -> ConfigError {
    ConfigError::BadValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_deployed_fleet() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_clients, 50);
        assert_eq!(cfg.port, 3126);
        assert_eq!(cfg.local_address, Ipv4Addr::new(192, 168, 99, 1));
        assert_eq!(cfg.prefix, 24);
        assert_eq!(cfg.params.packing, 5);
        assert_eq!(cfg.params.keepalive_timeout, 60);
    }

    #[test]
    fn full_file_parses() {
        let text = "\
# iprohc server configuration
max_clients = 10
port = 4000
pkcs12_file = /etc/iprohc/server.pem
pidfile = /run/iprohc.pid
local_address = 10.8.0.1/16
packing = 3          # lowered for lossy links
max_cid = 100
unidirectional = 0
wlsb_window_width = 16
refresh = 20
keepalive_timeout = 30
rohc_compat_version = 2
";
        let cfg = ServerConfig::parse(text).unwrap();
        assert_eq!(cfg.max_clients, 10);
        assert_eq!(cfg.port, 4000);
        assert_eq!(
            cfg.pkcs12_file.as_deref(),
            Some(Path::new("/etc/iprohc/server.pem"))
        );
        assert_eq!(cfg.local_address, Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(cfg.prefix, 16);
        assert_eq!(cfg.params.packing, 3);
        assert_eq!(cfg.params.max_cid, 100);
        assert!(!cfg.params.is_unidirectional);
        assert_eq!(cfg.params.compat, CompatVersion::V2);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ServerConfig::parse("max_clinets = 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { line: 1, .. }));
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = ServerConfig::parse("port = lots\n").unwrap_err();
        assert!(err.to_string().contains("port"));
        let err = ServerConfig::parse("local_address = 10.8.0.1\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadValue { .. }));
    }

    #[test]
    fn invalid_params_fail_validation() {
        let err = ServerConfig::parse("packing = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadParams(_)));
    }

    #[test]
    fn from_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_clients = 2").unwrap();
        writeln!(file, "local_address = 192.168.99.1/30").unwrap();
        let cfg = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.max_clients, 2);
        assert_eq!(cfg.prefix, 30);
    }
}
