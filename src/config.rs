//! Broker settings from the command line and an optional JSON file
//!
//! Values given on the command line (or through their environment variables)
//! win over the file, and the file wins over built-in defaults.

use anyhow::{bail, Context, Result};
use revtun_lib::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Every tunable the broker accepts; unset fields fall through to the next
/// source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSettings {
    /// Control listener address, e.g. "0.0.0.0:7000"
    pub bind: Option<String>,
    /// Shared secret clients present in REGISTER
    pub password: Option<String>,
    /// Address exposed ports are bound on
    pub public_ip: Option<IpAddr>,
    pub idle_timeout_secs: Option<u64>,
    pub idle_retry_limit: Option<u32>,
    pub write_timeout_secs: Option<u64>,
    pub read_chunk_size: Option<usize>,
    pub log_level: Option<String>,
}

impl BrokerSettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Fill every unset field from `fallback`
    pub fn merge(self, fallback: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            bind: self.bind.or(fallback.bind),
            password: self.password.or(fallback.password),
            public_ip: self.public_ip.or(fallback.public_ip),
            idle_timeout_secs: self.idle_timeout_secs.or(fallback.idle_timeout_secs),
            idle_retry_limit: self.idle_retry_limit.or(fallback.idle_retry_limit),
            write_timeout_secs: self.write_timeout_secs.or(fallback.write_timeout_secs),
            read_chunk_size: self.read_chunk_size.or(fallback.read_chunk_size),
            log_level: self.log_level.or(fallback.log_level),
        }
    }

    /// Apply the settings on top of [`BrokerConfig::default`]
    pub fn into_broker_config(self) -> Result<BrokerConfig> {
        let mut config = BrokerConfig::default();

        if let Some(bind) = self.bind {
            config.control_addr = bind
                .parse()
                .with_context(|| format!("Invalid bind address: {}", bind))?;
        }
        if let Some(password) = self.password {
            config.session.password = Some(password);
        }
        if let Some(ip) = self.public_ip {
            config.listener.bind_ip = ip;
        }
        if let Some(secs) = self.idle_timeout_secs {
            if secs == 0 {
                bail!("Idle timeout must be at least one second");
            }
            config.session.idle_window = Duration::from_secs(secs);
        }
        if let Some(limit) = self.idle_retry_limit {
            config.session.idle_retry_limit = limit;
        }
        if let Some(secs) = self.write_timeout_secs {
            if secs == 0 {
                bail!("Write timeout must be at least one second");
            }
            config.session.data_write_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = self.read_chunk_size {
            config.listener = config.listener.with_read_chunk_size(size);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_settings() {
        let config = BrokerSettings::default().into_broker_config().unwrap();
        assert_eq!(config.control_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.session.idle_window, Duration::from_secs(30));
        assert_eq!(config.session.idle_retry_limit, 5);
        assert!(config.session.password.is_none());
    }

    #[test]
    fn test_command_line_wins_over_file() {
        let cli = BrokerSettings {
            password: Some("from-cli".to_string()),
            ..Default::default()
        };
        let file = BrokerSettings {
            bind: Some("127.0.0.1:9000".to_string()),
            password: Some("from-file".to_string()),
            ..Default::default()
        };

        let merged = cli.merge(file);
        assert_eq!(merged.password.as_deref(), Some("from-cli"));
        assert_eq!(merged.bind.as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "bind": "127.0.0.1:7100",
            "password": "s3cret",
            "public_ip": "127.0.0.1",
            "idle_timeout_secs": 10,
            "idle_retry_limit": 3
        }"#;
        let settings: BrokerSettings = serde_json::from_str(json).unwrap();
        let config = settings.into_broker_config().unwrap();

        assert_eq!(config.control_addr, "127.0.0.1:7100".parse().unwrap());
        assert!(config.session.check_password("s3cret"));
        assert_eq!(config.listener.bind_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.session.idle_window, Duration::from_secs(10));
        assert_eq!(config.session.idle_retry_limit, 3);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<BrokerSettings, _> = serde_json::from_str(r#"{"pasword": "typo"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values() {
        let bad_bind = BrokerSettings {
            bind: Some("nowhere".to_string()),
            ..Default::default()
        };
        assert!(bad_bind.into_broker_config().is_err());

        let zero_idle = BrokerSettings {
            idle_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(zero_idle.into_broker_config().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"password": "on-disk", "log_level": "debug"}}"#).unwrap();

        let settings = BrokerSettings::load(file.path()).unwrap();
        assert_eq!(settings.password.as_deref(), Some("on-disk"));
        assert_eq!(settings.log_level.as_deref(), Some("debug"));

        assert!(BrokerSettings::load(Path::new("/definitely/not/here.json")).is_err());
    }
}
