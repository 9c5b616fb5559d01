use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Malformed { var: &'static str, value: String },
    #[error("both ROOMDESK_TLS_CERT and ROOMDESK_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Server settings, read from `ROOMDESK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub cache_ttl: Option<Duration>,
    pub revalidate_updates: bool,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            cache_ttl: None,
            revalidate_updates: false,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_connections = parsed(&get, "ROOMDESK_MAX_CONNECTIONS")?
            .unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Zero("ROOMDESK_MAX_CONNECTIONS"));
        }
        let compact_threshold = parsed(&get, "ROOMDESK_COMPACT_THRESHOLD")?
            .unwrap_or(defaults.compact_threshold);
        if compact_threshold == 0 {
            return Err(ConfigError::Zero("ROOMDESK_COMPACT_THRESHOLD"));
        }

        let tls_cert = get("ROOMDESK_TLS_CERT");
        let tls_key = get("ROOMDESK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            port: parsed(&get, "ROOMDESK_PORT")?.unwrap_or(defaults.port),
            bind: get("ROOMDESK_BIND").unwrap_or(defaults.bind),
            data_dir: get("ROOMDESK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            max_connections,
            compact_threshold,
            cache_ttl: parsed::<u64>(&get, "ROOMDESK_CACHE_TTL_SECS")?.map(Duration::from_secs),
            revalidate_updates: parsed_bool(&get, "ROOMDESK_REVALIDATE_UPDATES")?
                .unwrap_or(defaults.revalidate_updates),
            metrics_port: parsed(&get, "ROOMDESK_METRICS_PORT")?,
            tls_cert,
            tls_key,
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            revalidate_updates: self.revalidate_updates,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Malformed { var, value })
        })
        .transpose()
}

fn parsed_bool(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    get(var)
        .map(|value| {
            let lowered = value.trim().to_ascii_lowercase();
            match lowered.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Malformed { var, value }),
            }
        })
        .transpose()
}
