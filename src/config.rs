use serde::Deserialize;
use std::{
    fmt,
    net::{Ipv6Addr, SocketAddrV6},
    path::{Path, PathBuf},
    str::FromStr,
};

use ipnet::Ipv6Net;

use crate::v6::{PREFERRED_LIFETIME, REBINDING_TIME, RENEWAL_TIME, VALID_LIFETIME};
use crate::{Duid, INFINITY};

/// How dynamic DNS updates would be transported. The update machinery itself
/// lives outside this daemon; the knob is stored and logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DdnsProtocol {
    Tcp,
    Udp,
    #[default]
    Any,
}

/// Server wide configuration
pub struct Config {
    pub server_duid: Duid,
    pub bind_address: SocketAddrV6,
    /// Where the lease database snapshot lives.
    pub db_path: PathBuf,
    /// Pool the allocator hands out addresses from.
    pub addr_pool: Ipv6Net,
    /// Pool delegated prefixes are carved out of.
    pub pd_pool: Ipv6Net,
    /// Length of each delegated prefix.
    pub pd_length: u8,
    pub t1: u32,
    pub t2: u32,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    /// Preference option value advertised to soliciting clients.
    pub preference: u8,
    /// Whether the two-message rapid-commit exchange is honoured.
    pub rapid_commit: bool,
    /// Upper bound on addresses leased to one client across its IA_NAs.
    pub client_max_leases: usize,
    pub dns_servers: Vec<Ipv6Addr>,
    pub ddns_protocol: DdnsProtocol,
    pub log_level: tracing::Level,
}

/// Server wide configuration, used to deserialize the config.json file
/// before transforming to `Config`
#[derive(Deserialize)]
struct ServerConfig {
    addr_pool: Ipv6Net,
    pd_pool: Ipv6Net,
    pd_length: Option<u8>,
    bind_address: Option<SocketAddrV6>,
    db_path: Option<PathBuf>,
    t1: Option<u32>,
    t2: Option<u32>,
    preferred_lifetime: Option<u32>,
    valid_lifetime: Option<u32>,
    preference: Option<u8>,
    rapid_commit: Option<bool>,
    client_max_leases: Option<usize>,
    #[serde(default)]
    dns_servers: Vec<Ipv6Addr>,
    ddns_protocol: Option<DdnsProtocol>,
    log_level: Option<String>,
}

/// Server identity stored in a separate file that may be auto generated in
/// the future
#[derive(Deserialize)]
struct ServerIds {
    v6: Duid,
}

#[derive(Debug)]
pub enum ConfigError {
    Parsing {
        err: serde_json::Error,
        path: PathBuf,
    },
    Io {
        err: std::io::Error,
        path: PathBuf,
    },
    LogLevel(String),
    PdLength(u8),
    Lifetimes {
        t1: u32,
        t2: u32,
        preferred: u32,
        valid: u32,
    },
}

trait PathContext<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError>;
}

impl<T> PathContext<T> for serde_json::Result<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError> {
        self.map_err(|e| ConfigError::Parsing {
            err: e,
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl<T> PathContext<T> for std::io::Result<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError> {
        self.map_err(|e| ConfigError::Io {
            err: e,
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parsing { err, path } => {
                write!(f, "Parsing `{}`: {err}", path.to_string_lossy())
            }
            ConfigError::Io { err, path } => write!(f, "`{}`: {err}", path.to_string_lossy()),
            ConfigError::LogLevel(value) => write!(
                f,
                r#"Unexpected log level {value}. Expected one of [trace, debug, info, warn, error]"#
            ),
            ConfigError::PdLength(len) => {
                write!(f, "Delegated prefix length {len} is outside 1..=128")
            }
            ConfigError::Lifetimes {
                t1,
                t2,
                preferred,
                valid,
            } => write!(
                f,
                "Lifetimes must satisfy T1 <= T2 <= preferred <= valid, got {t1}/{t2}/{preferred}/{valid}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_duid: Duid::default(),
            bind_address: "[::]:547".parse().unwrap(),
            db_path: PathBuf::from("server-addrdb.xml"),
            addr_pool: "2001:db8:1::/64".parse().unwrap(),
            pd_pool: "2001:db8:8000::/40".parse().unwrap(),
            pd_length: 56,
            t1: RENEWAL_TIME,
            t2: REBINDING_TIME,
            preferred_lifetime: PREFERRED_LIFETIME,
            valid_lifetime: VALID_LIFETIME,
            preference: 0,
            rapid_commit: true,
            client_max_leases: 16,
            dns_servers: vec![],
            ddns_protocol: DdnsProtocol::Any,
            log_level: tracing::Level::INFO,
        }
    }
}

impl Config {
    /// Load server config from `config.json` and `ids.json` in the given
    /// directory
    pub fn load_from_files<P: AsRef<Path>>(config_dir: P) -> Result<Config, ConfigError> {
        let server_config_path = config_dir.as_ref().join("config.json");
        let server_config: ServerConfig = serde_json::from_reader(
            std::fs::File::open(&server_config_path).context(&server_config_path)?,
        )
        .context(&server_config_path)?;

        let server_ids_path = config_dir.as_ref().join("ids.json");
        let server_ids: ServerIds = serde_json::from_reader(
            std::fs::File::open(&server_ids_path).context(&server_ids_path)?,
        )
        .context(&server_ids_path)?;

        let log_level = match server_config.log_level {
            Some(s) if !s.is_empty() => {
                tracing::Level::from_str(&s).map_err(|_| ConfigError::LogLevel(s))?
            }
            _ => tracing::Level::INFO,
        };

        let defaults = Config::default();
        let config = Config {
            server_duid: server_ids.v6,
            bind_address: server_config.bind_address.unwrap_or(defaults.bind_address),
            db_path: server_config.db_path.unwrap_or(defaults.db_path),
            addr_pool: server_config.addr_pool,
            pd_pool: server_config.pd_pool,
            pd_length: server_config.pd_length.unwrap_or(defaults.pd_length),
            t1: server_config.t1.unwrap_or(defaults.t1),
            t2: server_config.t2.unwrap_or(defaults.t2),
            preferred_lifetime: server_config
                .preferred_lifetime
                .unwrap_or(defaults.preferred_lifetime),
            valid_lifetime: server_config
                .valid_lifetime
                .unwrap_or(defaults.valid_lifetime),
            preference: server_config.preference.unwrap_or(defaults.preference),
            rapid_commit: server_config.rapid_commit.unwrap_or(defaults.rapid_commit),
            client_max_leases: server_config
                .client_max_leases
                .unwrap_or(defaults.client_max_leases),
            dns_servers: server_config.dns_servers,
            ddns_protocol: server_config
                .ddns_protocol
                .unwrap_or(defaults.ddns_protocol),
            log_level,
        };
        config.validate()
    }

    fn validate(self) -> Result<Config, ConfigError> {
        if self.pd_length == 0 || self.pd_length > 128 {
            return Err(ConfigError::PdLength(self.pd_length));
        }
        let ordered = [self.t1, self.t2, self.preferred_lifetime, self.valid_lifetime];
        let finite = ordered.iter().filter(|v| **v != INFINITY && **v != 0);
        let mut last = 0u32;
        for v in finite {
            if *v < last {
                return Err(ConfigError::Lifetimes {
                    t1: self.t1,
                    t2: self.t2,
                    preferred: self.preferred_lifetime,
                    valid: self.valid_lifetime,
                });
            }
            last = *v;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deser_config() {
        let config = Config::load_from_files(".").unwrap();
        assert!(!config.server_duid.is_empty());
        assert!(config.pd_length >= config.pd_pool.prefix_len());
    }

    #[test]
    fn lifetime_ordering_is_enforced() {
        let config = Config {
            t1: 4000,
            t2: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Lifetimes { .. })
        ));

        // zero and infinity are outside the ordering check
        let config = Config {
            t1: 0,
            t2: INFINITY,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pd_length_bounds_are_checked() {
        let config = Config {
            pd_length: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::PdLength(0))));
    }
}
