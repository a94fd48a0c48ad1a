//! Immutable, write-once crawl configuration, loaded once at startup from a
//! sectioned INI file under a single `[crawl]` section.
//!
//! Per the "cyclic/global state" design note, nothing in this crate keeps a
//! mutable global config: every component takes an `Arc<CrawlConfig>` through
//! its constructor instead.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use ini::Ini;

use crate::error::ConfigError;

/// Whether this process drives the Pass Controller (`master`) or only runs
/// worker tasks gated on the master's published `run_state` (`slave`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    pub fn is_master(self) -> bool {
        matches!(self, Role::Master)
    }

    pub fn parse(s: &str) -> Result<Role, ConfigError> {
        match s {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            other => Err(ConfigError::BadRole(other.to_string())),
        }
    }
}

/// A configured SOCKS5 proxy used to dial onion addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TorProxy {
    pub host: String,
    pub port: u16,
}

/// Everything read from the `[crawl]` section, plus the role selected on the
/// command line. Built once, shared behind an `Arc` for the life of the
/// process.
#[derive(Clone, Debug)]
pub struct CrawlConfig {
    pub role: Role,

    pub logfile: String,
    pub debug: bool,

    pub magic_number: [u8; 4],
    pub port: u16,
    pub db: i64,

    pub seeders: Vec<String>,
    pub workers: usize,
    pub max_nodes: usize,

    pub source_address: String,
    pub protocol_version: u32,
    pub user_agent: String,
    pub services: u64,
    pub relay: bool,

    pub socket_timeout_secs: u64,
    pub cron_delay_secs: u64,
    pub snapshot_delay_secs: u64,

    pub addr_ttl_secs: u64,
    pub addr_ttl_var_pct: u32,
    pub max_age_secs: i64,
    pub peers_per_node: usize,

    pub ipv6: bool,
    pub ipv6_prefix: u8,
    pub nodes_per_ipv6_prefix: u64,

    pub exclude_ipv4_networks: Vec<String>,
    pub exclude_ipv6_networks: Vec<String>,
    pub exclude_ipv4_bogons_from_urls: Vec<String>,
    pub exclude_ipv6_bogons_from_urls: Vec<String>,
    pub exclude_ipv4_networks_from_url: Option<String>,
    pub exclude_ipv6_networks_from_url: Option<String>,

    pub onion: bool,
    pub tor_proxies: Vec<TorProxy>,
    pub onion_nodes: Vec<String>,

    pub include_checked: bool,

    pub crawl_dir: String,
}

fn lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn get<'a>(ini: &'a Ini, key: &str) -> Result<&'a str, ConfigError> {
    ini.get_from(Some("crawl"), key)
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn get_int(ini: &Ini, key: &str) -> Result<i64, ConfigError> {
    get(ini, key)?
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), get(ini, key).unwrap().to_string()))
}

fn get_bool(ini: &Ini, key: &str) -> Result<bool, ConfigError> {
    match get(ini, key)?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(key.to_string(), other.to_string())),
    }
}

fn get_opt_list(ini: &Ini, key: &str) -> Vec<String> {
    ini.get_from(Some("crawl"), key)
        .map(lines)
        .unwrap_or_default()
}

fn get_opt_string(ini: &Ini, key: &str) -> Option<String> {
    ini.get_from(Some("crawl"), key)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_magic_number(hex: &str) -> Result<[u8; 4], ConfigError> {
    let hex = hex.trim();
    let bytes =
        hex::decode(hex).map_err(|e| ConfigError::InvalidValue("magic_number".into(), e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidValue("magic_number".into(), hex.to_string()))
}

fn parse_tor_proxies(raw: &[String]) -> Result<Vec<TorProxy>, ConfigError> {
    raw.iter()
        .map(|entry| {
            let (host, port) = entry
                .rsplit_once(':')
                .ok_or_else(|| ConfigError::InvalidValue("tor_proxies".into(), entry.clone()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue("tor_proxies".into(), entry.clone()))?;
            Ok(TorProxy {
                host: host.to_string(),
                port,
            })
        })
        .collect()
}

impl CrawlConfig {
    /// Loads and validates configuration from `path`, under the `[crawl]`
    /// section, with `role` selected by the CLI's second positional argument.
    pub fn load(path: &Path, role: Role) -> Result<Arc<CrawlConfig>, ConfigError> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| ConfigError::Unreadable(path.display().to_string(), e.to_string()))?;

        let ipv6_prefix = get_int(&ini, "ipv6_prefix")?;
        let ipv6_prefix: u8 = ipv6_prefix
            .try_into()
            .map_err(|_| ConfigError::InvalidValue("ipv6_prefix".into(), ipv6_prefix.to_string()))?;

        let tor_proxies = parse_tor_proxies(&get_opt_list(&ini, "tor_proxies"))?;

        let config = CrawlConfig {
            role,

            logfile: get(&ini, "logfile")?.to_string(),
            debug: get_bool(&ini, "debug")?,

            magic_number: parse_magic_number(get(&ini, "magic_number")?)?,
            port: get_int(&ini, "port")? as u16,
            db: get_int(&ini, "db")?,

            seeders: lines(get(&ini, "seeders")?),
            workers: get_int(&ini, "workers")? as usize,
            max_nodes: get_int(&ini, "max_nodes")? as usize,

            source_address: get(&ini, "source_address")?.to_string(),
            protocol_version: get_int(&ini, "protocol_version")? as u32,
            user_agent: get(&ini, "user_agent")?.to_string(),
            services: get_int(&ini, "services")? as u64,
            relay: get_int(&ini, "relay")? != 0,

            socket_timeout_secs: get_int(&ini, "socket_timeout")? as u64,
            cron_delay_secs: get_int(&ini, "cron_delay")? as u64,
            snapshot_delay_secs: get_int(&ini, "snapshot_delay")? as u64,

            addr_ttl_secs: get_int(&ini, "addr_ttl")? as u64,
            addr_ttl_var_pct: get_int(&ini, "addr_ttl_var")? as u32,
            max_age_secs: get_int(&ini, "max_age")?,
            peers_per_node: get_int(&ini, "peers_per_node")? as usize,

            ipv6: get_bool(&ini, "ipv6")?,
            ipv6_prefix,
            nodes_per_ipv6_prefix: get_int(&ini, "nodes_per_ipv6_prefix")? as u64,

            exclude_ipv4_networks: lines(get(&ini, "exclude_ipv4_networks")?),
            exclude_ipv6_networks: lines(get(&ini, "exclude_ipv6_networks")?),
            exclude_ipv4_bogons_from_urls: get_opt_list(&ini, "exclude_ipv4_bogons_from_urls"),
            exclude_ipv6_bogons_from_urls: get_opt_list(&ini, "exclude_ipv6_bogons_from_urls"),
            exclude_ipv4_networks_from_url: get_opt_string(&ini, "exclude_ipv4_networks_from_url"),
            exclude_ipv6_networks_from_url: get_opt_string(&ini, "exclude_ipv6_networks_from_url"),

            onion: get_bool(&ini, "onion")?,
            tor_proxies,
            onion_nodes: get_opt_list(&ini, "onion_nodes"),

            include_checked: get_bool(&ini, "include_checked")?,

            crawl_dir: get(&ini, "crawl_dir")?.to_string(),
        };

        Ok(Arc::new(config))
    }

    pub fn source_ip(&self) -> Option<IpAddr> {
        self.source_address.parse().ok()
    }
}
