//! Declarative configuration: resources are populated from declared
//! input, with defaults applied per field rather than at the
//! top-level struct, plus the binary's own CLI (`Cli`/`Config::load`).
//!
//! A full resource declaration language is out of scope; this module
//! instead models the *demo* graph `main.rs` assembles, as plain TOML
//! structs deserialized directly into resource constructor arguments.

use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Deserialize, Debug, Clone, Copy)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }

    /// Whether resource `Services` should run in debug mode (spec §6's
    /// `debug` flag passed to every `init`).
    pub fn is_debug(&self) -> bool {
        matches!(self, Self::Debug | Self::Trace)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

/// Engine-level knobs — not declared resource state (§6: "no flag or
/// environment variable is consumed by the core" describes the
/// *resources*, not the binary assembling them).
#[derive(Deserialize, Debug)]
pub struct Engine {
    #[serde(default = "Engine::poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    #[serde(default = "Engine::var_dir")]
    pub var_dir: PathBuf,
}

impl Engine {
    fn poll_interval_seconds() -> u64 {
        30
    }

    fn var_dir() -> PathBuf {
        PathBuf::from("/var/lib/mgmtd")
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            poll_interval_seconds: Self::poll_interval_seconds(),
            var_dir: Self::var_dir(),
        }
    }
}

/// A DHCPv4 server declaration (spec §3 "server").
#[derive(Deserialize, Debug, Clone)]
pub struct DhcpServerConfig {
    pub name: String,
    pub listen: SocketAddrV4,
    pub interface: String,

    /// `None`: derive from the listen address. `Some("")`: suppress
    /// the option. `Some(addr)`: explicit value (spec §4.5's
    /// `serverId` sub-state machine).
    #[serde(default)]
    pub server_id: Option<String>,

    #[serde(default = "DhcpServerConfig::default_lease_seconds")]
    pub default_lease_seconds: u32,

    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,

    #[serde(default)]
    pub routers: Vec<Ipv4Addr>,
}

impl DhcpServerConfig {
    fn default_lease_seconds() -> u32 {
        3600
    }
}

/// A static host declaration (spec §3 "host").
#[derive(Deserialize, Debug, Clone)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub server: Option<String>,
    pub mac: String,
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
    #[serde(default)]
    pub boot_file: Option<String>,
}

/// A dynamic range declaration (spec §3 "range").
#[derive(Deserialize, Debug, Clone)]
pub struct RangeConfig {
    pub name: String,
    #[serde(default)]
    pub server: Option<String>,
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
    pub mask: Ipv4Addr,
    #[serde(default)]
    pub skip: Vec<Ipv4Addr>,
    #[serde(default = "RangeConfig::default_lease_seconds")]
    pub lease_seconds: u64,

    /// Parsed but never implemented: persistent lease storage across
    /// restarts. `Config::validate` rejects `persist = true` rather
    /// than silently ignoring it.
    #[serde(default)]
    pub persist: bool,
}

impl RangeConfig {
    fn default_lease_seconds() -> u64 {
        3600
    }
}

/// An HTTP caching proxy declaration (spec §3 "HTTP proxy resource").
#[derive(Deserialize, Debug, Clone)]
pub struct HttpCacheConfig {
    pub name: String,
    pub public_path: String,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub head: String,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub engine: Engine,

    #[serde(default)]
    pub dhcp_servers: Vec<DhcpServerConfig>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub ranges: Vec<RangeConfig>,
    #[serde(default)]
    pub http_caches: Vec<HttpCacheConfig>,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters; if a configuration file path is
    /// specified, read it, otherwise use the default configuration
    /// (an empty demo graph).
    pub fn load() -> anyhow::Result<Self> {
        let cfg_str = Cli::parse()
            .config
            .map(fs::read_to_string)
            .transpose()?
            .unwrap_or_default();

        let config: Config = toml::from_str(&cfg_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects declared-but-unimplemented surface: persistent lease
    /// storage. Everything else `validate()` would reject belongs to
    /// the individual resources' own `validate()`, called later at
    /// engine build time.
    pub fn validate(&self) -> Result<()> {
        for range in &self.ranges {
            if range.persist {
                return Err(Error::configuration_invalid(format!(
                    "range {}: persisted leases not yet supported",
                    range.name
                )));
            }
        }
        Ok(())
    }
}
