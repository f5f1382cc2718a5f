//! Configuration for macy.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MACY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/macy/config.toml
//!   3. ~/.config/macy/config.toml
//!
//! [`MacyConfig`] is the raw, editable form. [`MacyConfig::validate`] turns it
//! into [`Settings`], the immutable value every component receives.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::wire::{MAX_DATAGRAM_V4, MAX_DATAGRAM_V6, MAX_FIELD_LEN};

/// Highest probe rate, in reports per second.
pub const MAX_RATE: u32 = 1_000_000_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MacyConfig {
    pub probe: ProbeConfig,
    pub filter: FilterConfig,
    pub log: LogConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Multicast group. Its family selects the transport.
    pub group: String,
    pub port: u32,
    /// Multicast TTL / hop limit.
    pub ttl: u32,
    /// Reports per second.
    pub rate: u32,
    /// DSCP code point, 0..=63.
    pub qos: u32,
    /// Allow reports to be fragmented on the path.
    pub fragments: bool,
    /// Pad every datagram to this many bytes. 0 = no padding.
    pub size: u32,
    /// Send from link-local addresses too.
    pub link_local: bool,
    /// Host name put in reports. Empty = OS host name up to the first '.'.
    pub host: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Case-insensitive regex on address strings. Empty = all.
    pub addresses: String,
    /// Case-insensitive regex on interface names. Empty = all.
    pub interfaces: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Local status port, bound on 127.0.0.1.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            group: "239.239.239.239".into(),
            port: 23923,
            ttl: 1,
            rate: 2,
            qos: 0,
            fragments: false,
            size: 0,
            link_local: false,
            host: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 23924,
        }
    }
}

// ── Validated settings ────────────────────────────────────────────────────────

/// Address family of the probe, fixed by the group address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    V4,
    V6,
}

impl Transport {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Transport::V4,
            IpAddr::V6(_) => Transport::V6,
        }
    }

    pub fn matches(self, addr: &IpAddr) -> bool {
        Transport::of(addr) == self
    }

    /// Largest UDP payload for this family.
    pub fn max_datagram(self) -> usize {
        match self {
            Transport::V4 => MAX_DATAGRAM_V4,
            Transport::V6 => MAX_DATAGRAM_V6,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::V4 => f.write_str("udp4"),
            Transport::V6 => f.write_str("udp6"),
        }
    }
}

/// Immutable runtime configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub group: IpAddr,
    pub port: u16,
    pub transport: Transport,
    pub ttl: u32,
    pub qos: u32,
    pub fragments: bool,
    pub size: Option<NonZeroUsize>,
    pub link_local: bool,
    pub address_filter: Regex,
    pub interface_filter: Regex,
    /// Time between probe cycles.
    pub period: Duration,
    /// Host name carried in every report.
    pub host: String,
    /// Local status API port, None when disabled.
    pub api_port: Option<u16>,
}

impl Settings {
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(self.group, self.port)
    }

    /// Value for the IP TOS / IPv6 traffic class byte.
    pub fn traffic_class(&self) -> u32 {
        self.qos << 2
    }
}

/// OS host name up to the first '.'.
pub fn short_hostname(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("macy")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {1}", .0.display())]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {}: {1}", .0.display())]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {}: {1}", .0.display())]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),

    #[error("group {0:?} is not a multicast address")]
    NotMulticast(String),
    #[error("port {0} is outside 1..=65535")]
    InvalidPort(u32),
    #[error("ttl {0} is outside 0..=255")]
    InvalidTtl(u32),
    #[error("rate {0} is outside 1..=1000000000 reports per second")]
    InvalidRate(u32),
    #[error("qos {0} is outside 0..=63")]
    InvalidQos(u32),
    #[error("size {size} is outside 0..={max} for {transport}")]
    InvalidSize {
        size: u32,
        max: usize,
        transport: Transport,
    },
    #[error("invalid {which} filter: {source}")]
    InvalidRegex {
        which: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("host name {0:?} must be 1..={} bytes", MAX_FIELD_LEN)]
    InvalidHost(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MacyConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read a config file, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(MacyConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MACY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&MacyConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply MACY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = var("MACY_PROBE__GROUP") {
            self.probe.group = v;
        }
        if let Some(v) = var("MACY_PROBE__PORT").and_then(|v| v.parse().ok()) {
            self.probe.port = v;
        }
        if let Some(v) = var("MACY_PROBE__TTL").and_then(|v| v.parse().ok()) {
            self.probe.ttl = v;
        }
        if let Some(v) = var("MACY_PROBE__RATE").and_then(|v| v.parse().ok()) {
            self.probe.rate = v;
        }
        if let Some(v) = var("MACY_PROBE__QOS").and_then(|v| v.parse().ok()) {
            self.probe.qos = v;
        }
        if let Some(v) = var("MACY_PROBE__FRAGMENTS") {
            self.probe.fragments = flag(v);
        }
        if let Some(v) = var("MACY_PROBE__SIZE").and_then(|v| v.parse().ok()) {
            self.probe.size = v;
        }
        if let Some(v) = var("MACY_PROBE__LINK_LOCAL") {
            self.probe.link_local = flag(v);
        }
        if let Some(v) = var("MACY_PROBE__HOST") {
            self.probe.host = v;
        }
        if let Some(v) = var("MACY_FILTER__ADDRESSES") {
            self.filter.addresses = v;
        }
        if let Some(v) = var("MACY_FILTER__INTERFACES") {
            self.filter.interfaces = v;
        }
        if let Some(v) = var("MACY_LOG__VERBOSE") {
            self.log.verbose = flag(v);
        }
        if let Some(v) = var("MACY_API__ENABLED") {
            self.api.enabled = flag(v);
        }
        if let Some(v) = var("MACY_API__PORT").and_then(|v| v.parse().ok()) {
            self.api.port = v;
        }
    }

    /// Check every field and build the runtime settings.
    ///
    /// `os_host` is used when `probe.host` is empty, truncated at the first '.'.
    pub fn validate(&self, os_host: &str) -> Result<Settings, ConfigError> {
        let probe = &self.probe;

        let group: IpAddr = probe
            .group
            .parse()
            .map_err(|_| ConfigError::NotMulticast(probe.group.clone()))?;
        if !group.is_multicast() {
            return Err(ConfigError::NotMulticast(probe.group.clone()));
        }
        let transport = Transport::of(&group);

        let port = u16::try_from(probe.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ConfigError::InvalidPort(probe.port))?;

        if probe.ttl > 255 {
            return Err(ConfigError::InvalidTtl(probe.ttl));
        }
        if probe.ttl <= 1 {
            tracing::warn!(
                ttl = probe.ttl,
                "reports will not be forwarded beyond the attached subnets"
            );
        }

        // Above one per nanosecond the period rounds down to zero.
        if probe.rate < 1 || probe.rate > MAX_RATE {
            return Err(ConfigError::InvalidRate(probe.rate));
        }
        if probe.qos > 63 {
            return Err(ConfigError::InvalidQos(probe.qos));
        }

        let max = transport.max_datagram();
        if probe.size as usize > max {
            return Err(ConfigError::InvalidSize {
                size: probe.size,
                max,
                transport,
            });
        }

        let address_filter = compile_filter("address", &self.filter.addresses)?;
        let interface_filter = compile_filter("interface", &self.filter.interfaces)?;

        let host = if probe.host.is_empty() {
            short_hostname(os_host)
        } else {
            probe.host.as_str()
        };
        if host.is_empty() || host.len() > MAX_FIELD_LEN {
            return Err(ConfigError::InvalidHost(host.to_string()));
        }

        Ok(Settings {
            group,
            port,
            transport,
            ttl: probe.ttl,
            qos: probe.qos,
            fragments: probe.fragments,
            size: NonZeroUsize::new(probe.size as usize),
            link_local: probe.link_local,
            address_filter,
            interface_filter,
            period: Duration::from_secs(1) / probe.rate,
            host: host.to_string(),
            api_port: self.api.enabled.then_some(self.api.port),
        })
    }
}

fn compile_filter(which: &'static str, pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::InvalidRegex { which, source })
}
