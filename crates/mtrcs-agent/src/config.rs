use std::net::{IpAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::Deserialize;

/// Wire protocol used to reach the collector server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Grpc,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "grpc" => Ok(TransportKind::Grpc),
            other => Err(anyhow!("unknown transport: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// `host:port` of the collector server, without scheme.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    /// Worker count; also the number of batches that may be queued or in flight.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    /// Pre-shared HMAC key. Requests are signed when set.
    #[serde(default)]
    pub key: Option<String>,
    /// Path to the server's PKCS#1 PEM public key. Bodies are encrypted when set.
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,
    /// Address reported as `X-Real-IP`; detected when absent.
    #[serde(default)]
    pub real_ip: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_server_addr() -> String {
    "localhost:8080".to_string()
}

fn default_poll_interval() -> u64 {
    2
}

fn default_report_interval() -> u64 {
    10
}

fn default_rate_limit() -> usize {
    1
}

fn default_request_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            transport: TransportKind::default(),
            poll_interval_secs: default_poll_interval(),
            report_interval_secs: default_report_interval(),
            rate_limit: default_rate_limit(),
            key: None,
            crypto_key: None,
            real_ip: None,
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl AgentConfig {
    /// Reads the TOML file at `path` (a missing file means all defaults) and
    /// applies environment overrides.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config: Self = if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!(path, "Config file not found, using defaults");
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment-style variables supplied by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("ADDRESS") {
            self.server_addr = v;
        }
        if let Some(v) = lookup("TRANSPORT") {
            self.transport = v.parse()?;
        }
        override_parsed(&lookup, "POLL_INTERVAL", &mut self.poll_interval_secs)?;
        override_parsed(&lookup, "REPORT_INTERVAL", &mut self.report_interval_secs)?;
        override_parsed(&lookup, "RATE_LIMIT", &mut self.rate_limit)?;
        if let Some(v) = lookup("KEY") {
            self.key = Some(v).filter(|k| !k.is_empty());
        }
        if let Some(v) = lookup("CRYPTO_KEY") {
            self.crypto_key = Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Some(v) = lookup("REAL_IP") {
            self.real_ip = Some(v).filter(|ip| !ip.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 || self.report_interval_secs == 0 {
            bail!("poll and report intervals must be positive");
        }
        if self.rate_limit == 0 {
            bail!("rate_limit must be at least 1");
        }
        if self.server_addr.contains("://") {
            bail!("server_addr must be host:port without a scheme");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Configured source address, or the detected outbound IPv4 address.
    pub fn source_ip(&self) -> Option<String> {
        self.real_ip
            .clone()
            .or_else(|| detect_local_ip().map(|ip| ip.to_string()))
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    field: &mut T,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *field = raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {name}={raw:?}: {e}"))?;
    }
    Ok(())
}

/// Address of the interface the OS would route external traffic through.
/// Connecting a UDP socket sends no packets.
fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
