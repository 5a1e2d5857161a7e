use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use ipnet::IpNet;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
    /// gRPC listener; the gRPC service is disabled when absent.
    #[serde(default)]
    pub grpc_addr: Option<SocketAddr>,
    #[serde(default = "default_file_storage_path")]
    pub file_storage_path: PathBuf,
    /// 0 rewrites the snapshot after every update, otherwise the snapshot is
    /// written every `store_interval_secs` seconds.
    #[serde(default = "default_store_interval")]
    pub store_interval_secs: u64,
    #[serde(default = "default_restore")]
    pub restore: bool,
    /// Selects the SQL backend when set (`postgres://...` or `sqlite://...`).
    #[serde(default)]
    pub database_dsn: Option<String>,
    /// Pre-shared HMAC key for request verification and response signing.
    #[serde(default)]
    pub key: Option<String>,
    /// Path to the PKCS#1 PEM private key for encrypted payloads.
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,
    #[serde(default)]
    pub trusted_subnet: Option<IpNet>,
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_file_storage_path() -> PathBuf {
    PathBuf::from("/tmp/metrics-db.json")
}

fn default_store_interval() -> u64 {
    300
}

fn default_restore() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            grpc_addr: None,
            file_storage_path: default_file_storage_path(),
            store_interval_secs: default_store_interval(),
            restore: default_restore(),
            database_dsn: None,
            key: None,
            crypto_key: None,
            trusted_subnet: None,
        }
    }
}

impl ServerConfig {
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
        Ok(config)
    }

    /// Overrides fields from environment-style variables supplied by `lookup`.
    /// Empty values clear optional settings.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        override_parsed(&lookup, "ADDRESS", &mut self.http_addr)?;
        override_optional(&lookup, "GRPC_ADDRESS", &mut self.grpc_addr)?;
        if let Some(v) = lookup("FILE_STORAGE_PATH") {
            self.file_storage_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "STORE_INTERVAL", &mut self.store_interval_secs)?;
        override_parsed(&lookup, "RESTORE", &mut self.restore)?;
        override_optional(&lookup, "DATABASE_DSN", &mut self.database_dsn)?;
        override_optional(&lookup, "KEY", &mut self.key)?;
        override_optional(&lookup, "CRYPTO_KEY", &mut self.crypto_key)?;
        override_optional(&lookup, "TRUSTED_SUBNET", &mut self.trusted_subnet)?;
        Ok(())
    }

    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval_secs)
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

fn override_optional<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    field: &mut Option<T>,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        let raw = raw.trim();
        *field = if raw.is_empty() {
            None
        } else {
            Some(raw.parse().map_err(|e| anyhow!("invalid {name}={raw:?}: {e}"))?)
        };
    }
    Ok(())
}
