use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use mtrcs_common::crypto::PayloadDecryptor;
use mtrcs_common::sign::Signer;
use mtrcs_storage::Storage;

use crate::config::ServerConfig;

/// Shared by every HTTP handler, middleware and the gRPC service.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub signer: Option<Arc<Signer>>,
    pub decryptor: Option<Arc<PayloadDecryptor>>,
    pub trusted_subnet: Option<IpNet>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Builds the request-facing state from `config`, loading the HMAC key and
    /// the RSA private key when configured.
    pub fn new(storage: Arc<dyn Storage>, config: ServerConfig) -> anyhow::Result<Self> {
        let signer = config
            .key
            .as_deref()
            .map(Signer::new)
            .transpose()?
            .map(Arc::new);
        let decryptor = config
            .crypto_key
            .as_ref()
            .map(PayloadDecryptor::from_file)
            .transpose()?
            .map(Arc::new);
        Ok(Self {
            storage,
            signer,
            decryptor,
            trusted_subnet: config.trusted_subnet,
            config: Arc::new(config),
        })
    }

    /// Whether a caller claiming `source` may submit metrics. Always true when
    /// no subnet is configured.
    pub fn is_trusted(&self, source: Option<&str>) -> bool {
        let Some(subnet) = &self.trusted_subnet else {
            return true;
        };
        source
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
            .is_some_and(|ip| subnet.contains(&ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtrcs_storage::MemStorage;

    fn state_with_subnet(subnet: Option<&str>) -> AppState {
        let config = ServerConfig {
            trusted_subnet: subnet.map(|s| s.parse().unwrap()),
            ..Default::default()
        };
        AppState::new(Arc::new(MemStorage::new()), config).unwrap()
    }

    #[test]
    fn everyone_is_trusted_without_subnet() {
        let state = state_with_subnet(None);
        assert!(state.is_trusted(None));
        assert!(state.is_trusted(Some("203.0.113.7")));
    }

    #[test]
    fn subnet_membership() {
        let state = state_with_subnet(Some("10.1.0.0/16"));
        assert!(state.is_trusted(Some("10.1.2.3")));
        assert!(!state.is_trusted(Some("10.2.0.1")));
        assert!(!state.is_trusted(Some("not-an-ip")));
        assert!(!state.is_trusted(None));
    }

    #[test]
    fn missing_key_file_fails() {
        let config = ServerConfig {
            crypto_key: Some("/nonexistent/private.pem".into()),
            ..Default::default()
        };
        assert!(AppState::new(Arc::new(MemStorage::new()), config).is_err());
    }
}
