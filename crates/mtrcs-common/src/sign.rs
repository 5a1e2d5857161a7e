use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::crypto::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// HTTP header carrying the hex-encoded HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// HMAC-SHA256 signer keyed by the pre-shared secret.
///
/// Constructed once at startup and handed to whatever needs to sign or verify
/// payloads.
///
/// # Examples
///
/// ```
/// use mtrcs_common::sign::Signer;
///
/// let signer = Signer::new("secret").unwrap();
/// let sig = signer.sign_hex(b"payload");
/// assert_eq!(sig.len(), 64);
/// assert!(signer.verify_hex(b"payload", &sig));
/// assert!(!signer.verify_hex(b"tampered", &sig));
/// ```
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, CryptoError> {
        let mac = HmacSha256::new_from_slice(key.as_ref()).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { mac })
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn sign_hex(&self, data: &[u8]) -> String {
        hex::encode(self.sign(data))
    }

    /// Constant-time check of a hex signature. Malformed hex never verifies.
    pub fn verify_hex(&self, data: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.verify_slice(&expected).is_ok()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Signer(..)")
    }
}
