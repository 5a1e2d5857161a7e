//! RSA payload encryption between agent and server.
//!
//! PKCS#1 v1.5 caps one block at `k - 11` bytes of plaintext for a `k`-byte
//! modulus, so payloads are split into consecutive blocks. The ciphertext is the
//! concatenation of the encrypted blocks, each exactly `k` bytes long.

use std::path::Path;

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

/// HTTP header announcing an encrypted body, and its only accepted value.
pub const ENCRYPTION_HEADER: &str = "Encryption";
pub const ENCRYPTION_VALUE: &str = "crypto-key";

const PKCS1_OVERHEAD: usize = 11;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid signing key")]
    InvalidKey,
    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid PEM key: {0}")]
    Pem(#[from] rsa::pkcs1::Error),
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("ciphertext length {len} is not a multiple of the {block}-byte block size")]
    Truncated { len: usize, block: usize },
}

fn read_pem(path: &Path) -> Result<String, CryptoError> {
    std::fs::read_to_string(path).map_err(|source| CryptoError::KeyFile {
        path: path.display().to_string(),
        source,
    })
}

/// Agent side: encrypts with the server's public key.
#[derive(Debug, Clone)]
pub struct PayloadEncryptor {
    key: RsaPublicKey,
}

impl PayloadEncryptor {
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            key: RsaPublicKey::from_pkcs1_pem(pem)?,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let k = self.key.size();
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(plain.len().div_ceil(k - PKCS1_OVERHEAD) * k);
        for chunk in plain.chunks(k - PKCS1_OVERHEAD) {
            out.extend(self.key.encrypt(&mut rng, Pkcs1v15Encrypt, chunk)?);
        }
        Ok(out)
    }
}

/// Server side: decrypts with the private key.
#[derive(Debug, Clone)]
pub struct PayloadDecryptor {
    key: RsaPrivateKey,
}

impl PayloadDecryptor {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        Ok(Self::new(RsaPrivateKey::from_pkcs1_pem(pem)?))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    pub fn encryptor(&self) -> PayloadEncryptor {
        PayloadEncryptor {
            key: self.key.to_public_key(),
        }
    }

    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let k = self.key.size();
        if cipher.len() % k != 0 {
            return Err(CryptoError::Truncated {
                len: cipher.len(),
                block: k,
            });
        }
        let mut out = Vec::with_capacity(cipher.len());
        for block in cipher.chunks(k) {
            out.extend(self.key.decrypt(Pkcs1v15Encrypt, block)?);
        }
        Ok(out)
    }
}
