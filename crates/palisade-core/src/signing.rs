//! Ed25519 signing for plugin artifact integrity
//!
//! Publishers sign artifacts with a [`PluginSigner`]; the host verifies them
//! against the set of keys it has been configured to trust ([`TrustedKeys`]).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::error::Error;

/// Size of Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Size of Ed25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of Ed25519 private key in bytes
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Errors that can occur during signing operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength { expected: usize, actual: usize },

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Public key is not in the trusted key set")]
    UntrustedKey,

    #[error("Invalid key encoding: {0}")]
    InvalidEncoding(String),
}

/// Ed25519 signing key held by a plugin publisher
#[derive(Debug)]
pub struct PluginSigner {
    signing_key: SigningKey,
}

impl PluginSigner {
    /// Generate a new random signing key pair
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; PRIVATE_KEY_SIZE];
        OsRng.fill_bytes(&mut secret_bytes);
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        Self { signing_key }
    }

    /// Create a signer from raw private key bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SigningError> {
        let key_bytes: [u8; PRIVATE_KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| SigningError::InvalidKeyLength {
                    expected: PRIVATE_KEY_SIZE,
                    actual: bytes.len(),
                })?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// Create a signer from a base64-encoded private key
    pub fn from_base64(encoded: &str) -> Result<Self, SigningError> {
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| SigningError::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Export the private key bytes (use carefully!)
    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.signing_key.to_bytes()
    }

    /// Get the public verifying key bytes
    pub fn verifying_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key in the base64 form used by `trust.keys`
    pub fn public_key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.verifying_key_bytes())
    }

    /// Sign arbitrary data
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

/// The set of publisher keys the host accepts signatures from
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: Vec<VerifyingKey>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse base64-encoded public keys, as stored in configuration
    pub fn from_base64<S: AsRef<str>>(encoded: &[S]) -> crate::Result<Self> {
        let mut trusted = Self::new();
        for key in encoded {
            let bytes = BASE64_STANDARD
                .decode(key.as_ref().trim())
                .map_err(|e| Error::InvalidKey(format!("bad encoding: {e}")))?;
            trusted
                .add_bytes(&bytes)
                .map_err(|e| Error::InvalidKey(e.to_string()))?;
        }
        Ok(trusted)
    }

    /// Add a raw 32-byte public key
    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<(), SigningError> {
        let key = parse_verifying_key(bytes)?;
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the given raw public key is trusted
    pub fn contains(&self, public_key: &[u8]) -> bool {
        self.keys.iter().any(|k| k.as_bytes().as_slice() == public_key)
    }

    /// Verify `signature` over `data` using `public_key`, which must be trusted
    pub fn verify(
        &self,
        public_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SigningError> {
        let key = parse_verifying_key(public_key)?;
        if !self.keys.contains(&key) {
            return Err(SigningError::UntrustedKey);
        }

        let sig_bytes: [u8; SIGNATURE_SIZE] =
            signature
                .try_into()
                .map_err(|_| SigningError::InvalidSignatureLength {
                    expected: SIGNATURE_SIZE,
                    actual: signature.len(),
                })?;

        key.verify(data, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SigningError::VerificationFailed)
    }
}

fn parse_verifying_key(bytes: &[u8]) -> Result<VerifyingKey, SigningError> {
    let key_bytes: [u8; PUBLIC_KEY_SIZE] =
        bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            })?;

    VerifyingKey::from_bytes(&key_bytes).map_err(|_| SigningError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_trusted() {
        let signer = PluginSigner::generate();
        let mut trusted = TrustedKeys::new();
        trusted.add_bytes(&signer.verifying_key_bytes()).unwrap();

        let sig = signer.sign(b"payload");
        assert!(
            trusted
                .verify(&signer.verifying_key_bytes(), b"payload", &sig)
                .is_ok()
        );
    }

    #[test]
    fn test_untrusted_key_rejected() {
        let signer = PluginSigner::generate();
        let trusted = TrustedKeys::new();

        let sig = signer.sign(b"payload");
        assert_eq!(
            trusted.verify(&signer.verifying_key_bytes(), b"payload", &sig),
            Err(SigningError::UntrustedKey)
        );
    }

    #[test]
    fn test_tampered_data_rejected() {
        let signer = PluginSigner::generate();
        let mut trusted = TrustedKeys::new();
        trusted.add_bytes(&signer.verifying_key_bytes()).unwrap();

        let sig = signer.sign(b"payload");
        assert_eq!(
            trusted.verify(&signer.verifying_key_bytes(), b"payloae", &sig),
            Err(SigningError::VerificationFailed)
        );
    }

    #[test]
    fn test_wrong_signature_length() {
        let signer = PluginSigner::generate();
        let mut trusted = TrustedKeys::new();
        trusted.add_bytes(&signer.verifying_key_bytes()).unwrap();

        let err = trusted
            .verify(&signer.verifying_key_bytes(), b"payload", &[0u8; 10])
            .unwrap_err();
        assert_eq!(
            err,
            SigningError::InvalidSignatureLength {
                expected: SIGNATURE_SIZE,
                actual: 10
            }
        );
    }

    #[test]
    fn test_signer_roundtrip_through_bytes() {
        let signer = PluginSigner::generate();
        let restored = PluginSigner::from_bytes(&signer.to_bytes()).unwrap();
        assert_eq!(signer.verifying_key_bytes(), restored.verifying_key_bytes());

        assert!(PluginSigner::from_bytes(&[1u8; 5]).is_err());
    }

    #[test]
    fn test_trusted_keys_from_base64() {
        let signer = PluginSigner::generate();
        let trusted = TrustedKeys::from_base64(&[signer.public_key_base64()]).unwrap();
        assert_eq!(trusted.len(), 1);
        assert!(trusted.contains(&signer.verifying_key_bytes()));

        let err = TrustedKeys::from_base64(&["AAAA"]).unwrap_err();
        assert_eq!(err.code(), "E900");
    }

    #[test]
    fn test_duplicate_keys_collapse() {
        let signer = PluginSigner::generate();
        let key = signer.public_key_base64();
        let trusted = TrustedKeys::from_base64(&[key.clone(), key]).unwrap();
        assert_eq!(trusted.len(), 1);
    }
}
