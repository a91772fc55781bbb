//! Artifact verification using ed25519 signatures
//!
//! Cold verification parses the package, checks the payload digest against the
//! manifest and the manifest signature against the trusted key set. Continuous
//! verification (`reverify`) re-hashes the stored bytes and compares them with
//! the digest taken at cold verification time.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{DateTime, Utc};
use palisade_core::signing::{SigningError, TrustedKeys};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::manifest::{PluginMetadata, content_hash};
use crate::package::{MAX_PACKAGE_BYTES, PACKAGE_FORMAT, PluginPackage};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Package too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Malformed package: {0}")]
    Malformed(String),

    #[error("Unsupported package format {0}")]
    UnsupportedFormat(u32),

    #[error("Content hash mismatch for '{plugin_id}'")]
    DigestMismatch { plugin_id: String },

    #[error("Package for '{0}' is not signed")]
    MissingSignature(String),

    #[error("Package for '{0}' is signed by an untrusted key")]
    UntrustedKey(String),

    #[error("Signature check failed for '{0}'")]
    BadSignature(String),

    #[error("Artifact for '{0}' changed since it was verified")]
    Tampered(String),
}

impl VerificationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => "P100",
            Self::Malformed(_) => "P101",
            Self::UnsupportedFormat(_) => "P102",
            Self::DigestMismatch { .. } => "P103",
            Self::MissingSignature(_) => "P104",
            Self::UntrustedKey(_) => "P105",
            Self::BadSignature(_) => "P106",
            Self::Tampered(_) => "P107",
        }
    }
}

/// A package that passed cold verification
#[derive(Debug, Clone)]
pub struct VerifiedArtifact {
    pub metadata: Arc<PluginMetadata>,
    pub payload: Arc<[u8]>,
    /// SHA-256 over the full package bytes as they were verified
    pub package_digest: [u8; 32],
    pub verified_at: DateTime<Utc>,
}

impl VerifiedArtifact {
    pub fn plugin_id(&self) -> &str {
        &self.metadata.id
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactVerifier {
    trusted: TrustedKeys,
}

impl ArtifactVerifier {
    pub fn new(trusted: TrustedKeys) -> Self {
        Self { trusted }
    }

    /// Full verification of package bytes; fails closed
    pub fn verify(&self, bytes: &[u8]) -> Result<VerifiedArtifact, VerificationError> {
        if bytes.len() > MAX_PACKAGE_BYTES {
            return Err(VerificationError::TooLarge {
                size: bytes.len(),
                limit: MAX_PACKAGE_BYTES,
            });
        }

        let package = PluginPackage::from_bytes(bytes)
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;
        if package.format != PACKAGE_FORMAT {
            return Err(VerificationError::UnsupportedFormat(package.format));
        }

        let manifest = package.manifest;
        manifest
            .validate()
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;
        let plugin_id = manifest.id.clone();

        if manifest.content_hash != content_hash(&package.payload) {
            warn!(plugin_id = %plugin_id, "Payload digest does not match manifest");
            return Err(VerificationError::DigestMismatch { plugin_id });
        }

        let signature = manifest
            .signature
            .as_ref()
            .ok_or_else(|| VerificationError::MissingSignature(plugin_id.clone()))?;

        let public_key = BASE64_STANDARD
            .decode(&signature.public_key)
            .map_err(|_| VerificationError::BadSignature(plugin_id.clone()))?;
        let value = BASE64_STANDARD
            .decode(&signature.value)
            .map_err(|_| VerificationError::BadSignature(plugin_id.clone()))?;

        let digest = manifest
            .signing_digest()
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;

        self.trusted
            .verify(&public_key, &digest, &value)
            .map_err(|e| match e {
                SigningError::UntrustedKey => VerificationError::UntrustedKey(plugin_id.clone()),
                _ => VerificationError::BadSignature(plugin_id.clone()),
            })?;

        debug!(plugin_id = %plugin_id, version = %manifest.version, "Artifact verified");

        Ok(VerifiedArtifact {
            metadata: Arc::new(manifest),
            payload: package.payload.into(),
            package_digest: package_digest(bytes),
            verified_at: Utc::now(),
        })
    }

    /// Cheap continuous check against the bytes currently in storage
    pub fn reverify(
        &self,
        artifact: &VerifiedArtifact,
        current: &[u8],
    ) -> Result<(), VerificationError> {
        if package_digest(current) != artifact.package_digest {
            warn!(plugin_id = %artifact.plugin_id(), "Stored artifact changed after verification");
            return Err(VerificationError::Tampered(artifact.plugin_id().to_string()));
        }
        Ok(())
    }
}

fn package_digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::EntryPoint;
    use palisade_core::signing::PluginSigner;
    use proptest::prelude::*;
    use semver::Version;

    fn manifest() -> PluginMetadata {
        PluginMetadata {
            id: "sample".into(),
            name: "Sample".into(),
            version: Version::new(1, 0, 0),
            author: "Acme".into(),
            description: String::new(),
            min_api_level: 1,
            max_api_level: None,
            min_host_version: None,
            permissions: vec![],
            dependencies: vec![],
            allowed_hosts: vec![],
            entry_point: EntryPoint::Native("sample".into()),
            content_hash: String::new(),
            signature: None,
        }
    }

    fn sealed(signer: &PluginSigner) -> Vec<u8> {
        PluginPackage::seal(manifest(), b"payload bytes".to_vec(), signer)
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    fn verifier_for(signer: &PluginSigner) -> ArtifactVerifier {
        let mut trusted = TrustedKeys::new();
        trusted.add_bytes(&signer.verifying_key_bytes()).unwrap();
        ArtifactVerifier::new(trusted)
    }

    #[test]
    fn test_verify_sealed_package() {
        let signer = PluginSigner::generate();
        let artifact = verifier_for(&signer).verify(&sealed(&signer)).unwrap();
        assert_eq!(artifact.plugin_id(), "sample");
        assert_eq!(&*artifact.payload, b"payload bytes");
    }

    #[test]
    fn test_untrusted_signer_rejected() {
        let signer = PluginSigner::generate();
        let other = PluginSigner::generate();
        let err = verifier_for(&other).verify(&sealed(&signer)).unwrap_err();
        assert_eq!(err, VerificationError::UntrustedKey("sample".into()));
    }

    #[test]
    fn test_empty_trust_set_rejects_everything() {
        let signer = PluginSigner::generate();
        let verifier = ArtifactVerifier::new(TrustedKeys::new());
        assert!(verifier.verify(&sealed(&signer)).is_err());
    }

    #[test]
    fn test_missing_signature_rejected() {
        let signer = PluginSigner::generate();
        let mut package = PluginPackage::seal(manifest(), b"x".to_vec(), &signer).unwrap();
        package.manifest.signature = None;
        let err = verifier_for(&signer)
            .verify(&package.to_bytes().unwrap())
            .unwrap_err();
        assert_eq!(err, VerificationError::MissingSignature("sample".into()));
    }

    #[test]
    fn test_swapped_payload_rejected() {
        let signer = PluginSigner::generate();
        let mut package = PluginPackage::seal(manifest(), b"x".to_vec(), &signer).unwrap();
        package.payload = b"y".to_vec();
        let err = verifier_for(&signer)
            .verify(&package.to_bytes().unwrap())
            .unwrap_err();
        assert_eq!(err.code(), "P103");
    }

    #[test]
    fn test_escalated_permissions_break_signature() {
        let signer = PluginSigner::generate();
        let mut package = PluginPackage::seal(manifest(), b"x".to_vec(), &signer).unwrap();
        package
            .manifest
            .permissions
            .push(crate::manifest::Permission::Network);
        let err = verifier_for(&signer)
            .verify(&package.to_bytes().unwrap())
            .unwrap_err();
        assert_eq!(err, VerificationError::BadSignature("sample".into()));
    }

    #[test]
    fn test_reverify_detects_change() {
        let signer = PluginSigner::generate();
        let verifier = verifier_for(&signer);
        let bytes = sealed(&signer);
        let artifact = verifier.verify(&bytes).unwrap();

        assert!(verifier.reverify(&artifact, &bytes).is_ok());
        let mut changed = bytes.clone();
        changed.push(b' ');
        assert_eq!(
            verifier.reverify(&artifact, &changed),
            Err(VerificationError::Tampered("sample".into()))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_single_byte_mutation_fails_reverification(index in any::<prop::sample::Index>(), flip in 1u8..=255) {
            let signer = PluginSigner::generate();
            let verifier = verifier_for(&signer);
            let bytes = sealed(&signer);
            let artifact = verifier.verify(&bytes).unwrap();

            let mut mutated = bytes.clone();
            let i = index.index(mutated.len());
            mutated[i] ^= flip;

            prop_assert!(verifier.reverify(&artifact, &mutated).is_err());
            prop_assert!(verifier.verify(&mutated).is_err());
        }
    }
}
