//! Fixtures shared by unit tests

use palisade_core::signing::{PluginSigner, TrustedKeys};
use semver::{Version, VersionReq};

use crate::manifest::{Dependency, EntryPoint, Permission, PluginMetadata};
use crate::package::PluginPackage;
use crate::resolver::HostInfo;
use crate::verifier::ArtifactVerifier;

pub(crate) fn host() -> HostInfo {
    HostInfo {
        api_level: 1,
        app_version: Version::new(1, 0, 0),
    }
}

pub(crate) fn metadata(id: &str, version: &str) -> PluginMetadata {
    PluginMetadata {
        id: id.to_string(),
        name: id.to_uppercase(),
        version: Version::parse(version).unwrap(),
        author: "Acme".into(),
        description: String::new(),
        min_api_level: 1,
        max_api_level: None,
        min_host_version: None,
        permissions: vec![Permission::Logging],
        dependencies: vec![],
        allowed_hosts: vec![],
        entry_point: EntryPoint::Native("echo".into()),
        content_hash: String::new(),
        signature: None,
    }
}

pub(crate) fn depends_on(mut metadata: PluginMetadata, id: &str, req: &str) -> PluginMetadata {
    metadata.dependencies.push(Dependency {
        id: id.to_string(),
        version_req: VersionReq::parse(req).unwrap(),
    });
    metadata
}

/// A signing key plus the verifier that trusts it
pub(crate) struct Publisher {
    signer: PluginSigner,
}

impl Publisher {
    pub(crate) fn new() -> Self {
        Self {
            signer: PluginSigner::generate(),
        }
    }

    pub(crate) fn trusted(&self) -> TrustedKeys {
        let mut trusted = TrustedKeys::new();
        trusted.add_bytes(&self.signer.verifying_key_bytes()).unwrap();
        trusted
    }

    pub(crate) fn verifier(&self) -> ArtifactVerifier {
        ArtifactVerifier::new(self.trusted())
    }

    pub(crate) fn seal(&self, metadata: PluginMetadata, payload: &[u8]) -> Vec<u8> {
        PluginPackage::seal(metadata, payload.to_vec(), &self.signer)
            .unwrap()
            .to_bytes()
            .unwrap()
    }
}
