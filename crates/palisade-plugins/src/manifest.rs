//! Plugin manifest (`plugin.json`) parsing and validation

use std::collections::HashSet;
use std::fmt;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Manifests larger than this are rejected before parsing
pub const MAX_MANIFEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Manifest too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid manifest JSON: {0}")]
    InvalidJson(String),

    #[error("Manifest field '{0}' cannot be empty")]
    EmptyField(&'static str),

    #[error("Invalid plugin id '{0}': use lowercase letters, digits, '.', '-' or '_'")]
    InvalidId(String),

    #[error("Duplicate permission '{0}'")]
    DuplicatePermission(Permission),

    #[error("Duplicate dependency '{0}'")]
    DuplicateDependency(String),

    #[error("Plugin '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Invalid API level window: min {min} > max {max}")]
    InvalidApiWindow { min: u32, max: u32 },

    #[error("Invalid entry point '{0}': expected 'native:<name>' or 'wasm'")]
    InvalidEntryPoint(String),

    #[error("Invalid content hash '{0}': expected 'sha256:<64 hex chars>'")]
    InvalidContentHash(String),
}

/// Capabilities a plugin may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadFiles,
    WriteFiles,
    Network,
    Messaging,
    Logging,
    SystemInfo,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadFiles => "read_files",
            Self::WriteFiles => "write_files",
            Self::Network => "network",
            Self::Messaging => "messaging",
            Self::Logging => "logging",
            Self::SystemInfo => "system_info",
        }
    }

    /// Permissions that require a threat scan before the plugin is enabled
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Network | Self::WriteFiles)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the host instantiates the plugin
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntryPoint {
    /// A constructor registered with the host under this name
    Native(String),
    /// The package payload is a WebAssembly module
    Wasm,
}

impl TryFrom<String> for EntryPoint {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "wasm" {
            return Ok(Self::Wasm);
        }
        match value.strip_prefix("native:") {
            Some(name)
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')) =>
            {
                Ok(Self::Native(name.to_string()))
            }
            _ => Err(ManifestError::InvalidEntryPoint(value)),
        }
    }
}

impl From<EntryPoint> for String {
    fn from(value: EntryPoint) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(name) => write!(f, "native:{name}"),
            Self::Wasm => f.write_str("wasm"),
        }
    }
}

/// A declared library dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependency {
    pub id: String,
    pub version_req: VersionReq,
}

/// Detached ed25519 signature over the manifest, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestSignature {
    pub public_key: String,
    pub value: String,
}

/// Immutable plugin metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub author: String,
    #[serde(default)]
    pub description: String,
    pub min_api_level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_api_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<Version>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    pub entry_point: EntryPoint,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<ManifestSignature>,
}

impl PluginMetadata {
    /// Parse and validate a manifest from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.len() > MAX_MANIFEST_BYTES {
            return Err(ManifestError::TooLarge {
                size: bytes.len(),
                limit: MAX_MANIFEST_BYTES,
            });
        }

        let manifest: Self =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::InvalidJson(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks that do not depend on the payload or keys
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::EmptyField("id"));
        }
        if self.name.trim().is_empty() {
            return Err(ManifestError::EmptyField("name"));
        }
        if self.author.trim().is_empty() {
            return Err(ManifestError::EmptyField("author"));
        }
        if !is_valid_id(&self.id) {
            return Err(ManifestError::InvalidId(self.id.clone()));
        }

        match self.max_api_level {
            Some(max) if max < self.min_api_level => {
                return Err(ManifestError::InvalidApiWindow {
                    min: self.min_api_level,
                    max,
                });
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for permission in &self.permissions {
            if !seen.insert(permission) {
                return Err(ManifestError::DuplicatePermission(*permission));
            }
        }

        let mut deps = HashSet::new();
        for dependency in &self.dependencies {
            if !is_valid_id(&dependency.id) {
                return Err(ManifestError::InvalidId(dependency.id.clone()));
            }
            if dependency.id == self.id {
                return Err(ManifestError::SelfDependency(self.id.clone()));
            }
            if !deps.insert(dependency.id.as_str()) {
                return Err(ManifestError::DuplicateDependency(dependency.id.clone()));
            }
        }

        if !self.content_hash.is_empty() && !is_valid_content_hash(&self.content_hash) {
            return Err(ManifestError::InvalidContentHash(self.content_hash.clone()));
        }

        Ok(())
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Declared permissions that need a threat scan before enabling
    pub fn sensitive_permissions(&self) -> Vec<Permission> {
        self.permissions
            .iter()
            .copied()
            .filter(Permission::is_sensitive)
            .collect()
    }

    /// SHA-256 over the canonical JSON of this manifest without its signature.
    ///
    /// This is the message publishers sign.
    pub fn signing_digest(&self) -> Result<[u8; 32], ManifestError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let serialized =
            serde_json::to_vec(&unsigned).map_err(|e| ManifestError::InvalidJson(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(serialized);
        Ok(hasher.finalize().into())
    }
}

/// `sha256:<hex>` digest of a payload, in manifest form
pub fn content_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
        && !id.starts_with('.')
        && !id.contains("..")
}

fn is_valid_content_hash(value: &str) -> bool {
    value
        .strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json() -> serde_json::Value {
        serde_json::json!({
            "id": "weather",
            "name": "Weather",
            "version": "1.2.0",
            "author": "Acme",
            "min_api_level": 1,
            "permissions": ["network", "logging"],
            "dependencies": [{ "id": "libx", "version_req": ">=2.0, <3.0" }],
            "allowed_hosts": ["*.weather.example"],
            "entry_point": "native:weather"
        })
    }

    #[test]
    fn test_parse_valid_manifest() {
        let bytes = serde_json::to_vec(&manifest_json()).unwrap();
        let manifest = PluginMetadata::from_json(&bytes).unwrap();

        assert_eq!(manifest.id, "weather");
        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert_eq!(manifest.entry_point, EntryPoint::Native("weather".into()));
        assert!(manifest.has_permission(Permission::Network));
        assert_eq!(manifest.sensitive_permissions(), vec![Permission::Network]);
        assert!(
            manifest.dependencies[0]
                .version_req
                .matches(&Version::new(2, 4, 0))
        );
    }

    #[test]
    fn test_duplicate_permissions_rejected() {
        let mut json = manifest_json();
        json["permissions"] = serde_json::json!(["network", "network"]);
        let err = PluginMetadata::from_json(&serde_json::to_vec(&json).unwrap()).unwrap_err();
        assert_eq!(err, ManifestError::DuplicatePermission(Permission::Network));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut json = manifest_json();
        json["dependencies"] = serde_json::json!([{ "id": "weather", "version_req": "*" }]);
        let err = PluginMetadata::from_json(&serde_json::to_vec(&json).unwrap()).unwrap_err();
        assert_eq!(err, ManifestError::SelfDependency("weather".into()));
    }

    #[test]
    fn test_empty_field_rejected() {
        let mut json = manifest_json();
        json["author"] = serde_json::json!("  ");
        let err = PluginMetadata::from_json(&serde_json::to_vec(&json).unwrap()).unwrap_err();
        assert_eq!(err, ManifestError::EmptyField("author"));
    }

    #[test]
    fn test_bad_entry_point_rejected() {
        let mut json = manifest_json();
        json["entry_point"] = serde_json::json!("java:com.example.Main");
        let err = PluginMetadata::from_json(&serde_json::to_vec(&json).unwrap()).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidJson(_)));
    }

    #[test]
    fn test_oversized_manifest_rejected() {
        let bytes = vec![b' '; MAX_MANIFEST_BYTES + 1];
        assert!(matches!(
            PluginMetadata::from_json(&bytes),
            Err(ManifestError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_api_window() {
        let mut json = manifest_json();
        json["min_api_level"] = serde_json::json!(5);
        json["max_api_level"] = serde_json::json!(3);
        let err = PluginMetadata::from_json(&serde_json::to_vec(&json).unwrap()).unwrap_err();
        assert_eq!(err, ManifestError::InvalidApiWindow { min: 5, max: 3 });
    }

    #[test]
    fn test_signing_digest_ignores_signature() {
        let bytes = serde_json::to_vec(&manifest_json()).unwrap();
        let mut manifest = PluginMetadata::from_json(&bytes).unwrap();
        let before = manifest.signing_digest().unwrap();

        manifest.signature = Some(ManifestSignature {
            public_key: "k".into(),
            value: "v".into(),
        });
        assert_eq!(before, manifest.signing_digest().unwrap());

        manifest.permissions.push(Permission::WriteFiles);
        assert_ne!(before, manifest.signing_digest().unwrap());
    }

    #[test]
    fn test_content_hash_format() {
        let hash = content_hash(b"abc");
        assert_eq!(
            hash,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(is_valid_content_hash(&hash));
        assert!(!is_valid_content_hash("md5:abc"));
    }
}
