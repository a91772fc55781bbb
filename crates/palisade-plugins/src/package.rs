//! Plugin package wire format
//!
//! A package is one JSON document holding the manifest and the base64 payload
//! (a wasm module, or an opaque blob handed to a native entry point).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use palisade_core::signing::PluginSigner;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::manifest::{ManifestError, ManifestSignature, PluginMetadata, content_hash};

/// Current package format
pub const PACKAGE_FORMAT: u32 = 1;

/// Packages larger than this are rejected before parsing
pub const MAX_PACKAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginPackage {
    pub format: u32,
    pub manifest: PluginMetadata,
    #[serde(serialize_with = "encode_payload", deserialize_with = "decode_payload")]
    pub payload: Vec<u8>,
}

impl PluginPackage {
    /// Fill in the content hash and signature and wrap the payload
    pub fn seal(
        mut manifest: PluginMetadata,
        payload: Vec<u8>,
        signer: &PluginSigner,
    ) -> Result<Self, ManifestError> {
        manifest.content_hash = content_hash(&payload);
        manifest.signature = None;
        manifest.validate()?;

        let digest = manifest.signing_digest()?;
        manifest.signature = Some(ManifestSignature {
            public_key: signer.public_key_base64(),
            value: BASE64_STANDARD.encode(signer.sign(&digest)),
        });

        Ok(Self {
            format: PACKAGE_FORMAT,
            manifest,
            payload,
        })
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse without verifying anything beyond the JSON shape
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

fn encode_payload<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(payload))
}

fn decode_payload<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64_STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}
