//! Palisade Plugin System
//!
//! Runs third-party plugins behind a narrow capability boundary:
//! - Signed packages verified before load and re-checked before sensitive operations
//! - Dependency resolution against the installed set, with cycle detection
//! - Per-plugin resource budgets and per-operation token buckets
//! - An isolation broker that mediates filesystem, network and messaging access
//! - Versioned install and atomic rollback
//! - A lifecycle state machine that drives all of the above

pub mod isolation;
pub mod lifecycle;
pub mod limiter;
pub mod manifest;
pub mod package;
pub mod ratelimit;
pub mod resolver;
pub mod store;
pub mod verifier;
pub mod versions;

#[cfg(test)]
mod testing;

use semver::Version;
use serde::Serialize;
use thiserror::Error;

pub use lifecycle::{LifecycleManager, PluginInstance, PluginState};
pub use limiter::{BudgetExceeded, ResourceBudget, ResourceKind};
pub use manifest::{EntryPoint, ManifestError, Permission, PluginMetadata};
pub use package::PluginPackage;
pub use resolver::{DependencyGraph, ResolutionError};
pub use store::StorageError;
pub use verifier::{VerificationError, VerifiedArtifact};
pub use versions::VersionRecord;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    #[error("Plugin '{plugin_id}' throttled on '{operation}'")]
    Throttled { plugin_id: String, operation: String },

    #[error("Plugin '{plugin_id}' did not answer request {correlation_id} within {timeout_ms}ms")]
    ChannelTimeout {
        plugin_id: String,
        correlation_id: u64,
        timeout_ms: u64,
    },

    #[error("Isolation channel for plugin '{0}' is closed")]
    ChannelClosed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Plugin '{plugin_id}' cannot go from {from} to {to}")]
    InvalidTransition {
        plugin_id: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("Failed to instantiate plugin '{plugin_id}': {reason}")]
    Instantiation { plugin_id: String, reason: String },

    #[error("Plugin '{plugin_id}' failed to handle the request: {message}")]
    Invocation { plugin_id: String, message: String },

    #[error("Plugin '{plugin_id}' is {state}, not ENABLED")]
    NotEnabled {
        plugin_id: String,
        state: PluginState,
    },

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin '{plugin_id}' version {version} is already installed")]
    VersionExists { plugin_id: String, version: Version },

    #[error("Plugin '{plugin_id}' has no installed version {version}")]
    VersionNotFound { plugin_id: String, version: Version },

    #[error("Plugin '{plugin_id}' blocked by threat scan: {}", .threats.join(", "))]
    ThreatDetected {
        plugin_id: String,
        threats: Vec<String>,
    },
}

pub type PluginResult<T> = Result<T, PluginError>;

/// What the host is told about a failure: no paths, traces or key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFailure {
    pub plugin_id: Option<String>,
    pub kind: &'static str,
    pub code: &'static str,
    pub summary: String,
}

impl PluginError {
    /// Stable error code, grouped by family
    pub fn code(&self) -> &'static str {
        match self {
            Self::Verification(e) => e.code(),
            Self::Resolution(e) => e.code(),
            Self::BudgetExceeded(_) => "P300",
            Self::Throttled { .. } => "P400",
            Self::ChannelTimeout { .. } => "P500",
            Self::ChannelClosed(_) => "P501",
            Self::Storage(e) => e.code(),
            Self::Manifest(_) => "P700",
            Self::InvalidTransition { .. } => "P801",
            Self::Instantiation { .. } => "P802",
            Self::Invocation { .. } => "P803",
            Self::NotFound(_) => "P804",
            Self::NotEnabled { .. } => "P808",
            Self::VersionExists { .. } => "P805",
            Self::VersionNotFound { .. } => "P806",
            Self::ThreatDetected { .. } => "P807",
        }
    }

    /// Error family name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Verification(_) => "verification",
            Self::Resolution(_) => "resolution",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::Throttled { .. } => "throttled",
            Self::ChannelTimeout { .. } => "channel_timeout",
            Self::ChannelClosed(_) => "channel_closed",
            Self::Storage(_) => "storage",
            Self::Manifest(_) => "manifest",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Instantiation { .. } => "instantiation",
            Self::Invocation { .. } => "invocation",
            Self::NotFound(_) => "not_found",
            Self::NotEnabled { .. } => "not_enabled",
            Self::VersionExists { .. } => "version_exists",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::ThreatDetected { .. } => "threat_detected",
        }
    }

    /// Transient errors the caller may retry later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::ChannelTimeout { .. })
    }

    /// Plugin id the error is about, when known
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::Verification(e) => match e {
                VerificationError::DigestMismatch { plugin_id } => Some(plugin_id),
                VerificationError::MissingSignature(id)
                | VerificationError::UntrustedKey(id)
                | VerificationError::BadSignature(id)
                | VerificationError::Tampered(id) => Some(id),
                _ => None,
            },
            Self::Resolution(e) => match e {
                ResolutionError::MissingDependency { required_by, .. } => Some(required_by),
                ResolutionError::IncompatibleHost { plugin_id, .. } => Some(plugin_id),
                _ => None,
            },
            Self::BudgetExceeded(e) => Some(&e.plugin_id),
            Self::Throttled { plugin_id, .. }
            | Self::ChannelTimeout { plugin_id, .. }
            | Self::InvalidTransition { plugin_id, .. }
            | Self::Instantiation { plugin_id, .. }
            | Self::Invocation { plugin_id, .. }
            | Self::NotEnabled { plugin_id, .. }
            | Self::VersionExists { plugin_id, .. }
            | Self::VersionNotFound { plugin_id, .. }
            | Self::ThreatDetected { plugin_id, .. } => Some(plugin_id),
            Self::ChannelClosed(id) | Self::NotFound(id) => Some(id),
            Self::Storage(_) | Self::Manifest(_) => None,
        }
    }

    /// Sanitized view for the host UI
    pub fn host_summary(&self) -> HostFailure {
        let summary = match self {
            // Storage errors carry filesystem paths and OS messages.
            Self::Storage(StorageError::NotFound(_)) => "artifact not found in storage".to_string(),
            Self::Storage(_) => "artifact storage failure".to_string(),
            Self::Instantiation { .. } => "plugin could not be started".to_string(),
            Self::Invocation { .. } => "plugin failed to handle the request".to_string(),
            other => other.to_string(),
        };

        HostFailure {
            plugin_id: self.plugin_id().map(str::to_string),
            kind: self.kind(),
            code: self.code(),
            summary,
        }
    }
}
