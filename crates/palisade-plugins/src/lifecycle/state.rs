//! Lifecycle states and the transitions allowed between them

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a plugin instance is in its lifecycle
///
/// ```text
/// DISCOVERED -> VERIFIED -> RESOLVED -> LOADED -> ENABLED <-> DISABLED -> UNLOADED
/// ```
///
/// Any failed step lands in `Error`, which ends that load attempt. A new
/// attempt starts again at `Discovered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    Discovered,
    Verified,
    Resolved,
    Loaded,
    Enabled,
    Disabled,
    Unloaded,
    Error,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "DISCOVERED",
            Self::Verified => "VERIFIED",
            Self::Resolved => "RESOLVED",
            Self::Loaded => "LOADED",
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
            Self::Unloaded => "UNLOADED",
            Self::Error => "ERROR",
        }
    }

    /// States that own a live isolation context
    pub fn has_context(&self) -> bool {
        matches!(self, Self::Loaded | Self::Enabled | Self::Disabled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unloaded | Self::Error)
    }

    pub fn valid_transitions(&self) -> &'static [PluginState] {
        match self {
            Self::Discovered => &[Self::Verified, Self::Error, Self::Unloaded],
            Self::Verified => &[Self::Resolved, Self::Error, Self::Unloaded],
            Self::Resolved => &[Self::Loaded, Self::Error, Self::Unloaded],
            Self::Loaded => &[Self::Enabled, Self::Disabled, Self::Error, Self::Unloaded],
            Self::Enabled => &[Self::Disabled, Self::Error, Self::Unloaded],
            Self::Disabled => &[Self::Enabled, Self::Error, Self::Unloaded],
            Self::Unloaded | Self::Error => &[Self::Discovered],
        }
    }

    pub fn can_transition_to(&self, target: PluginState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
