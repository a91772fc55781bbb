//! Threat scanner collaborator
//!
//! The host decides how to scan; the lifecycle manager only asks before it
//! enables a plugin that declares a sensitive permission.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatReport {
    pub threats_found: bool,
    /// Names of the detection methods that fired
    #[serde(default)]
    pub method_names: Vec<String>,
}

impl ThreatReport {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn detected<S: Into<String>>(methods: impl IntoIterator<Item = S>) -> Self {
        Self {
            threats_found: true,
            method_names: methods.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
pub trait ThreatScanner: Send + Sync + fmt::Debug {
    /// Err means the scan was inconclusive
    async fn scan(&self) -> Result<ThreatReport, String>;
}

/// Scanner for hosts without one; always clean
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopThreatScanner;

#[async_trait]
impl ThreatScanner for NoopThreatScanner {
    async fn scan(&self) -> Result<ThreatReport, String> {
        Ok(ThreatReport::clean())
    }
}
