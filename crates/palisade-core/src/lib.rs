//! Palisade Core Library
//!
//! Shared infrastructure for the Palisade plugin host:
//! - Configuration (TOML file + environment overrides)
//! - Structured audit events and best-effort audit sinks
//! - Per-key async locks used to serialize work on a single plugin id
//! - Ed25519 signing and the trusted key set used for artifact verification

pub mod audit;
pub mod config;
pub mod error;
pub mod locking;
pub mod signing;


pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::locking::KeyedLocks;
    pub use crate::signing::{PluginSigner, TrustedKeys};
}
