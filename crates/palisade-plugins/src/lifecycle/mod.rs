//! Plugin lifecycle: states, the threat scanner seam and the manager

mod manager;
mod state;
mod threat;

pub use manager::{LifecycleManager, LifecycleManagerBuilder, PluginInstance};
pub use state::PluginState;
pub use threat::{NoopThreatScanner, ThreatReport, ThreatScanner};
