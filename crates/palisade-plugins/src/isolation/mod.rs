//! Isolation contexts and the broker between them and the host
//!
//! Plugin code runs behind message channels only. Everything it can do to the
//! outside world is a [`protocol::BridgeCall`] that the [`IsolationBroker`]
//! checks and executes on its behalf.

pub mod broker;
pub mod bus;
pub mod entry;
pub mod fs;
pub mod network;
pub mod protocol;
mod runtime;
pub mod wasm;

pub use broker::{BrokerOptions, ContainmentNotice, ContainmentReason, ContextHandle, IsolationBroker};
pub use bus::MessageBus;
pub use entry::{
    EntryPointFactory, GuestContext, NativeEntryFactory, PluginEntry, StandardEntryFactory,
};
pub use fs::FsBridge;
pub use network::{
    DisconnectedEgress, EgressError, HttpEgress, NetworkEgress, NetworkPolicy, PolicyViolation,
};
pub use protocol::{BridgeCall, BridgeFailure, BridgeResult, BridgeValue, BusMessage, HostRequest};
pub use wasm::WasmEntryFactory;
