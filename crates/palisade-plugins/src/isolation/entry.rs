//! Entry points and the guest-side view of the bridge
//!
//! A manifest names its entry point as `native:<name>` or `wasm`. The host
//! resolves that string through an [`EntryPointFactory`] exactly once per load.
//! Both strategies hand back the same [`PluginEntry`] contract, so callers never
//! branch on how a plugin is implemented.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::protocol::{
    BridgeCall, BridgeFailure, BridgeResult, BridgeValue, BusMessage, Envelope, LogLevel, Outbound,
};
use super::wasm::WasmEntryFactory;
use crate::limiter::ResourceBudget;
use crate::manifest::{EntryPoint, PluginMetadata};

/// Code running inside an isolation context
#[async_trait]
pub trait PluginEntry: Send {
    async fn handle(
        &mut self,
        ctx: &GuestContext,
        command: &str,
        args: Value,
    ) -> Result<Value, String>;

    async fn on_message(&mut self, _ctx: &GuestContext, _message: BusMessage) {}

    async fn shutdown(&mut self, _ctx: &GuestContext) {}
}

/// Turns a verified payload into a running entry point
pub trait EntryPointFactory: Send + Sync + fmt::Debug {
    fn instantiate(
        &self,
        metadata: &PluginMetadata,
        payload: &[u8],
        budget: &ResourceBudget,
    ) -> Result<Box<dyn PluginEntry>, String>;
}

pub type NativeConstructor =
    Arc<dyn Fn(&PluginMetadata, &[u8]) -> Result<Box<dyn PluginEntry>, String> + Send + Sync>;

/// Host-registered constructors, looked up by name
#[derive(Clone, Default)]
pub struct NativeEntryFactory {
    constructors: HashMap<String, NativeConstructor>,
}

impl NativeEntryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: &str, constructor: F) -> Self
    where
        F: Fn(&PluginMetadata, &[u8]) -> Result<Box<dyn PluginEntry>, String>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for NativeEntryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEntryFactory")
            .field("constructors", &self.names())
            .finish()
    }
}

impl EntryPointFactory for NativeEntryFactory {
    fn instantiate(
        &self,
        metadata: &PluginMetadata,
        payload: &[u8],
        _budget: &ResourceBudget,
    ) -> Result<Box<dyn PluginEntry>, String> {
        let EntryPoint::Native(name) = &metadata.entry_point else {
            return Err(format!(
                "entry point '{}' is not a native entry point",
                metadata.entry_point
            ));
        };
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| format!("no native entry point registered as '{name}'"))?;
        constructor(metadata, payload)
    }
}

/// Dispatches on the manifest's entry point kind
#[derive(Debug, Clone)]
pub struct StandardEntryFactory {
    native: NativeEntryFactory,
    wasm: WasmEntryFactory,
}

impl StandardEntryFactory {
    pub fn new(native: NativeEntryFactory, wasm: WasmEntryFactory) -> Self {
        Self { native, wasm }
    }
}

impl Default for StandardEntryFactory {
    fn default() -> Self {
        Self::new(NativeEntryFactory::new(), WasmEntryFactory::default())
    }
}

impl EntryPointFactory for StandardEntryFactory {
    fn instantiate(
        &self,
        metadata: &PluginMetadata,
        payload: &[u8],
        budget: &ResourceBudget,
    ) -> Result<Box<dyn PluginEntry>, String> {
        match metadata.entry_point {
            EntryPoint::Native(_) => self.native.instantiate(metadata, payload, budget),
            EntryPoint::Wasm => self.wasm.instantiate(metadata, payload, budget),
        }
    }
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<BridgeResult>>>>;

/// The only handle plugin code has on the host
#[derive(Debug, Clone)]
pub struct GuestContext {
    plugin_id: Arc<str>,
    outbound: mpsc::Sender<Envelope<Outbound>>,
    pending: PendingCalls,
    next_id: Arc<AtomicU64>,
}

impl GuestContext {
    pub(crate) fn new(plugin_id: &str, outbound: mpsc::Sender<Envelope<Outbound>>) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            outbound,
            pending: Arc::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Send a bridge call and wait for the host's answer
    pub async fn call(&self, call: BridgeCall) -> BridgeResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self
            .outbound
            .send(Envelope::new(id, Outbound::Bridge(call)))
            .await
            .is_err()
        {
            self.pending.lock().remove(&id);
            return Err(BridgeFailure::failed("host channel closed"));
        }

        rx.await
            .unwrap_or_else(|_| Err(BridgeFailure::failed("host channel closed")))
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> BridgeResult {
        self.call(BridgeCall::SubmitLog {
            level,
            message: message.into(),
            exception: None,
        })
        .await
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, BridgeFailure> {
        match self
            .call(BridgeCall::ReadFile {
                path: path.to_string(),
            })
            .await?
        {
            BridgeValue::Bytes(bytes) => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<(), BridgeFailure> {
        self.call(BridgeCall::WriteFile {
            path: path.to_string(),
            data,
        })
        .await
        .map(|_| ())
    }

    pub async fn publish(&self, topic: &str, payload: Value) -> Result<usize, BridgeFailure> {
        match self
            .call(BridgeCall::Publish {
                topic: topic.to_string(),
                payload,
                to: None,
            })
            .await?
        {
            BridgeValue::Delivered(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), BridgeFailure> {
        self.call(BridgeCall::Subscribe {
            topic: topic.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub(crate) fn resolve(&self, correlation_id: u64, result: BridgeResult) {
        if let Some(tx) = self.pending.lock().remove(&correlation_id) {
            let _ = tx.send(result);
        }
    }

    pub(crate) async fn reply(&self, correlation_id: u64, result: Result<Value, String>) {
        let _ = self
            .outbound
            .send(Envelope::new(correlation_id, Outbound::Reply(result)))
            .await;
    }

    pub(crate) fn try_reply(&self, correlation_id: u64, result: Result<Value, String>) {
        let _ = self
            .outbound
            .try_send(Envelope::new(correlation_id, Outbound::Reply(result)));
    }
}

fn unexpected(value: BridgeValue) -> BridgeFailure {
    BridgeFailure::failed(format!("unexpected bridge answer: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::metadata;

    struct Echo;

    #[async_trait]
    impl PluginEntry for Echo {
        async fn handle(
            &mut self,
            _ctx: &GuestContext,
            _command: &str,
            args: Value,
        ) -> Result<Value, String> {
            Ok(args)
        }
    }

    #[test]
    fn test_native_factory_resolves_registered_name() {
        let factory = NativeEntryFactory::new().register("echo", |_, _| Ok(Box::new(Echo)));
        let budget = ResourceBudget::default();

        assert!(factory.instantiate(&metadata("p", "1.0.0"), b"", &budget).is_ok());

        let mut unknown = metadata("p", "1.0.0");
        unknown.entry_point = EntryPoint::Native("missing".into());
        let err = factory
            .instantiate(&unknown, b"", &budget)
            .err()
            .unwrap();
        assert!(err.contains("missing"));
    }

    #[test]
    fn test_native_factory_refuses_wasm_entry() {
        let factory = NativeEntryFactory::new();
        let mut wasm = metadata("p", "1.0.0");
        wasm.entry_point = EntryPoint::Wasm;
        assert!(
            factory
                .instantiate(&wasm, b"", &ResourceBudget::default())
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_guest_call_fails_when_host_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ctx = GuestContext::new("p", tx);
        assert_eq!(
            ctx.subscribe("t").await,
            Err(BridgeFailure::failed("host channel closed"))
        );
    }
}
