//! WebAssembly entry points via wasmtime

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::debug;
use wasmtime::{
    Config, Engine, Instance, Module, Store, StoreLimits, StoreLimitsBuilder, TypedFunc,
    WasmBacktraceDetails,
};

use super::entry::{EntryPointFactory, GuestContext, PluginEntry};
use super::protocol::BridgeCall;
use crate::limiter::ResourceBudget;
use crate::manifest::{EntryPoint, PluginMetadata};

/// Fuel units that make up one millisecond of CPU budget
pub const FUEL_PER_CPU_MILLI: u64 = 100_000;

/// Name and shape of the one export a module must provide: `(i32) -> i32`
pub const HANDLE_EXPORT: &str = "handle";

/// Instantiates `wasm` entry points
///
/// Modules may not import anything. Linear memory is capped by the memory
/// budget, each call runs on fuel derived from the CPU budget and is cut off
/// by epoch interruption after the call timeout.
#[derive(Debug, Clone)]
pub struct WasmEntryFactory {
    call_timeout: Duration,
    table_elements_limit: usize,
    instance_limit: usize,
}

impl Default for WasmEntryFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl WasmEntryFactory {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            table_elements_limit: 1_024,
            instance_limit: 16,
        }
    }

    fn engine() -> Result<Engine, String> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        config.wasm_threads(false);
        config.wasm_backtrace_details(WasmBacktraceDetails::Disable);
        Engine::new(&config).map_err(|e| format!("failed to initialize wasmtime engine: {e}"))
    }
}

impl EntryPointFactory for WasmEntryFactory {
    fn instantiate(
        &self,
        metadata: &PluginMetadata,
        payload: &[u8],
        budget: &ResourceBudget,
    ) -> Result<Box<dyn PluginEntry>, String> {
        if metadata.entry_point != EntryPoint::Wasm {
            return Err(format!(
                "entry point '{}' is not a wasm entry point",
                metadata.entry_point
            ));
        }

        let fuel_per_call = budget.cpu_millis.saturating_mul(FUEL_PER_CPU_MILLI);
        if fuel_per_call == 0 {
            return Err("CPU budget must be greater than zero".to_string());
        }

        // One engine per instance, so an epoch tick only interrupts this plugin.
        let engine = Self::engine()?;
        let module =
            Module::new(&engine, payload).map_err(|e| format!("invalid module: {e}"))?;

        if module.imports().next().is_some() {
            return Err("module imports are not allowed".to_string());
        }

        let memory_limit = usize::try_from(budget.memory_bytes).unwrap_or(usize::MAX);
        let mut store = Store::new(
            &engine,
            WasmLimits {
                limits: StoreLimitsBuilder::new()
                    .memory_size(memory_limit)
                    .table_elements(self.table_elements_limit)
                    .instances(self.instance_limit)
                    .trap_on_grow_failure(true)
                    .build(),
            },
        );
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(fuel_per_call)
            .map_err(|e| format!("failed to add fuel: {e}"))?;
        store.set_epoch_deadline(1);

        // No imports -> empty host environment
        let instance = Instance::new(&mut store, &module, &[])
            .map_err(|e| format!("instantiation failed: {e}"))?;
        let handle = instance
            .get_typed_func::<i32, i32>(&mut store, HANDLE_EXPORT)
            .map_err(|e| format!("missing `{HANDLE_EXPORT}: (i32) -> i32` export: {e}"))?;

        debug!(plugin_id = %metadata.id, "Wasm module instantiated");

        Ok(Box::new(WasmEntry {
            engine,
            instance: Arc::new(Mutex::new(WasmInstance { store, handle })),
            fuel_per_call,
            call_timeout: self.call_timeout,
        }))
    }
}

struct WasmLimits {
    limits: StoreLimits,
}

struct WasmInstance {
    store: Store<WasmLimits>,
    handle: TypedFunc<i32, i32>,
}

impl WasmInstance {
    /// Run `handle(arg)`; returns the result and the fuel consumed
    fn call(&mut self, arg: i32, fuel: u64) -> (Result<i32, String>, u64) {
        if let Err(e) = self.store.set_fuel(fuel) {
            return (Err(format!("failed to add fuel: {e}")), 0);
        }
        self.store.set_epoch_deadline(1);

        let result = self
            .handle
            .call(&mut self.store, arg)
            .map_err(|e| format!("wasm trap: {e}"));
        let remaining = self.store.get_fuel().unwrap_or(0);
        (result, fuel.saturating_sub(remaining))
    }
}

struct WasmEntry {
    engine: Engine,
    instance: Arc<Mutex<WasmInstance>>,
    fuel_per_call: u64,
    call_timeout: Duration,
}

#[async_trait]
impl PluginEntry for WasmEntry {
    async fn handle(
        &mut self,
        ctx: &GuestContext,
        command: &str,
        args: Value,
    ) -> Result<Value, String> {
        if command != HANDLE_EXPORT {
            return Err(format!("unknown command '{command}'"));
        }
        let arg = match &args {
            Value::Null => 0,
            other => other
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| "argument must be a 32-bit integer".to_string())?,
        };

        let engine = self.engine.clone();
        let timeout = self.call_timeout;
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.increment_epoch();
        });

        let instance = Arc::clone(&self.instance);
        let fuel = self.fuel_per_call;
        let joined = tokio::task::spawn_blocking(move || instance.lock().call(arg, fuel)).await;
        watchdog.abort();

        let (result, consumed) = joined.map_err(|_| "wasm call aborted".to_string())?;

        let millis = consumed.div_ceil(FUEL_PER_CPU_MILLI);
        if millis > 0 {
            // A breach is handled by the broker; the guest only sees the refusal.
            let _ = ctx.call(BridgeCall::ReportCpu { millis }).await;
        }

        result.map(|value| json!(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::metadata;

    const ADD_ONE: &str = r#"
        (module
          (func (export "handle") (param i32) (result i32)
            local.get 0
            i32.const 1
            i32.add))
    "#;

    fn wasm_metadata() -> PluginMetadata {
        let mut metadata = metadata("w", "1.0.0");
        metadata.entry_point = EntryPoint::Wasm;
        metadata
    }

    fn instantiate(source: &str) -> Result<Box<dyn PluginEntry>, String> {
        WasmEntryFactory::default().instantiate(
            &wasm_metadata(),
            source.as_bytes(),
            &ResourceBudget::default(),
        )
    }

    #[test]
    fn test_valid_module_instantiates() {
        assert!(instantiate(ADD_ONE).is_ok());
    }

    #[test]
    fn test_imports_rejected() {
        let source = r#"
            (module
              (import "env" "host" (func))
              (func (export "handle") (param i32) (result i32) local.get 0))
        "#;
        let err = instantiate(source).err().unwrap();
        assert!(err.contains("imports"));
    }

    #[test]
    fn test_wrong_export_shape_rejected() {
        let source = r#"(module (func (export "handle") (result i32) i32.const 0))"#;
        let err = instantiate(source).err().unwrap();
        assert!(err.contains("handle"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(instantiate("not wasm at all").is_err());
    }

    #[test]
    fn test_memory_above_budget_fails_to_instantiate() {
        // Two pages minimum against a one-page budget.
        let source = r#"
            (module
              (memory 2)
              (func (export "handle") (param i32) (result i32) local.get 0))
        "#;
        let budget = ResourceBudget {
            memory_bytes: 64 * 1024,
            ..ResourceBudget::default()
        };
        let result =
            WasmEntryFactory::default().instantiate(&wasm_metadata(), source.as_bytes(), &budget);
        assert!(result.is_err());
    }

    #[test]
    fn test_native_entry_point_refused() {
        let result = WasmEntryFactory::default().instantiate(
            &metadata("p", "1.0.0"),
            ADD_ONE.as_bytes(),
            &ResourceBudget::default(),
        );
        assert!(result.is_err());
    }
}
