//! Lifecycle manager
//!
//! Owns every plugin instance and is the only component that changes its
//! state. Operations on one plugin id are serialized with a per-key lock;
//! different ids proceed in parallel. Containment never waits for that lock:
//! it is applied in one step on the instance entry, so a stalled operation
//! cannot delay a kill. Notices raised by the broker arrive on a channel and
//! are applied by a background task.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use palisade_core::audit::{
    AuditEvent, AuditSink, BroadcastAuditSink, FanoutAuditSink, TracingAuditSink,
};
use palisade_core::config::{Config, ThreatPolicy};
use palisade_core::locking::KeyedLocks;
use palisade_core::signing::TrustedKeys;
use palisade_core::{Error, Result};
use semver::Version;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::state::PluginState;
use super::threat::{NoopThreatScanner, ThreatScanner};
use crate::isolation::{
    BrokerOptions, ContainmentNotice, ContainmentReason, ContextHandle, EntryPointFactory,
    HttpEgress, IsolationBroker, NativeEntryFactory, NetworkEgress, NetworkPolicy, PluginEntry,
    StandardEntryFactory, WasmEntryFactory,
};
use crate::limiter::{ResourceBudget, ResourceKind, ResourceLimiter, ResourceUsage};
use crate::manifest::PluginMetadata;
use crate::ratelimit::RateLimiter;
use crate::resolver::{DependencyGraph, DependencyResolver, HostInfo};
use crate::store::{ArtifactStore, FsArtifactStore, keys};
use crate::verifier::{ArtifactVerifier, VerifiedArtifact};
use crate::versions::{VersionManager, VersionRecord};
use crate::{PluginError, PluginResult};

const EVENT_CAPACITY: usize = 256;
const INVOKE_OPERATION: &str = "invoke";

/// Read-only view of a plugin instance
#[derive(Debug, Clone)]
pub struct PluginInstance {
    pub id: String,
    pub version: Version,
    pub state: PluginState,
    pub metadata: Arc<PluginMetadata>,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    pub usage: ResourceUsage,
    /// Dependencies first, the plugin itself last
    pub load_order: Vec<String>,
    /// Why the host last forced this instance down
    pub last_error: Option<String>,
    /// Whether an isolation context is running
    pub context_live: bool,
    pub generation: u64,
}

#[derive(Debug)]
struct Slot {
    state: PluginState,
    artifact: VerifiedArtifact,
    graph: DependencyGraph,
    created_at: DateTime<Utc>,
    last_verified_at: DateTime<Utc>,
    generation: u64,
    context: Option<Arc<ContextHandle>>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    budget: ResourceBudget,
    threat_policy: ThreatPolicy,
    scan_timeout: Duration,
    versions: VersionManager,
    verifier: Arc<ArtifactVerifier>,
    resolver: Arc<DependencyResolver>,
    limiter: Arc<ResourceLimiter>,
    rate: Arc<RateLimiter>,
    broker: IsolationBroker,
    factory: Arc<dyn EntryPointFactory>,
    scanner: Arc<dyn ThreatScanner>,
    audit: Arc<dyn AuditSink>,
    events: BroadcastAuditSink,
    instances: DashMap<String, Slot>,
    locks: KeyedLocks,
    generations: AtomicU64,
}

/// Drives plugins from discovery to unload
///
/// Cheap to clone; clones share the same instances.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

/// Builder for [`LifecycleManager`]
#[derive(Default)]
pub struct LifecycleManagerBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn ArtifactStore>>,
    trusted: Option<TrustedKeys>,
    factory: Option<Arc<dyn EntryPointFactory>>,
    native: Option<NativeEntryFactory>,
    scanner: Option<Arc<dyn ThreatScanner>>,
    audit: Option<Arc<dyn AuditSink>>,
    egress: Option<Arc<dyn NetworkEgress>>,
    files_root: Option<PathBuf>,
}

impl LifecycleManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration (defaults when unset)
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Artifact storage (defaults to `<data_dir>/artifacts` on disk)
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Trusted publisher keys (defaults to `trust.keys` from the config)
    pub fn trusted_keys(mut self, trusted: TrustedKeys) -> Self {
        self.trusted = Some(trusted);
        self
    }

    /// Replace entry point instantiation entirely
    pub fn entry_factory(mut self, factory: Arc<dyn EntryPointFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Native constructors for the standard factory
    pub fn native_entries(mut self, native: NativeEntryFactory) -> Self {
        self.native = Some(native);
        self
    }

    pub fn threat_scanner(mut self, scanner: Arc<dyn ThreatScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Where audit events go, in addition to the event stream
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Transport for the network bridge (defaults to HTTPS via reqwest)
    pub fn network_egress(mut self, egress: Arc<dyn NetworkEgress>) -> Self {
        self.egress = Some(egress);
        self
    }

    /// Root of the per-plugin private directories (defaults to `<data_dir>/files`)
    pub fn files_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.files_root = Some(root.into());
        self
    }

    /// Build the manager; must be called inside a Tokio runtime
    pub fn build(self) -> Result<LifecycleManager> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|e| Error::ConfigError(format!("{e:#}")))?;

        let app_version = Version::parse(&config.host.app_version)
            .map_err(|e| Error::ConfigError(format!("host.app_version: {e}")))?;
        let trusted = match self.trusted {
            Some(trusted) => trusted,
            None => TrustedKeys::from_base64(&config.trust.keys)?,
        };

        let (store, files_root) = match (self.store, self.files_root) {
            (Some(store), Some(root)) => (store, root),
            (store, root) => {
                let data_dir = config
                    .data_dir()
                    .map_err(|e| Error::ConfigError(e.to_string()))?;
                let store = store.unwrap_or_else(|| {
                    Arc::new(FsArtifactStore::new(data_dir.join("artifacts")))
                });
                (store, root.unwrap_or_else(|| data_dir.join("files")))
            }
        };

        let request_timeout = Duration::from_millis(config.channel.request_timeout_ms);
        let egress: Arc<dyn NetworkEgress> = match self.egress {
            Some(egress) => egress,
            None => Arc::new(HttpEgress::new(request_timeout).map_err(Error::ConfigError)?),
        };
        let factory: Arc<dyn EntryPointFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(StandardEntryFactory::new(
                self.native.unwrap_or_default(),
                WasmEntryFactory::new(request_timeout),
            )),
        };

        let verifier = Arc::new(ArtifactVerifier::new(trusted));
        let resolver = Arc::new(DependencyResolver::new(HostInfo {
            api_level: config.host.api_level,
            app_version,
        }));
        let budget = ResourceBudget::from(&config.budgets);
        let limiter = Arc::new(ResourceLimiter::new());
        let rate = Arc::new(RateLimiter::new(config.rate.clone()));

        let events = BroadcastAuditSink::new(EVENT_CAPACITY);
        let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(vec![
            self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            Arc::new(events.clone()),
        ]));

        let (broker, notices) = IsolationBroker::with_options(
            Arc::clone(&rate),
            Arc::clone(&limiter),
            Arc::clone(&audit),
            files_root,
            BrokerOptions {
                policy: NetworkPolicy::from_config(&config.network),
                egress,
                channel: config.channel.clone(),
            },
        );

        let inner = Arc::new(Inner {
            budget,
            threat_policy: config.security.threat_policy,
            scan_timeout: Duration::from_millis(config.security.scan_timeout_ms),
            versions: VersionManager::new(store, Arc::clone(&verifier), Arc::clone(&resolver)),
            verifier,
            resolver,
            limiter,
            rate,
            broker,
            factory,
            scanner: self
                .scanner
                .unwrap_or_else(|| Arc::new(NoopThreatScanner)),
            audit,
            events,
            instances: DashMap::new(),
            locks: KeyedLocks::new(),
            generations: AtomicU64::new(0),
        });

        tokio::spawn(run_containment(Arc::downgrade(&inner), notices));
        info!("Lifecycle manager started");

        Ok(LifecycleManager { inner })
    }
}

impl LifecycleManager {
    pub fn builder() -> LifecycleManagerBuilder {
        LifecycleManagerBuilder::new()
    }

    // ========== Versions ==========

    /// Verify, resolve and activate a new version
    ///
    /// A running instance keeps its version until it is reloaded.
    pub async fn install(
        &self,
        plugin_id: &str,
        version: &Version,
        artifact: &[u8],
    ) -> PluginResult<VersionRecord> {
        let _guard = self.inner.locks.lock(plugin_id).await;
        match self.inner.versions.install(plugin_id, version, artifact).await {
            Ok(activation) => {
                self.inner
                    .audit
                    .record(AuditEvent::installed(plugin_id, &version.to_string()));
                Ok(activation.record)
            }
            Err(e) => {
                self.inner.audit_failure(plugin_id, &e);
                Err(e)
            }
        }
    }

    /// Reactivate an earlier version; the active version is unchanged on failure
    pub async fn rollback(&self, plugin_id: &str, target: &Version) -> PluginResult<VersionRecord> {
        let _guard = self.inner.locks.lock(plugin_id).await;
        match self.inner.versions.rollback(plugin_id, target).await {
            Ok(activation) => {
                let previous = activation.previous.as_ref().map(Version::to_string);
                self.inner.audit.record(AuditEvent::rolled_back(
                    plugin_id,
                    previous.as_deref(),
                    &target.to_string(),
                ));
                Ok(activation.record)
            }
            Err(e) => {
                self.inner.audit_failure(plugin_id, &e);
                Err(e)
            }
        }
    }

    pub async fn history(&self, plugin_id: &str) -> PluginResult<Vec<VersionRecord>> {
        self.inner.versions.history(plugin_id).await
    }

    pub async fn prune(&self, plugin_id: &str, keep: usize) -> PluginResult<Vec<VersionRecord>> {
        let _guard = self.inner.locks.lock(plugin_id).await;
        self.inner.versions.prune(plugin_id, keep).await
    }

    /// Ids with installed versions, loaded or not
    pub async fn installed(&self) -> PluginResult<Vec<String>> {
        self.inner.versions.installed_ids().await
    }

    // ========== Lifecycle ==========

    /// Bring the active version from DISCOVERED to LOADED
    ///
    /// On failure the instance ends in ERROR and is not retained. A contained
    /// instance (DISABLED without a context) is replaced by the new attempt.
    pub async fn load(&self, plugin_id: &str) -> PluginResult<PluginInstance> {
        let _guard = self.inner.locks.lock(plugin_id).await;
        self.inner.load(plugin_id).await
    }

    /// LOADED or DISABLED to ENABLED, after re-verifying the stored artifact
    pub async fn enable(&self, plugin_id: &str) -> PluginResult<PluginInstance> {
        let _guard = self.inner.locks.lock(plugin_id).await;
        self.inner.enable(plugin_id).await
    }

    pub async fn disable(&self, plugin_id: &str) -> PluginResult<PluginInstance> {
        let _guard = self.inner.locks.lock(plugin_id).await;
        self.inner.disable(plugin_id)
    }

    /// Release the context and discard counters and buckets
    ///
    /// Unloading an id with no instance is a no-op.
    pub async fn unload(&self, plugin_id: &str) -> PluginResult<()> {
        let _guard = self.inner.locks.lock(plugin_id).await;
        self.inner.unload(plugin_id).await;
        Ok(())
    }

    /// Unload every instance
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            let _guard = self.inner.locks.lock(&id).await;
            self.inner.unload(&id).await;
        }
        info!("Lifecycle manager shut down");
    }

    // ========== Runtime ==========

    /// Send a host request into an ENABLED instance
    pub async fn invoke(&self, plugin_id: &str, command: &str, args: Value) -> PluginResult<Value> {
        let context = {
            let slot = self
                .inner
                .instances
                .get(plugin_id)
                .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
            if slot.state != PluginState::Enabled {
                return Err(PluginError::NotEnabled {
                    plugin_id: plugin_id.to_string(),
                    state: slot.state,
                });
            }
            slot.context
                .clone()
                .ok_or_else(|| PluginError::ChannelClosed(plugin_id.to_string()))?
        };

        if !self.inner.rate.try_acquire(plugin_id, INVOKE_OPERATION) {
            debug!(plugin_id = %plugin_id, "Invoke throttled");
            return Err(PluginError::Throttled {
                plugin_id: plugin_id.to_string(),
                operation: INVOKE_OPERATION.to_string(),
            });
        }

        context.invoke(command, args).await
    }

    /// Charge usage the host measured itself
    ///
    /// A breach disables the instance before this returns.
    pub async fn charge(&self, plugin_id: &str, kind: ResourceKind, amount: u64) -> PluginResult<u64> {
        if !self.inner.instances.contains_key(plugin_id) {
            return Err(PluginError::NotFound(plugin_id.to_string()));
        }
        match self.inner.limiter.charge(plugin_id, kind, amount) {
            Ok(used) => Ok(used),
            Err(exceeded) => {
                self.inner.contain(
                    plugin_id,
                    None,
                    ContainmentReason::BudgetExceeded(exceeded.clone()),
                );
                Err(exceeded.into())
            }
        }
    }

    // ========== Queries ==========

    pub fn list_instances(&self) -> Vec<PluginInstance> {
        let mut instances: Vec<PluginInstance> = self
            .inner
            .instances
            .iter()
            .map(|entry| self.inner.snapshot(entry.key(), entry.value()))
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    pub fn get_instance(&self, plugin_id: &str) -> Option<PluginInstance> {
        self.inner
            .instances
            .get(plugin_id)
            .map(|slot| self.inner.snapshot(plugin_id, &slot))
    }

    /// Stream of audit events: transitions, breaches, denials
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.inner.events.subscribe()
    }

    pub fn broker(&self) -> &IsolationBroker {
        &self.inner.broker
    }

    pub fn verifier(&self) -> &ArtifactVerifier {
        &self.inner.verifier
    }
}

impl Inner {
    async fn load(&self, plugin_id: &str) -> PluginResult<PluginInstance> {
        let existing = self
            .instances
            .get(plugin_id)
            .map(|slot| (slot.state, slot.context.is_some()));
        match existing {
            Some((state, true)) => {
                return Err(PluginError::InvalidTransition {
                    plugin_id: plugin_id.to_string(),
                    from: state,
                    to: PluginState::Loaded,
                });
            }
            Some((state, false)) => {
                self.instances.remove(plugin_id);
                self.limiter.remove(plugin_id);
                self.rate.reset(plugin_id);
                self.record_transition(plugin_id, state, PluginState::Unloaded, Some("reloading"));
            }
            None => {}
        }

        let mut state = PluginState::Discovered;
        debug!(plugin_id = %plugin_id, "Plugin discovered");

        match self.bring_up(plugin_id, &mut state).await {
            Ok(slot) => {
                let instance = self.snapshot(plugin_id, &slot);
                self.instances.insert(plugin_id.to_string(), slot);
                Ok(instance)
            }
            Err(e) => {
                self.audit_failure(plugin_id, &e);
                self.record_transition(
                    plugin_id,
                    state,
                    PluginState::Error,
                    Some(&e.host_summary().summary),
                );
                Err(e)
            }
        }
    }

    async fn bring_up(&self, plugin_id: &str, state: &mut PluginState) -> PluginResult<Slot> {
        let (record, bytes) = self.versions.read_active(plugin_id).await?;
        let artifact = self.versions.verify_for(plugin_id, &record.version, &bytes)?;
        self.advance(plugin_id, state, PluginState::Verified);

        let installed = self.versions.installed_index().await?;
        let graph = self
            .resolver
            .resolve(plugin_id, &artifact.metadata, &installed)?;
        self.advance(plugin_id, state, PluginState::Resolved);

        let entry = self.instantiate(&artifact)?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        self.limiter.reset(plugin_id, self.budget);
        self.rate.reset(plugin_id);
        let context = self
            .broker
            .open(Arc::clone(&artifact.metadata), entry, generation);
        self.advance(plugin_id, state, PluginState::Loaded);

        Ok(Slot {
            state: PluginState::Loaded,
            last_verified_at: artifact.verified_at,
            artifact,
            graph,
            created_at: Utc::now(),
            generation,
            context: Some(Arc::new(context)),
            last_error: None,
        })
    }

    fn instantiate(&self, artifact: &VerifiedArtifact) -> PluginResult<Box<dyn PluginEntry>> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.factory
                .instantiate(&artifact.metadata, &artifact.payload, &self.budget)
        }));
        let reason = match outcome {
            Ok(Ok(entry)) => return Ok(entry),
            Ok(Err(reason)) => reason,
            Err(_) => "entry point panicked during instantiation".to_string(),
        };
        warn!(plugin_id = %artifact.plugin_id(), reason = %reason, "Instantiation failed");
        Err(PluginError::Instantiation {
            plugin_id: artifact.plugin_id().to_string(),
            reason,
        })
    }

    async fn enable(&self, plugin_id: &str) -> PluginResult<PluginInstance> {
        let (from, artifact, live, generation) = {
            let slot = self
                .instances
                .get(plugin_id)
                .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
            (
                slot.state,
                slot.artifact.clone(),
                slot.context.is_some(),
                slot.generation,
            )
        };

        if from == PluginState::Enabled {
            return self.instance(plugin_id);
        }
        if !from.can_transition_to(PluginState::Enabled) {
            return Err(PluginError::InvalidTransition {
                plugin_id: plugin_id.to_string(),
                from,
                to: PluginState::Enabled,
            });
        }
        if !live {
            // Contained instances need a fresh load.
            return Err(PluginError::ChannelClosed(plugin_id.to_string()));
        }

        let backup = keys::backup(plugin_id, &artifact.metadata.version);
        let current = self.versions.store().read(&backup).await?;
        if let Err(e) = self.verifier.reverify(&artifact, &current) {
            self.audit
                .record(AuditEvent::verification_failed(plugin_id, e.code(), &e.to_string()));
            self.retire(plugin_id, &e.to_string()).await;
            return Err(e.into());
        }

        self.threat_gate(plugin_id, &artifact.metadata).await?;

        // Containment may have run while the checks were awaiting.
        let committed = match self.instances.get_mut(plugin_id) {
            Some(mut slot) if slot.generation == generation && slot.context.is_some() => {
                slot.state = PluginState::Enabled;
                slot.last_verified_at = Utc::now();
                true
            }
            _ => false,
        };
        if !committed {
            return Err(PluginError::ChannelClosed(plugin_id.to_string()));
        }
        self.record_transition(plugin_id, from, PluginState::Enabled, None);
        self.instance(plugin_id)
    }

    async fn threat_gate(&self, plugin_id: &str, metadata: &PluginMetadata) -> PluginResult<()> {
        let sensitive = metadata.sensitive_permissions();
        if sensitive.is_empty() {
            return Ok(());
        }

        let outcome = match tokio::time::timeout(self.scan_timeout, self.scanner.scan()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("no result after {:?}", self.scan_timeout)),
        };
        match outcome {
            Ok(report) if report.threats_found => {
                let blocked = self.threat_policy == ThreatPolicy::Block;
                self.audit.record(AuditEvent::threat_scan(
                    plugin_id,
                    Some(&report.method_names),
                    blocked,
                ));
                warn!(
                    plugin_id = %plugin_id,
                    methods = ?report.method_names,
                    blocked,
                    "Threat scan found threats"
                );
                if blocked {
                    return Err(PluginError::ThreatDetected {
                        plugin_id: plugin_id.to_string(),
                        threats: report.method_names,
                    });
                }
            }
            Ok(report) => {
                self.audit.record(AuditEvent::threat_scan(
                    plugin_id,
                    Some(&report.method_names),
                    false,
                ));
            }
            Err(reason) => {
                warn!(plugin_id = %plugin_id, reason = %reason, "Threat scan inconclusive");
                self.audit.record(AuditEvent::threat_scan(plugin_id, None, false));
            }
        }
        Ok(())
    }

    fn disable(&self, plugin_id: &str) -> PluginResult<PluginInstance> {
        let from = {
            let mut slot = self
                .instances
                .get_mut(plugin_id)
                .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
            let from = slot.state;
            if from == PluginState::Disabled {
                None
            } else if from.can_transition_to(PluginState::Disabled) {
                slot.state = PluginState::Disabled;
                Some(from)
            } else {
                return Err(PluginError::InvalidTransition {
                    plugin_id: plugin_id.to_string(),
                    from,
                    to: PluginState::Disabled,
                });
            }
        };

        if let Some(from) = from {
            self.record_transition(plugin_id, from, PluginState::Disabled, None);
        }
        self.instance(plugin_id)
    }

    async fn unload(&self, plugin_id: &str) {
        let Some((_, slot)) = self.instances.remove(plugin_id) else {
            debug!(plugin_id = %plugin_id, "Unload of a plugin that is not loaded");
            return;
        };

        if let Some(context) = &slot.context {
            context.shutdown().await;
        }
        self.limiter.remove(plugin_id);
        self.rate.reset(plugin_id);
        self.record_transition(plugin_id, slot.state, PluginState::Unloaded, None);
    }

    /// Tear down and drop an instance that failed a check
    async fn retire(&self, plugin_id: &str, reason: &str) {
        let Some((_, slot)) = self.instances.remove(plugin_id) else {
            return;
        };
        if let Some(context) = &slot.context {
            context.teardown();
        }
        self.limiter.remove(plugin_id);
        self.rate.reset(plugin_id);
        self.record_transition(plugin_id, slot.state, PluginState::Error, Some(reason));
    }

    /// Force an instance to DISABLED and release its context immediately
    ///
    /// Does not take the per-plugin lock. `generation` filters out notices
    /// from a context that has since been replaced.
    fn contain(&self, plugin_id: &str, generation: Option<u64>, reason: ContainmentReason) {
        let (from, context) = {
            let Some(mut slot) = self.instances.get_mut(plugin_id) else {
                debug!(plugin_id = %plugin_id, "Containment for an unloaded plugin ignored");
                return;
            };
            if generation.is_some_and(|g| g != slot.generation) {
                debug!(plugin_id = %plugin_id, "Stale containment notice ignored");
                return;
            }
            let Some(context) = slot.context.take() else {
                return;
            };
            let from = slot.state;
            slot.state = PluginState::Disabled;
            slot.last_error = Some(reason.to_string());
            (from, context)
        };

        context.teardown();

        if let ContainmentReason::BudgetExceeded(exceeded) = &reason {
            self.audit.record(AuditEvent::budget_exceeded(
                plugin_id,
                exceeded.resource.as_str(),
                exceeded.used,
                exceeded.limit,
            ));
        }
        let reason = reason.to_string();
        error!(plugin_id = %plugin_id, reason = %reason, "Plugin contained");
        self.audit.record(AuditEvent::contained(plugin_id, &reason));
        if from != PluginState::Disabled {
            self.record_transition(plugin_id, from, PluginState::Disabled, Some(&reason));
        }
    }

    fn advance(&self, plugin_id: &str, state: &mut PluginState, to: PluginState) {
        self.record_transition(plugin_id, *state, to, None);
        *state = to;
    }

    fn record_transition(
        &self,
        plugin_id: &str,
        from: PluginState,
        to: PluginState,
        reason: Option<&str>,
    ) {
        debug_assert!(from.can_transition_to(to), "{from} -> {to}");
        info!(plugin_id = %plugin_id, from = %from, to = %to, "Plugin state changed");
        self.audit.record(AuditEvent::transition(
            plugin_id,
            from.as_str(),
            to.as_str(),
            reason,
        ));
    }

    fn audit_failure(&self, plugin_id: &str, error: &PluginError) {
        match error {
            PluginError::Verification(e) => self.audit.record(AuditEvent::verification_failed(
                plugin_id,
                e.code(),
                &e.to_string(),
            )),
            PluginError::Resolution(e) => self
                .audit
                .record(AuditEvent::resolution_failed(plugin_id, &e.to_string())),
            _ => {}
        }
    }

    fn instance(&self, plugin_id: &str) -> PluginResult<PluginInstance> {
        self.instances
            .get(plugin_id)
            .map(|slot| self.snapshot(plugin_id, &slot))
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))
    }

    fn snapshot(&self, plugin_id: &str, slot: &Slot) -> PluginInstance {
        PluginInstance {
            id: plugin_id.to_string(),
            version: slot.artifact.metadata.version.clone(),
            state: slot.state,
            metadata: Arc::clone(&slot.artifact.metadata),
            created_at: slot.created_at,
            last_verified_at: slot.last_verified_at,
            usage: self.limiter.usage(plugin_id).unwrap_or_default(),
            load_order: slot
                .graph
                .load_order()
                .iter()
                .map(|node| node.id.clone())
                .collect(),
            last_error: slot.last_error.clone(),
            context_live: slot.context.is_some(),
            generation: slot.generation,
        }
    }
}

async fn run_containment(
    inner: Weak<Inner>,
    mut notices: mpsc::UnboundedReceiver<ContainmentNotice>,
) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.contain(&notice.plugin_id, Some(notice.generation), notice.reason);
    }
    debug!("Containment worker stopped");
}
