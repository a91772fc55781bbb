//! Isolation broker
//!
//! Opens isolation contexts and mediates every message that crosses the
//! boundary. Each bridge call passes the permission check, then the rate
//! limiter, then the resource limiter, before anything executes. The broker
//! never changes lifecycle state; breaches, repeated timeouts and dead
//! contexts are reported as [`ContainmentNotice`]s for the lifecycle manager.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use palisade_core::audit::{AuditEvent, AuditSink};
use palisade_core::config::ChannelConfig;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::bus::MessageBus;
use super::entry::PluginEntry;
use super::fs::FsBridge;
use super::network::{DisconnectedEgress, EgressError, NetworkEgress, NetworkPolicy};
use super::protocol::{
    BridgeCall, BridgeFailure, BridgeResult, BridgeValue, BusMessage, Envelope, HostRequest,
    Inbound, LogLevel, Outbound,
};
use super::runtime::spawn_context;
use crate::limiter::{BudgetExceeded, ResourceKind, ResourceLimiter};
use crate::manifest::{Permission, PluginMetadata};
use crate::ratelimit::RateLimiter;
use crate::{PluginError, PluginResult};

const MAX_LOG_MESSAGE_CHARS: usize = 4_096;

/// Why the broker wants an instance contained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainmentReason {
    BudgetExceeded(BudgetExceeded),
    RepeatedTimeouts { count: u32 },
    ContextDied,
}

impl fmt::Display for ContainmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded(e) => write!(f, "{} budget exceeded", e.resource),
            Self::RepeatedTimeouts { count } => write!(f, "{count} consecutive channel timeouts"),
            Self::ContextDied => f.write_str("isolation context died"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainmentNotice {
    pub plugin_id: String,
    /// Load generation of the context that raised it
    pub generation: u64,
    pub reason: ContainmentReason,
}

#[derive(Debug)]
struct Shared {
    rate: Arc<RateLimiter>,
    limiter: Arc<ResourceLimiter>,
    bus: MessageBus,
    fs: FsBridge,
    policy: NetworkPolicy,
    egress: Arc<dyn NetworkEgress>,
    audit: Arc<dyn AuditSink>,
    channel: ChannelConfig,
    containment: mpsc::UnboundedSender<ContainmentNotice>,
}

#[derive(Debug)]
pub struct IsolationBroker {
    shared: Arc<Shared>,
}

impl IsolationBroker {
    /// Create a broker and the receiving end of its containment notices
    pub fn new(
        rate: Arc<RateLimiter>,
        limiter: Arc<ResourceLimiter>,
        audit: Arc<dyn AuditSink>,
        files_root: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<ContainmentNotice>) {
        Self::with_options(
            rate,
            limiter,
            audit,
            files_root,
            BrokerOptions::default(),
        )
    }

    pub fn with_options(
        rate: Arc<RateLimiter>,
        limiter: Arc<ResourceLimiter>,
        audit: Arc<dyn AuditSink>,
        files_root: impl Into<PathBuf>,
        options: BrokerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ContainmentNotice>) {
        let (containment, notices) = mpsc::unbounded_channel();
        let shared = Shared {
            rate,
            limiter,
            bus: MessageBus::new(),
            fs: FsBridge::new(files_root),
            policy: options.policy,
            egress: options.egress,
            audit,
            channel: options.channel,
            containment,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            notices,
        )
    }

    pub fn bus(&self) -> &MessageBus {
        &self.shared.bus
    }

    pub fn channel_config(&self) -> &ChannelConfig {
        &self.shared.channel
    }

    /// Start an isolation context running `entry`
    pub fn open(
        &self,
        metadata: Arc<PluginMetadata>,
        entry: Box<dyn PluginEntry>,
        generation: u64,
    ) -> ContextHandle {
        let channels = spawn_context(&metadata.id, entry, self.shared.channel.queue_depth);
        self.shared.bus.register(
            &metadata.id,
            channels.inbound.clone(),
            metadata.has_permission(Permission::Messaging),
        );

        let state = Arc::new(ChannelState::default());
        let pump = tokio::spawn(pump(
            Arc::clone(&self.shared),
            Arc::clone(&metadata),
            generation,
            channels.inbound.clone(),
            channels.outbound,
            Arc::clone(&state),
        ));

        info!(plugin_id = %metadata.id, generation, "Isolation context opened");

        ContextHandle {
            plugin_id: metadata.id.clone(),
            generation,
            inbound: channels.inbound,
            state,
            shared: Arc::clone(&self.shared),
            tasks: Mutex::new(vec![channels.router, channels.worker, pump.abort_handle()]),
            torn_down: AtomicBool::new(false),
        }
    }
}

/// Optional collaborators; the defaults allow no network access
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub policy: NetworkPolicy,
    pub egress: Arc<dyn NetworkEgress>,
    pub channel: ChannelConfig,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            policy: NetworkPolicy::default(),
            egress: Arc::new(DisconnectedEgress),
            channel: ChannelConfig::default(),
        }
    }
}

type PendingReplies = DashMap<u64, oneshot::Sender<Result<Value, String>>>;

#[derive(Debug, Default)]
struct ChannelState {
    pending: PendingReplies,
    next_id: AtomicU64,
    consecutive_timeouts: AtomicU32,
    closing: AtomicBool,
}

/// Host-side handle on one running context
#[derive(Debug)]
pub struct ContextHandle {
    plugin_id: String,
    generation: u64,
    inbound: mpsc::Sender<Envelope<Inbound>>,
    state: Arc<ChannelState>,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<AbortHandle>>,
    torn_down: AtomicBool,
}

impl ContextHandle {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.state.consecutive_timeouts.load(Ordering::Acquire)
    }

    /// Send a request and wait for the reply, up to the channel timeout
    ///
    /// A timeout abandons the reply only; anything the context already charged
    /// stays charged.
    pub async fn request(&self, request: HostRequest) -> PluginResult<Value> {
        if self.is_torn_down() {
            return Err(PluginError::ChannelClosed(self.plugin_id.clone()));
        }

        let correlation_id = self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.state.pending.insert(correlation_id, tx);

        let timeout_ms = self.shared.channel.request_timeout_ms;
        let exchange = async {
            self.inbound
                .send(Envelope::new(correlation_id, Inbound::Request(request)))
                .await
                .map_err(|_| ())?;
            rx.await.map_err(|_| ())
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), exchange).await {
            Ok(Ok(reply)) => {
                self.state.consecutive_timeouts.store(0, Ordering::Release);
                reply.map_err(|message| PluginError::Invocation {
                    plugin_id: self.plugin_id.clone(),
                    message,
                })
            }
            Ok(Err(())) => {
                self.state.pending.remove(&correlation_id);
                Err(PluginError::ChannelClosed(self.plugin_id.clone()))
            }
            Err(_) => {
                self.state.pending.remove(&correlation_id);
                self.on_timeout(correlation_id, timeout_ms);
                Err(PluginError::ChannelTimeout {
                    plugin_id: self.plugin_id.clone(),
                    correlation_id,
                    timeout_ms,
                })
            }
        }
    }

    pub async fn invoke(&self, command: &str, args: Value) -> PluginResult<Value> {
        self.request(HostRequest::Invoke {
            command: command.to_string(),
            args,
        })
        .await
    }

    pub async fn ping(&self) -> PluginResult<()> {
        self.request(HostRequest::Ping).await.map(|_| ())
    }

    /// Ask the plugin to stop, then release the context whatever the answer
    pub async fn shutdown(&self) {
        if self.is_torn_down() {
            return;
        }
        self.state.closing.store(true, Ordering::Release);
        if let Err(e) = self.request(HostRequest::Shutdown).await {
            debug!(plugin_id = %self.plugin_id, error = %e, "Plugin did not acknowledge shutdown");
        }
        self.teardown();
    }

    /// Release the context immediately; safe to call more than once
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.closing.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.bus.unregister(&self.plugin_id, &self.inbound);
        self.state.pending.clear();
        info!(plugin_id = %self.plugin_id, generation = self.generation, "Isolation context released");
    }

    fn on_timeout(&self, correlation_id: u64, timeout_ms: u64) {
        if self.state.closing.load(Ordering::Acquire) {
            return;
        }

        let count = self
            .state
            .consecutive_timeouts
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        warn!(
            plugin_id = %self.plugin_id,
            correlation_id,
            timeout_ms,
            consecutive = count,
            "Plugin did not answer in time"
        );
        self.shared.audit.record(AuditEvent::channel_timeout(
            &self.plugin_id,
            &correlation_id.to_string(),
            timeout_ms,
        ));

        if count >= self.shared.channel.max_consecutive_timeouts {
            self.shared.contain(
                &self.plugin_id,
                self.generation,
                ContainmentReason::RepeatedTimeouts { count },
            );
        }
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn pump(
    shared: Arc<Shared>,
    metadata: Arc<PluginMetadata>,
    generation: u64,
    inbound: mpsc::Sender<Envelope<Inbound>>,
    mut outbound: mpsc::Receiver<Envelope<Outbound>>,
    state: Arc<ChannelState>,
) {
    let mut bridges = JoinSet::new();

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(envelope) = message else { break };
                let correlation_id = envelope.correlation_id;

                if !envelope.is_supported() {
                    warn!(
                        plugin_id = %metadata.id,
                        version = envelope.version,
                        "Rejecting message with foreign protocol version"
                    );
                    if matches!(envelope.body, Outbound::Bridge(_)) {
                        let failure = BridgeFailure::UnsupportedVersion { version: envelope.version };
                        let _ = inbound.try_send(Envelope::new(correlation_id, Inbound::BridgeReply(Err(failure))));
                    }
                    continue;
                }

                match envelope.body {
                    Outbound::Reply(result) => match state.pending.remove(&correlation_id) {
                        Some((_, tx)) => {
                            let _ = tx.send(result);
                        }
                        None => debug!(plugin_id = %metadata.id, correlation_id, "Late reply dropped"),
                    },
                    Outbound::Bridge(call) => {
                        let shared = Arc::clone(&shared);
                        let metadata = Arc::clone(&metadata);
                        let inbound = inbound.clone();
                        bridges.spawn(async move {
                            let result = shared.dispatch(&metadata, generation, call).await;
                            let reply = Envelope::new(correlation_id, Inbound::BridgeReply(result));
                            let _ = inbound.send(reply).await;
                        });
                    }
                }
            }
            Some(_) = bridges.join_next(), if !bridges.is_empty() => {}
        }
    }

    // Waiting requests see a closed channel.
    state.pending.clear();
    if !state.closing.load(Ordering::Acquire) {
        error!(plugin_id = %metadata.id, generation, "Isolation context died");
        shared.contain(&metadata.id, generation, ContainmentReason::ContextDied);
    }
}

impl Shared {
    fn contain(&self, plugin_id: &str, generation: u64, reason: ContainmentReason) {
        let notice = ContainmentNotice {
            plugin_id: plugin_id.to_string(),
            generation,
            reason,
        };
        if self.containment.send(notice).is_err() {
            debug!(plugin_id = %plugin_id, "Containment receiver is gone");
        }
    }

    async fn dispatch(
        &self,
        metadata: &PluginMetadata,
        generation: u64,
        call: BridgeCall,
    ) -> BridgeResult {
        let plugin_id = metadata.id.as_str();
        let operation = call.operation();

        if let Some(permission) = call.required_permission() {
            if !metadata.has_permission(permission) {
                warn!(
                    plugin_id = %plugin_id,
                    permission = %permission,
                    op_code = ?call.op_code(),
                    "Bridge call without permission"
                );
                self.audit.record(AuditEvent::permission_denied(
                    plugin_id,
                    permission.as_str(),
                    operation,
                ));
                return Err(BridgeFailure::denied(permission));
            }
        }

        if !self.rate.try_acquire(plugin_id, operation) {
            return Err(BridgeFailure::Throttled {
                operation: operation.to_string(),
            });
        }

        let used = match call.charge() {
            Some((kind, amount)) => Some(self.charge(plugin_id, generation, kind, amount)?),
            None => None,
        };

        let result = self.execute(metadata, generation, call, used).await;
        if let Err(BridgeFailure::PermissionDenied {
            permission,
            path: Some(path),
        }) = &result
        {
            self.audit.record(AuditEvent::permission_denied(
                plugin_id,
                permission.as_str(),
                &format!("{operation} outside the plugin directory: {path}"),
            ));
        }
        result
    }

    fn charge(
        &self,
        plugin_id: &str,
        generation: u64,
        kind: ResourceKind,
        amount: u64,
    ) -> Result<u64, BridgeFailure> {
        self.limiter.charge(plugin_id, kind, amount).map_err(|exceeded| {
            let resource = exceeded.resource;
            self.contain(
                plugin_id,
                generation,
                ContainmentReason::BudgetExceeded(exceeded),
            );
            BridgeFailure::BudgetExceeded { resource }
        })
    }

    async fn execute(
        &self,
        metadata: &PluginMetadata,
        generation: u64,
        call: BridgeCall,
        used: Option<u64>,
    ) -> BridgeResult {
        let plugin_id = metadata.id.as_str();
        match call {
            BridgeCall::ReadFile { path } => self.fs.read(plugin_id, &path).await.map(BridgeValue::Bytes),
            BridgeCall::WriteFile { path, data } => self
                .fs
                .write(plugin_id, &path, &data)
                .await
                .map(|()| BridgeValue::Unit),
            BridgeCall::DeleteFile { path } => self
                .fs
                .delete(plugin_id, &path)
                .await
                .map(|()| BridgeValue::Unit),
            BridgeCall::ListDir { path } => self.fs.list(plugin_id, &path).await.map(BridgeValue::Entries),
            BridgeCall::NetworkSend { url, body } => {
                let url = self
                    .policy
                    .check(&url, &metadata.allowed_hosts)
                    .map_err(|violation| {
                        warn!(plugin_id = %plugin_id, reason = %violation, "Network destination refused");
                        self.audit.record(AuditEvent::permission_denied(
                            plugin_id,
                            Permission::Network.as_str(),
                            &violation.to_string(),
                        ));
                        BridgeFailure::failed(violation.to_string())
                    })?;

                let allowance = self
                    .limiter
                    .remaining(plugin_id, ResourceKind::NetworkBytes)
                    .unwrap_or_default();
                let response = match self.egress.send(&url, body, allowance).await {
                    Ok(response) => response,
                    Err(EgressError::OverBudget { received }) => {
                        // Whatever was read counts; past the allowance that is a breach.
                        self.charge(plugin_id, generation, ResourceKind::NetworkBytes, received)?;
                        return Err(BridgeFailure::BudgetExceeded {
                            resource: ResourceKind::NetworkBytes,
                        });
                    }
                    Err(EgressError::Failed(message)) => return Err(BridgeFailure::failed(message)),
                };
                self.charge(
                    plugin_id,
                    generation,
                    ResourceKind::NetworkBytes,
                    response.len() as u64,
                )?;
                Ok(BridgeValue::Bytes(response))
            }
            BridgeCall::Publish { topic, payload, to } => {
                let message = BusMessage {
                    from: plugin_id.to_string(),
                    topic,
                    payload,
                };
                Ok(BridgeValue::Delivered(self.bus.publish(message, to.as_deref())))
            }
            BridgeCall::Subscribe { topic } => {
                self.bus.subscribe(plugin_id, &topic);
                Ok(BridgeValue::Unit)
            }
            BridgeCall::SubmitLog {
                level,
                message,
                exception,
            } => {
                let message: String = message.chars().take(MAX_LOG_MESSAGE_CHARS).collect();
                let exception = exception.unwrap_or_default();
                match level {
                    LogLevel::Debug => debug!(target: "palisade::plugin", plugin_id = %plugin_id, exception = %exception, "{message}"),
                    LogLevel::Info => info!(target: "palisade::plugin", plugin_id = %plugin_id, exception = %exception, "{message}"),
                    LogLevel::Warn => warn!(target: "palisade::plugin", plugin_id = %plugin_id, exception = %exception, "{message}"),
                    LogLevel::Error => error!(target: "palisade::plugin", plugin_id = %plugin_id, exception = %exception, "{message}"),
                }
                Ok(BridgeValue::Unit)
            }
            BridgeCall::ReportMemory { .. } | BridgeCall::ReportCpu { .. } => {
                Ok(BridgeValue::Used(used.unwrap_or_default()))
            }
        }
    }
}
