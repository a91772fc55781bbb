//! Audit events
//!
//! Every state transition and every security-relevant failure in the plugin
//! host is recorded as an [`AuditEvent`]. Sinks are best-effort: recording an
//! event must never block the caller or fail the operation that produced it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

/// Type of audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Lifecycle state changed
    Transition,
    /// Signature, hash or manifest checks failed
    VerificationFailed,
    /// Dependency resolution failed
    ResolutionFailed,
    /// A resource ceiling was crossed
    BudgetExceeded,
    /// A bridge call was refused for lack of permission
    PermissionDenied,
    /// A request to the plugin did not complete in time
    ChannelTimeout,
    /// A threat scan ran before enabling
    ThreatScan,
    /// A version was installed
    Installed,
    /// The active version was rolled back
    RolledBack,
    /// An instance was forcibly disabled by the host
    Contained,
}

impl AuditEventKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transition => "transition",
            Self::VerificationFailed => "verification_failed",
            Self::ResolutionFailed => "resolution_failed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::PermissionDenied => "permission_denied",
            Self::ChannelTimeout => "channel_timeout",
            Self::ThreatScan => "threat_scan",
            Self::Installed => "installed",
            Self::RolledBack => "rolled_back",
            Self::Contained => "contained",
        }
    }

    /// Whether this kind reports a failure rather than a routine change
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Transition | Self::Installed | Self::ThreatScan)
    }
}

impl std::fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// Plugin this event relates to
    pub plugin_id: String,
    /// Type of event
    pub kind: AuditEventKind,
    /// Event data (never carries plugin payloads)
    pub data: Option<serde_json::Value>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        plugin_id: impl Into<String>,
        kind: AuditEventKind,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin_id: plugin_id.into(),
            kind,
            data,
            created_at: Utc::now(),
        }
    }

    /// State transition, with an optional reason (e.g. "budget exceeded")
    pub fn transition(plugin_id: &str, from: &str, to: &str, reason: Option<&str>) -> Self {
        let data = serde_json::json!({
            "from": from,
            "to": to,
            "reason": reason,
        });
        Self::new(plugin_id, AuditEventKind::Transition, Some(data))
    }

    pub fn verification_failed(plugin_id: &str, error_code: &str, message: &str) -> Self {
        let data = serde_json::json!({
            "error_code": error_code,
            "message": message,
        });
        Self::new(plugin_id, AuditEventKind::VerificationFailed, Some(data))
    }

    pub fn resolution_failed(plugin_id: &str, message: &str) -> Self {
        let data = serde_json::json!({ "message": message });
        Self::new(plugin_id, AuditEventKind::ResolutionFailed, Some(data))
    }

    pub fn budget_exceeded(plugin_id: &str, resource: &str, used: u64, limit: u64) -> Self {
        let data = serde_json::json!({
            "resource": resource,
            "used": used,
            "limit": limit,
        });
        Self::new(plugin_id, AuditEventKind::BudgetExceeded, Some(data))
    }

    pub fn permission_denied(plugin_id: &str, permission: &str, detail: &str) -> Self {
        let data = serde_json::json!({
            "permission": permission,
            "detail": detail,
        });
        Self::new(plugin_id, AuditEventKind::PermissionDenied, Some(data))
    }

    pub fn channel_timeout(plugin_id: &str, correlation_id: &str, timeout_ms: u64) -> Self {
        let data = serde_json::json!({
            "correlation_id": correlation_id,
            "timeout_ms": timeout_ms,
        });
        Self::new(plugin_id, AuditEventKind::ChannelTimeout, Some(data))
    }

    /// Threat scan outcome; `threats` is `None` when the scan was inconclusive
    pub fn threat_scan(plugin_id: &str, threats: Option<&[String]>, blocked: bool) -> Self {
        let data = serde_json::json!({
            "threats": threats,
            "inconclusive": threats.is_none(),
            "blocked": blocked,
        });
        Self::new(plugin_id, AuditEventKind::ThreatScan, Some(data))
    }

    pub fn installed(plugin_id: &str, version: &str) -> Self {
        let data = serde_json::json!({ "version": version });
        Self::new(plugin_id, AuditEventKind::Installed, Some(data))
    }

    pub fn rolled_back(plugin_id: &str, from: Option<&str>, to: &str) -> Self {
        let data = serde_json::json!({
            "from": from,
            "to": to,
        });
        Self::new(plugin_id, AuditEventKind::RolledBack, Some(data))
    }

    pub fn contained(plugin_id: &str, reason: &str) -> Self {
        let data = serde_json::json!({ "reason": reason });
        Self::new(plugin_id, AuditEventKind::Contained, Some(data))
    }
}

/// Destination for audit events
///
/// Implementations must not block and must swallow their own failures.
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: AuditEvent);
}

/// Emits audit events as structured tracing records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let data = event
            .data
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();

        if event.kind.is_failure() {
            warn!(
                target: "palisade::audit",
                event_id = %event.id,
                plugin_id = %event.plugin_id,
                kind = %event.kind,
                data = %data,
                "audit"
            );
        } else {
            info!(
                target: "palisade::audit",
                event_id = %event.id,
                plugin_id = %event.plugin_id,
                kind = %event.kind,
                data = %data,
                "audit"
            );
        }
    }
}

/// Forwards audit events to a bounded channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(target: "palisade::audit", error = %e, "Dropping audit event");
        }
    }
}

/// Keeps audit events in memory for later inspection
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind for one plugin
    pub fn events_for(&self, plugin_id: &str, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.plugin_id == plugin_id && e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Sends every event to each of several sinks
#[derive(Debug, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// Publishes audit events to any number of live subscribers
///
/// Slow subscribers lag and lose the oldest events; recording never waits.
#[derive(Debug, Clone)]
pub struct BroadcastAuditSink {
    tx: broadcast::Sender<AuditEvent>,
}

impl BroadcastAuditSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.tx.subscribe()
    }
}

impl AuditSink for BroadcastAuditSink {
    fn record(&self, event: AuditEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_as_str() {
        assert_eq!(AuditEventKind::Transition.as_str(), "transition");
        assert_eq!(AuditEventKind::ChannelTimeout.to_string(), "channel_timeout");
        assert!(AuditEventKind::BudgetExceeded.is_failure());
        assert!(!AuditEventKind::Transition.is_failure());
    }

    #[test]
    fn test_transition_event_data() {
        let event = AuditEvent::transition("p", "ENABLED", "DISABLED", Some("budget exceeded"));
        assert_eq!(event.kind, AuditEventKind::Transition);
        let data = event.data.unwrap();
        assert_eq!(data["from"], "ENABLED");
        assert_eq!(data["to"], "DISABLED");
        assert_eq!(data["reason"], "budget exceeded");
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::channel_timeout("a", "7", 100));
        sink.record(AuditEvent::channel_timeout("b", "8", 100));
        sink.record(AuditEvent::installed("a", "1.0.0"));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.events_for("a", AuditEventKind::ChannelTimeout).len(), 1);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelAuditSink::new(1);
        sink.record(AuditEvent::installed("a", "1.0.0"));
        sink.record(AuditEvent::installed("a", "1.0.1"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data.unwrap()["version"], "1.0.0");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAuditSink::new());
        let b = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutAuditSink::new(vec![a.clone(), b.clone()]);
        fanout.record(AuditEvent::contained("p", "timeouts"));

        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_sink_reaches_subscribers() {
        let sink = BroadcastAuditSink::new(8);
        sink.record(AuditEvent::installed("p", "0.9.0"));

        let mut rx = sink.subscribe();
        sink.record(AuditEvent::installed("p", "1.0.0"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.data.unwrap()["version"], "1.0.0");
    }

    #[test]
    fn test_inconclusive_scan_flag() {
        let event = AuditEvent::threat_scan("p", None, false);
        assert_eq!(event.data.unwrap()["inconclusive"], true);
    }
}
