//! Closed, versioned message protocol between the host and an isolation context
//!
//! Every message travels in an [`Envelope`] carrying the protocol version and a
//! correlation id. The host sends [`Inbound`] messages; the context answers with
//! [`Outbound`] messages. A context reaches host capabilities only through the
//! fixed set of [`BridgeCall`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::limiter::ResourceKind;
use crate::manifest::Permission;

pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u16,
    pub correlation_id: u64,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(correlation_id: u64, body: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            body,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Calls the host makes into the plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequest {
    Invoke { command: String, args: Value },
    Ping,
    Shutdown,
}

/// Host -> context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Inbound {
    Request(HostRequest),
    BridgeReply(BridgeResult),
    Deliver(BusMessage),
}

/// Context -> host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Outbound {
    Reply(Result<Value, String>),
    Bridge(BridgeCall),
}

/// Wire operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum OpCode {
    ReadFile = 0x0101,
    WriteFile = 0x0102,
    DeleteFile = 0x0103,
    ListDir = 0x0104,
    NetworkSend = 0x0201,
    Publish = 0x0301,
    Subscribe = 0x0302,
    SubmitLog = 0x0401,
    ReportMemory = 0x0501,
    ReportCpu = 0x0502,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Capability requests from inside the context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeCall {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        data: Vec<u8>,
    },
    DeleteFile {
        path: String,
    },
    ListDir {
        path: String,
    },
    NetworkSend {
        url: String,
        body: Vec<u8>,
    },
    Publish {
        topic: String,
        payload: Value,
        /// Direct delivery to one plugin instead of topic fan-out
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    Subscribe {
        topic: String,
    },
    SubmitLog {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<String>,
    },
    /// Newly allocated memory, as measured inside the context
    ReportMemory {
        bytes: u64,
    },
    ReportCpu {
        millis: u64,
    },
}

impl BridgeCall {
    pub fn op_code(&self) -> OpCode {
        match self {
            Self::ReadFile { .. } => OpCode::ReadFile,
            Self::WriteFile { .. } => OpCode::WriteFile,
            Self::DeleteFile { .. } => OpCode::DeleteFile,
            Self::ListDir { .. } => OpCode::ListDir,
            Self::NetworkSend { .. } => OpCode::NetworkSend,
            Self::Publish { .. } => OpCode::Publish,
            Self::Subscribe { .. } => OpCode::Subscribe,
            Self::SubmitLog { .. } => OpCode::SubmitLog,
            Self::ReportMemory { .. } => OpCode::ReportMemory,
            Self::ReportCpu { .. } => OpCode::ReportCpu,
        }
    }

    /// Rate-limit bucket name
    pub fn operation(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::DeleteFile { .. } => "delete_file",
            Self::ListDir { .. } => "list_dir",
            Self::NetworkSend { .. } => "network_send",
            Self::Publish { .. } => "publish",
            Self::Subscribe { .. } => "subscribe",
            Self::SubmitLog {
                exception: Some(_), ..
            } => "submit_log_exception",
            Self::SubmitLog { .. } => "submit_log",
            Self::ReportMemory { .. } => "report_memory",
            Self::ReportCpu { .. } => "report_cpu",
        }
    }

    /// Permission the plugin must have declared; usage reports need none
    pub fn required_permission(&self) -> Option<Permission> {
        match self {
            Self::ReadFile { .. } | Self::ListDir { .. } => Some(Permission::ReadFiles),
            Self::WriteFile { .. } | Self::DeleteFile { .. } => Some(Permission::WriteFiles),
            Self::NetworkSend { .. } => Some(Permission::Network),
            Self::Publish { .. } | Self::Subscribe { .. } => Some(Permission::Messaging),
            Self::SubmitLog { .. } => Some(Permission::Logging),
            Self::ReportMemory { .. } | Self::ReportCpu { .. } => None,
        }
    }

    /// Resource charged before the call executes
    pub fn charge(&self) -> Option<(ResourceKind, u64)> {
        match self {
            Self::WriteFile { data, .. } => Some((ResourceKind::DiskBytes, data.len() as u64)),
            Self::NetworkSend { body, .. } => {
                Some((ResourceKind::NetworkBytes, body.len() as u64))
            }
            Self::ReportMemory { bytes } => Some((ResourceKind::MemoryBytes, *bytes)),
            Self::ReportCpu { millis } => Some((ResourceKind::CpuMillis, *millis)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BridgeValue {
    Unit,
    Bytes(Vec<u8>),
    Entries(Vec<String>),
    /// Cumulative usage after a report
    Used(u64),
    Delivered(usize),
}

/// Why the host refused or failed a bridge call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFailure {
    #[error("permission '{permission}' not granted{}", format_path(.path))]
    PermissionDenied {
        permission: Permission,
        /// Set when the call named a path outside the plugin directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    #[error("rate limited on '{operation}'")]
    Throttled { operation: String },

    #[error("{resource} budget exhausted")]
    BudgetExceeded { resource: ResourceKind },

    #[error("not found")]
    NotFound,

    #[error("unsupported protocol version {version}")]
    UnsupportedVersion { version: u16 },

    #[error("{message}")]
    Failed { message: String },
}

impl BridgeFailure {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn denied(permission: Permission) -> Self {
        Self::PermissionDenied {
            permission,
            path: None,
        }
    }

    /// `path` does not stay inside the plugin directory
    pub fn outside(permission: Permission, path: &str) -> Self {
        Self::PermissionDenied {
            permission,
            path: Some(path.to_string()),
        }
    }
}

fn format_path(path: &Option<String>) -> String {
    match path {
        Some(path) => format!(" for path '{path}' outside the plugin directory"),
        None => String::new(),
    }
}

pub type BridgeResult = Result<BridgeValue, BridgeFailure>;

/// A message carried by the host bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub from: String,
    pub topic: String,
    pub payload: Value,
}
