//! Typed message bodies carried in frame payloads.
//!
//! Bodies are serde types encoded with CBOR. The frame layer treats them as
//! opaque bytes; only the two connection endpoints know the shapes.

use crate::control::io::ConnError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Encode a message body
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ConnError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ConnError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a message body
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ConnError> {
    ciborium::from_reader(bytes).map_err(|e| ConnError::Decode(e.to_string()))
}

// =============================================================================
// IDENTITY AND LAUNCH CONFIG
// =============================================================================

/// Who a weavelet is. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaveletIdentity {
    /// Application name
    pub app: String,
    /// Deployment this weavelet belongs to
    pub deployment_id: String,
    /// Unique id of this weavelet instance
    pub id: String,
    /// All components run in this one process
    #[serde(default)]
    pub single_process: bool,
    /// All processes run on this one machine
    #[serde(default)]
    pub single_machine: bool,
}

impl WeaveletIdentity {
    /// Identity with freshly generated deployment and instance ids.
    pub fn new(app: impl Into<String>, single_process: bool, single_machine: bool) -> Self {
        Self {
            app: app.into(),
            deployment_id: uuid::Uuid::new_v4().to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            single_process,
            single_machine,
        }
    }
}

/// How to launch the weavelet binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Path to the executable
    pub binary: PathBuf,
    /// Command line arguments, not including the binary
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Parse a launch config from JSON, e.g. a deployment file section.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Body of the SETUP frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaveletSetup {
    pub identity: WeaveletIdentity,
    pub config: LaunchConfig,
}

/// Body of the READY frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaveletReady {
    pub pid: u32,
}

// =============================================================================
// LOGS
// =============================================================================

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Component name used for captured standard output
pub const STDOUT_COMPONENT: &str = "stdout";
/// Component name used for captured standard error
pub const STDERR_COMPONENT: &str = "stderr";

/// One structured log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub app: String,
    pub deployment_id: String,
    pub weavelet_id: String,
    /// Source: "stdout", "stderr", or the emitting component's name
    pub component: String,
    pub pid: Option<u32>,
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    pub msg: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl LogEntry {
    /// Entry stamped with the current time and attributed to `identity`.
    pub fn new(
        identity: &WeaveletIdentity,
        component: impl Into<String>,
        level: LogLevel,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            app: identity.app.clone(),
            deployment_id: identity.deployment_id.clone(),
            weavelet_id: identity.id.clone(),
            component: component.into(),
            pid: None,
            time: Utc::now(),
            level,
            file: String::new(),
            line: 0,
            msg: msg.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// TRACES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error(String),
}

/// A finished trace span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    /// All zeroes for a root span
    pub parent_span_id: [u8; 8],
    pub name: String,
    #[serde(default)]
    pub kind: SpanKind,
    /// Microseconds since the Unix epoch
    pub start_micros: i64,
    pub end_micros: i64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub status: SpanStatus,
}

impl Span {
    /// Root span in a new trace, starting and ending now.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_micros();
        let trace = uuid::Uuid::new_v4();
        let span = uuid::Uuid::new_v4();
        let mut span_id = [0u8; 8];
        span_id.copy_from_slice(&span.as_bytes()[..8]);
        Self {
            trace_id: *trace.as_bytes(),
            span_id,
            parent_span_id: [0u8; 8],
            name: name.into(),
            kind: SpanKind::Internal,
            start_micros: now,
            end_micros: now,
            attributes: BTreeMap::new(),
            status: SpanStatus::Unset,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id == [0u8; 8]
    }
}

// =============================================================================
// PROFILING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileType {
    Heap,
    Cpu,
}

/// Request for a single profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub kind: ProfileType,
    /// Sampling window; only meaningful for CPU profiles
    pub cpu_duration: Duration,
}

impl ProfileRequest {
    pub fn heap() -> Self {
        Self {
            kind: ProfileType::Heap,
            cpu_duration: Duration::ZERO,
        }
    }

    pub fn cpu(duration: Duration) -> Self {
        Self {
            kind: ProfileType::Cpu,
            cpu_duration: duration,
        }
    }
}

/// Profile data plus any collection errors.
///
/// A non-empty `errors` list means the profile is partial or missing; the
/// call itself still succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileReply {
    pub data: Vec<u8>,
    #[serde(default)]
    pub errors: Vec<String>,
}

// =============================================================================
// WEAVELET REQUESTS
// =============================================================================

/// A component the weavelet wants started somewhere in the deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentToStart {
    pub app: String,
    pub deployment_id: String,
    pub component: String,
    #[serde(default)]
    pub routed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAddressRequest {
    /// Listener name
    pub name: String,
    /// Address the application asked for, possibly empty
    #[serde(default)]
    pub local_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAddressReply {
    /// Address the weavelet should bind
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportListenerRequest {
    pub name: String,
    /// Address the weavelet actually bound
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExportListenerReply {
    /// Public address of the proxy in front of the listener, if any
    #[serde(default)]
    pub proxy_address: String,
    /// Non-fatal export problem reported back to the application
    #[serde(default)]
    pub error: String,
}

// =============================================================================
// HEALTH
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReply {
    pub status: HealthStatus,
    #[serde(default)]
    pub detail: String,
}

/// Empty body for requests and replies that carry no data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ids_are_unique_per_launch() {
        let a = WeaveletIdentity::new("collatz", true, true);
        let b = WeaveletIdentity::new("collatz", true, true);
        assert_eq!(a.app, b.app);
        assert_ne!(a.id, b.id);
        assert_ne!(a.deployment_id, b.deployment_id);
    }

    #[test]
    fn launch_config_from_json_defaults() {
        let config = LaunchConfig::from_json(r#"{"binary": "/usr/bin/weavelet"}"#).unwrap();
        assert_eq!(config.binary, PathBuf::from("/usr/bin/weavelet"));
        assert!(config.args.is_empty());
        assert!(config.env.is_empty());

        let config = LaunchConfig::from_json(
            r#"{"binary": "w", "args": ["loop"], "env": {"RUST_LOG": "debug"}}"#,
        )
        .unwrap();
        assert_eq!(config.args, vec!["loop".to_string()]);
        assert_eq!(config.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn launch_config_rejects_missing_binary() {
        assert!(LaunchConfig::from_json(r#"{"args": []}"#).is_err());
    }

    #[test]
    fn log_entry_carries_identity() {
        let identity = WeaveletIdentity::new("app", false, true);
        let entry = LogEntry::new(&identity, STDERR_COMPONENT, LogLevel::Error, "boom")
            .with_pid(Some(12))
            .with_attr("k", "v");
        assert_eq!(entry.weavelet_id, identity.id);
        assert_eq!(entry.deployment_id, identity.deployment_id);
        assert_eq!(entry.pid, Some(12));
        assert_eq!(entry.attrs.len(), 1);

        let decoded: LogEntry = decode_payload(&encode_payload(&entry).unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn span_batch_keeps_order() {
        let spans: Vec<Span> = ["span1", "span2", "span3"].into_iter().map(Span::new).collect();
        assert!(spans[0].is_root());
        let decoded: Vec<Span> = decode_payload(&encode_payload(&spans).unwrap()).unwrap();
        let names: Vec<&str> = decoded.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["span1", "span2", "span3"]);
    }

    #[test]
    fn decode_wrong_shape_fails() {
        let bytes = encode_payload(&WeaveletReady { pid: 3 }).unwrap();
        let result: Result<ProfileRequest, _> = decode_payload(&bytes);
        assert!(matches!(result, Err(ConnError::Decode(_))));
    }
}
