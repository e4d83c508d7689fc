//! Control Frame Types for Envelope/Weavelet Communication
//!
//! Every message exchanged over the control pipes is a single frame: a CBOR
//! map with integer keys. The typed body of a message travels as an opaque
//! CBOR byte string in the payload field, so the frame layer never needs to
//! know message shapes.
//!
//! ## Frame Format
//!
//! ```text
//! {
//!   0: version (u8, always 1)
//!   1: msg_type (u8)
//!   2: id (uint, 0 for one-way messages)
//!   3: payload (bstr, optional)
//!   4: error (tstr, optional - only on failed replies)
//! }
//! ```
//!
//! ## Message Types
//!
//! - SETUP (0): envelope → weavelet, identity and launch config
//! - READY (1): weavelet → envelope, explicit liveness signal
//! - LOG_ENTRY (2): weavelet → envelope, structured log record
//! - TRACE_SPANS (3): weavelet → envelope, batch of finished spans
//! - START_COMPONENT (4), GET_ADDRESS (5), EXPORT_LISTENER (6): weavelet → envelope requests
//! - RUN_PROFILING (7), GET_HEALTH (8): envelope → weavelet requests
//! - REPLY (9): either direction, correlated by id

use crate::control::io::ConnError;
use ciborium::Value;
use std::collections::BTreeMap;

/// Control protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Identity and launch configuration, first frame from the envelope
    Setup = 0,
    /// Weavelet finished bootstrapping
    Ready = 1,
    /// Structured log entry from the weavelet's logger
    LogEntry = 2,
    /// Batch of trace spans
    TraceSpans = 3,
    /// Ask the envelope to start a component
    StartComponent = 4,
    /// Ask the envelope which address to listen on
    GetAddress = 5,
    /// Tell the envelope a listener is ready to be exported
    ExportListener = 6,
    /// Ask the weavelet for a profile
    RunProfiling = 7,
    /// Ask the weavelet for its health status
    GetHealth = 8,
    /// Response to any request, correlated by id
    Reply = 9,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::Setup),
            1 => Some(MessageType::Ready),
            2 => Some(MessageType::LogEntry),
            3 => Some(MessageType::TraceSpans),
            4 => Some(MessageType::StartComponent),
            5 => Some(MessageType::GetAddress),
            6 => Some(MessageType::ExportListener),
            7 => Some(MessageType::RunProfiling),
            8 => Some(MessageType::GetHealth),
            9 => Some(MessageType::Reply),
            _ => None,
        }
    }

    /// True for message types that expect a correlated REPLY.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::StartComponent
                | MessageType::GetAddress
                | MessageType::ExportListener
                | MessageType::RunProfiling
                | MessageType::GetHealth
        )
    }
}

/// A control protocol frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Protocol version
    pub version: u8,
    /// Message type
    pub msg_type: MessageType,
    /// Correlation id; 0 for one-way messages
    pub id: u64,
    /// CBOR-encoded message body
    pub payload: Option<Vec<u8>>,
    /// Failure description on a REPLY
    pub error: Option<String>,
}

impl Frame {
    /// Create a new frame with required fields
    pub fn new(msg_type: MessageType, id: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            id,
            payload: None,
            error: None,
        }
    }

    /// One-way message carrying a body
    pub fn one_way(msg_type: MessageType, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(msg_type, 0);
        frame.payload = Some(payload);
        frame
    }

    /// Request carrying a body; `id` must be non-zero
    pub fn request(msg_type: MessageType, id: u64, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(msg_type, id);
        frame.payload = Some(payload);
        frame
    }

    /// Successful reply to request `id`
    pub fn reply(id: u64, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(MessageType::Reply, id);
        frame.payload = Some(payload);
        frame
    }

    /// Failed reply to request `id`
    pub fn reply_err(id: u64, message: impl Into<String>) -> Self {
        let mut frame = Self::new(MessageType::Reply, id);
        frame.error = Some(message.into());
        frame
    }

    /// Payload bytes, empty when absent
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }
}

/// Integer keys for CBOR map fields
pub mod keys {
    pub const VERSION: u64 = 0;
    pub const MSG_TYPE: u64 = 1;
    pub const ID: u64 = 2;
    pub const PAYLOAD: u64 = 3;
    pub const ERROR: u64 = 4;
}

/// Encode a frame to CBOR bytes
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ConnError> {
    let mut map: Vec<(Value, Value)> = Vec::with_capacity(5);

    map.push((
        Value::Integer(keys::VERSION.into()),
        Value::Integer(frame.version.into()),
    ));
    map.push((
        Value::Integer(keys::MSG_TYPE.into()),
        Value::Integer((frame.msg_type as u8).into()),
    ));
    map.push((Value::Integer(keys::ID.into()), Value::Integer(frame.id.into())));

    if let Some(ref payload) = frame.payload {
        map.push((
            Value::Integer(keys::PAYLOAD.into()),
            Value::Bytes(payload.clone()),
        ));
    }

    if let Some(ref error) = frame.error {
        map.push((Value::Integer(keys::ERROR.into()), Value::Text(error.clone())));
    }

    let mut buf = Vec::new();
    ciborium::into_writer(&Value::Map(map), &mut buf)
        .map_err(|e| ConnError::Encode(e.to_string()))?;
    Ok(buf)
}

fn as_uint(v: &Value) -> Option<u64> {
    match v {
        Value::Integer(i) => u64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

/// Decode a frame from CBOR bytes
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ConnError> {
    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| ConnError::Decode(e.to_string()))?;

    let map = match value {
        Value::Map(m) => m,
        _ => return Err(ConnError::InvalidFrame("expected map".to_string())),
    };

    let mut lookup: BTreeMap<u64, Value> = BTreeMap::new();
    for (k, v) in map {
        if let Some(key) = as_uint(&k) {
            lookup.insert(key, v);
        }
    }

    let version = lookup
        .get(&keys::VERSION)
        .and_then(as_uint)
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| ConnError::InvalidFrame("missing version".to_string()))?;

    if version != PROTOCOL_VERSION {
        return Err(ConnError::InvalidFrame(format!(
            "unsupported protocol version {}",
            version
        )));
    }

    let type_code = lookup
        .get(&keys::MSG_TYPE)
        .and_then(as_uint)
        .ok_or_else(|| ConnError::InvalidFrame("missing msg_type".to_string()))?;

    let msg_type = u8::try_from(type_code)
        .ok()
        .and_then(MessageType::from_u8)
        .ok_or_else(|| ConnError::InvalidFrame(format!("invalid msg_type: {}", type_code)))?;

    let id = lookup
        .get(&keys::ID)
        .and_then(as_uint)
        .ok_or_else(|| ConnError::InvalidFrame("missing id".to_string()))?;

    let payload = lookup.get(&keys::PAYLOAD).and_then(|v| match v {
        Value::Bytes(b) => Some(b.clone()),
        _ => None,
    });

    let error = lookup.get(&keys::ERROR).and_then(|v| match v {
        Value::Text(s) => Some(s.clone()),
        _ => None,
    });

    if msg_type.is_request() && id == 0 {
        return Err(ConnError::InvalidFrame(format!(
            "{:?} request without correlation id",
            msg_type
        )));
    }

    Ok(Frame {
        version,
        msg_type,
        id,
        payload,
        error,
    })
}
