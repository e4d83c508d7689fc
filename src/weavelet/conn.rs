//! Weavelet end of the control connection.
//!
//! Blocking, thread based. `serve` runs the read loop on the calling thread;
//! requests the weavelet sends (`get_address` and friends) block on a
//! crossbeam channel until that loop hands them their reply, so `serve` must
//! be running on some other thread for them to complete.

use crate::control::bootstrap::Bootstrap;
use crate::control::frame::{Frame, MessageType};
use crate::control::io::{handshake_accept, ConnError, FrameReader, FrameWriter};
use crate::control::messages::{
    decode_payload, encode_payload, ComponentToStart, Empty, ExportListenerReply,
    ExportListenerRequest, GetAddressReply, GetAddressRequest, HealthReply, HealthStatus,
    LaunchConfig, LogEntry, LogLevel, ProfileRequest, Span, WeaveletIdentity, WeaveletSetup,
};
use crate::weavelet::profiler;
use crossbeam_channel::{bounded, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type BoxedReader = BufReader<Box<dyn Read + Send>>;
type BoxedWriter = BufWriter<Box<dyn Write + Send>>;
type ReplySender = Sender<Result<Frame, ConnError>>;

#[derive(Default)]
struct PendingReplies {
    waiters: HashMap<u64, ReplySender>,
    failure: Option<ConnError>,
}

pub struct WeaveletConn {
    setup: WeaveletSetup,
    pid: u32,
    reader: Mutex<Option<FrameReader<BoxedReader>>>,
    writer: Arc<Mutex<FrameWriter<BoxedWriter>>>,
    pending: Mutex<PendingReplies>,
    next_id: AtomicU64,
}

impl WeaveletConn {
    /// Connect using the control pipes the envelope left in the environment.
    pub fn from_env() -> Result<Self, ConnError> {
        let (reader, writer) = Bootstrap::from_env()?.into_files()?;
        Self::new(reader, writer)
    }

    /// Connect over explicit streams: read SETUP, answer READY.
    pub fn new<R, W>(reader: R, writer: W) -> Result<Self, ConnError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut reader = FrameReader::new(BufReader::new(Box::new(reader) as Box<dyn Read + Send>));
        let mut writer = FrameWriter::new(BufWriter::new(Box::new(writer) as Box<dyn Write + Send>));
        let pid = std::process::id();
        let setup = handshake_accept(&mut reader, &mut writer, pid)?;
        tracing::debug!(pid, weavelet_id = %setup.identity.id, "weavelet connected to envelope");
        Ok(Self {
            setup,
            pid,
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(Mutex::new(writer)),
            pending: Mutex::new(PendingReplies::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn identity(&self) -> &WeaveletIdentity {
        &self.setup.identity
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.setup.config
    }

    fn send(&self, frame: &Frame) -> Result<(), ConnError> {
        send_on(&self.writer, frame)
    }

    // =========================================================================
    // ONE-WAY MESSAGES
    // =========================================================================

    /// Export a batch of finished spans. Batches arrive in the order sent.
    pub fn send_trace_spans(&self, spans: &[Span]) -> Result<(), ConnError> {
        let payload = encode_payload(&spans)?;
        self.send(&Frame::one_way(MessageType::TraceSpans, payload))
    }

    /// Forward a structured log entry.
    pub fn send_log_entry(&self, entry: &LogEntry) -> Result<(), ConnError> {
        let payload = encode_payload(entry)?;
        self.send(&Frame::one_way(MessageType::LogEntry, payload))
    }

    /// Build and forward a log entry attributed to this weavelet.
    pub fn log(&self, component: &str, level: LogLevel, msg: impl Into<String>) -> Result<(), ConnError> {
        let entry = LogEntry::new(&self.setup.identity, component, level, msg).with_pid(Some(self.pid));
        self.send_log_entry(&entry)
    }

    // =========================================================================
    // REQUESTS TO THE ENVELOPE
    // =========================================================================

    fn call<Req, Rep>(&self, msg_type: MessageType, req: &Req) -> Result<Rep, ConnError>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        let payload = encode_payload(req)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| ConnError::Protocol("pending table poisoned".to_string()))?;
            if let Some(ref err) = pending.failure {
                return Err(err.clone());
            }
            pending.waiters.insert(id, tx);
        }

        if let Err(e) = self.send(&Frame::request(msg_type, id, payload)) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.waiters.remove(&id);
            }
            return Err(e);
        }

        let frame = rx.recv().map_err(|_| ConnError::Closed)??;
        if let Some(err) = frame.error {
            return Err(ConnError::Remote(err));
        }
        decode_payload(frame.payload_bytes())
    }

    pub fn start_component(&self, req: &ComponentToStart) -> Result<(), ConnError> {
        let _: Empty = self.call(MessageType::StartComponent, req)?;
        Ok(())
    }

    pub fn get_address(&self, req: &GetAddressRequest) -> Result<GetAddressReply, ConnError> {
        self.call(MessageType::GetAddress, req)
    }

    pub fn export_listener(
        &self,
        req: &ExportListenerRequest,
    ) -> Result<ExportListenerReply, ConnError> {
        self.call(MessageType::ExportListener, req)
    }

    // =========================================================================
    // READ LOOP
    // =========================================================================

    fn close(&self, err: ConnError) {
        let waiters = match self.pending.lock() {
            Ok(mut pending) => {
                if pending.failure.is_none() {
                    pending.failure = Some(err.clone());
                }
                std::mem::take(&mut pending.waiters)
            }
            Err(_) => return,
        };
        for (_, tx) in waiters {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Service envelope requests until the envelope closes the stream.
    ///
    /// Profiles are collected on their own threads so the loop keeps reading
    /// while a long CPU profile runs. Can only be called once.
    pub fn serve(&self) -> Result<(), ConnError> {
        let mut reader = self
            .reader
            .lock()
            .ok()
            .and_then(|mut r| r.take())
            .ok_or_else(|| ConnError::Protocol("weavelet connection already serving".to_string()))?;

        let result = loop {
            let frame = match reader.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if let Err(e) = self.dispatch(frame) {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => {
                tracing::debug!("envelope closed control stream");
                self.close(ConnError::Closed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "control stream failed");
                self.close(e.clone());
            }
        }
        result
    }

    fn dispatch(&self, frame: Frame) -> Result<(), ConnError> {
        match frame.msg_type {
            MessageType::Reply => {
                let waiter = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut p| p.waiters.remove(&frame.id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(frame));
                    }
                    None => tracing::debug!(id = frame.id, "reply for unknown request"),
                }
            }
            MessageType::RunProfiling => {
                let req: ProfileRequest = decode_payload(frame.payload_bytes())?;
                let writer = Arc::clone(&self.writer);
                let id = frame.id;
                std::thread::spawn(move || {
                    let reply = profiler::collect(&req);
                    let frame = match encode_payload(&reply) {
                        Ok(payload) => Frame::reply(id, payload),
                        Err(e) => Frame::reply_err(id, e.to_string()),
                    };
                    if let Err(e) = send_on(&writer, &frame) {
                        tracing::warn!(id, error = %e, "failed to send profile");
                    }
                });
            }
            MessageType::GetHealth => {
                let reply = HealthReply {
                    status: HealthStatus::Healthy,
                    detail: String::new(),
                };
                self.send(&Frame::reply(frame.id, encode_payload(&reply)?))?;
            }
            other => {
                return Err(ConnError::Protocol(format!(
                    "unexpected {:?} from envelope",
                    other
                )));
            }
        }
        Ok(())
    }
}

fn send_on(writer: &Mutex<FrameWriter<BoxedWriter>>, frame: &Frame) -> Result<(), ConnError> {
    writer
        .lock()
        .map_err(|_| ConnError::Protocol("writer poisoned".to_string()))?
        .write(frame)
}
