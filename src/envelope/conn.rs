//! Envelope end of the weavelet control connection.
//!
//! Writes go through one async mutex so frames never interleave. Requests the
//! envelope sends are correlated with replies by id; a oneshot per request is
//! parked in the pending table until the read loop completes it. When the read
//! loop ends, every parked request fails with the terminal error and so does
//! every later request.

use crate::control::frame::{Frame, MessageType};
use crate::control::io::{handshake_async, AsyncFrameReader, AsyncFrameWriter, ConnError};
use crate::control::messages::{
    decode_payload, encode_payload, ComponentToStart, Empty, ExportListenerRequest,
    GetAddressRequest, HealthReply, LogEntry, ProfileReply, ProfileRequest, Span, WeaveletReady,
    WeaveletSetup,
};
use crate::envelope::handler::EnvelopeHandler;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ReplySender = oneshot::Sender<Result<Frame, ConnError>>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, ReplySender>,
    /// Set once the read loop has ended; never cleared
    failure: Option<ConnError>,
}

/// Removes an abandoned request from the pending table.
struct PendingGuard<'a> {
    pending: &'a Mutex<Pending>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.waiters.remove(&self.id);
        }
    }
}

/// What the read loop observed about the weavelet's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// First decoded frame of any kind
    FirstMessage,
    /// Explicit READY with the weavelet's own pid
    Ready(u32),
}

pub struct EnvelopeConn {
    writer: Arc<tokio::sync::Mutex<AsyncFrameWriter<BoxedWriter>>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
}

impl EnvelopeConn {
    /// Wrap the envelope→weavelet stream and send SETUP on it.
    pub async fn new<W>(writer: W, setup: &WeaveletSetup) -> Result<Self, ConnError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut writer = AsyncFrameWriter::new(Box::new(writer) as BoxedWriter);
        handshake_async(&mut writer, setup).await?;
        Ok(Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Write one frame on its own task.
    ///
    /// A caller that stops waiting does not stop the write, so a frame is
    /// never left half written on the stream.
    async fn send(&self, frame: Frame) -> Result<(), ConnError> {
        let writer = self.writer.clone();
        tokio::spawn(async move { writer.lock().await.write(&frame).await })
            .await
            .map_err(|e| ConnError::Protocol(format!("frame writer task failed: {}", e)))?
    }

    /// Issue a request and wait for its reply.
    ///
    /// Dropping the returned future abandons the request; a late reply is
    /// discarded by the read loop. The request frame is still written in full.
    pub async fn call<Req, Rep>(&self, msg_type: MessageType, req: &Req) -> Result<Rep, ConnError>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        let payload = encode_payload(req)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
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
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.send(Frame::request(msg_type, id, payload)).await?;

        let frame = rx.await.map_err(|_| ConnError::Closed)??;
        if let Some(err) = frame.error {
            return Err(ConnError::Remote(err));
        }
        decode_payload(frame.payload_bytes())
    }

    /// Ask the weavelet for a profile.
    pub async fn run_profiling(&self, req: &ProfileRequest) -> Result<ProfileReply, ConnError> {
        self.call(MessageType::RunProfiling, req).await
    }

    /// Ask the weavelet whether it is healthy.
    pub async fn get_health(&self) -> Result<HealthReply, ConnError> {
        self.call(MessageType::GetHealth, &Empty {}).await
    }

    /// The error every request now fails with, once the connection is gone.
    pub fn failure(&self) -> Option<ConnError> {
        self.pending.lock().ok().and_then(|p| p.failure.clone())
    }

    /// Fail every outstanding and future request with `err`.
    ///
    /// Only the first error is kept.
    pub fn close(&self, err: ConnError) {
        let waiters = match self.pending.lock() {
            Ok(mut pending) => {
                if pending.failure.is_none() {
                    pending.failure = Some(err.clone());
                }
                std::mem::take(&mut pending.waiters)
            }
            Err(_) => return,
        };
        if !waiters.is_empty() {
            tracing::debug!(count = waiters.len(), error = %err, "failing pending requests");
        }
        for (_, tx) in waiters {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn complete(&self, frame: Frame) {
        let waiter = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.waiters.remove(&frame.id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(frame));
            }
            None => tracing::debug!(id = frame.id, "dropping reply for abandoned request"),
        }
    }

    /// Run the control read loop until the weavelet's stream ends.
    ///
    /// Frames are handled one at a time in arrival order. Returns Ok(()) on
    /// clean end-of-stream and the fatal error otherwise; either way all
    /// outstanding requests are failed before returning.
    pub async fn serve<R, F>(
        &self,
        mut reader: AsyncFrameReader<R>,
        handler: Arc<dyn EnvelopeHandler>,
        mut on_alive: F,
    ) -> Result<(), ConnError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(Liveness) + Send,
    {
        let mut seen_first = false;
        let result = loop {
            let frame = match reader.read().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if !seen_first {
                seen_first = true;
                on_alive(Liveness::FirstMessage);
            }
            if let Err(e) = self.dispatch(frame, handler.as_ref(), &mut on_alive).await {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => {
                tracing::debug!("weavelet closed control stream");
                self.close(ConnError::Closed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "control stream failed");
                self.close(e.clone());
            }
        }
        result
    }

    async fn dispatch<F>(
        &self,
        frame: Frame,
        handler: &dyn EnvelopeHandler,
        on_alive: &mut F,
    ) -> Result<(), ConnError>
    where
        F: FnMut(Liveness) + Send,
    {
        match frame.msg_type {
            MessageType::Reply => self.complete(frame),
            MessageType::Ready => {
                let ready: WeaveletReady = decode_payload(frame.payload_bytes())?;
                tracing::debug!(pid = ready.pid, "weavelet ready");
                on_alive(Liveness::Ready(ready.pid));
            }
            MessageType::LogEntry => {
                let entry: LogEntry = decode_payload(frame.payload_bytes())?;
                handler.recv_log_entry(entry).await;
            }
            MessageType::TraceSpans => {
                let spans: Vec<Span> = decode_payload(frame.payload_bytes())?;
                let count = spans.len();
                if let Err(e) = handler.recv_trace_spans(spans).await {
                    tracing::warn!(count, error = %e, "trace span batch rejected");
                }
            }
            MessageType::StartComponent => {
                let req: ComponentToStart = decode_payload(frame.payload_bytes())?;
                let result = handler.start_component(req).await.map(|()| Empty {});
                self.reply(frame.id, result).await?;
            }
            MessageType::GetAddress => {
                let req: GetAddressRequest = decode_payload(frame.payload_bytes())?;
                let result = handler.get_address(req).await;
                self.reply(frame.id, result).await?;
            }
            MessageType::ExportListener => {
                let req: ExportListenerRequest = decode_payload(frame.payload_bytes())?;
                let result = handler.export_listener(req).await;
                self.reply(frame.id, result).await?;
            }
            other => {
                return Err(ConnError::Protocol(format!(
                    "unexpected {:?} from weavelet",
                    other
                )));
            }
        }
        Ok(())
    }

    async fn reply<T, E>(&self, id: u64, result: Result<T, E>) -> Result<(), ConnError>
    where
        T: Serialize,
        E: std::fmt::Display,
    {
        let frame = match result {
            Ok(value) => Frame::reply(id, encode_payload(&value)?),
            Err(e) => Frame::reply_err(id, e.to_string()),
        };
        self.send(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::io::{read_frame_async, write_frame_async};
    use crate::control::messages::{
        ExportListenerReply, GetAddressReply, HealthStatus, LaunchConfig, WeaveletIdentity,
    };
    use crate::envelope::handler::HandlerError;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    #[derive(Default)]
    struct Recorder {
        logs: Mutex<Vec<String>>,
        spans: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn recv_log_entry(&self, entry: LogEntry) {
            self.logs.lock().unwrap().push(entry.msg);
        }
        async fn recv_trace_spans(&self, spans: Vec<Span>) -> Result<(), HandlerError> {
            let mut names = self.spans.lock().unwrap();
            names.extend(spans.into_iter().map(|s| s.name));
            Ok(())
        }
        async fn start_component(&self, _req: ComponentToStart) -> Result<(), HandlerError> {
            Ok(())
        }
        async fn get_address(&self, req: GetAddressRequest) -> Result<GetAddressReply, HandlerError> {
            if req.name == "bad" {
                return Err(HandlerError::failed("no address for bad"));
            }
            Ok(GetAddressReply {
                address: format!("{}:1234", req.name),
            })
        }
        async fn export_listener(
            &self,
            _req: ExportListenerRequest,
        ) -> Result<ExportListenerReply, HandlerError> {
            Ok(ExportListenerReply::default())
        }
    }

    fn setup() -> WeaveletSetup {
        WeaveletSetup {
            identity: WeaveletIdentity::new("app", true, true),
            config: LaunchConfig::new("/bin/weavelet"),
        }
    }

    /// Envelope conn plus the weavelet's ends of both streams.
    async fn pair() -> (Arc<EnvelopeConn>, AsyncFrameReader<DuplexStream>, DuplexStream, DuplexStream) {
        let (env_out, weavelet_in) = duplex(1 << 16);
        let (weavelet_out, env_in) = duplex(1 << 16);
        let conn = Arc::new(EnvelopeConn::new(env_out, &setup()).await.unwrap());
        (conn, AsyncFrameReader::new(env_in), weavelet_in, weavelet_out)
    }

    #[tokio::test]
    async fn setup_is_the_first_frame() {
        let (_conn, _reader, mut weavelet_in, _weavelet_out) = pair().await;
        let frame = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::Setup);
        let received: WeaveletSetup = decode_payload(frame.payload_bytes()).unwrap();
        assert_eq!(received.config.binary, std::path::PathBuf::from("/bin/weavelet"));
    }

    #[tokio::test]
    async fn replies_are_matched_by_id() {
        let (conn, reader, mut weavelet_in, mut weavelet_out) = pair().await;
        let serve_conn = conn.clone();
        let server = tokio::spawn(async move {
            serve_conn
                .serve(reader, Arc::new(Recorder::default()), |_| {})
                .await
        });

        let fake_weavelet = tokio::spawn(async move {
            let _setup = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
            let first = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
            let second = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
            // Answer in reverse order.
            for frame in [second, first] {
                let reply = match frame.msg_type {
                    MessageType::GetHealth => encode_payload(&HealthReply {
                        status: HealthStatus::Healthy,
                        detail: String::new(),
                    })
                    .unwrap(),
                    _ => encode_payload(&ProfileReply {
                        data: vec![1, 2, 3],
                        errors: vec![],
                    })
                    .unwrap(),
                };
                write_frame_async(&mut weavelet_out, &Frame::reply(frame.id, reply))
                    .await
                    .unwrap();
            }
            weavelet_out
        });

        let req = ProfileRequest::heap();
        let (profile, health) = tokio::join!(conn.run_profiling(&req), conn.get_health());
        assert_eq!(profile.unwrap().data, vec![1, 2, 3]);
        assert_eq!(health.unwrap().status, HealthStatus::Healthy);

        drop(fake_weavelet.await.unwrap());
        assert_eq!(server.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn eof_fails_pending_and_later_calls() {
        let (conn, reader, _weavelet_in, weavelet_out) = pair().await;
        let serve_conn = conn.clone();
        let server = tokio::spawn(async move {
            serve_conn
                .serve(reader, Arc::new(Recorder::default()), |_| {})
                .await
        });

        let call_conn = conn.clone();
        let call = tokio::spawn(async move { call_conn.get_health().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(weavelet_out);

        assert_eq!(call.await.unwrap(), Err(ConnError::Closed));
        assert_eq!(server.await.unwrap(), Ok(()));
        assert_eq!(conn.get_health().await, Err(ConnError::Closed));
        assert_eq!(conn.failure(), Some(ConnError::Closed));
    }

    #[tokio::test]
    async fn handler_requests_get_replies_and_errors() {
        let (conn, reader, mut weavelet_in, mut weavelet_out) = pair().await;
        let handler = Arc::new(Recorder::default());
        let server = tokio::spawn({
            let conn = conn.clone();
            let handler: Arc<dyn EnvelopeHandler> = handler.clone();
            async move { conn.serve(reader, handler, |_| {}).await }
        });

        let _setup = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
        for (id, name) in [(1u64, "main"), (2, "bad")] {
            let req = GetAddressRequest {
                name: name.to_string(),
                local_address: String::new(),
            };
            let frame = Frame::request(MessageType::GetAddress, id, encode_payload(&req).unwrap());
            write_frame_async(&mut weavelet_out, &frame).await.unwrap();
        }

        let ok = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
        assert_eq!(ok.id, 1);
        let reply: GetAddressReply = decode_payload(ok.payload_bytes()).unwrap();
        assert_eq!(reply.address, "main:1234");

        let err = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
        assert_eq!(err.id, 2);
        assert_eq!(err.error.as_deref(), Some("no address for bad"));

        drop(weavelet_out);
        assert_eq!(server.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn spans_and_logs_arrive_in_order() {
        let (conn, reader, _weavelet_in, mut weavelet_out) = pair().await;
        let handler = Arc::new(Recorder::default());
        let identity = WeaveletIdentity::new("app", true, true);

        for batch in [["span1", "span2"], ["span3", "span4"]] {
            let spans: Vec<Span> = batch.into_iter().map(Span::new).collect();
            let frame = Frame::one_way(MessageType::TraceSpans, encode_payload(&spans).unwrap());
            write_frame_async(&mut weavelet_out, &frame).await.unwrap();
        }
        let entry = LogEntry::new(&identity, "main", crate::control::messages::LogLevel::Info, "hi");
        let frame = Frame::one_way(MessageType::LogEntry, encode_payload(&entry).unwrap());
        write_frame_async(&mut weavelet_out, &frame).await.unwrap();
        drop(weavelet_out);

        let mut alive = Vec::new();
        conn.serve(reader, handler.clone(), |l| alive.push(l)).await.unwrap();

        assert_eq!(*handler.spans.lock().unwrap(), ["span1", "span2", "span3", "span4"]);
        assert_eq!(*handler.logs.lock().unwrap(), ["hi"]);
        assert_eq!(alive, [Liveness::FirstMessage]);
    }

    #[tokio::test]
    async fn unexpected_message_is_fatal() {
        let (conn, reader, _weavelet_in, mut weavelet_out) = pair().await;
        let frame = Frame::request(MessageType::RunProfiling, 5, encode_payload(&ProfileRequest::heap()).unwrap());
        write_frame_async(&mut weavelet_out, &frame).await.unwrap();

        let result = conn.serve(reader, Arc::new(Recorder::default()), |_| {}).await;
        assert!(matches!(result, Err(ConnError::Protocol(_))));
        assert!(matches!(conn.get_health().await, Err(ConnError::Protocol(_))));
    }

    #[tokio::test]
    async fn ready_reports_pid() {
        let (conn, reader, _weavelet_in, mut weavelet_out) = pair().await;
        let frame = Frame::one_way(MessageType::Ready, encode_payload(&WeaveletReady { pid: 99 }).unwrap());
        write_frame_async(&mut weavelet_out, &frame).await.unwrap();
        drop(weavelet_out);

        let mut alive = Vec::new();
        conn.serve(reader, Arc::new(Recorder::default()), |l| alive.push(l)).await.unwrap();
        assert_eq!(alive, [Liveness::FirstMessage, Liveness::Ready(99)]);
    }

    #[tokio::test]
    async fn abandoned_request_is_still_written_whole() {
        // A tiny pipe buffer forces the request write to block partway.
        let (env_out, mut weavelet_in) = duplex(64);
        let setup = setup();
        let (conn, setup_frame) = tokio::join!(
            EnvelopeConn::new(env_out, &setup),
            read_frame_async(&mut weavelet_in)
        );
        let conn = conn.unwrap();
        assert_eq!(setup_frame.unwrap().unwrap().msg_type, MessageType::Setup);

        let big = vec![7u32; 4096];
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            conn.call::<_, Empty>(MessageType::GetHealth, &big),
        )
        .await;
        assert!(abandoned.is_err(), "request should still be blocked on the pipe");

        let frame = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::GetHealth);
        let payload: Vec<u32> = decode_payload(frame.payload_bytes()).unwrap();
        assert_eq!(payload, big);

        // The stream is still in sync for the next request.
        let next = tokio::spawn({
            let conn = Arc::new(conn);
            async move { conn.get_health().await }
        });
        let frame = read_frame_async(&mut weavelet_in).await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::GetHealth);
        assert_eq!(frame.payload_bytes(), encode_payload(&Empty {}).unwrap().as_slice());
        next.abort();
    }
}
