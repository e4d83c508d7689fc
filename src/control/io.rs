//! Framed I/O - Reading and Writing Control Frames
//!
//! Frames travel over a pair of unidirectional pipes, one per direction.
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  8 bytes: u64 big-endian length                         │
//! ├─────────────────────────────────────────────────────────┤
//! │  N bytes: CBOR-encoded Frame                            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no size ceiling. Bodies are read incrementally so a bogus length
//! prefix never triggers a huge up-front allocation; the stream simply ends
//! early and the read fails with `UnexpectedEof`.

use crate::control::frame::{decode_frame, encode_frame, Frame, MessageType};
use crate::control::messages::{decode_payload, encode_payload, WeaveletReady, WeaveletSetup};
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix size in bytes
pub const LENGTH_PREFIX: usize = 8;

/// Initial buffer reservation for a frame body
const READ_CHUNK: usize = 64 * 1024;

/// Errors that can occur on a control connection.
///
/// Clone so a terminal failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("CBOR encoding error: {0}")]
    Encode(String),

    #[error("CBOR decoding error: {0}")]
    Decode(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Bootstrap error: {0}")]
    Bootstrap(String),
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(e.to_string())
    }
}

fn frame_bytes(frame: &Frame) -> Result<Vec<u8>, ConnError> {
    let body = encode_frame(frame)?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX + body.len());
    buf.extend_from_slice(&(body.len() as u64).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Write a length-prefixed frame to a writer
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), ConnError> {
    let buf = frame_bytes(frame)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Write a length-prefixed frame to an async writer
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ConnError> {
    let buf = frame_bytes(frame)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame from a reader
///
/// Returns Ok(None) on clean EOF, Err(UnexpectedEof) on partial read.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, ConnError> {
    let mut len_buf = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ConnError::UnexpectedEof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let length = u64::from_be_bytes(len_buf);
    let mut body = Vec::with_capacity((length as usize).min(READ_CHUNK));
    reader.by_ref().take(length).read_to_end(&mut body)?;
    if (body.len() as u64) < length {
        return Err(ConnError::UnexpectedEof);
    }

    decode_frame(&body).map(Some)
}

/// Read a length-prefixed frame from an async reader
///
/// Returns Ok(None) on clean EOF, Err(UnexpectedEof) on partial read.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, ConnError> {
    let mut len_buf = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        match reader.read(&mut len_buf[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ConnError::UnexpectedEof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let length = u64::from_be_bytes(len_buf);
    let mut body = Vec::with_capacity((length as usize).min(READ_CHUNK));
    (&mut *reader).take(length).read_to_end(&mut body).await?;
    if (body.len() as u64) < length {
        return Err(ConnError::UnexpectedEof);
    }

    decode_frame(&body).map(Some)
}

/// Blocking frame reader
pub struct FrameReader<R: Read> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame
    pub fn read(&mut self) -> Result<Option<Frame>, ConnError> {
        read_frame(&mut self.reader)
    }
}

/// Blocking frame writer
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a frame
    pub fn write(&mut self, frame: &Frame) -> Result<(), ConnError> {
        write_frame(&mut self.writer, frame)
    }
}

// =============================================================================
// ASYNC I/O TYPES
// =============================================================================

/// Async frame reader.
///
/// Not cancel-safe: a read abandoned mid-frame loses the bytes already
/// consumed. Drive it from a dedicated task rather than a `select!` arm.
pub struct AsyncFrameReader<R: AsyncRead + Unpin> {
    reader: R,
}

impl<R: AsyncRead + Unpin> AsyncFrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame
    pub async fn read(&mut self) -> Result<Option<Frame>, ConnError> {
        read_frame_async(&mut self.reader).await
    }
}

/// Async frame writer
pub struct AsyncFrameWriter<W: AsyncWrite + Unpin> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> AsyncFrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a frame
    pub async fn write(&mut self, frame: &Frame) -> Result<(), ConnError> {
        write_frame_async(&mut self.writer, frame).await
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Send the SETUP frame (envelope side - sends first, does not wait).
///
/// The weavelet answers with READY, which arrives later through the normal
/// control loop so that a slow weavelet never blocks envelope construction.
pub async fn handshake_async<W: AsyncWrite + Unpin>(
    writer: &mut AsyncFrameWriter<W>,
    setup: &WeaveletSetup,
) -> Result<(), ConnError> {
    let payload = encode_payload(setup)?;
    writer
        .write(&Frame::one_way(MessageType::Setup, payload))
        .await
        .map_err(|e| ConnError::Handshake(format!("failed to send SETUP: {}", e)))
}

/// Accept the SETUP frame and answer with READY (weavelet side).
pub fn handshake_accept<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    pid: u32,
) -> Result<WeaveletSetup, ConnError> {
    let frame = reader.read()?.ok_or_else(|| {
        ConnError::Handshake("connection closed before receiving SETUP".to_string())
    })?;

    if frame.msg_type != MessageType::Setup {
        return Err(ConnError::Handshake(format!(
            "expected SETUP, got {:?}",
            frame.msg_type
        )));
    }

    let setup: WeaveletSetup = decode_payload(frame.payload_bytes())
        .map_err(|e| ConnError::Handshake(format!("malformed SETUP: {}", e)))?;

    let ready = encode_payload(&WeaveletReady { pid })?;
    writer.write(&Frame::one_way(MessageType::Ready, ready))?;

    Ok(setup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::messages::{LaunchConfig, WeaveletIdentity};
    use std::io::Cursor;

    // TEST020: write_frame/read_frame through the length-prefixed wire format
    #[test]
    fn test020_frame_io_roundtrip() {
        let original = Frame::request(MessageType::GetAddress, 3, b"payload".to_vec());

        let mut buf = Vec::new();
        write_frame(&mut buf, &original).expect("write should succeed");

        let prefix = u64::from_be_bytes(buf[..8].try_into().unwrap()) as usize;
        assert_eq!(buf.len(), LENGTH_PREFIX + prefix, "buffer must be exactly prefix + frame");

        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor)
            .expect("read should succeed")
            .expect("should have frame");
        assert_eq!(decoded, original);
    }

    // TEST021: Several frames in one buffer come back in order, then clean EOF
    #[test]
    fn test021_multiple_frames() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::one_way(MessageType::Ready, vec![1])).unwrap();
        write_frame(&mut buf, &Frame::request(MessageType::GetHealth, 8, vec![])).unwrap();
        write_frame(&mut buf, &Frame::reply_err(8, "nope")).unwrap();

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.read().unwrap().unwrap().msg_type, MessageType::Ready);
        assert_eq!(reader.read().unwrap().unwrap().id, 8);
        assert_eq!(reader.read().unwrap().unwrap().error.as_deref(), Some("nope"));
        assert!(reader.read().unwrap().is_none());
    }

    // TEST022: Empty stream is a clean EOF
    #[test]
    fn test022_empty_stream_is_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    // TEST023: Stream ending inside the length prefix is not a clean EOF
    #[test]
    fn test023_truncated_prefix() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0]);
        assert_eq!(read_frame(&mut cursor), Err(ConnError::UnexpectedEof));
    }

    // TEST024: Stream ending inside the body is not a clean EOF
    #[test]
    fn test024_truncated_body() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::one_way(MessageType::LogEntry, vec![7; 100])).unwrap();
        buf.truncate(buf.len() - 10);
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor), Err(ConnError::UnexpectedEof));
    }

    // TEST025: A huge bogus length does not allocate up front; it just hits EOF
    #[test]
    fn test025_bogus_length_is_eof() {
        let mut buf = u64::MAX.to_be_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3]);
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor), Err(ConnError::UnexpectedEof));
    }

    // TEST026: Multi-megabyte payloads pass without a ceiling
    #[tokio::test]
    async fn test026_large_payload_async() {
        let payload = vec![0xabu8; 8 * 1024 * 1024];
        let frame = Frame::reply(1, payload.clone());

        let mut buf = Vec::new();
        write_frame_async(&mut buf, &frame).await.unwrap();

        let mut reader = AsyncFrameReader::new(Cursor::new(buf));
        let decoded = reader.read().await.unwrap().unwrap();
        assert_eq!(decoded.payload_bytes().len(), payload.len());
        assert!(reader.read().await.unwrap().is_none());
    }

    // TEST027: Async reader reports truncation the same way as the sync reader
    #[tokio::test]
    async fn test027_async_truncated_body() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::reply(4, vec![9; 32])).unwrap();
        buf.truncate(LENGTH_PREFIX + 2);
        let mut reader = AsyncFrameReader::new(Cursor::new(buf));
        assert_eq!(reader.read().await, Err(ConnError::UnexpectedEof));
    }

    // TEST028: SETUP then READY handshake between async sender and sync acceptor
    #[tokio::test]
    async fn test028_handshake() {
        let setup = WeaveletSetup {
            identity: WeaveletIdentity::new("app", true, true),
            config: LaunchConfig::new("/bin/true"),
        };

        let mut to_weavelet = Vec::new();
        {
            let mut writer = AsyncFrameWriter::new(&mut to_weavelet);
            handshake_async(&mut writer, &setup).await.unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(to_weavelet));
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);
        let received = handshake_accept(&mut reader, &mut writer, 4242).unwrap();
        assert_eq!(received, setup);

        let ready = read_frame(&mut Cursor::new(out)).unwrap().unwrap();
        assert_eq!(ready.msg_type, MessageType::Ready);
        let ready: WeaveletReady = decode_payload(ready.payload_bytes()).unwrap();
        assert_eq!(ready.pid, 4242);
    }

    // TEST029: Handshake refuses anything but SETUP as the first frame
    #[test]
    fn test029_handshake_wrong_first_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::one_way(MessageType::Ready, vec![])).unwrap();
        let mut reader = FrameReader::new(Cursor::new(buf));
        let mut writer = FrameWriter::new(Vec::new());
        let result = handshake_accept(&mut reader, &mut writer, 1);
        assert!(matches!(result, Err(ConnError::Handshake(_))));
    }

    // TEST030: Handshake on a closed stream fails instead of hanging
    #[test]
    fn test030_handshake_on_closed_stream() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let mut writer = FrameWriter::new(Vec::new());
        let result = handshake_accept(&mut reader, &mut writer, 1);
        assert!(matches!(result, Err(ConnError::Handshake(_))));
    }
}
