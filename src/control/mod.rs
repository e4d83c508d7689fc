//! Control channel between an envelope and its weavelet.

pub mod bootstrap;
pub mod frame;
pub mod io;
pub mod messages;


pub use bootstrap::{Bootstrap, ControlPipes, ENVELOPE_TO_WEAVELET_FD, WEAVELET_TO_ENVELOPE_FD};
pub use frame::{Frame, MessageType, PROTOCOL_VERSION};
pub use io::{
    handshake_accept, handshake_async, read_frame, read_frame_async, write_frame,
    write_frame_async, AsyncFrameReader, AsyncFrameWriter, ConnError, FrameReader, FrameWriter,
};
pub use messages::*;
