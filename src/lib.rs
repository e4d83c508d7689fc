//! Weavelet Envelope - supervision and control plane for weavelet processes
//!
//! An envelope launches one weavelet (a worker process hosting application
//! components), relays its stdout/stderr as structured log entries, and talks
//! to it over a pair of pipes carrying length-prefixed CBOR frames.
//!
//! - [`control`]: frame format, framed I/O, message bodies, pipe bootstrap
//! - [`envelope`]: the supervisor and its handler callbacks
//! - [`weavelet`]: the worker's end of the connection

pub mod control;
pub mod envelope;
pub mod weavelet;

pub use control::{ConnError, Frame, MessageType};
pub use control::messages::*;
pub use envelope::{
    Envelope, EnvelopeError, EnvelopeHandler, EnvelopeOptions, EnvelopeState, HandlerError,
    TracingHandler,
};
pub use weavelet::WeaveletConn;
