//! Envelope side: spawning and supervising one weavelet.

pub mod conn;
pub mod handler;
pub mod log_relay;
pub mod profiling;
pub mod runtime;

pub use conn::{EnvelopeConn, Liveness};
pub use handler::{EnvelopeHandler, HandlerError, TracingHandler};
pub use log_relay::{CapturedLine, LogStream};
pub use profiling::ProfilingSlot;
pub use runtime::{Envelope, EnvelopeError, EnvelopeOptions, EnvelopeState};
