//! Weavelet side of the control protocol.

pub mod conn;
pub mod profiler;

pub use conn::WeaveletConn;
