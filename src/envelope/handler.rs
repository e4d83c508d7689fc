//! Envelope-side callbacks for traffic the weavelet initiates.

use crate::control::messages::{
    ComponentToStart, ExportListenerReply, ExportListenerRequest, GetAddressReply,
    GetAddressRequest, LogEntry, LogLevel, Span,
};
use async_trait::async_trait;

/// Failure reported by an [`EnvelopeHandler`].
///
/// For request-style callbacks the message travels back to the weavelet as
/// the reply's error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// Receives everything a weavelet sends to its envelope.
///
/// Calls for one stream (logs, or control messages) arrive one at a time and
/// in order. Log calls and control calls run on different tasks, so an
/// implementation shared between them must be `Sync`.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// One captured output line or structured log record.
    async fn recv_log_entry(&self, entry: LogEntry);

    /// One batch of spans, in the order the weavelet exported them.
    async fn recv_trace_spans(&self, spans: Vec<Span>) -> Result<(), HandlerError>;

    async fn start_component(&self, req: ComponentToStart) -> Result<(), HandlerError>;

    async fn get_address(&self, req: GetAddressRequest) -> Result<GetAddressReply, HandlerError>;

    async fn export_listener(
        &self,
        req: ExportListenerRequest,
    ) -> Result<ExportListenerReply, HandlerError>;
}

/// Handler that forwards weavelet output to `tracing`.
///
/// Listeners bind wherever the application asked, or an ephemeral localhost
/// port, and are exported without a proxy.
#[derive(Debug, Default, Clone)]
pub struct TracingHandler;

#[async_trait]
impl EnvelopeHandler for TracingHandler {
    async fn recv_log_entry(&self, entry: LogEntry) {
        let LogEntry {
            component,
            weavelet_id,
            pid,
            msg,
            level,
            ..
        } = entry;
        match level {
            LogLevel::Debug => tracing::debug!(%component, %weavelet_id, ?pid, "{}", msg),
            LogLevel::Info => tracing::info!(%component, %weavelet_id, ?pid, "{}", msg),
            LogLevel::Warn => tracing::warn!(%component, %weavelet_id, ?pid, "{}", msg),
            LogLevel::Error => tracing::error!(%component, %weavelet_id, ?pid, "{}", msg),
        }
    }

    async fn recv_trace_spans(&self, spans: Vec<Span>) -> Result<(), HandlerError> {
        for span in &spans {
            tracing::trace!(
                name = %span.name,
                duration_us = span.end_micros.saturating_sub(span.start_micros),
                "weavelet span"
            );
        }
        Ok(())
    }

    async fn start_component(&self, req: ComponentToStart) -> Result<(), HandlerError> {
        tracing::info!(component = %req.component, routed = req.routed, "start component");
        Ok(())
    }

    async fn get_address(&self, req: GetAddressRequest) -> Result<GetAddressReply, HandlerError> {
        let address = if req.local_address.is_empty() {
            "localhost:0".to_string()
        } else {
            req.local_address
        };
        Ok(GetAddressReply { address })
    }

    async fn export_listener(
        &self,
        req: ExportListenerRequest,
    ) -> Result<ExportListenerReply, HandlerError> {
        tracing::info!(listener = %req.name, address = %req.address, "listener ready");
        Ok(ExportListenerReply::default())
    }
}
