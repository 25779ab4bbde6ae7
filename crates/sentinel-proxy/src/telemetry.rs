use std::fmt;
use std::net::SocketAddr;

use sentinel_core::Classification;

/// Receives a summary of every session the proxy finishes, found or rejected.
pub trait SessionTelemetryCollector: Send + Sync + fmt::Debug {
    /// Called once per accepted connection before any I/O.
    fn session_started(&self) {}

    fn record(&self, event: &SessionTelemetryEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTelemetryEvent {
    pub peer: SocketAddr,
    /// Bytes read from the client hello, when the read succeeded.
    pub payload_size: Option<usize>,
    pub disposition: SessionDisposition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDisposition {
    Finding {
        classification: Classification,
        reply_delivered: bool,
        report_persisted: bool,
    },
    Rejected {
        reason: &'static str,
    },
}

/// Forwards session telemetry to the tracing subsystem.
#[derive(Debug, Default)]
pub struct TracingTelemetryCollector;

impl SessionTelemetryCollector for TracingTelemetryCollector {
    fn record(&self, event: &SessionTelemetryEvent) {
        match &event.disposition {
            SessionDisposition::Finding {
                classification,
                reply_delivered,
                report_persisted,
            } => tracing::debug!(
                target: "sentinel::telemetry",
                peer = %event.peer,
                payload_size = ?event.payload_size,
                status = %classification,
                reply_delivered = *reply_delivered,
                report_persisted = *report_persisted,
                "session finding"
            ),
            SessionDisposition::Rejected { reason } => tracing::debug!(
                target: "sentinel::telemetry",
                peer = %event.peer,
                payload_size = ?event.payload_size,
                reason = *reason,
                "session rejected"
            ),
        }
    }
}
