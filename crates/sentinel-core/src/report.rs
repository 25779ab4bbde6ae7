use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::classify::{Classification, Verdict};
use crate::sink::{ReportError, ReportSink};

const SUMMARY_WIDTH: usize = 27;

/// Finding emitted for every session that reached encapsulation.
///
/// Field order is the persisted order and is part of the dashboard contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostReport {
    pub timestamp: String,
    pub client_ip: String,
    pub algorithm: String,
    pub public_key_size: usize,
    pub handshake_size_bytes: usize,
    pub fragmentation_risk: bool,
    pub status: Classification,
    pub message: String,
}

impl GhostReport {
    pub fn new(
        client: impl Into<String>,
        algorithm: impl Into<String>,
        public_key_size: usize,
        handshake_size_bytes: usize,
        verdict: &Verdict,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            client_ip: client.into(),
            algorithm: algorithm.into(),
            public_key_size,
            handshake_size_bytes,
            fragmentation_risk: verdict.risk,
            status: verdict.classification,
            message: verdict.message.clone(),
        }
    }
}

/// Persists reports through a sink and mirrors them to the operational log.
#[derive(Debug, Clone)]
pub struct ReportEmitter {
    sink: Arc<dyn ReportSink>,
    safe_threshold: usize,
}

impl ReportEmitter {
    pub fn new(sink: Arc<dyn ReportSink>, safe_threshold: usize) -> Self {
        Self {
            sink,
            safe_threshold,
        }
    }

    /// Persist `report` and log the summary table.
    ///
    /// Failures are logged here as well as returned; callers treat reporting
    /// as best-effort and never roll back network work because of it.
    pub fn emit(&self, report: &GhostReport) -> Result<(), ReportError> {
        let result = self.sink.persist(report);
        match &result {
            Ok(()) => info!(
                target: "sentinel::report",
                sink = %self.sink.describe(),
                client = %report.client_ip,
                status = %report.status,
                "report saved"
            ),
            Err(err) => error!(
                target: "sentinel::report",
                sink = %self.sink.describe(),
                error = %err,
                "failed to persist report"
            ),
        }
        for line in render_summary(report, self.safe_threshold) {
            info!(target: "sentinel::report", "{line}");
        }
        result
    }
}

fn row(label: &str, value: &str) -> String {
    format!("│ {label:<15} {value:<SUMMARY_WIDTH$} │")
}

/// Boxed, human-readable summary of a finding.
pub fn render_summary(report: &GhostReport, safe_threshold: usize) -> Vec<String> {
    let verdict = if report.fragmentation_risk {
        "FRAGMENTATION RISK"
    } else {
        "SAFE"
    };
    vec![
        "┌─────────────────────────────────────────────┐".to_string(),
        "│           GHOST DETECTION SUMMARY           │".to_string(),
        "├─────────────────────────────────────────────┤".to_string(),
        row("Algorithm:", &report.algorithm),
        row("Public Key:", &format!("{} bytes", report.public_key_size)),
        row("Total Size:", &format!("{} bytes", report.handshake_size_bytes)),
        row("MTU Threshold:", &format!("{safe_threshold} bytes")),
        row("Status:", verdict),
        "└─────────────────────────────────────────────┘".to_string(),
    ]
}
