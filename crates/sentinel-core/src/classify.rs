use std::fmt;

use serde::{Deserialize, Serialize};

/// Safe handshake budget for a 1500-byte Ethernet path once IP (20), TCP (20)
/// and record-layer (~5) headers are paid for, rounded down.
pub const DEFAULT_SAFE_THRESHOLD: usize = 1400;

/// Capacity of the single read a session performs for the client hello.
pub const DEFAULT_RECV_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Safe,
    CriticalRisk,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Safe => "SAFE",
            Classification::CriticalRisk => "CRITICAL_RISK",
        }
    }

    pub fn is_risk(&self) -> bool {
        matches!(self, Classification::CriticalRisk)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub risk: bool,
    pub classification: Classification,
    pub message: String,
}

/// Classify a handshake payload purely by size.
///
/// The payload is at risk of fragmentation iff it is strictly larger than the
/// threshold; content is never inspected.
pub fn classify(payload_size: usize, safe_threshold: usize) -> Verdict {
    if payload_size > safe_threshold {
        Verdict {
            risk: true,
            classification: Classification::CriticalRisk,
            message: format!(
                "Packet size {payload_size} > MTU {safe_threshold}. WILL FRAGMENT on legacy networks!"
            ),
        }
    } else {
        Verdict {
            risk: false,
            classification: Classification::Safe,
            message: format!("Packet size {payload_size} fits within MTU {safe_threshold}"),
        }
    }
}
