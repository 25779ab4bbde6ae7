//! Peer simulator for the Sentinel ghost proxy.
//!
//! Plays the client side of a post-quantum key exchange: generates an
//! ephemeral keypair, sends `public key ++ padding` as a simulated client
//! hello, waits for the ciphertext and decapsulates it. The padding length is
//! the knob that pushes the hello across the fragmentation threshold.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::{classify, Classification, DEFAULT_SAFE_THRESHOLD};
use sentinel_kem::{fingerprint, KemError, KemScheme};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{info, warn};

pub const DEFAULT_TARGET: &str = "127.0.0.1:4433";
/// Padding that pushes an ML-KEM-768 hello to 1484 bytes, over the default budget.
pub const DEFAULT_PADDING: usize = 300;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

const FRAGMENTATION_HINTS: &[&str] = &[
    "the proxy rejected the handshake",
    "the network dropped fragmented packets",
    "a firewall or NAT interfered with the exchange",
];
const CONNECT_HINTS: &[&str] = &[
    "the proxy is not running at the target address",
    "a firewall is blocking the port",
];

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub target: SocketAddr,
    pub padding: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Only used for the local pre-flight warning; the proxy classifies on its own.
    pub safe_threshold: usize,
    /// Cut the hello to this many bytes to simulate a malformed key share.
    pub truncate_to: Option<usize>,
}

impl ProbeConfig {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_safe_threshold(mut self, threshold: usize) -> Self {
        self.safe_threshold = threshold;
        self
    }

    pub fn with_truncate_to(mut self, limit: usize) -> Self {
        self.truncate_to = Some(limit);
        self
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([127, 0, 0, 1], 4433)),
            padding: DEFAULT_PADDING,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            safe_threshold: DEFAULT_SAFE_THRESHOLD,
            truncate_to: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] KemError),
    #[error("connection to {target} failed: {source}")]
    Connect {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("connection to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: SocketAddr, timeout: Duration },
    #[error("failed to send client hello: {0}")]
    Send(#[source] io::Error),
    #[error("no server hello within {0:?}")]
    ResponseTimeout(Duration),
    #[error("failed to receive server hello: {0}")]
    Receive(#[source] io::Error),
    #[error("server closed the connection without a reply")]
    ServerClosed,
    #[error("server hello truncated: {received} of {expected} ciphertext bytes")]
    TruncatedReply { received: usize, expected: usize },
    #[error("decapsulation failed: {0}")]
    Decapsulation(#[source] KemError),
}

impl ProbeError {
    /// Likely causes worth showing to an operator alongside the error.
    pub fn hints(&self) -> &'static [&'static str] {
        match self {
            ProbeError::Connect { .. } | ProbeError::ConnectTimeout { .. } => CONNECT_HINTS,
            ProbeError::ResponseTimeout(_)
            | ProbeError::Receive(_)
            | ProbeError::ServerClosed
            | ProbeError::TruncatedReply { .. } => FRAGMENTATION_HINTS,
            _ => &[],
        }
    }
}

/// Result of a completed round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub algorithm: &'static str,
    pub public_key_size: usize,
    pub padding: usize,
    pub payload_size: usize,
    pub ciphertext_size: usize,
    pub shared_secret_size: usize,
    pub shared_secret_fingerprint: String,
    /// What the proxy should conclude given the configured threshold.
    pub expected: Classification,
}

/// `public_key ++ padding`, where the padding is a repeating 0..=255 ramp.
pub fn build_payload(public_key: &[u8], padding: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(public_key.len() + padding);
    payload.extend_from_slice(public_key);
    payload.extend((0..padding).map(|i| (i % 256) as u8));
    payload
}

/// Boxed description of the simulated client hello.
pub fn render_hello_summary(public_key_size: usize, padding: usize, total: usize) -> Vec<String> {
    let row = |label: &str, value: String| format!("│ {label:<15} {value:<27} │");
    vec![
        "┌─────────────────────────────────────────────┐".to_string(),
        "│          CLIENTHELLO SIMULATION             │".to_string(),
        "├─────────────────────────────────────────────┤".to_string(),
        row("Public Key:", format!("{public_key_size} bytes")),
        row("TLS Headers:", format!("{padding} bytes (padding)")),
        row("Total Payload:", format!("{total} bytes")),
        "└─────────────────────────────────────────────┘".to_string(),
    ]
}

pub struct PeerSimulator {
    config: ProbeConfig,
    scheme: Arc<dyn KemScheme>,
}

impl PeerSimulator {
    pub fn new(config: ProbeConfig, scheme: Arc<dyn KemScheme>) -> Self {
        Self { config, scheme }
    }

    /// Run one handshake against the configured target.
    pub async fn run(&self) -> Result<ProbeOutcome, ProbeError> {
        let scheme = self.scheme.as_ref();
        let target = self.config.target;
        info!(target: "sentinel::probe", algorithm = scheme.name(), target = %target, "generating keypair");
        let pair = scheme
            .generate_keypair()
            .map_err(ProbeError::KeyGeneration)?;
        info!(
            target: "sentinel::probe",
            public_key_size = pair.public.len(),
            "public key generated; secret key kept for decapsulation"
        );

        let mut payload = build_payload(&pair.public, self.config.padding);
        if let Some(limit) = self.config.truncate_to {
            payload.truncate(limit);
        }
        let total = payload.len();
        for line in render_hello_summary(pair.public.len(), self.config.padding, total) {
            info!(target: "sentinel::probe", "{line}");
        }
        let expected = classify(total, self.config.safe_threshold).classification;
        if expected.is_risk() {
            warn!(
                target: "sentinel::probe",
                total,
                threshold = self.config.safe_threshold,
                "payload exceeds the safe threshold; fragmentation expected"
            );
        }

        info!(target: "sentinel::probe", target = %target, "connecting");
        let mut stream = match time::timeout(self.config.connect_timeout, TcpStream::connect(target))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ProbeError::Connect { target, source }),
            Err(_) => {
                return Err(ProbeError::ConnectTimeout {
                    target,
                    timeout: self.config.connect_timeout,
                })
            }
        };

        stream.write_all(&payload).await.map_err(ProbeError::Send)?;
        info!(target: "sentinel::probe", bytes = total, "client hello sent");

        let expected_len = scheme.ciphertext_size();
        let ciphertext = time::timeout(
            self.config.read_timeout,
            read_reply(&mut stream, expected_len),
        )
        .await
        .map_err(|_| ProbeError::ResponseTimeout(self.config.read_timeout))??;
        info!(target: "sentinel::probe", bytes = ciphertext.len(), "server hello received");

        let shared = scheme
            .decapsulate(&pair.secret, &ciphertext)
            .map_err(ProbeError::Decapsulation)?;
        let shared_secret_fingerprint = fingerprint(&shared);
        info!(
            target: "sentinel::probe",
            shared_secret_size = shared.len(),
            secret = %shared_secret_fingerprint,
            "shared secret derived"
        );

        Ok(ProbeOutcome {
            algorithm: scheme.name(),
            public_key_size: pair.public.len(),
            padding: self.config.padding,
            payload_size: total,
            ciphertext_size: ciphertext.len(),
            shared_secret_size: shared.len(),
            shared_secret_fingerprint,
            expected,
        })
    }
}

/// Read until a full ciphertext has arrived or the peer closes.
async fn read_reply(stream: &mut TcpStream, expected: usize) -> Result<Vec<u8>, ProbeError> {
    let mut buf = vec![0u8; expected];
    let mut filled = 0;
    while filled < expected {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(ProbeError::Receive)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    match filled {
        0 => Err(ProbeError::ServerClosed),
        n if n < expected => Err(ProbeError::TruncatedReply {
            received: n,
            expected,
        }),
        _ => Ok(buf),
    }
}
