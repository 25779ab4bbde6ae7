use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::{classify, GhostReport, ReportEmitter, Verdict};
use sentinel_kem::{fingerprint, KemError, KemScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::telemetry::{SessionDisposition, SessionTelemetryCollector, SessionTelemetryEvent};

/// Shared, read-only state handed to every session task.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub scheme: Arc<dyn KemScheme>,
    pub emitter: Arc<ReportEmitter>,
    pub safe_threshold: usize,
    pub recv_buffer: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub telemetry: Option<Arc<dyn SessionTelemetryCollector>>,
}

impl SessionContext {
    pub fn new(config: &ProxyConfig, scheme: Arc<dyn KemScheme>, emitter: ReportEmitter) -> Self {
        Self {
            scheme,
            emitter: Arc::new(emitter),
            safe_threshold: config.safe_threshold,
            recv_buffer: config.recv_buffer.max(1),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            telemetry: config.telemetry.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no client hello within {0:?}")]
    ReadTimeout(Duration),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("peer closed before sending a client hello")]
    Closed,
    #[error("payload too small ({received} bytes) for {scheme} key ({required} bytes required)")]
    PayloadTooShort {
        received: usize,
        required: usize,
        scheme: &'static str,
    },
    #[error("invalid {scheme} public key: {source}")]
    InvalidPublicKey {
        received: usize,
        scheme: &'static str,
        #[source]
        source: KemError,
    },
    #[error("encapsulation failed: {source}")]
    Encapsulation {
        received: usize,
        #[source]
        source: KemError,
    },
}

impl SessionError {
    /// Stable label used for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            SessionError::ReadTimeout(_) => "read_timeout",
            SessionError::Read(_) => "read_error",
            SessionError::Closed => "closed",
            SessionError::PayloadTooShort { .. } => "payload_too_short",
            SessionError::InvalidPublicKey { .. } => "invalid_public_key",
            SessionError::Encapsulation { .. } => "encapsulation",
        }
    }

    /// Transport failures say nothing about the handshake and are not findings.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::ReadTimeout(_) | SessionError::Read(_) | SessionError::Closed
        )
    }

    /// Bytes read from the client hello, for failures that follow a successful read.
    pub fn payload_size(&self) -> Option<usize> {
        match self {
            SessionError::PayloadTooShort { received, .. }
            | SessionError::InvalidPublicKey { received, .. }
            | SessionError::Encapsulation { received, .. } => Some(*received),
            _ => None,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SessionError::PayloadTooShort { .. } | SessionError::InvalidPublicKey { .. }
        )
    }
}

/// A session that reached encapsulation and produced a finding.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub peer: SocketAddr,
    pub payload_size: usize,
    pub verdict: Verdict,
    pub ciphertext_len: usize,
    pub reply_delivered: bool,
    pub report_persisted: bool,
    pub report: GhostReport,
}

/// Drive one client hello through classification, key validation,
/// encapsulation and reporting.
///
/// Malformed hellos are rejected before encapsulation and never produce a
/// report. Once encapsulation succeeds the finding is reported even if the
/// ciphertext cannot be delivered.
pub async fn handle_session<S>(
    mut stream: S,
    peer: SocketAddr,
    ctx: &SessionContext,
) -> Result<SessionOutcome, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; ctx.recv_buffer];
    let received = match time::timeout(ctx.read_timeout, stream.read(&mut buffer)).await {
        Err(_) => return Err(SessionError::ReadTimeout(ctx.read_timeout)),
        Ok(Err(err)) => return Err(SessionError::Read(err)),
        Ok(Ok(0)) => return Err(SessionError::Closed),
        Ok(Ok(n)) => n,
    };
    let payload = &buffer[..received];
    info!(target: "sentinel::session", peer = %peer, bytes = received, "received handshake packet");

    let verdict = classify(received, ctx.safe_threshold);
    if verdict.risk {
        warn!(target: "sentinel::session", peer = %peer, "ghost detected: {}", verdict.message);
    } else {
        info!(target: "sentinel::session", peer = %peer, "safe: {}", verdict.message);
    }

    let scheme = ctx.scheme.as_ref();
    let key_size = scheme.public_key_size();
    if received < key_size {
        return Err(SessionError::PayloadTooShort {
            received,
            required: key_size,
            scheme: scheme.name(),
        });
    }

    // Fixed-offset framing: the key share occupies the first `key_size` bytes,
    // anything after it is opaque padding.
    let public_key = &payload[..key_size];
    scheme
        .validate_public_key(public_key)
        .map_err(|source| SessionError::InvalidPublicKey {
            received,
            scheme: scheme.name(),
            source,
        })?;
    debug!(target: "sentinel::session", peer = %peer, scheme = scheme.name(), "public key accepted");

    let encapsulation = scheme
        .encapsulate(public_key)
        .map_err(|source| SessionError::Encapsulation { received, source })?;
    let ciphertext_len = encapsulation.ciphertext.len();
    info!(
        target: "sentinel::session",
        peer = %peer,
        ciphertext_len,
        secret = %fingerprint(&encapsulation.shared_secret),
        "encapsulation complete"
    );

    let write = async {
        stream.write_all(&encapsulation.ciphertext).await?;
        stream.flush().await
    };
    let reply_delivered = match time::timeout(ctx.write_timeout, write).await {
        Ok(Ok(())) => {
            info!(target: "sentinel::session", peer = %peer, bytes = ciphertext_len, "ciphertext sent");
            true
        }
        Ok(Err(err)) => {
            warn!(target: "sentinel::session", peer = %peer, error = %err, "failed to send ciphertext");
            false
        }
        Err(_) => {
            warn!(
                target: "sentinel::session",
                peer = %peer,
                timeout = ?ctx.write_timeout,
                "timed out sending ciphertext"
            );
            false
        }
    };

    let report = GhostReport::new(
        peer.to_string(),
        scheme.name(),
        key_size,
        received,
        &verdict,
    );
    let emitter = Arc::clone(&ctx.emitter);
    let (report, report_persisted) = match task::spawn_blocking(move || {
        let persisted = emitter.emit(&report).is_ok();
        (report, persisted)
    })
    .await
    {
        Ok(result) => result,
        Err(err) => {
            error!(target: "sentinel::report", peer = %peer, error = %err, "report task failed");
            (
                GhostReport::new(peer.to_string(), scheme.name(), key_size, received, &verdict),
                false,
            )
        }
    };

    Ok(SessionOutcome {
        peer,
        payload_size: received,
        verdict,
        ciphertext_len,
        reply_delivered,
        report_persisted,
        report,
    })
}

/// Run a session to completion, logging its failure and feeding telemetry.
pub(crate) async fn run_session<S>(stream: S, peer: SocketAddr, ctx: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(collector) = ctx.telemetry.as_ref() {
        collector.session_started();
    }

    let result = handle_session(stream, peer, &ctx).await;

    let event = match &result {
        Ok(outcome) => SessionTelemetryEvent {
            peer,
            payload_size: Some(outcome.payload_size),
            disposition: SessionDisposition::Finding {
                classification: outcome.verdict.classification,
                reply_delivered: outcome.reply_delivered,
                report_persisted: outcome.report_persisted,
            },
        },
        Err(err) => {
            match err {
                SessionError::Closed => {
                    debug!(target: "sentinel::session", peer = %peer, "{err}")
                }
                err if err.is_transport() => {
                    warn!(target: "sentinel::session", peer = %peer, error = %err, "session aborted")
                }
                err => {
                    error!(target: "sentinel::session", peer = %peer, error = %err, "handshake rejected")
                }
            }
            SessionTelemetryEvent {
                peer,
                payload_size: err.payload_size(),
                disposition: SessionDisposition::Rejected {
                    reason: err.reason(),
                },
            }
        }
    };

    if let Some(collector) = ctx.telemetry.as_ref() {
        collector.record(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{Classification, MemorySink};
    use sentinel_kem::{KemAlgorithm, MlKem768};

    fn context(sink: Arc<MemorySink>) -> SessionContext {
        let config = ProxyConfig::default().with_read_timeout(Duration::from_millis(200));
        SessionContext::new(
            &config,
            KemAlgorithm::MlKem768.scheme(),
            ReportEmitter::new(sink, config.safe_threshold),
        )
    }

    fn hello(padding: usize) -> (Vec<u8>, sentinel_kem::KemKeyPair) {
        let pair = MlKem768.generate_keypair().expect("keypair");
        let mut payload = pair.public.clone();
        payload.extend((0..padding).map(|i| (i % 256) as u8));
        (payload, pair)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn risky_hello_is_answered_and_reported() {
        let sink = Arc::new(MemorySink::default());
        let ctx = context(sink.clone());
        let (payload, pair) = hello(300);
        let (mut client, server) = tokio::io::duplex(8192);
        client.write_all(&payload).await.expect("send hello");

        let outcome = handle_session(server, peer(), &ctx).await.expect("session");
        assert_eq!(outcome.payload_size, 1484);
        assert!(outcome.verdict.risk);
        assert!(outcome.reply_delivered);
        assert!(outcome.report_persisted);

        let mut ciphertext = vec![0u8; MlKem768::CIPHERTEXT_BYTES];
        client.read_exact(&mut ciphertext).await.expect("ciphertext");
        MlKem768
            .decapsulate(&pair.secret, &ciphertext)
            .expect("decapsulate");

        let report = sink.latest().expect("report");
        assert_eq!(report.status, Classification::CriticalRisk);
        assert_eq!(report.handshake_size_bytes, 1484);
        assert_eq!(report.client_ip, "127.0.0.1:40000");
    }

    #[tokio::test]
    async fn short_hello_is_rejected_without_report() {
        let sink = Arc::new(MemorySink::default());
        let ctx = context(sink.clone());
        let (payload, _) = hello(0);
        let (mut client, server) = tokio::io::duplex(8192);
        client.write_all(&payload[..1000]).await.expect("send hello");

        let err = handle_session(server, peer(), &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::PayloadTooShort {
                received: 1000,
                required: 1184,
                ..
            }
        ));
        assert!(err.is_protocol_violation());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn garbage_key_is_rejected_without_report() {
        let sink = Arc::new(MemorySink::default());
        let ctx = context(sink.clone());
        let garbage = vec![0xffu8; 1300];
        let (mut client, server) = tokio::io::duplex(8192);
        client.write_all(&garbage).await.expect("send hello");

        let err = handle_session(server, peer(), &ctx).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_public_key");
        assert_eq!(err.payload_size(), Some(1300));
        assert!(sink.is_empty());
    }

    #[derive(Debug)]
    struct BrokenEncapsulation;

    impl KemScheme for BrokenEncapsulation {
        fn name(&self) -> &'static str {
            MlKem768::NAME
        }

        fn public_key_size(&self) -> usize {
            MlKem768.public_key_size()
        }

        fn ciphertext_size(&self) -> usize {
            MlKem768.ciphertext_size()
        }

        fn shared_secret_size(&self) -> usize {
            MlKem768.shared_secret_size()
        }

        fn generate_keypair(&self) -> Result<sentinel_kem::KemKeyPair, KemError> {
            MlKem768.generate_keypair()
        }

        fn validate_public_key(&self, public_key: &[u8]) -> Result<(), KemError> {
            MlKem768.validate_public_key(public_key)
        }

        fn encapsulate(&self, _public_key: &[u8]) -> Result<sentinel_kem::Encapsulation, KemError> {
            Err(KemError::Operation("entropy source unavailable".to_string()))
        }

        fn decapsulate(
            &self,
            secret_key: &[u8],
            ciphertext: &[u8],
        ) -> Result<sentinel_kem::SharedSecret, KemError> {
            MlKem768.decapsulate(secret_key, ciphertext)
        }
    }

    #[derive(Debug, Default)]
    struct RecordingTelemetry {
        events: std::sync::Mutex<Vec<SessionTelemetryEvent>>,
    }

    impl SessionTelemetryCollector for RecordingTelemetry {
        fn record(&self, event: &SessionTelemetryEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn failed_encapsulation_aborts_without_reply_or_report() {
        let sink = Arc::new(MemorySink::default());
        let config = ProxyConfig::default().with_read_timeout(Duration::from_millis(200));
        let ctx = SessionContext::new(
            &config,
            Arc::new(BrokenEncapsulation),
            ReportEmitter::new(sink.clone(), config.safe_threshold),
        );
        let (payload, _) = hello(150);
        let (mut client, server) = tokio::io::duplex(8192);
        client.write_all(&payload).await.expect("send hello");

        let err = handle_session(server, peer(), &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Encapsulation {
                received: 1334,
                source: KemError::Operation(_),
            }
        ));
        assert!(!err.is_transport());
        assert!(!err.is_protocol_violation());
        assert!(sink.is_empty());

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.expect("read reply");
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn rejected_session_telemetry_keeps_payload_size() {
        let sink = Arc::new(MemorySink::default());
        let telemetry = Arc::new(RecordingTelemetry::default());
        let config = ProxyConfig::default()
            .with_read_timeout(Duration::from_millis(200))
            .with_telemetry(telemetry.clone());
        let ctx = Arc::new(SessionContext::new(
            &config,
            KemAlgorithm::MlKem768.scheme(),
            ReportEmitter::new(sink.clone(), config.safe_threshold),
        ));
        let (mut client, server) = tokio::io::duplex(8192);
        client.write_all(&[0xffu8; 1300]).await.expect("send hello");

        run_session(server, peer(), ctx).await;

        let events = telemetry.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload_size, Some(1300));
        assert_eq!(
            events[0].disposition,
            SessionDisposition::Rejected {
                reason: "invalid_public_key"
            }
        );
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let sink = Arc::new(MemorySink::default());
        let ctx = context(sink.clone());
        let (_client, server) = tokio::io::duplex(8192);

        let err = handle_session(server, peer(), &ctx).await.unwrap_err();
        assert!(matches!(err, SessionError::ReadTimeout(_)));
        assert!(err.is_transport());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn clean_close_is_not_a_finding() {
        let sink = Arc::new(MemorySink::default());
        let ctx = context(sink.clone());
        let (client, server) = tokio::io::duplex(8192);
        drop(client);

        let err = handle_session(server, peer(), &ctx).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn undeliverable_reply_still_reports() {
        let sink = Arc::new(MemorySink::default());
        let ctx = context(sink.clone());
        let (payload, _) = hello(150);
        let (mut client, server) = tokio::io::duplex(8192);
        client.write_all(&payload).await.expect("send hello");
        drop(client);

        let outcome = handle_session(server, peer(), &ctx).await.expect("session");
        assert!(!outcome.reply_delivered);
        assert_eq!(outcome.verdict.classification, Classification::Safe);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.latest().expect("report").handshake_size_bytes, 1334);
    }
}
