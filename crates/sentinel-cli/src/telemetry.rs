use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use sentinel_proxy::{SessionDisposition, SessionTelemetryCollector, SessionTelemetryEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct TelemetrySettings {
    pub namespace: String,
    pub listen: Option<SocketAddr>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            namespace: "sentinel".to_string(),
            listen: None,
        }
    }
}

/// Prometheus counters fed by the proxy's session telemetry hook.
#[derive(Clone, Default)]
pub struct TelemetryHandle {
    inner: Option<Arc<TelemetryInner>>,
}

impl TelemetryHandle {
    pub async fn initialize(settings: TelemetrySettings) -> Result<Self> {
        let Some(listen) = settings.listen else {
            return Ok(Self { inner: None });
        };

        let namespace = settings.namespace;
        let registry = Arc::new(Registry::new());

        let sessions_opts = Opts::new("sessions_total", "Connections accepted by the ghost proxy")
            .namespace(namespace.clone());
        let sessions_total = IntCounter::with_opts(sessions_opts)?;
        registry.register(Box::new(sessions_total.clone()))?;

        let findings_opts = Opts::new(
            "findings_total",
            "Handshakes classified and reported, grouped by status",
        )
        .namespace(namespace.clone());
        let findings_total = IntCounterVec::new(findings_opts, &["status"])?;
        registry.register(Box::new(findings_total.clone()))?;

        let rejected_opts = Opts::new(
            "rejected_sessions_total",
            "Sessions aborted before producing a finding, grouped by reason",
        )
        .namespace(namespace.clone());
        let rejected_total = IntCounterVec::new(rejected_opts, &["reason"])?;
        registry.register(Box::new(rejected_total.clone()))?;

        let bytes_opts = Opts::new(
            "handshake_bytes_total",
            "Client hello bytes received across all sessions",
        )
        .namespace(namespace.clone());
        let handshake_bytes = IntCounter::with_opts(bytes_opts)?;
        registry.register(Box::new(handshake_bytes.clone()))?;

        let active_opts =
            Opts::new("active_sessions", "In-flight proxy sessions").namespace(namespace);
        let active_sessions = IntGauge::with_opts(active_opts)?;
        registry.register(Box::new(active_sessions.clone()))?;

        let exporter = spawn_metrics_server(listen, Arc::clone(&registry)).await?;

        let inner = TelemetryInner {
            sessions_total,
            findings_total,
            rejected_total,
            handshake_bytes,
            active_sessions,
            exporter: Mutex::new(Some(exporter)),
        };

        Ok(Self {
            inner: Some(Arc::new(inner)),
        })
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().and_then(|inner| inner.metrics_addr())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(inner) = self.inner.as_ref() {
            inner.shutdown().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for TelemetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryHandle")
            .field("enabled", &self.is_enabled())
            .field("metrics_addr", &self.metrics_addr())
            .finish()
    }
}

impl SessionTelemetryCollector for TelemetryHandle {
    fn session_started(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.sessions_total.inc();
            inner.active_sessions.inc();
        }
    }

    fn record(&self, event: &SessionTelemetryEvent) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        inner.active_sessions.dec();
        if let Some(bytes) = event.payload_size {
            inner.handshake_bytes.inc_by(bytes as u64);
        }
        match &event.disposition {
            SessionDisposition::Finding { classification, .. } => inner
                .findings_total
                .with_label_values(&[classification.as_str()])
                .inc(),
            SessionDisposition::Rejected { reason } => {
                inner.rejected_total.with_label_values(&[*reason]).inc()
            }
        }
    }
}

struct TelemetryInner {
    sessions_total: IntCounter,
    findings_total: IntCounterVec,
    rejected_total: IntCounterVec,
    handshake_bytes: IntCounter,
    active_sessions: IntGauge,
    exporter: Mutex<Option<MetricsServer>>,
}

impl TelemetryInner {
    async fn shutdown(&self) -> Result<()> {
        let server = self.exporter.lock().take();

        if let Some(mut server) = server {
            server.shutdown().await?;
        }
        Ok(())
    }

    fn metrics_addr(&self) -> Option<SocketAddr> {
        self.exporter.lock().as_ref().map(|server| server.addr)
    }
}

struct MetricsServer {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<Result<()>>>,
    addr: SocketAddr,
}

impl MetricsServer {
    async fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join.take() {
            handle.await??;
        }
        Ok(())
    }
}

async fn spawn_metrics_server(addr: SocketAddr, registry: Arc<Registry>) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener at {addr}"))?;
    let bound_addr = listener.local_addr()?;
    debug!(target: "sentinel::metrics", requested = %addr, bound = %bound_addr, "metrics endpoint bound");
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(target: "sentinel::metrics", "metrics endpoint received shutdown signal");
                    break;
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((mut socket, peer)) => {
                            let registry = Arc::clone(&registry);
                            tokio::spawn(async move {
                                if let Err(err) = respond_with_metrics(&mut socket, &registry).await {
                                    warn!(target: "sentinel::metrics", error = %err, peer = %peer, "failed to serve metrics request");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(target: "sentinel::metrics", error = %err, "metrics accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    });

    Ok(MetricsServer {
        shutdown: Some(shutdown_tx),
        join: Some(join),
        addr: bound_addr,
    })
}

async fn respond_with_metrics(socket: &mut TcpStream, registry: &Registry) -> Result<()> {
    let mut buf = [0u8; 1024];
    let _ = socket.read(&mut buf).await?;

    let metric_families = registry.gather();
    let mut payload = Vec::new();
    static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);
    ENCODER
        .encode(&metric_families, &mut payload)
        .map_err(|err| anyhow!("failed to encode metrics: {err}"))?;
    if payload.is_empty() {
        payload.extend_from_slice(b"# no metrics available\n");
    }

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    socket.write_all(header.as_bytes()).await?;
    socket.write_all(&payload).await?;
    socket.shutdown().await?;
    Ok(())
}
