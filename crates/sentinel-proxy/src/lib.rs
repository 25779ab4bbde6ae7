//! Ghost fragmentation proxy.
//!
//! Accepts a simulated client hello whose first bytes are a KEM public key,
//! classifies the hello size against a safe MTU budget, completes the key
//! exchange by encapsulating against the key, and emits a finding report.
//! Every accepted connection runs in its own task; the accept loop never
//! waits on session work unless a concurrency limit is configured.

mod config;
mod session;
mod telemetry;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::ReportEmitter;
use sentinel_kem::KemScheme;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{info, info_span, warn, Instrument};

pub use config::{ProxyConfig, DEFAULT_LISTEN, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
pub use session::{handle_session, SessionContext, SessionError, SessionOutcome};
pub use telemetry::{
    SessionDisposition, SessionTelemetryCollector, SessionTelemetryEvent,
    TracingTelemetryCollector,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session limiter closed")]
    Shutdown,
}

/// Bound TCP listener plus the shared state every session borrows.
pub struct Proxy {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    limiter: Option<Arc<Semaphore>>,
}

impl Proxy {
    /// Bind the listener. A bind failure means the proxy cannot run at all.
    pub async fn bind(
        config: ProxyConfig,
        scheme: Arc<dyn KemScheme>,
        emitter: ReportEmitter,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.listen,
                source,
            })?;
        let limiter = config
            .max_concurrent_sessions
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let ctx = Arc::new(SessionContext::new(&config, scheme, emitter));

        let scheme = ctx.scheme.as_ref();
        let combined = scheme.public_key_size() + scheme.ciphertext_size();
        info!(
            target: "sentinel::proxy",
            algorithm = scheme.name(),
            public_key_size = scheme.public_key_size(),
            ciphertext_size = scheme.ciphertext_size(),
            combined_size = combined,
            safe_threshold = ctx.safe_threshold,
            "kem scheme loaded"
        );
        if scheme.public_key_size() > ctx.safe_threshold {
            warn!(
                target: "sentinel::proxy",
                algorithm = scheme.name(),
                "public key alone exceeds the safe threshold; every hello will be flagged"
            );
        }
        info!(
            target: "sentinel::proxy",
            address = %listener.local_addr()?,
            max_sessions = ?config.max_concurrent_sessions,
            "ghost proxy listening"
        );

        Ok(Self {
            listener,
            ctx,
            limiter,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<(), ProxyError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. In-flight sessions are
    /// left to finish on their own deadlines.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let permit = match self.limiter.as_ref() {
                Some(limiter) => tokio::select! {
                    _ = &mut shutdown => break,
                    permit = Arc::clone(limiter).acquire_owned() => {
                        Some(permit.map_err(|_| ProxyError::Shutdown)?)
                    }
                },
                None => None,
            };

            tokio::select! {
                _ = &mut shutdown => break,
                accept = self.listener.accept() => match accept {
                    Ok((stream, peer)) => {
                        info!(target: "sentinel::proxy", peer = %peer, "new client");
                        let ctx = Arc::clone(&self.ctx);
                        let span = info_span!("session", peer = %peer);
                        tokio::spawn(
                            async move {
                                session::run_session(stream, peer, ctx).await;
                                drop(permit);
                            }
                            .instrument(span),
                        );
                    }
                    Err(err) => {
                        warn!(target: "sentinel::proxy", error = %err, "connection accept failed");
                        time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        info!(target: "sentinel::proxy", "shutdown signal received");
        Ok(())
    }
}
