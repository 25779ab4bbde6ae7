mod simple_config;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use sentinel_client::{PeerSimulator, ProbeConfig, DEFAULT_PADDING, DEFAULT_TARGET};
use sentinel_core::{
    classify, FileSink, JsonLinesSink, ReportEmitter, ReportSink, DEFAULT_SAFE_THRESHOLD,
};
use sentinel_kem::KemAlgorithm;
use sentinel_proxy::{Proxy, ProxyConfig, SessionTelemetryCollector, TracingTelemetryCollector};
use simple_config::load_config;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry::{TelemetryHandle, TelemetrySettings};

const DEFAULT_REPORT_PATH: &str = "ghost_report.json";

#[derive(Parser, Debug)]
#[command(
    name = "sentinel",
    author,
    version,
    about = "Sentinel: probe post-quantum handshakes for MTU fragmentation risk",
    propagate_version = true
)]
struct Cli {
    /// Increase output verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Output log format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ghost proxy that classifies incoming client hellos.
    Proxy(ProxyArgs),
    /// Send a simulated client hello to a running proxy.
    Probe(ProbeArgs),
    /// List supported KEM schemes and how their handshakes classify.
    Schemes(SchemesArgs),
}

/// Proxy flags are optional so a config file can fill the gaps; anything
/// still unset falls back to the built-in defaults.
#[derive(Args, Debug, Clone, Default)]
struct ProxyArgs {
    /// TCP address to accept client hellos on [default: 0.0.0.0:4433].
    #[arg(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// KEM scheme expected in the client hello [default: ML-KEM-768].
    #[arg(long)]
    scheme: Option<KemAlgorithm>,

    /// Largest hello size in bytes considered safe from fragmentation [default: 1400].
    #[arg(long)]
    threshold: Option<usize>,

    /// Receive buffer capacity in bytes [default: 4096].
    #[arg(long)]
    recv_buffer: Option<usize>,

    /// Deadline for the client hello (e.g. "10s").
    #[arg(long, value_parser = humantime::parse_duration)]
    read_timeout: Option<Duration>,

    /// Deadline for sending the ciphertext (e.g. "5s").
    #[arg(long, value_parser = humantime::parse_duration)]
    write_timeout: Option<Duration>,

    /// Where findings are written [default: ghost_report.json].
    #[arg(long)]
    report: Option<PathBuf>,

    /// Replace the report on every finding, or append one JSON line per finding.
    #[arg(long, value_enum)]
    report_mode: Option<ReportMode>,

    /// Maximum number of concurrent sessions (unbounded when omitted).
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Expose Prometheus metrics on this address.
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,

    /// Proxy configuration file (YAML, or JSON by extension).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    /// Proxy address to send the client hello to.
    #[arg(short = 't', long, default_value = DEFAULT_TARGET)]
    target: SocketAddr,

    /// KEM scheme used to generate the client key share.
    #[arg(long, default_value_t = KemAlgorithm::default())]
    scheme: KemAlgorithm,

    /// Filler bytes appended after the public key.
    #[arg(long, default_value_t = DEFAULT_PADDING)]
    padding: usize,

    /// Cut the hello to this many bytes to simulate a malformed key share.
    #[arg(long)]
    truncate: Option<usize>,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    connect_timeout: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    read_timeout: Duration,

    /// Threshold for the local pre-flight warning.
    #[arg(long, default_value_t = DEFAULT_SAFE_THRESHOLD)]
    threshold: usize,
}

#[derive(Args, Debug, Clone)]
struct SchemesArgs {
    /// Padding assumed on top of the public key when classifying.
    #[arg(long, default_value_t = DEFAULT_PADDING)]
    padding: usize,

    #[arg(long, default_value_t = DEFAULT_SAFE_THRESHOLD)]
    threshold: usize,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum ReportMode {
    #[default]
    Single,
    Append,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let command = cli.command.unwrap_or(Command::Proxy(ProxyArgs::default()));

    match command {
        Command::Proxy(args) => run_proxy(args).await?,
        Command::Probe(args) => run_probe(args).await?,
        Command::Schemes(args) => run_schemes(&args),
    }

    Ok(())
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(filter.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let _ = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
}

async fn run_proxy(mut args: ProxyArgs) -> Result<()> {
    if let Some(path) = args.config.clone() {
        let overrides = load_config(&path).await?;
        info!(
            target: "sentinel::config",
            file = %path.display(),
            overrides = !overrides.is_empty(),
            "proxy configuration loaded"
        );
        overrides.apply(&mut args);
    }

    let ProxyArgs {
        listen,
        scheme,
        threshold,
        recv_buffer,
        read_timeout,
        write_timeout,
        report,
        report_mode,
        max_sessions,
        metrics_listen,
        config: _,
    } = args;

    let mut config = ProxyConfig::default();
    if let Some(listen) = listen {
        config = config.with_listen(listen);
    }
    if let Some(threshold) = threshold {
        config = config.with_safe_threshold(threshold);
    }
    if let Some(capacity) = recv_buffer {
        config = config.with_recv_buffer(capacity);
    }
    if let Some(timeout) = read_timeout {
        config = config.with_read_timeout(timeout);
    }
    if let Some(timeout) = write_timeout {
        config = config.with_write_timeout(timeout);
    }
    if let Some(limit) = max_sessions {
        config = config.with_max_concurrent_sessions(limit);
    }

    let report = report.unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_PATH));
    let sink: Arc<dyn ReportSink> = match report_mode.unwrap_or_default() {
        ReportMode::Single => Arc::new(FileSink::new(report)),
        ReportMode::Append => Arc::new(JsonLinesSink::new(report)),
    };
    info!(target: "sentinel::report", destination = %sink.describe(), "report sink ready");
    let emitter = ReportEmitter::new(sink, config.safe_threshold);

    let telemetry = if let Some(addr) = metrics_listen {
        info!(target: "sentinel::metrics", address = %addr, "Prometheus metrics endpoint enabled");
        let settings = TelemetrySettings {
            listen: Some(addr),
            ..Default::default()
        };
        let telemetry = TelemetryHandle::initialize(settings).await?;
        if let Some(bound) = telemetry.metrics_addr() {
            info!(target: "sentinel::metrics", address = %bound, "Prometheus metrics exporter running");
        }
        telemetry
    } else {
        TelemetryHandle::disabled()
    };
    let collector: Arc<dyn SessionTelemetryCollector> = if telemetry.is_enabled() {
        Arc::new(telemetry.clone())
    } else {
        Arc::new(TracingTelemetryCollector)
    };
    config = config.with_telemetry(collector);

    let scheme = scheme.unwrap_or_default();
    let proxy = Proxy::bind(config, scheme.scheme(), emitter)
        .await
        .context("failed to start ghost proxy")?;

    proxy
        .serve_with_shutdown(async {
            if let Err(err) = signal::ctrl_c().await {
                warn!(target: "sentinel::proxy", error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("ghost proxy stopped unexpectedly")?;

    telemetry
        .shutdown()
        .await
        .context("failed to stop metrics exporter")?;
    Ok(())
}

async fn run_probe(args: ProbeArgs) -> Result<()> {
    let mut config = ProbeConfig::new(args.target)
        .with_padding(args.padding)
        .with_connect_timeout(args.connect_timeout)
        .with_read_timeout(args.read_timeout)
        .with_safe_threshold(args.threshold);
    if let Some(limit) = args.truncate {
        config = config.with_truncate_to(limit);
    }

    let simulator = PeerSimulator::new(config, args.scheme.scheme());
    match simulator.run().await {
        Ok(outcome) => {
            info!(
                target: "sentinel::probe",
                algorithm = outcome.algorithm,
                payload_size = outcome.payload_size,
                ciphertext_size = outcome.ciphertext_size,
                shared_secret_size = outcome.shared_secret_size,
                secret = %outcome.shared_secret_fingerprint,
                expected = %outcome.expected,
                "handshake complete; check the proxy report for its verdict"
            );
            Ok(())
        }
        Err(err) => {
            error!(target: "sentinel::probe", error = %err, "handshake failed");
            for hint in err.hints() {
                warn!(target: "sentinel::probe", "possible cause: {hint}");
            }
            Err(anyhow::Error::new(err).context("handshake probe failed"))
        }
    }
}

fn run_schemes(args: &SchemesArgs) {
    println!(
        "{:<12} {:>10} {:>11} {:>9} {:>9}  {}",
        "SCHEME", "PUBLIC KEY", "CIPHERTEXT", "COMBINED", "HELLO", "VERDICT"
    );
    for algorithm in KemAlgorithm::ALL {
        let scheme = algorithm.scheme();
        let hello = scheme.public_key_size() + args.padding;
        let verdict = classify(hello, args.threshold);
        println!(
            "{:<12} {:>10} {:>11} {:>9} {:>9}  {}",
            scheme.name(),
            scheme.public_key_size(),
            scheme.ciphertext_size(),
            scheme.public_key_size() + scheme.ciphertext_size(),
            hello,
            verdict.classification
        );
    }
    println!(
        "hello = public key + {} bytes padding; threshold {} bytes",
        args.padding, args.threshold
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn proxy_flags_parse() {
        let cli = Cli::parse_from([
            "sentinel",
            "proxy",
            "--listen",
            "127.0.0.1:5544",
            "--scheme",
            "kyber512",
            "--read-timeout",
            "250ms",
            "--report-mode",
            "append",
        ]);
        let Some(Command::Proxy(args)) = cli.command else {
            panic!("expected proxy command");
        };
        assert_eq!(args.listen, Some("127.0.0.1:5544".parse().unwrap()));
        assert_eq!(args.scheme, Some(KemAlgorithm::MlKem512));
        assert_eq!(args.read_timeout, Some(Duration::from_millis(250)));
        assert_eq!(args.report_mode, Some(ReportMode::Append));
        assert!(args.threshold.is_none());
    }

    #[test]
    fn probe_defaults_match_reference_client() {
        let cli = Cli::parse_from(["sentinel", "-v", "probe", "--truncate", "1000"]);
        assert_eq!(cli.verbose, 1);
        let Some(Command::Probe(args)) = cli.command else {
            panic!("expected probe command");
        };
        assert_eq!(args.target, DEFAULT_TARGET.parse().unwrap());
        assert_eq!(args.scheme, KemAlgorithm::MlKem768);
        assert_eq!(args.padding, 300);
        assert_eq!(args.truncate, Some(1000));
        assert_eq!(args.connect_timeout, Duration::from_secs(5));
        assert_eq!(args.threshold, 1400);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(Cli::try_parse_from(["sentinel", "probe", "--scheme", "x25519"]).is_err());
    }
}
