use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sentinel_kem::KemAlgorithm;
use serde::Deserialize;

use crate::{ProxyArgs, ReportMode};

/// Proxy settings read from a config file. Each field only fills in a flag
/// the operator left unset on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub listen: Option<SocketAddr>,
    pub scheme: Option<KemAlgorithm>,
    pub threshold: Option<usize>,
    pub recv_buffer: Option<usize>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub report: Option<PathBuf>,
    pub report_mode: Option<ReportMode>,
    pub max_sessions: Option<usize>,
    pub metrics_listen: Option<SocketAddr>,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.listen.is_none()
            && self.scheme.is_none()
            && self.threshold.is_none()
            && self.recv_buffer.is_none()
            && self.read_timeout.is_none()
            && self.write_timeout.is_none()
            && self.report.is_none()
            && self.report_mode.is_none()
            && self.max_sessions.is_none()
            && self.metrics_listen.is_none()
    }

    pub fn apply(&self, args: &mut ProxyArgs) {
        args.listen = args.listen.or(self.listen);
        args.scheme = args.scheme.or(self.scheme);
        args.threshold = args.threshold.or(self.threshold);
        args.recv_buffer = args.recv_buffer.or(self.recv_buffer);
        args.read_timeout = args.read_timeout.or(self.read_timeout);
        args.write_timeout = args.write_timeout.or(self.write_timeout);
        if args.report.is_none() {
            args.report = self.report.clone();
        }
        args.report_mode = args.report_mode.or(self.report_mode);
        args.max_sessions = args.max_sessions.or(self.max_sessions);
        args.metrics_listen = args.metrics_listen.or(self.metrics_listen);
    }
}

pub async fn load_config(path: &Path) -> Result<ConfigOverrides> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read proxy config {}", path.display()))?;
    parse_config(&source, path)
}

fn parse_config(source: &str, path: &Path) -> Result<ConfigOverrides> {
    if source.trim().is_empty() {
        return Ok(ConfigOverrides::default());
    }
    let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let file: ProxyFile = if ext.eq_ignore_ascii_case("json") {
        serde_json::from_str(source)
            .with_context(|| format!("proxy config {} is not valid JSON", path.display()))?
    } else {
        serde_yaml::from_str(source)
            .with_context(|| format!("proxy config {} is not valid YAML", path.display()))?
    };
    build_overrides(file)
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ProxyFile {
    #[serde(default)]
    listen: Option<String>,
    #[serde(default)]
    scheme: Option<String>,
    #[serde(default)]
    threshold: Option<usize>,
    #[serde(default)]
    recv_buffer: Option<usize>,
    #[serde(default)]
    read_timeout: Option<String>,
    #[serde(default)]
    write_timeout: Option<String>,
    #[serde(default)]
    report: Option<PathBuf>,
    #[serde(default)]
    report_mode: Option<String>,
    #[serde(default)]
    max_sessions: Option<usize>,
    #[serde(default)]
    metrics_listen: Option<String>,
}

fn build_overrides(file: ProxyFile) -> Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::default();

    if let Some(listen) = file.listen.as_deref() {
        overrides.listen = Some(parse_socket(listen, "listen")?);
    }
    if let Some(metrics) = file.metrics_listen.as_deref() {
        overrides.metrics_listen = Some(parse_socket(metrics, "metrics_listen")?);
    }
    if let Some(scheme) = file.scheme.as_deref() {
        overrides.scheme = Some(
            KemAlgorithm::from_name(scheme)
                .with_context(|| format!("unsupported scheme '{scheme}' in proxy config"))?,
        );
    }
    if let Some(read_timeout) = file.read_timeout.as_deref() {
        overrides.read_timeout = Some(parse_duration(read_timeout, "read_timeout")?);
    }
    if let Some(write_timeout) = file.write_timeout.as_deref() {
        overrides.write_timeout = Some(parse_duration(write_timeout, "write_timeout")?);
    }
    if let Some(mode) = file.report_mode.as_deref() {
        overrides.report_mode = Some(parse_report_mode(mode)?);
    }
    if let Some(recv_buffer) = file.recv_buffer {
        if recv_buffer == 0 {
            bail!("recv_buffer must be greater than zero");
        }
        overrides.recv_buffer = Some(recv_buffer);
    }
    if let Some(max_sessions) = file.max_sessions {
        if max_sessions == 0 {
            bail!("max_sessions must be greater than zero");
        }
        overrides.max_sessions = Some(max_sessions);
    }
    overrides.threshold = file.threshold;
    overrides.report = file.report;

    Ok(overrides)
}

fn parse_socket(value: &str, field: &str) -> Result<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .with_context(|| format!("failed to parse {field} socket address"))
}

fn parse_duration(value: &str, field: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("failed to parse {field} duration"))
}

fn parse_report_mode(value: &str) -> Result<ReportMode> {
    match value.to_ascii_lowercase().as_str() {
        "single" => Ok(ReportMode::Single),
        "append" => Ok(ReportMode::Append),
        other => bail!("unknown report mode '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_proxy_config() {
        let config = r#"
listen: 127.0.0.1:5544
scheme: kyber1024
threshold: 1300
read_timeout: 2s
write_timeout: 500ms
report: reports/ghost.json
report_mode: append
max_sessions: 64
metrics_listen: 127.0.0.1:9100
"#;
        let overrides = parse_config(config, Path::new("sentinel.yaml")).unwrap();
        assert_eq!(overrides.listen, Some("127.0.0.1:5544".parse().unwrap()));
        assert_eq!(overrides.scheme, Some(KemAlgorithm::MlKem1024));
        assert_eq!(overrides.threshold, Some(1300));
        assert_eq!(overrides.read_timeout, Some(Duration::from_secs(2)));
        assert_eq!(overrides.write_timeout, Some(Duration::from_millis(500)));
        assert_eq!(overrides.report, Some(PathBuf::from("reports/ghost.json")));
        assert_eq!(overrides.report_mode, Some(ReportMode::Append));
        assert_eq!(overrides.max_sessions, Some(64));
        assert!(overrides.recv_buffer.is_none());
    }

    #[test]
    fn parses_json_by_extension() {
        let config = r#"{ "threshold": 1200, "scheme": "ML-KEM-512" }"#;
        let overrides = parse_config(config, Path::new("sentinel.json")).unwrap();
        assert_eq!(overrides.threshold, Some(1200));
        assert_eq!(overrides.scheme, Some(KemAlgorithm::MlKem512));
    }

    #[test]
    fn rejects_unknown_keys_and_schemes() {
        assert!(parse_config("mtu: 1500\n", Path::new("sentinel.yaml")).is_err());
        assert!(parse_config("scheme: rsa2048\n", Path::new("sentinel.yaml")).is_err());
        assert!(parse_config("read_timeout: soon\n", Path::new("sentinel.yaml")).is_err());
    }

    #[test]
    fn empty_file_changes_nothing() {
        let overrides = parse_config("\n", Path::new("sentinel.yaml")).unwrap();
        assert!(overrides.is_empty());
    }

    #[test]
    fn command_line_flags_win_over_file() {
        let overrides = ConfigOverrides {
            threshold: Some(1200),
            listen: Some("127.0.0.1:5544".parse().unwrap()),
            report: Some(PathBuf::from("from-file.json")),
            ..Default::default()
        };
        let mut args = ProxyArgs {
            threshold: Some(1450),
            ..Default::default()
        };
        overrides.apply(&mut args);
        assert_eq!(args.threshold, Some(1450));
        assert_eq!(args.listen, Some("127.0.0.1:5544".parse().unwrap()));
        assert_eq!(args.report, Some(PathBuf::from("from-file.json")));
        assert!(args.scheme.is_none());
    }

    #[tokio::test]
    async fn loads_config_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.yml");
        std::fs::write(&path, "recv_buffer: 8192\n").unwrap();
        let overrides = load_config(&path).await.unwrap();
        assert_eq!(overrides.recv_buffer, Some(8192));
        assert!(load_config(&dir.path().join("missing.yml")).await.is_err());
    }
}
