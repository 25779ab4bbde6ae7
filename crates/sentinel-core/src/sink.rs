use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::report::GhostReport;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write report to {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ReportError {
    fn io(path: &Path, source: io::Error) -> Self {
        ReportError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Destination for persisted findings.
pub trait ReportSink: Send + Sync + fmt::Debug {
    fn persist(&self, report: &GhostReport) -> Result<(), ReportError>;

    /// Short description for log lines.
    fn describe(&self) -> String;
}

/// Single-slot report file: each report fully replaces the previous one.
///
/// Content is written to a sibling temp file and renamed into place, so a
/// reader never observes a half-written report. Writers are serialized; the
/// last session to finish emitting wins.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

impl ReportSink for FileSink {
    fn persist(&self, report: &GhostReport) -> Result<(), ReportError> {
        let mut data = serde_json::to_vec_pretty(report)?;
        data.push(b'\n');

        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| ReportError::io(parent, err))?;
        }
        let tmp = self.temp_path();
        let result = write_synced(&tmp, &data)
            .map_err(|err| ReportError::io(&tmp, err))
            .and_then(|()| {
                fs::rename(&tmp, &self.path).map_err(|err| ReportError::io(&self.path, err))
            });
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Append-only history, one compact JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for JsonLinesSink {
    fn persist(&self, report: &GhostReport) -> Result<(), ReportError> {
        let mut line = serde_json::to_vec(report)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| ReportError::io(&self.path, err))?;
        file.write_all(&line)
            .map_err(|err| ReportError::io(&self.path, err))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} (append)", self.path.display())
    }
}

/// Keeps every report in memory in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<GhostReport>>,
}

impl MemorySink {
    pub fn latest(&self) -> Option<GhostReport> {
        self.reports.lock().last().cloned()
    }

    pub fn all(&self) -> Vec<GhostReport> {
        self.reports.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl ReportSink for MemorySink {
    fn persist(&self, report: &GhostReport) -> Result<(), ReportError> {
        self.reports.lock().push(report.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
