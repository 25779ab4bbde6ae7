//! Classification and reporting primitives shared by the Sentinel proxy and CLI.
//!
//! A handshake finding is produced in two steps: [`classify`] maps the observed
//! payload size onto a binary fragmentation verdict, and a [`ReportEmitter`]
//! persists the resulting [`GhostReport`] through an injected [`ReportSink`].

pub mod classify;
pub mod report;
pub mod sink;

pub use classify::{
    classify, Classification, Verdict, DEFAULT_RECV_BUFFER, DEFAULT_SAFE_THRESHOLD,
};
pub use report::{render_summary, GhostReport, ReportEmitter};
pub use sink::{FileSink, JsonLinesSink, MemorySink, ReportError, ReportSink};
