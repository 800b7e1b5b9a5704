//! Error types surfaced by the verification pipeline
//!
//! Per-endpoint failures never show up here; they are reported as
//! [`ProbeOutcome`](crate::proxy::ProbeOutcome) values. Only conditions that
//! make the run's output untrustworthy, or that defeat the requested relay
//! selection, become an [`Error`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("denylist {path} exists but cannot be read: {source}")]
    DenylistUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("input {path} cannot be read: {source}")]
    InputUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output {path} is not writable: {source}")]
    OutputUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to append result row: {0}")]
    Sink(#[from] csv::Error),

    #[error("result sink lock poisoned")]
    SinkPoisoned,

    #[error("no relay candidates available")]
    EmptyRelayPool,

    #[error("no relay matches {0}")]
    NoRelayMatch(String),

    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error("failed to download {name}: {source}")]
    Download {
        name: String,
        #[source]
        source: reqwest::Error,
    },
}
