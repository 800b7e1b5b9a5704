//! Proxy module for verifying SOCKS5 endpoints
//!
//! This module provides functionality for:
//! - Loading endpoints from delimited proxy lists
//! - Compiling a denylist of IP ranges
//! - Probing endpoints directly or through an upstream relay
//! - Running a concurrent verification pass with incremental persistence
//! - Selecting the upstream relay ("stealth mode")
//! - Fetching the GeoLite2 databases used for enrichment

pub mod checker;
pub mod denylist;
pub mod download;
pub mod geo;
pub mod models;
pub mod parser;
pub mod prober;
pub mod selector;
pub mod sink;

pub use checker::{BatchSummary, CheckerConfig, VerificationEngine};
pub use denylist::RangeSet;
pub use download::{FetcherConfig, GeoFetcher};
pub use geo::{GeoField, GeoInfo, GeoLocator, GeoResolver, NoGeo};
pub use models::{Anonymity, Endpoint, ProbeOutcome, RelayChoice, VerifiedResult};
pub use parser::ProxyParser;
pub use prober::{DnsReverseResolver, NoReverse, Probe, ReverseResolver, Socks5Prober};
pub use selector::{ChainSelector, RelayCandidate, SelectionConstraints};
pub use sink::{CsvResultSink, MemorySink, ResultSink};
