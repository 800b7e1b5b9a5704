//! Verification engine: concurrent, incremental checking of a batch of
//! candidate endpoints

use crate::error::Error;
use crate::proxy::denylist::RangeSet;
use crate::proxy::geo::GeoResolver;
use crate::proxy::models::{Endpoint, ProbeOutcome, RelayChoice, VerifiedResult};
use crate::proxy::prober::Probe;
use crate::proxy::sink::ResultSink;
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default timeout for each connection attempt in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default number of concurrent probes
const DEFAULT_CONCURRENCY: usize = 10;

/// Default bound on a reverse DNS lookup in seconds
const DEFAULT_REVERSE_DNS_TIMEOUT_SECS: u64 = 2;

/// Configuration for the verification engine
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each connection attempt, relay handshake included
    pub timeout: Duration,
    /// Number of probes in flight at once
    pub concurrency: usize,
    /// Upper bound on the reverse DNS lookup of a reachable endpoint
    pub reverse_dns_timeout: Duration,
    /// Require a SOCKS5 greeting reply before counting an endpoint as verified
    pub handshake: bool,
    /// Stop a relay survey once this many matching candidates were measured
    pub relay_sample: Option<usize>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            reverse_dns_timeout: Duration::from_secs(DEFAULT_REVERSE_DNS_TIMEOUT_SECS),
            handshake: false,
            relay_sample: None,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Zero is treated as one
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_reverse_dns_timeout(mut self, timeout: Duration) -> Self {
        self.reverse_dns_timeout = timeout;
        self
    }

    pub fn with_handshake(mut self, handshake: bool) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_relay_sample(mut self, sample: usize) -> Self {
        self.relay_sample = Some(sample);
        self
    }
}

/// Counts and denylisted endpoints of one verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Unique endpoints submitted
    pub total: usize,
    pub verified: usize,
    pub unreachable: usize,
    pub invalid: usize,
    /// Endpoints skipped because they matched the denylist
    pub denylisted: Vec<Endpoint>,
    /// Whether the pass was stopped before every endpoint was processed
    pub cancelled: bool,
}

impl BatchSummary {
    /// Number of outcomes recorded so far
    pub fn processed(&self) -> usize {
        self.verified + self.unreachable + self.invalid + self.denylisted.len()
    }

    fn record(&mut self, endpoint: Endpoint, outcome: &ProbeOutcome) {
        match outcome {
            ProbeOutcome::Verified { .. } => self.verified += 1,
            ProbeOutcome::Denylisted => self.denylisted.push(endpoint),
            ProbeOutcome::Unreachable { .. } => self.unreachable += 1,
            ProbeOutcome::Invalid { .. } => self.invalid += 1,
        }
    }
}

/// Item produced by [`VerificationEngine::run`]
///
/// Only a failed append to the result sink is an error.
pub type Verification = Result<(Endpoint, ProbeOutcome), Error>;

/// Engine that fans probes out over a bounded worker pool
#[derive(Clone)]
pub struct VerificationEngine {
    config: CheckerConfig,
    prober: Arc<dyn Probe>,
    geo: Arc<dyn GeoResolver>,
}

impl VerificationEngine {
    pub fn new(config: CheckerConfig, prober: Arc<dyn Probe>, geo: Arc<dyn GeoResolver>) -> Self {
        Self {
            config,
            prober,
            geo,
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Verify a single endpoint, persisting it if it verifies
    ///
    /// The denylist is consulted before any network I/O.
    pub async fn verify_one(
        &self,
        endpoint: Endpoint,
        ranges: &RangeSet,
        relay: Option<&RelayChoice>,
        sink: &dyn ResultSink,
    ) -> Verification {
        if ranges.contains_ip(&endpoint.address) {
            return Ok((endpoint, ProbeOutcome::Denylisted));
        }

        let geo = self.geo.resolve(endpoint.address);
        debug!("Checking {} ({})", endpoint, geo);

        let outcome = self.prober.probe(&endpoint, relay).await;
        if let Some(result) = VerifiedResult::from_outcome(endpoint, geo, &outcome) {
            sink.append(&result)?;
            debug!("Added working proxy: {}", endpoint);
        }
        Ok((endpoint, outcome))
    }

    /// Lazily verify a batch, yielding outcomes in completion order
    ///
    /// Duplicate endpoints are verified once. At most `concurrency` probes
    /// are in flight; dropping the stream drops (and closes) them.
    pub fn run<'a>(
        &'a self,
        endpoints: Vec<Endpoint>,
        ranges: &'a RangeSet,
        relay: Option<&'a RelayChoice>,
        sink: &'a dyn ResultSink,
    ) -> impl Stream<Item = Verification> + 'a {
        stream::iter(unique(endpoints))
            .map(move |endpoint| self.verify_one(endpoint, ranges, relay, sink))
            .buffer_unordered(self.config.concurrency)
    }

    /// Drive a full pass to completion, or until `shutdown` resolves
    ///
    /// Progress is logged as `[index/total]`. The first sink failure aborts
    /// the pass, since the output could no longer be trusted.
    pub async fn verify_all<F>(
        &self,
        endpoints: Vec<Endpoint>,
        ranges: &RangeSet,
        relay: Option<&RelayChoice>,
        sink: &dyn ResultSink,
        shutdown: F,
    ) -> Result<BatchSummary, Error>
    where
        F: Future<Output = ()>,
    {
        let endpoints = unique(endpoints);
        let mut summary = BatchSummary {
            total: endpoints.len(),
            ..BatchSummary::default()
        };

        let results = self.run(endpoints, ranges, relay, sink).take_until(shutdown);
        futures::pin_mut!(results);

        while let Some(verification) = results.next().await {
            let (endpoint, outcome) = match verification {
                Ok(verified) => verified,
                Err(e) => {
                    error!("{}", e);
                    return Err(e);
                }
            };
            summary.record(endpoint, &outcome);
            info!(
                "[{}/{}] {} {}",
                summary.processed(),
                summary.total,
                endpoint,
                outcome
            );
        }

        summary.cancelled = summary.processed() < summary.total;
        Ok(summary)
    }
}

/// Drop repeated endpoints, keeping the first occurrence
pub fn unique(endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    let mut seen = HashSet::with_capacity(endpoints.len());
    endpoints.into_iter().filter(|e| seen.insert(*e)).collect()
}
