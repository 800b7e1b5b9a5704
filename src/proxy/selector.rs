//! Upstream relay selection ("stealth mode" and speed-constrained chaining)

use crate::error::Error;
use crate::proxy::checker::{unique, CheckerConfig};
use crate::proxy::denylist::RangeSet;
use crate::proxy::geo::{GeoInfo, GeoResolver};
use crate::proxy::models::{Endpoint, RelayChoice};
use crate::proxy::prober::Probe;
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;
use tracing::{debug, info};

/// Requirements a relay must satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionConstraints {
    /// ISO country code, compared case-insensitively
    pub country: Option<String>,
    /// Maximum measured connect latency
    pub max_speed_ms: Option<u64>,
}

impl SelectionConstraints {
    pub fn country(code: impl Into<String>) -> Self {
        Self {
            country: Some(code.into()),
            max_speed_ms: None,
        }
    }

    pub fn with_max_speed(mut self, max_speed_ms: u64) -> Self {
        self.max_speed_ms = Some(max_speed_ms);
        self
    }

    /// No constraint means no relay is wanted
    pub fn is_unconstrained(&self) -> bool {
        self.country.is_none() && self.max_speed_ms.is_none()
    }

    fn matches_country(&self, geo: &GeoInfo) -> bool {
        self.country.as_deref().map_or(true, |cc| geo.in_country(cc))
    }

    fn matches_speed(&self, speed_ms: Option<u64>) -> bool {
        match (self.max_speed_ms, speed_ms) {
            (None, _) => true,
            (Some(max), Some(speed)) => speed <= max,
            (Some(_), None) => false,
        }
    }

    pub fn matches(&self, candidate: &RelayCandidate) -> bool {
        self.matches_country(&candidate.geo) && self.matches_speed(candidate.speed_ms)
    }
}

impl fmt::Display for SelectionConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.country, self.max_speed_ms) {
            (Some(cc), Some(ms)) => write!(f, "country {} with speed <= {}ms", cc, ms),
            (Some(cc), None) => write!(f, "country {}", cc),
            (None, Some(ms)) => write!(f, "speed <= {}ms", ms),
            (None, None) => write!(f, "no constraints"),
        }
    }
}

/// A proxy considered for the relay role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCandidate {
    pub endpoint: Endpoint,
    pub geo: GeoInfo,
    /// Measured connect latency, if it was probed and reachable
    pub speed_ms: Option<u64>,
}

impl RelayCandidate {
    pub fn new(endpoint: Endpoint, geo: GeoInfo) -> Self {
        Self {
            endpoint,
            geo,
            speed_ms: None,
        }
    }

    pub fn with_speed(mut self, speed_ms: u64) -> Self {
        self.speed_ms = Some(speed_ms);
        self
    }
}

/// Picks the relay every probe of a run tunnels through
pub struct ChainSelector;

impl ChainSelector {
    /// Choose uniformly at random among candidates satisfying `constraints`
    ///
    /// Unconstrained selection means "no relay" and returns `Ok(None)`.
    /// Otherwise an empty match set is an error; there is no fallback to an
    /// arbitrary candidate.
    pub fn select<R: Rng + ?Sized>(
        candidates: &[RelayCandidate],
        constraints: &SelectionConstraints,
        rng: &mut R,
    ) -> Result<Option<RelayChoice>, Error> {
        if constraints.is_unconstrained() {
            return Ok(None);
        }
        if candidates.is_empty() {
            return Err(Error::EmptyRelayPool);
        }

        let matching: Vec<&RelayCandidate> =
            candidates.iter().filter(|c| constraints.matches(c)).collect();
        let chosen = matching
            .choose(rng)
            .ok_or_else(|| Error::NoRelayMatch(constraints.to_string()))?;

        info!(
            "Selected relay {} ({}) out of {} matching {}",
            chosen.endpoint,
            chosen.geo.country,
            matching.len(),
            constraints
        );
        Ok(Some(RelayChoice::new(chosen.endpoint)))
    }

    /// Gather relay candidates from `pool`
    ///
    /// Denylisted endpoints and, when a country is required, endpoints in
    /// other countries are dropped before any network I/O. When a speed bound
    /// is set, the rest are measured with a direct connect; unreachable ones
    /// are dropped. With `relay_sample` set, the speed survey stops as soon as
    /// that many matching candidates are known and in-flight connects are
    /// cancelled. A country-only survey keeps every match.
    pub async fn survey(
        pool: Vec<Endpoint>,
        ranges: &RangeSet,
        constraints: &SelectionConstraints,
        prober: &dyn Probe,
        geo: &dyn GeoResolver,
        config: &CheckerConfig,
    ) -> Vec<RelayCandidate> {
        let located: Vec<RelayCandidate> = unique(pool)
            .into_iter()
            .filter(|e| !ranges.contains_ip(&e.address))
            .map(|e| RelayCandidate::new(e, geo.resolve(e.address)))
            .filter(|c| constraints.matches_country(&c.geo))
            .collect();
        debug!("{} relay candidates after country filter", located.len());

        if constraints.max_speed_ms.is_none() {
            return located;
        }

        let limit = config.relay_sample.unwrap_or(usize::MAX);
        let measured = stream::iter(located)
            .map(move |candidate| async move {
                let speed = prober.measure(&candidate.endpoint).await;
                speed.map(|ms| candidate.with_speed(ms))
            })
            .buffer_unordered(config.concurrency)
            .filter_map(|c| async move { c })
            .filter(|c| {
                let keep = constraints.matches(c);
                async move { keep }
            })
            .take(limit)
            .collect::<Vec<_>>()
            .await;

        debug!("{} relay candidates within speed bound", measured.len());
        measured
    }
}
