//! Denylist of IP network ranges
//!
//! Entries are CIDR blocks (`203.0.113.0/24`), bare addresses, or the loose
//! wildcard form found in shared denylists (`10.20.0/255.0/255`). Any entry
//! containing a `0/255` segment is collapsed to the /16 spanning its first two
//! octets. This is an approximation: wildcard octets in other positions are
//! not honoured.

use crate::error::Error;
use csv::ReaderBuilder;
use ipnet::{IpNet, Ipv4Net};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::{debug, info, warn};

/// Leading two octets of a wildcard range entry
static WILDCARD_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3})\.(\d{1,3})\.").expect("Invalid wildcard prefix regex")
});

const WILDCARD_SEGMENT: &str = "0/255";

/// An entry that could not be turned into a network range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDiagnostic {
    pub entry: String,
    pub reason: String,
}

/// Compiled, read-only set of denylisted network ranges
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    ranges: Vec<IpNet>,
    diagnostics: Vec<RangeDiagnostic>,
}

impl RangeSet {
    /// Compile raw entries, skipping (and recording) the malformed ones
    pub fn build<I, S>(raw_entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = RangeSet::default();
        for raw in raw_entries {
            let entry = raw.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match parse_range(entry) {
                Ok(net) => {
                    debug!("Added network: {}", net);
                    set.ranges.push(net);
                }
                Err(reason) => {
                    debug!("Invalid denylist entry {}: {}", entry, reason);
                    set.diagnostics.push(RangeDiagnostic {
                        entry: entry.to_string(),
                        reason,
                    });
                }
            }
        }
        set
    }

    /// Load a delimited denylist file, taking the first field of each row
    ///
    /// A missing file yields an empty set. A file that exists but cannot be
    /// read is a fatal setup error. A header row is skipped when it does not
    /// parse as a range.
    pub fn from_file<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self, Error> {
        let path = path.as_ref();
        let unreadable = |source: io::Error| Error::DenylistUnreadable {
            path: path.to_path_buf(),
            source,
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No denylist at {}, nothing excluded", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(unreadable(e)),
        };

        let set = Self::from_reader(file, delimiter).map_err(|e| match e.into_kind() {
            csv::ErrorKind::Io(io) => unreadable(io),
            other => unreadable(io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", other))),
        })?;

        for diag in &set.diagnostics {
            warn!("Skipped denylist entry {:?}: {}", diag.entry, diag.reason);
        }
        info!("Loaded {} denylist networks from {}", set.len(), path.display());
        Ok(set)
    }

    /// Parse delimited records from any reader
    ///
    /// Only I/O failures are returned. Rows that cannot be decoded are
    /// skipped and recorded as diagnostics, like malformed ranges.
    pub fn from_reader<R: Read>(reader: R, delimiter: u8) -> Result<Self, csv::Error> {
        let mut rdr = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut entries = Vec::new();
        let mut skipped = Vec::new();
        for (index, record) in rdr.byte_records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) if e.is_io_error() => return Err(e),
                Err(e) => {
                    debug!("Unreadable denylist row {}: {}", index + 1, e);
                    skipped.push(RangeDiagnostic {
                        entry: format!("row {}", index + 1),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let Some(field) = record.get(0) else {
                continue;
            };
            // Only the range column is decoded; comments may be in any encoding.
            let first = match std::str::from_utf8(field) {
                Ok(first) => first,
                Err(e) => {
                    debug!("Non UTF-8 denylist entry on row {}: {}", index + 1, e);
                    skipped.push(RangeDiagnostic {
                        entry: String::from_utf8_lossy(field).into_owned(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if index == 0 && parse_range(first).is_err() {
                debug!("Skipping denylist header: {:?}", first);
                continue;
            }
            entries.push(first.to_string());
        }

        let mut set = Self::build(entries);
        set.diagnostics.extend(skipped);
        Ok(set)
    }

    /// Test whether an address literal falls within any range
    ///
    /// Malformed addresses are never contained.
    pub fn contains(&self, address: &str) -> bool {
        match address.trim().parse::<IpAddr>() {
            Ok(ip) => self.contains_ip(&ip),
            Err(_) => {
                debug!("Invalid IP format for denylist check: {}", address);
                false
            }
        }
    }

    pub fn contains_ip(&self, ip: &IpAddr) -> bool {
        match self.ranges.iter().find(|net| net.contains(ip)) {
            Some(net) => {
                debug!("{} is in denylisted range {}", ip, net);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[IpNet] {
        &self.ranges
    }

    /// Entries skipped while building
    pub fn diagnostics(&self) -> &[RangeDiagnostic] {
        &self.diagnostics
    }
}

fn parse_range(entry: &str) -> Result<IpNet, String> {
    if entry.contains(WILDCARD_SEGMENT) {
        return parse_wildcard(entry);
    }
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    let ip = entry.parse::<IpAddr>().map_err(|e| e.to_string())?;
    let host_prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, host_prefix).map_err(|e| e.to_string())
}

fn parse_wildcard(entry: &str) -> Result<IpNet, String> {
    let caps = WILDCARD_PREFIX
        .captures(entry)
        .ok_or_else(|| format!("wildcard entry without two leading octets: {}", entry))?;
    let octet = |i: usize| {
        caps[i]
            .parse::<u8>()
            .map_err(|_| format!("octet out of range: {}", &caps[i]))
    };
    let addr = Ipv4Addr::new(octet(1)?, octet(2)?, 0, 0);
    Ipv4Net::new(addr, 16)
        .map(IpNet::V4)
        .map_err(|e| e.to_string())
}
