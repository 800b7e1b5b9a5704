//! Geolocation module for enriching endpoints with country, city and ASN
//! data from MaxMind GeoLite2 databases.
//!
//! Each of the three lookups may fail on its own (missing database, address
//! not present). A failed lookup only degrades its own field to
//! [`GeoField::Unknown`]; resolution never fails as a whole.

use crate::Result;
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// File name of the country database
pub const COUNTRY_DB: &str = "GeoLite2-Country.mmdb";
/// File name of the city database
pub const CITY_DB: &str = "GeoLite2-City.mmdb";
/// File name of the ASN database
pub const ASN_DB: &str = "GeoLite2-ASN.mmdb";

/// A single geolocation attribute that may not be resolvable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GeoField {
    Resolved(String),
    #[default]
    Unknown,
}

impl GeoField {
    pub fn as_deref(&self) -> Option<&str> {
        match self {
            GeoField::Resolved(value) => Some(value),
            GeoField::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, GeoField::Resolved(_))
    }
}

impl From<Option<String>> for GeoField {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(v) if !v.is_empty() => GeoField::Resolved(v),
            _ => GeoField::Unknown,
        }
    }
}

impl fmt::Display for GeoField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoField::Resolved(value) => write!(f, "{}", value),
            GeoField::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Geographic and network information for an IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoInfo {
    /// ISO 3166-1 alpha-2 country code (e.g., "US", "FR")
    pub country: GeoField,
    /// City name in English
    pub city: GeoField,
    /// Autonomous system number
    pub asn: GeoField,
}

impl GeoInfo {
    /// Check whether the country code matches, ignoring ASCII case
    pub fn in_country(&self, code: &str) -> bool {
        self.country
            .as_deref()
            .is_some_and(|cc| cc.eq_ignore_ascii_case(code))
    }
}

impl fmt::Display for GeoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, ASN {}", self.country, self.city, self.asn)
    }
}

/// Best-effort lookup of [`GeoInfo`] for an address
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, address: IpAddr) -> GeoInfo;
}

/// Resolver that knows nothing; every field is `Unknown`
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeo;

impl GeoResolver for NoGeo {
    fn resolve(&self, _address: IpAddr) -> GeoInfo {
        GeoInfo::default()
    }
}

type SharedReader = Arc<Reader<Vec<u8>>>;

/// GeoResolver backed by the three GeoLite2 databases
///
/// Readers are opened once and shared read-only between workers.
#[derive(Clone, Default)]
pub struct GeoLocator {
    country: Option<SharedReader>,
    city: Option<SharedReader>,
    asn: Option<SharedReader>,
}

impl GeoLocator {
    /// Open whichever of the three databases exist under `dir`
    ///
    /// Missing or corrupt databases are logged and left out; the matching
    /// field then always resolves to `Unknown`.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            country: open_optional(&dir.join(COUNTRY_DB)),
            city: open_optional(&dir.join(CITY_DB)),
            asn: open_optional(&dir.join(ASN_DB)),
        }
    }

    /// Number of databases that were successfully opened
    pub fn loaded(&self) -> usize {
        [&self.country, &self.city, &self.asn]
            .iter()
            .filter(|r| r.is_some())
            .count()
    }

    fn lookup_country(reader: &Reader<Vec<u8>>, ip: IpAddr) -> Result<Option<String>> {
        let record: Option<geoip2::Country> = reader.lookup(ip)?.decode()?;
        Ok(record.and_then(|r| r.country.iso_code.map(String::from)))
    }

    fn lookup_city(reader: &Reader<Vec<u8>>, ip: IpAddr) -> Result<Option<String>> {
        let record: Option<geoip2::City> = reader.lookup(ip)?.decode()?;
        Ok(record.and_then(|r| r.city.names.english.map(String::from)))
    }

    fn lookup_asn(reader: &Reader<Vec<u8>>, ip: IpAddr) -> Result<Option<String>> {
        let record: Option<geoip2::Asn> = reader.lookup(ip)?.decode()?;
        Ok(record.and_then(|r| r.autonomous_system_number.map(|n| n.to_string())))
    }
}

impl GeoResolver for GeoLocator {
    fn resolve(&self, address: IpAddr) -> GeoInfo {
        let info = GeoInfo {
            country: field("country", address, self.country.as_deref(), Self::lookup_country),
            city: field("city", address, self.city.as_deref(), Self::lookup_city),
            asn: field("ASN", address, self.asn.as_deref(), Self::lookup_asn),
        };
        debug!(%address, %info, "geoip");
        info
    }
}

fn field(
    kind: &str,
    address: IpAddr,
    reader: Option<&Reader<Vec<u8>>>,
    lookup: fn(&Reader<Vec<u8>>, IpAddr) -> Result<Option<String>>,
) -> GeoField {
    let Some(reader) = reader else {
        return GeoField::Unknown;
    };
    match lookup(reader, address) {
        Ok(value) => GeoField::from(value),
        Err(e) => {
            debug!("{} lookup failed for {}: {}", kind, address, e);
            GeoField::Unknown
        }
    }
}

fn open_optional(path: &Path) -> Option<SharedReader> {
    if !path.exists() {
        warn!("GeoIP database {} not found, field will be Unknown", path.display());
        return None;
    }
    match Reader::open_readfile(path) {
        Ok(reader) => Some(Arc::new(reader)),
        Err(e) => {
            warn!("cannot open GeoIP database {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_field_display() {
        assert_eq!(GeoField::Unknown.to_string(), "Unknown");
        assert_eq!(GeoField::Resolved("US".to_string()).to_string(), "US");
    }

    #[test]
    fn test_geo_field_from_option() {
        assert_eq!(GeoField::from(None), GeoField::Unknown);
        assert_eq!(GeoField::from(Some(String::new())), GeoField::Unknown);
        assert_eq!(
            GeoField::from(Some("Paris".to_string())),
            GeoField::Resolved("Paris".to_string())
        );
    }

    #[test]
    fn test_geo_info_in_country() {
        let info = GeoInfo {
            country: GeoField::Resolved("FR".to_string()),
            ..GeoInfo::default()
        };
        assert!(info.in_country("FR"));
        assert!(info.in_country("fr"));
        assert!(!info.in_country("US"));
        assert!(!GeoInfo::default().in_country("FR"));
    }

    #[test]
    fn test_geo_info_display() {
        let info = GeoInfo {
            country: GeoField::Resolved("US".to_string()),
            city: GeoField::Unknown,
            asn: GeoField::Resolved("15169".to_string()),
        };
        assert_eq!(info.to_string(), "US, Unknown, ASN 15169");
    }

    #[test]
    fn test_missing_databases_degrade_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let locator = GeoLocator::from_dir(dir.path());
        assert_eq!(locator.loaded(), 0);

        let info = locator.resolve("8.8.8.8".parse().unwrap());
        assert_eq!(info, GeoInfo::default());
    }

    #[test]
    fn test_corrupt_database_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(COUNTRY_DB), b"not a maxmind database").unwrap();

        let locator = GeoLocator::from_dir(dir.path());
        assert_eq!(locator.loaded(), 0);
        assert!(!locator.resolve("1.1.1.1".parse().unwrap()).country.is_known());
    }
}
