//! Proxy list loader
//!
//! Normalizes delimited proxy records into [`Endpoint`]s. Two row shapes
//! are accepted:
//! - `ip:port` in the first field (IPv6 as `[addr]:port`)
//! - `ip` and `port` in the first two fields
//!
//! A header row is tolerated. Malformed rows are skipped with a diagnostic.

use crate::error::Error;
use crate::proxy::checker::unique;
use crate::proxy::models::Endpoint;
use crate::Result;
use csv::{ReaderBuilder, StringRecord};
use std::fs::{self, File};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tracing::{debug, info, warn};

/// Proxy parser for loading endpoints from delimited files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single record into an endpoint
    pub fn parse_record(record: &StringRecord) -> Option<Endpoint> {
        let first = record.get(0)?.trim();
        if first.is_empty() || first.starts_with('#') {
            return None;
        }

        if let Ok(addr) = first.parse::<SocketAddr>() {
            return Some(Endpoint::from(addr));
        }
        if let Some((ip, port)) = first.rsplit_once(':') {
            if let Some(endpoint) = Self::parse_pair(ip, port) {
                return Some(endpoint);
            }
            // Bare IPv6 literals also contain ':'; fall through to two fields.
            first.parse::<IpAddr>().ok()?;
        }
        let port = record.get(1)?;
        Self::parse_pair(first, port)
    }

    fn parse_pair(ip: &str, port: &str) -> Option<Endpoint> {
        let address: IpAddr = ip.trim().parse().ok()?;
        let port: u16 = port.trim().parse().ok()?;
        Some(Endpoint::new(address, port))
    }

    /// Parse records from any reader
    ///
    /// The first row is treated as a header when it does not parse.
    pub fn parse_reader<R: Read>(reader: R, delimiter: u8) -> Vec<Endpoint> {
        let mut rdr = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut endpoints = Vec::new();
        for (index, record) in rdr.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    debug!("Unreadable row {}: {}", index + 1, e);
                    continue;
                }
            };
            match Self::parse_record(&record) {
                Some(endpoint) => {
                    debug!("Loaded proxy {}", endpoint);
                    endpoints.push(endpoint);
                }
                None if index == 0 => debug!("Header: {:?}", record),
                None if record.iter().all(str::is_empty) => debug!("Empty row {}", index + 1),
                None => debug!("Malformed row {}: {:?}", index + 1, record),
            }
        }
        endpoints
    }

    /// Parse endpoints from a file
    pub fn parse_file<P: AsRef<Path>>(path: P, delimiter: u8) -> std::result::Result<Vec<Endpoint>, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::InputUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let endpoints = Self::parse_reader(file, delimiter);
        debug!("Loaded {} proxies from {}", endpoints.len(), path.display());
        Ok(endpoints)
    }

    /// Parse every `*.csv` file of a folder, removing duplicates
    ///
    /// A missing folder yields no endpoints. Unreadable files are skipped.
    pub fn parse_folder<P: AsRef<Path>>(folder: P, delimiter: u8) -> Result<Vec<Endpoint>> {
        let folder = folder.as_ref();
        if !folder.exists() {
            warn!("Folder {} not found.", folder.display());
            return Ok(Vec::new());
        }

        let mut paths: Vec<_> = fs::read_dir(folder)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        paths.sort();

        let mut endpoints = Vec::new();
        for path in paths {
            match Self::parse_file(&path, delimiter) {
                Ok(found) => endpoints.extend(found),
                Err(e) => warn!("{}", e),
            }
        }
        let endpoints = unique(endpoints);
        info!("Loaded {} proxies from {} folder", endpoints.len(), folder.display());
        Ok(endpoints)
    }

    /// Render endpoints one `address:port` per line
    pub fn to_lines(endpoints: &[Endpoint]) -> String {
        endpoints
            .iter()
            .map(Endpoint::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Vec<Endpoint> {
        ProxyParser::parse_reader(content.as_bytes(), b';')
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::from(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn test_parse_colon_format() {
        let proxies = parse("IP:Port\n192.168.1.1:1080\n10.0.0.2:9050\n");
        assert_eq!(proxies, vec![ep("192.168.1.1:1080"), ep("10.0.0.2:9050")]);
    }

    #[test]
    fn test_parse_two_field_format() {
        let proxies = parse("IP;Port\n192.168.1.1;1080\n\"10.0.0.2\";\"9050\"\n");
        assert_eq!(proxies, vec![ep("192.168.1.1:1080"), ep("10.0.0.2:9050")]);
    }

    #[test]
    fn test_parse_comma_delimited() {
        let proxies = ProxyParser::parse_reader("\"203.0.113.5\",\"1080\"\n".as_bytes(), b',');
        assert_eq!(proxies, vec![ep("203.0.113.5:1080")]);
    }

    #[test]
    fn test_headerless_first_row_is_kept() {
        let proxies = parse("192.168.1.1:1080\n");
        assert_eq!(proxies.len(), 1);
    }

    #[test]
    fn test_parse_ipv6() {
        let proxies = parse("[2001:db8::1]:1080\n2001:db8::2;9050\n");
        assert_eq!(proxies, vec![ep("[2001:db8::1]:1080"), ep("[2001:db8::2]:9050")]);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let content = "header\nnot-an-ip:abc\n192.168.1.1:99999\n192.168.1.1\n\n300.1.1.1;80\n192.168.1.9:8080\n";
        assert_eq!(parse(content), vec![ep("192.168.1.9:8080")]);
    }

    #[test]
    fn test_comment_rows_are_skipped() {
        assert!(parse("# proxies\n#10.0.0.1:1080\n").is_empty());
    }

    #[test]
    fn test_parse_file_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProxyParser::parse_file(dir.path().join("nope.csv"), b';').unwrap_err();
        assert!(matches!(err, Error::InputUnreadable { .. }));
    }

    #[test]
    fn test_parse_folder() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "IP:Port\n10.0.0.1:1080\n10.0.0.2:1080\n").unwrap();
        fs::write(dir.path().join("b.csv"), "IP;Port\n10.0.0.2;1080\n10.0.0.3;1080\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "10.0.0.9:1080\n").unwrap();

        let proxies = ProxyParser::parse_folder(dir.path(), b';').unwrap();
        assert_eq!(
            proxies,
            vec![ep("10.0.0.1:1080"), ep("10.0.0.2:1080"), ep("10.0.0.3:1080")]
        );
    }

    #[test]
    fn test_parse_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let proxies = ProxyParser::parse_folder(dir.path().join("socks5"), b';').unwrap();
        assert!(proxies.is_empty());
    }

    #[test]
    fn test_to_lines() {
        let lines = ProxyParser::to_lines(&[ep("10.0.0.1:1080"), ep("[::1]:9050")]);
        assert_eq!(lines, "10.0.0.1:1080\n[::1]:9050");
    }
}
