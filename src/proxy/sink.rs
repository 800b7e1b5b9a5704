//! Durable destinations for verification results

use crate::error::Error;
use crate::proxy::models::{Endpoint, VerifiedResult};
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Column headers of the result file
pub const RESULT_HEADERS: [&str; 9] = [
    "IP",
    "Port",
    "CountryCode",
    "Hostname",
    "Speed_ms",
    "Anonymity",
    "Timestamp",
    "ASN",
    "City",
];

/// Append-only destination for verified results
///
/// Implementations must accept concurrent calls and write each result as a
/// single, non-interleaved unit.
pub trait ResultSink: Send + Sync {
    fn append(&self, result: &VerifiedResult) -> Result<(), Error>;
}

/// One result file row, in column order
#[derive(Serialize)]
struct ResultRow {
    ip: String,
    port: u16,
    country: String,
    hostname: String,
    speed: String,
    anonymity: String,
    timestamp: String,
    asn: String,
    city: String,
}

impl From<&VerifiedResult> for ResultRow {
    fn from(r: &VerifiedResult) -> Self {
        Self {
            ip: r.endpoint.address.to_string(),
            port: r.endpoint.port,
            country: r.geo.country.to_string(),
            hostname: r.hostname.clone(),
            speed: r.speed(),
            anonymity: r.anonymity.to_string(),
            timestamp: r.formatted_timestamp(),
            asn: r.geo.asn.to_string(),
            city: r.geo.city.to_string(),
        }
    }
}

/// Delimited result file, flushed after every row
pub struct CsvResultSink {
    path: PathBuf,
    writer: Mutex<Writer<File>>,
}

impl CsvResultSink {
    /// Open `path` for appending
    ///
    /// The header row is written only when the file is new or empty. Failure
    /// to create the file is reported immediately.
    pub fn open<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let unwritable = |source: io::Error| Error::OutputUnwritable {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unwritable)?;
        let fresh = file.metadata().map_err(unwritable)?.len() == 0;

        let mut writer = WriterBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .from_writer(file);
        if fresh {
            writer.write_record(RESULT_HEADERS)?;
            writer.flush().map_err(unwritable)?;
        }

        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for CsvResultSink {
    fn append(&self, result: &VerifiedResult) -> Result<(), Error> {
        let mut writer = self.writer.lock().map_err(|_| Error::SinkPoisoned)?;
        writer.serialize(ResultRow::from(result))?;
        writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

/// In-memory sink, handy for embedding and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<VerifiedResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_rows(self) -> Vec<VerifiedResult> {
        self.rows.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl ResultSink for MemorySink {
    fn append(&self, result: &VerifiedResult) -> Result<(), Error> {
        self.rows
            .lock()
            .map_err(|_| Error::SinkPoisoned)?
            .push(result.clone());
        Ok(())
    }
}

/// Write the `address:port` of every denylisted endpoint, one per line
///
/// Nothing is written when the list is empty.
pub fn write_denylisted_log<P: AsRef<Path>>(path: P, endpoints: &[Endpoint]) -> Result<(), Error> {
    let path = path.as_ref();
    if endpoints.is_empty() {
        return Ok(());
    }

    let mut content = String::new();
    for endpoint in endpoints {
        content.push_str(&endpoint.to_string());
        content.push('\n');
    }
    fs::write(path, content).map_err(|source| Error::OutputUnwritable {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Saved {} denylisted proxies to {}", endpoints.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::geo::{GeoField, GeoInfo};
    use crate::proxy::models::Anonymity;
    use chrono::Local;
    use std::sync::Arc;

    fn result(last: u8) -> VerifiedResult {
        VerifiedResult {
            endpoint: Endpoint::new(format!("198.51.100.{}", last).parse().unwrap(), 1080),
            geo: GeoInfo {
                country: GeoField::Resolved("FR".to_string()),
                city: GeoField::Unknown,
                asn: GeoField::Resolved("16276".to_string()),
            },
            hostname: "Unknown".to_string(),
            latency_ms: 87,
            anonymity: Anonymity::Low,
            timestamp: Local::now(),
        }
    }

    fn data_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_new_file_gets_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.csv");

        let sink = CsvResultSink::open(&path, b';').unwrap();
        sink.append(&result(9)).unwrap();

        let lines = data_lines(&path);
        assert_eq!(lines[0], "IP;Port;CountryCode;Hostname;Speed_ms;Anonymity;Timestamp;ASN;City");
        assert!(lines[1].starts_with("198.51.100.9;1080;FR;Unknown;87ms;Low;"));
        assert!(lines[1].ends_with(";16276;Unknown"));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_existing_file_is_appended_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.csv");

        CsvResultSink::open(&path, b';').unwrap().append(&result(1)).unwrap();
        CsvResultSink::open(&path, b';').unwrap().append(&result(2)).unwrap();

        let lines = data_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.iter().filter(|l| l.starts_with("IP;")).count(), 1);
    }

    #[test]
    fn test_unwritable_output_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("result.csv");

        let err = CsvResultSink::open(&path, b';').err().unwrap();
        assert!(matches!(err, Error::OutputUnwritable { .. }));
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.csv");
        let sink = Arc::new(CsvResultSink::open(&path, b';').unwrap());

        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..25u8 {
                        sink.append(&result(t * 25 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = data_lines(&path);
        assert_eq!(lines.len(), 201);
        for line in &lines[1..] {
            assert_eq!(line.split(';').count(), RESULT_HEADERS.len());
        }
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.append(&result(3)).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.into_rows()[0].latency_ms, 87);
    }

    #[test]
    fn test_denylisted_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("denylisted.log");
        let endpoints = vec![
            Endpoint::new("203.0.113.5".parse().unwrap(), 1080),
            Endpoint::new("203.0.113.6".parse().unwrap(), 9050),
        ];

        write_denylisted_log(&path, &endpoints).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "203.0.113.5:1080\n203.0.113.6:9050\n"
        );
    }

    #[test]
    fn test_empty_denylisted_log_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("denylisted.log");
        write_denylisted_log(&path, &[]).unwrap();
        assert!(!path.exists());
    }
}
