//! Socks Sentinel - SOCKS5 proxy verifier
//!
//! Verifies a batch of SOCKS5 proxy endpoints concurrently: denylisted
//! ranges are skipped before any network I/O, reachable endpoints are timed,
//! classified and enriched with GeoIP data, and each verified result is
//! appended to the output as soon as it is known. An upstream relay can be
//! selected first so every probe is chained through it.

pub mod error;
pub mod logging;
pub mod proxy;

pub use error::Error;
pub use proxy::*;

use std::path::PathBuf;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Folder scanned for `*.csv` proxy lists when no single input is given
pub const DEFAULT_INPUT_FOLDER: &str = "socks5";

/// Folder holding the GeoLite2 databases
pub const DEFAULT_GEOIP_DIR: &str = "inc";

/// Denylist file consulted when present
pub const DEFAULT_DENYLIST: &str = "denylist.csv";

/// Run-level paths and formats
#[derive(Debug, Clone)]
pub struct Config {
    /// Folder of proxy lists
    pub input_folder: PathBuf,
    /// Folder of GeoLite2 databases
    pub geoip_dir: PathBuf,
    /// Denylist file
    pub denylist_path: PathBuf,
    /// Where result and denylisted files are created
    pub output_dir: PathBuf,
    /// Field delimiter of every delimited file read or written
    pub delimiter: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_folder: PathBuf::from(DEFAULT_INPUT_FOLDER),
            geoip_dir: PathBuf::from(DEFAULT_GEOIP_DIR),
            denylist_path: PathBuf::from(DEFAULT_DENYLIST),
            output_dir: PathBuf::from("."),
            delimiter: b';',
        }
    }
}

impl Config {
    /// Fresh, timestamp-named result file
    pub fn result_path(&self) -> PathBuf {
        logging::timestamped_path(&self.output_dir, "result", "csv")
    }

    /// Fresh, timestamp-named denylisted log
    pub fn denylisted_path(&self) -> PathBuf {
        logging::timestamped_path(&self.output_dir, "denylisted", "log")
    }

    /// Fresh, timestamp-named verbose log
    pub fn scan_log_path(&self) -> PathBuf {
        logging::timestamped_path(&self.output_dir, "scan", "log")
    }
}
