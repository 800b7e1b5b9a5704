//! GeoLite2 database fetcher
//!
//! Downloads whichever of the three GeoLite2 databases are missing from the
//! local GeoIP directory. This is one-time setup; verification itself only
//! ever reads the files.

use crate::error::Error;
use crate::proxy::geo::{ASN_DB, CITY_DB, COUNTRY_DB};
use reqwest::Client;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default timeout for database downloads in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:136.0) Gecko/20100101 Firefox/136.0";

/// Database file names and the URLs they are fetched from
pub const GEOIP_SOURCES: [(&str, &str); 3] = [
    (COUNTRY_DB, "https://git.io/GeoLite2-Country.mmdb"),
    (CITY_DB, "https://git.io/GeoLite2-City.mmdb"),
    (ASN_DB, "https://git.io/GeoLite2-ASN.mmdb"),
];

/// Configuration for the database fetcher
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Timeout for each download
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Outcome of fetching one database
#[derive(Debug)]
pub struct FetchResult {
    pub name: &'static str,
    pub path: PathBuf,
    /// `None` when the file was downloaded or already present
    pub error: Option<Error>,
    pub downloaded: bool,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Downloads missing GeoLite2 databases
pub struct GeoFetcher {
    client: Client,
}

impl GeoFetcher {
    pub fn new() -> Result<Self, Error> {
        Self::with_config(FetcherConfig::default())
    }

    pub fn with_config(config: FetcherConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|source| Error::Download {
                name: "client".to_string(),
                source,
            })?;
        Ok(Self { client })
    }

    /// File names among the three databases that are not present in `dir`
    pub fn missing(dir: &Path) -> Vec<&'static str> {
        GEOIP_SOURCES
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| !dir.join(name).exists())
            .collect()
    }

    /// Download every missing database into `dir`
    ///
    /// Failures are reported per database and never stop the others. Only
    /// an uncreatable `dir` fails the whole call.
    pub async fn fetch_missing(&self, dir: &Path) -> Result<Vec<FetchResult>, Error> {
        fs::create_dir_all(dir).map_err(|source| Error::OutputUnwritable {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut results = Vec::new();
        for (name, url) in GEOIP_SOURCES {
            let path = dir.join(name);
            if path.exists() {
                results.push(FetchResult {
                    name,
                    path,
                    error: None,
                    downloaded: false,
                });
                continue;
            }

            info!("Downloading {} from {}", name, url);
            let error = self.download(name, url, &path).await.err();
            match &error {
                Some(e) => warn!("{}", e),
                None => info!("Saved {} to {}", name, dir.display()),
            }
            results.push(FetchResult {
                name,
                path,
                downloaded: error.is_none(),
                error,
            });
        }
        Ok(results)
    }

    async fn download(&self, name: &str, url: &str, path: &Path) -> Result<(), Error> {
        let to_error = |source| Error::Download {
            name: name.to_string(),
            source,
        };
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(to_error)?
            .bytes()
            .await
            .map_err(to_error)?;

        // A partially written database is never visible under its final name.
        let partial = path.with_extension("mmdb.part");
        fs::write(&partial, &bytes)
            .and_then(|_| fs::rename(&partial, path))
            .map_err(|source| Error::OutputUnwritable {
                path: path.to_path_buf(),
                source,
            })
    }
}
