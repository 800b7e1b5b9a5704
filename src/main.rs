use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use socks_sentinel::{
    logging,
    proxy::{
        sink::write_denylisted_log, ChainSelector, CheckerConfig, CsvResultSink,
        DnsReverseResolver, Endpoint, GeoFetcher, GeoLocator, GeoResolver, Probe, ProxyParser,
        RangeSet, RelayChoice, SelectionConstraints, Socks5Prober, VerificationEngine,
    },
    Config, Error, DEFAULT_DENYLIST, DEFAULT_GEOIP_DIR, DEFAULT_INPUT_FOLDER,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Check SOCKS5 proxies from CSV files
#[derive(Parser)]
#[command(name = "socks-sentinel")]
#[command(about = "Check SOCKS5 proxies from CSV files, with denylist, GeoIP and relay chaining")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output, also written to a scan_<timestamp>.log file
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Probe directly, or through a speed-selected relay when --speed and --cc are set
    Normal,
    /// Probe through a random relay located in --cc
    Stealth,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify proxies and append working ones to a timestamped result file
    Check {
        /// Single input CSV file (overrides --folder)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Folder whose *.csv files are loaded
        #[arg(long, default_value = DEFAULT_INPUT_FOLDER)]
        folder: PathBuf,
        /// Relay selection mode
        #[arg(long, value_enum, default_value_t = Mode::Normal)]
        mode: Mode,
        /// Country code the relay must be located in
        #[arg(long)]
        cc: Option<String>,
        /// Max relay speed in ms for proxy-behind-proxy
        #[arg(long)]
        speed: Option<u64>,
        /// CSV file of relay candidates (defaults to the input proxies)
        #[arg(long)]
        relay_pool: Option<PathBuf>,
        /// Stop the relay speed survey after this many matches
        #[arg(long)]
        relay_sample: Option<usize>,
        /// Log denylisted proxies to a denylisted_<timestamp>.log file
        #[arg(long)]
        log_denylisted: bool,
        /// Number of concurrent probes
        #[arg(short = 'n', long, default_value = "10")]
        threads: usize,
        /// Connect timeout in seconds
        #[arg(long, default_value = "5")]
        timeout: u64,
        /// Require a SOCKS5 greeting reply, not just an open port
        #[arg(long)]
        handshake: bool,
        /// Do not download missing GeoIP databases
        #[arg(long)]
        offline: bool,
        /// Denylist CSV file
        #[arg(long, default_value = DEFAULT_DENYLIST)]
        denylist: PathBuf,
        /// Folder of GeoLite2 databases
        #[arg(long, default_value = DEFAULT_GEOIP_DIR)]
        geoip_dir: PathBuf,
        /// Folder receiving result and log files
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Download missing GeoLite2 databases
    Fetch {
        /// Folder of GeoLite2 databases
        #[arg(long, default_value = DEFAULT_GEOIP_DIR)]
        geoip_dir: PathBuf,
    },
    /// Parse a proxy list and print the normalized endpoints
    Parse {
        /// Input CSV file
        input: PathBuf,
        /// Output file for normalized endpoints
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            input,
            folder,
            mode,
            cc,
            speed,
            relay_pool,
            relay_sample,
            log_denylisted,
            threads,
            timeout,
            handshake,
            offline,
            denylist,
            geoip_dir,
            output_dir,
        } => {
            let config = Config {
                input_folder: folder,
                geoip_dir,
                denylist_path: denylist,
                output_dir,
                ..Config::default()
            };
            let log_file = cli.verbose.then(|| config.scan_log_path());
            logging::init(cli.verbose, log_file.as_deref())?;
            if let Some(path) = &log_file {
                println!("Logging verbose output to {}", path.display());
            }

            let mut checker_config = CheckerConfig::new()
                .with_concurrency(threads)
                .with_timeout(Duration::from_secs(timeout))
                .with_handshake(handshake);
            if let Some(sample) = relay_sample {
                checker_config = checker_config.with_relay_sample(sample);
            }

            let constraints = relay_constraints(mode, cc, speed)?;
            run_check(
                &config,
                checker_config,
                input,
                relay_pool,
                constraints,
                log_denylisted,
                offline,
            )
            .await?;
        }
        Commands::Fetch { geoip_dir } => {
            logging::init(cli.verbose, None)?;
            let results = GeoFetcher::new()?.fetch_missing(&geoip_dir).await?;
            let failed = results.iter().filter(|r| !r.is_success()).count();
            for result in &results {
                let status = match (&result.error, result.downloaded) {
                    (Some(e), _) => format!("failed: {}", e),
                    (None, true) => "downloaded".to_string(),
                    (None, false) => "present".to_string(),
                };
                println!("{} {}", result.path.display(), status);
            }
            if failed > 0 {
                bail!("{} GeoIP database(s) could not be downloaded", failed);
            }
        }
        Commands::Parse { input, output } => {
            logging::init(cli.verbose, None)?;
            let proxies = ProxyParser::parse_file(&input, Config::default().delimiter)?;
            println!("Parsed {} proxies from {:?}", proxies.len(), input);

            let lines = ProxyParser::to_lines(&proxies);
            match output {
                Some(output_path) => {
                    std::fs::write(&output_path, lines)
                        .with_context(|| format!("writing {}", output_path.display()))?;
                    println!("Saved parsed proxies to {:?}", output_path);
                }
                None => println!("{}", lines),
            }
        }
    }

    Ok(())
}

/// Translate the mode flags into relay constraints
fn relay_constraints(
    mode: Mode,
    cc: Option<String>,
    speed: Option<u64>,
) -> Result<SelectionConstraints, Error> {
    let cc = cc.map(|c| c.to_ascii_uppercase());
    match (mode, cc, speed) {
        (Mode::Stealth, None, _) => Err(Error::InvalidMode(
            "stealth mode requires --cc".to_string(),
        )),
        (Mode::Stealth, Some(cc), speed) => Ok(SelectionConstraints {
            country: Some(cc),
            max_speed_ms: speed,
        }),
        (Mode::Normal, Some(cc), Some(speed)) => {
            Ok(SelectionConstraints::country(cc).with_max_speed(speed))
        }
        (Mode::Normal, None, Some(_)) => Err(Error::InvalidMode(
            "--speed requires --cc".to_string(),
        )),
        (Mode::Normal, Some(cc), None) => {
            warn!("--cc {} ignored: normal mode needs --speed to select a relay", cc);
            Ok(SelectionConstraints::default())
        }
        (Mode::Normal, None, None) => Ok(SelectionConstraints::default()),
    }
}

async fn run_check(
    config: &Config,
    checker_config: CheckerConfig,
    input: Option<PathBuf>,
    relay_pool: Option<PathBuf>,
    constraints: SelectionConstraints,
    log_denylisted: bool,
    offline: bool,
) -> Result<()> {
    if !offline && !GeoFetcher::missing(&config.geoip_dir).is_empty() {
        match GeoFetcher::new() {
            Ok(fetcher) => {
                if let Err(e) = fetcher.fetch_missing(&config.geoip_dir).await {
                    warn!("{}", e);
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    let ranges = RangeSet::from_file(&config.denylist_path, config.delimiter)?;
    let proxies = load_proxies(config, input.as_deref())?;
    if proxies.is_empty() {
        println!("No proxies to check.");
        return Ok(());
    }

    let result_path = config.result_path();
    let sink = CsvResultSink::open(&result_path, config.delimiter)?;

    let geo: Arc<dyn GeoResolver> = Arc::new(GeoLocator::from_dir(&config.geoip_dir));
    let resolver = Arc::new(DnsReverseResolver::from_system_conf(
        checker_config.reverse_dns_timeout,
    ));
    let prober: Arc<dyn Probe> = Arc::new(Socks5Prober::new(&checker_config, resolver));

    let relay = select_relay(
        config,
        &checker_config,
        &proxies,
        relay_pool.as_deref(),
        &constraints,
        &ranges,
        prober.as_ref(),
        geo.as_ref(),
    )
    .await?;

    let engine = VerificationEngine::new(checker_config, prober, geo);

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
        warn!("Interrupted, stopping outstanding probes");
    };
    let summary = engine
        .verify_all(proxies, &ranges, relay.as_ref(), &sink, shutdown)
        .await?;

    if log_denylisted {
        write_denylisted_log(config.denylisted_path(), &summary.denylisted)?;
    }

    println!(
        "Results: {} verified, {} unreachable, {} invalid, {} denylisted",
        summary.verified,
        summary.unreachable,
        summary.invalid,
        summary.denylisted.len()
    );
    if summary.cancelled {
        println!("Stopped after {} of {} proxies.", summary.processed(), summary.total);
    }
    println!("Results saved incrementally to {}", result_path.display());
    Ok(())
}

fn load_proxies(config: &Config, input: Option<&Path>) -> Result<Vec<Endpoint>> {
    match input {
        Some(path) => {
            let proxies = ProxyParser::parse_file(path, config.delimiter)?;
            info!("Loaded {} proxies from {}", proxies.len(), path.display());
            Ok(proxies)
        }
        None => ProxyParser::parse_folder(&config.input_folder, config.delimiter),
    }
}

#[allow(clippy::too_many_arguments)]
async fn select_relay(
    config: &Config,
    checker_config: &CheckerConfig,
    proxies: &[Endpoint],
    relay_pool: Option<&Path>,
    constraints: &SelectionConstraints,
    ranges: &RangeSet,
    prober: &dyn Probe,
    geo: &dyn GeoResolver,
) -> Result<Option<RelayChoice>> {
    if constraints.is_unconstrained() {
        return Ok(None);
    }

    let pool = match relay_pool {
        Some(path) => ProxyParser::parse_file(path, config.delimiter)?,
        None => proxies.to_vec(),
    };
    if pool.is_empty() {
        return Err(Error::EmptyRelayPool.into());
    }
    info!("Surveying {} relay candidates for {}", pool.len(), constraints);

    let candidates =
        ChainSelector::survey(pool, ranges, constraints, prober, geo, checker_config).await;
    if candidates.is_empty() {
        return Err(Error::NoRelayMatch(constraints.to_string()).into());
    }
    let relay = ChainSelector::select(&candidates, constraints, &mut rand::thread_rng())?;
    if let Some(relay) = &relay {
        println!("Using relay {} ({})", relay, constraints);
    }
    Ok(relay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stealth_requires_country() {
        let err = relay_constraints(Mode::Stealth, None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidMode(_)));
    }

    #[test]
    fn test_stealth_country_is_uppercased() {
        let constraints = relay_constraints(Mode::Stealth, Some("fr".to_string()), None).unwrap();
        assert_eq!(constraints, SelectionConstraints::country("FR"));
    }

    #[test]
    fn test_speed_mode_needs_both_flags() {
        let constraints = relay_constraints(Mode::Normal, Some("US".to_string()), Some(150)).unwrap();
        assert_eq!(constraints.max_speed_ms, Some(150));
        assert!(relay_constraints(Mode::Normal, None, Some(150)).is_err());
        assert!(relay_constraints(Mode::Normal, Some("US".to_string()), None)
            .unwrap()
            .is_unconstrained());
    }

    #[tokio::test]
    async fn test_unwritable_output_fails_before_relay_survey() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("proxies.csv");
        std::fs::write(&input, "127.0.0.1:1080\n").unwrap();
        let config = Config {
            denylist_path: dir.path().join("denylist.csv"),
            geoip_dir: dir.path().join("inc"),
            output_dir: dir.path().join("missing").join("out"),
            ..Config::default()
        };

        // The relay pool does not exist either; the output must be reported first.
        let err = run_check(
            &config,
            CheckerConfig::new(),
            Some(input),
            Some(dir.path().join("relays.csv")),
            SelectionConstraints::country("FR").with_max_speed(100),
            false,
            true,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::OutputUnwritable { .. })
        ));
    }

    #[test]
    fn test_normal_mode_without_flags_has_no_relay() {
        assert!(relay_constraints(Mode::Normal, None, None)
            .unwrap()
            .is_unconstrained());
    }
}
