//! Tracing subscriber setup

use chrono::Local;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// `dd_mm_YYYY-HH_MM_SS` suffix used for every generated file name
pub fn timestamp_suffix() -> String {
    Local::now().format("%d_%m_%Y-%H_%M_%S").to_string()
}

/// `<dir>/<prefix>_<timestamp>.<extension>`
pub fn timestamped_path(dir: &Path, prefix: &str, extension: &str) -> PathBuf {
    dir.join(format!("{}_{}.{}", prefix, timestamp_suffix(), extension))
}

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber
///
/// Human-readable output goes to stderr. When `log_file` is given, the same
/// events are also written to it without ANSI colours.
pub fn init(verbose: bool, log_file: Option<&Path>) -> crate::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(
            fmt::layer()
                .with_target(verbose)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()?;
    Ok(())
}
