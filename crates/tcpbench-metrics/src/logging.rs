//! Logging initialisation, grounded on `lib/utility/logger.hpp`'s level-mapped stderr/file
//! logger: one-time `tracing_subscriber::fmt` setup driven by a `--log-level` string and an
//! optional `--log-file` path.

use std::fs::OpenOptions;
use std::path::Path;
use tcpbench_core::{BenchError, Result};
use tracing_subscriber::EnvFilter;

/// `"off"` disables all logging; anything else maps onto a `tracing` level the same way the
/// source's `USE_STDERR_LOGGER` atomic level does.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    if level.eq_ignore_ascii_case("off") {
        return Ok(());
    }

    let filter = EnvFilter::try_new(level)
        .map_err(|e| BenchError::Setup(format!("invalid log level {level:?}: {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| BenchError::Setup(format!("open log file {path:?}: {e}")))?;
            builder.with_writer(move || file.try_clone().expect("log file clone")).init();
        }
        None => {
            builder.with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}
