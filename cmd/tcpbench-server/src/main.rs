//! `tcpbench-server`: an echo/sink benchmark server over a pluggable `io_uring` or epoll
//! reactor backend. Spawns one worker thread per `--workers`, a dedicated acceptor thread,
//! and drives a latency HUD plus periodic results persistence from the main thread.

mod cli;
mod epoll_backend;
mod uring_backend;
mod waker;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tcpbench_core::{BenchError, CounterSnapshot, Result};
use tcpbench_metrics::{logging, signal, Hud, MachineInfo, ResultsWriter, RunMetadata};

use cli::{Backend, Cli, LogLevel};

const HUD_RENDER_INTERVAL: Duration = Duration::from_secs(1);
const HUD_TICK_SLEEP: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.log_level {
        LogLevel::Off => "off",
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };
    if let Err(e) = logging::init(log_level, cli.log_file.as_deref().map(std::path::Path::new)) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    if let Err(e) = signal::install() {
        tracing::error!(error = %e, "failed to install signal handlers");
        return ExitCode::from(1);
    }

    match run(&cli) {
        Ok(()) => ExitCode::from(0),
        Err(BenchError::Setup(msg)) => {
            tracing::error!(error = %msg, "setup failed");
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

/// Splits `host:port`; grounded on the teacher's own minimal address parsing rather than
/// pulling in a URL crate for a shape this simple.
pub fn split_address(address: &str) -> Result<(String, String)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| BenchError::Setup(format!("invalid address {address:?}, expected host:port")))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port.to_string()))
}

fn run(cli: &Cli) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));

    let started_at_unix_ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let results_writer = match &cli.results_dir {
        Some(dir) => Some(ResultsWriter::new(dir)?),
        None => None,
    };

    if let Some(writer) = &results_writer {
        let metadata = RunMetadata {
            backend: format!("{:?}", cli.backend),
            mode: format!("{:?}", cli.mode),
            worker_count: cli.workers,
            message_size: cli.buffer_size,
            duration_secs: 0,
            started_at_unix_ns,
            machine: MachineInfo::collect(),
            tags: cli.tags.clone(),
        };
        writer.write_metadata(&metadata)?;
    }

    let (worker_counters, worker_conduits, join_handles, wakers): (
        Vec<_>,
        Vec<_>,
        Vec<std::thread::JoinHandle<()>>,
        Vec<Arc<dyn Fn() + Send + Sync>>,
    ) = match cli.backend {
        Backend::IoUring => {
            let handles = uring_backend::run(cli, shutdown.clone())?;
            let mut joins = Vec::new();
            let mut counters = Vec::new();
            let mut conduits = Vec::new();
            let mut wakers = Vec::new();
            for w in handles.workers {
                joins.push(w.join);
                counters.push(w.counters);
                conduits.push(w.sample_conduit);
                wakers.push(w.waker);
            }
            joins.push(handles.acceptor_join);
            wakers.push(handles.acceptor_waker);
            (counters, conduits, joins, wakers)
        }
        Backend::Epoll => {
            let handles = epoll_backend::run(cli, shutdown.clone())?;
            let mut joins = Vec::new();
            let mut counters = Vec::new();
            let mut conduits = Vec::new();
            let mut wakers = Vec::new();
            for w in handles.workers {
                joins.push(w.join);
                counters.push(w.counters);
                conduits.push(w.sample_conduit);
                wakers.push(w.waker);
            }
            joins.push(handles.acceptor_join);
            wakers.push(handles.acceptor_waker);
            (counters, conduits, joins, wakers)
        }
    };

    let mut hud = Hud::new(HUD_RENDER_INTERVAL);
    let mut last_snapshot = CounterSnapshot::default();

    while !shutdown.load(Ordering::Relaxed) && !signal::shutdown_requested() {
        for conduit in &worker_conduits {
            conduit.drain_into(|sample| hud.record(sample));
        }

        let total: CounterSnapshot = worker_counters
            .iter()
            .map(|c| c.snapshot())
            .fold(CounterSnapshot::default(), |acc, s| acc + s);

        if let Some(line) = hud.tick(total) {
            tracing::info!("{}", line.format());
        }
        last_snapshot = total;

        std::thread::sleep(HUD_TICK_SLEEP);
    }

    shutdown.store(true, Ordering::Relaxed);
    for waker in &wakers {
        waker();
    }

    if let Some(writer) = &results_writer {
        writer.write_metrics(last_snapshot, hud.histogram())?;
        writer.write_histogram(0, hud.histogram())?;
    }

    for join in join_handles {
        let _ = join.join();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_address_defaults_empty_host_to_any() {
        let (host, port) = split_address(":7878").unwrap();
        assert_eq!(host, "0.0.0.0");
        assert_eq!(port, "7878");
    }

    #[test]
    fn split_address_rejects_missing_port() {
        assert!(split_address("localhost").is_err());
    }
}
