//! `tcpbench-client`: paced TCP load generator. Spawns `--senders` threads, each owning a
//! shard of `--connections` total connections, and drives them against the pacing algorithm
//! in `tcpbench_runtime::client::run_paced`, over whichever reactor backend `--backend` picks
//! — mirroring `tcpbench-server`'s own io_uring/epoll split.

mod cli;
mod epoll_backend;
mod uring_backend;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tcpbench_core::{BenchError, CounterSnapshot, Counters, Result};
use tcpbench_metrics::{affinity, logging, signal, MachineInfo, ResultsWriter, RunMetadata};
use tcpbench_runtime::client::SenderConfig;

use cli::{Backend, Cli, LogLevel};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

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

fn split_address(address: &str) -> Result<(String, String)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| BenchError::Setup(format!("invalid address {address:?}, expected host:port")))?;
    Ok((host.to_string(), port.to_string()))
}

/// Splits `total` connections into `shards` buckets as evenly as possible (remainder spread
/// over the first buckets), matching the round-robin dispatch property the server side relies
/// on for comparable per-worker shares.
fn shard_sizes(total: usize, shards: usize) -> Vec<usize> {
    let base = total / shards;
    let remainder = total % shards;
    (0..shards)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

fn run(cli: &Cli) -> Result<()> {
    let (host, port) = split_address(&cli.address)?;
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
            mode: "load-generator".to_string(),
            worker_count: cli.senders,
            message_size: cli.msg_size,
            duration_secs: cli.duration_secs.unwrap_or(0),
            started_at_unix_ns,
            machine: MachineInfo::collect(),
            tags: cli.tags.clone(),
        };
        writer.write_metadata(&metadata)?;
    }

    let shards = shard_sizes(cli.connections, cli.senders.max(1));
    let mut join_handles = Vec::new();
    let mut per_sender_counters: Vec<Arc<Counters>> = Vec::new();

    for (sender_idx, shard) in shards.into_iter().enumerate() {
        if shard == 0 {
            continue;
        }
        let host = host.clone();
        let port = port.clone();
        let msg_size = cli.msg_size;
        let msgs_per_sec = cli.msgs_per_sec.max(1) / (cli.senders.max(1) as u64).max(1);
        let duration = cli.duration_secs.map(Duration::from_secs);
        let stop_after_n_messages = cli.stop_after_n_messages;
        let drain = cli.drain;
        let shutdown = shutdown.clone();
        let counters = Arc::new(Counters::default());
        let thread_counters = counters.clone();
        let cpu_id = cli.cpu_id_base + sender_idx;
        let backend = cli.backend;
        let buffer_count = cli.buffer_count.next_power_of_two();
        let uring_depth = cli.uring_depth;
        let zerocopy = cli.zerocopy;
        let id_base = sender_idx * 1_000_000;

        let sender_config = SenderConfig {
            msgs_per_sec: msgs_per_sec.max(1),
            duration,
            stop_after_n_messages,
            drain,
            ..Default::default()
        };

        let join = std::thread::Builder::new()
            .name(format!("tcpbench-sender-{sender_idx}"))
            .spawn(move || -> Result<()> {
                match backend {
                    Backend::IoUring => uring_backend::run_shard(
                        uring_backend::ShardConfig {
                            id_base,
                            count: shard,
                            host,
                            port,
                            msg_size,
                            buffer_count,
                            uring_depth,
                            zerocopy,
                            cpu_id,
                            sender: sender_config,
                        },
                        shutdown,
                        thread_counters,
                    ),
                    Backend::Epoll => epoll_backend::run_shard(
                        epoll_backend::ShardConfig {
                            id_base,
                            count: shard,
                            host,
                            port,
                            msg_size,
                            cpu_id,
                            sender: sender_config,
                        },
                        shutdown,
                        thread_counters,
                    ),
                }
            })
            .expect("spawn sender thread");

        join_handles.push(join);
        per_sender_counters.push(counters);
    }

    let overall_deadline = cli.duration_secs.map(|secs| {
        std::time::Instant::now() + Duration::from_secs(secs) + Duration::from_secs(5)
    });

    loop {
        if join_handles.iter().all(|h| h.is_finished()) {
            break;
        }
        if signal::shutdown_requested() {
            shutdown.store(true, Ordering::Relaxed);
        }
        if let Some(deadline) = overall_deadline {
            if std::time::Instant::now() >= deadline {
                shutdown.store(true, Ordering::Relaxed);
            }
        }

        let total: CounterSnapshot = per_sender_counters
            .iter()
            .map(|c| c.snapshot())
            .fold(CounterSnapshot::default(), |acc, s| acc + s);
        tracing::info!(ops = total.ops, msgs = total.msgs, bytes = total.bytes, "progress");

        std::thread::sleep(REPORT_INTERVAL);
    }

    let mut first_err = None;
    for join in join_handles {
        match join.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "sender thread returned an error");
                first_err.get_or_insert(e);
            }
            Err(_) => tracing::warn!("sender thread panicked"),
        }
    }

    let total: CounterSnapshot = per_sender_counters
        .iter()
        .map(|c| c.snapshot())
        .fold(CounterSnapshot::default(), |acc, s| acc + s);

    if let Some(writer) = &results_writer {
        let empty_histogram = hdrhistogram::Histogram::<u64>::new_with_bounds(1, 1_000_000_000, 3)
            .expect("valid histogram bounds");
        writer.write_metrics(total, &empty_histogram)?;
    }

    if let Some(e) = first_err {
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_sizes_splits_remainder_over_first_buckets() {
        assert_eq!(shard_sizes(10, 3), vec![4, 3, 3]);
        assert_eq!(shard_sizes(9, 3), vec![3, 3, 3]);
        assert_eq!(shard_sizes(1, 4), vec![1, 0, 0, 0]);
    }

    #[test]
    fn split_address_rejects_missing_port() {
        assert!(split_address("localhost").is_err());
        let (host, port) = split_address("127.0.0.1:7878").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, "7878");
    }
}
