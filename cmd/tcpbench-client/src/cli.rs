use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    IoUring,
    Epoll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Paced load generator: `--senders` threads each driving a shard of `--connections` total
/// connections against `--address` at an aggregate `--msgs-per-sec`, over an `io_uring` or
/// `epoll` reactor exactly like `tcpbench-server`'s two backends.
#[derive(Debug, Parser)]
#[command(name = "tcpbench-client", version)]
pub struct Cli {
    #[arg(long, default_value = "127.0.0.1:7878")]
    pub address: String,

    #[arg(long, default_value_t = 1)]
    pub connections: usize,

    #[arg(long, default_value_t = 1)]
    pub senders: usize,

    #[arg(long, default_value_t = 1024)]
    pub msg_size: usize,

    #[arg(long, default_value_t = 1000)]
    pub msgs_per_sec: u64,

    #[arg(long, default_value_t = Backend::IoUring, value_enum)]
    pub backend: Backend,

    /// Registered/provided buffer slot count backing the io_uring backend's sends and, when
    /// `--drain` is set, receives. Rounded up to a power of two. Unused on the epoll backend.
    #[arg(long, default_value_t = 64)]
    pub buffer_count: u16,

    #[arg(long, default_value_t = 256)]
    pub uring_depth: u32,

    #[arg(long, default_value_t = false)]
    pub zerocopy: bool,

    #[arg(long)]
    pub duration_secs: Option<u64>,

    #[arg(long)]
    pub stop_after_n_messages: Option<u64>,

    #[arg(long, default_value_t = false)]
    pub drain: bool,

    #[arg(long)]
    pub results_dir: Option<String>,

    #[arg(long)]
    pub tags: Vec<String>,

    #[arg(long)]
    pub log_file: Option<String>,

    #[arg(long, default_value_t = LogLevel::Info, value_enum)]
    pub log_level: LogLevel,

    #[arg(long, default_value_t = 0)]
    pub cpu_id_base: usize,
}
