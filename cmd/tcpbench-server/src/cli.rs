use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    IoUring,
    Epoll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Echo,
    Sink,
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

/// Echo/sink benchmark server, picking an `io_uring` or `epoll` reactor backend at startup.
#[derive(Debug, Parser)]
#[command(name = "tcpbench-server", version)]
pub struct Cli {
    #[arg(long, default_value = "0.0.0.0:7878")]
    pub address: String,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, default_value_t = Mode::Echo, value_enum)]
    pub mode: Mode,

    #[arg(long, default_value_t = Backend::IoUring, value_enum)]
    pub backend: Backend,

    #[arg(long, default_value_t = 4096)]
    pub buffer_size: usize,

    #[arg(long, default_value_t = 1024)]
    pub buffer_count: u16,

    #[arg(long, default_value_t = 4096)]
    pub uring_depth: u32,

    #[arg(long)]
    pub so_rcvbuf: Option<i32>,

    #[arg(long)]
    pub so_sndbuf: Option<i32>,

    #[arg(long)]
    pub read_limit: Option<usize>,

    #[arg(long, default_value_t = false)]
    pub zerocopy: bool,

    #[arg(long, default_value_t = false)]
    pub busy_spin: bool,

    #[arg(long, default_value_t = false)]
    pub shutdown_on_disconnect: bool,

    #[arg(long)]
    pub results_dir: Option<String>,

    #[arg(long)]
    pub tags: Vec<String>,

    #[arg(long, default_value_t = 1)]
    pub collect_latency_every_n_samples: u64,

    #[arg(long)]
    pub log_file: Option<String>,

    #[arg(long, default_value_t = LogLevel::Info, value_enum)]
    pub log_level: LogLevel,

    #[arg(long, default_value_t = 0)]
    pub cpu_id_base: usize,
}
