//! Ambient observability and host-control stack: the latency HUD, run/machine metadata,
//! results persistence, signal handling, and CPU affinity.

pub mod affinity;
pub mod hud;
pub mod logging;
pub mod results_writer;
pub mod run_metadata;
pub mod signal;

pub use affinity::pin_current_thread;
pub use hud::{Hud, HudLine};
pub use results_writer::ResultsWriter;
pub use run_metadata::{MachineInfo, RunMetadata};
