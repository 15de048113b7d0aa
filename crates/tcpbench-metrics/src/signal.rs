//! SIGINT/SIGTERM handling, grounded on `app/common/signal_handler.hpp`/`.cpp`: install a
//! handler that only flips an `AtomicBool`, because the reactor poll loop is the only place
//! safe to act on a shutdown request — nothing async-signal-unsafe runs inside the handler
//! itself.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use tcpbench_core::{BenchError, Result};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs handlers for `SIGINT` and `SIGTERM`. Idempotent; safe to call more than once
/// (e.g. once per worker thread during startup) since it only ever (re)installs the same
/// handler function.
pub fn install() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| BenchError::Setup(format!("sigaction({sig}): {e}")))?;
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Exposed for tests and for a `--max-duration` watchdog that wants to trigger the same
/// drain path a real signal would.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shutdown_is_observable() {
        request_shutdown();
        assert!(shutdown_requested());
    }
}
