//! CPU pinning, grounded on `app/common/affinity.hpp`/`.cpp`: each worker thread pins itself
//! to one core by index, round-robin over the online core count, to keep per-worker latency
//! distributions comparable across a run.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tcpbench_core::{BenchError, Result};

/// Pins the calling thread to `core_index`, wrapping around the online CPU count. Logs and
/// returns an error rather than panicking: affinity failures (e.g. inside a constrained
/// container) should degrade the run, not crash it.
pub fn pin_current_thread(core_index: usize) -> Result<()> {
    let online = online_cpu_count();
    let target = core_index % online;

    let mut set = CpuSet::new();
    set.set(target)
        .map_err(|e| BenchError::Setup(format!("CpuSet::set({target}): {e}")))?;

    sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|e| BenchError::Setup(format!("sched_setaffinity: {e}")))?;
    Ok(())
}

fn online_cpu_count() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_to_core_zero_does_not_error() {
        // Core 0 is virtually guaranteed to exist and be allowed in CI/test sandboxes.
        assert!(pin_current_thread(0).is_ok());
    }

    #[test]
    fn wraps_around_online_count() {
        let huge = online_cpu_count() * 3 + 1;
        // Should not panic on modulo; success/failure depends on sandbox cgroup, so just
        // assert it returns rather than panics.
        let _ = pin_current_thread(huge);
    }
}
