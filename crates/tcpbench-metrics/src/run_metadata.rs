//! Run and machine metadata, grounded on `app/common/run_metadata.hpp`/`.cpp`: a snapshot of
//! invocation parameters and host characteristics written alongside the histogram so a later
//! run can be compared apples-to-apples.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub hostname: String,
    pub kernel_release: String,
    pub cpu_count: usize,
    pub page_size: usize,
}

impl MachineInfo {
    pub fn collect() -> Self {
        Self {
            hostname: hostname(),
            kernel_release: kernel_release(),
            cpu_count: num_cpus(),
            page_size: page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub backend: String,
    pub mode: String,
    pub worker_count: usize,
    pub message_size: usize,
    pub duration_secs: u64,
    pub started_at_unix_ns: u64,
    pub machine: MachineInfo,
    /// User-supplied `--tags`, carried through verbatim for later run comparison.
    pub tags: Vec<String>,
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..nul]).into_owned()
}

fn kernel_release() -> String {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return "unknown".to_string();
    }
    let bytes: Vec<u8> = uts.release.iter().map(|&c| c as u8).collect();
    let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..nul]).into_owned()
}

fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n < 1 {
        4096
    } else {
        n as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_info_collects_without_panicking() {
        let info = MachineInfo::collect();
        assert!(info.cpu_count >= 1);
        assert!(info.page_size >= 512);
    }
}
