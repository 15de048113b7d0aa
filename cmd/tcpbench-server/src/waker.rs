//! A minimal `Send + Sync` handle for waking a reactor from another thread. The reactor types
//! themselves are `!Send` (they own `Rc`-based completion state), so cross-thread wakeups go
//! through the raw eventfd/pipe descriptor directly instead.

use std::os::fd::RawFd;
use std::sync::Arc;

pub fn make_waker(fd: RawFd) -> Arc<dyn Fn() + Send + Sync> {
    Arc::new(move || {
        let one: u64 = 1;
        unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
        }
    })
}
