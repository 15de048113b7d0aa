//! Registered (fixed) buffer pool, grounded on `lib/uring/registered_buffer_pool.hpp`/`.cpp`:
//! one large page-aligned allocation registered once via `io_uring_register_buffers`, carved
//! into fixed-size slices handed out by index through a free stack. Used by `WriteFixed` sends
//! to skip the per-call page-pin/unpin the kernel otherwise does on every iovec.

use io_uring::IoUring;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use tcpbench_core::{BenchError, BufferIndex, Result};

pub struct RegisteredBufferPool {
    storage: NonNull<u8>,
    layout: Layout,
    slot_len: usize,
    slot_count: u16,
    free_stack: Vec<u16>,
}

unsafe impl Send for RegisteredBufferPool {}

impl RegisteredBufferPool {
    pub fn new(ring: &IoUring, slot_count: u16, slot_len: usize) -> Result<Self> {
        let total = slot_count as usize * slot_len;
        let layout = Layout::from_size_align(total, 4096)
            .map_err(|_| BenchError::Setup("registered buffer layout overflow".into()))?;
        let storage = NonNull::new(unsafe { alloc(layout) })
            .ok_or_else(|| BenchError::Setup("registered buffer allocation failed".into()))?;

        let iovec = libc::iovec {
            iov_base: storage.as_ptr() as *mut libc::c_void,
            iov_len: total,
        };
        unsafe {
            ring.submitter()
                .register_buffers(std::slice::from_raw_parts(&iovec, 1))
                .map_err(|e| BenchError::Setup(format!("register_buffers: {e}")))?;
        }

        Ok(Self {
            storage,
            layout,
            slot_len,
            slot_count,
            free_stack: (0..slot_count).rev().collect(),
        })
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    fn slot_ptr(&self, idx: u16) -> *mut u8 {
        unsafe { self.storage.as_ptr().add(idx as usize * self.slot_len) }
    }

    /// `buf_index` for `WriteFixed`/`ReadFixed` is always `0` in this pool: all slots live
    /// inside the single registered iovec, distinguished by byte offset, not by registration
    /// index (matches `registered_buffer_pool.cpp`'s single-iovec-many-slots layout).
    pub const FIXED_BUF_INDEX: u16 = 0;

    pub fn acquire(&mut self) -> Option<BufferIndex> {
        self.free_stack.pop().map(BufferIndex::new)
    }

    pub fn release(&mut self, idx: BufferIndex) {
        debug_assert!(idx.get() < self.slot_count);
        self.free_stack.push(idx.get());
    }

    pub fn is_empty(&self) -> bool {
        self.free_stack.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free_stack.len()
    }

    /// Offset of slot `idx` within the single registered iovec, for `WriteFixed::offset`.
    pub fn offset_of(&self, idx: BufferIndex) -> u64 {
        idx.get() as u64 * self.slot_len as u64
    }

    /// # Safety
    /// Caller must not alias this with another live mutable view of the same slot.
    pub unsafe fn slot_mut(&self, idx: BufferIndex) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.slot_ptr(idx.get()), self.slot_len)
    }

    pub fn slot(&self, idx: BufferIndex) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot_ptr(idx.get()), self.slot_len) }
    }
}

impl Drop for RegisteredBufferPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.storage.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cannot build a real IoUring in a unit test (needs CAP_SYS_ADMIN-equivalent / kernel
    // support); exercise the free-stack bookkeeping against a hand-built pool instead.
    fn bare_pool(slot_count: u16, slot_len: usize) -> RegisteredBufferPool {
        let layout = Layout::from_size_align(slot_count as usize * slot_len, 4096).unwrap();
        let storage = NonNull::new(unsafe { alloc(layout) }).unwrap();
        RegisteredBufferPool {
            storage,
            layout,
            slot_len,
            slot_count,
            free_stack: (0..slot_count).rev().collect(),
        }
    }

    #[test]
    fn acquire_release_reuses_indices() {
        let mut pool = bare_pool(4, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        pool.release(a);
        let c = pool.acquire().unwrap();
        assert_eq!(a, c);
        assert_eq!(pool.acquire().unwrap().get(), 1);
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn offsets_are_slot_aligned() {
        let pool = bare_pool(4, 128);
        assert_eq!(pool.offset_of(BufferIndex::new(0)), 0);
        assert_eq!(pool.offset_of(BufferIndex::new(3)), 384);
    }
}
