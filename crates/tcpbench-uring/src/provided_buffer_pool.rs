//! Provided-buffer ring (`io_uring_buf_ring`), grounded on `lib/uring/provided_buffer_pool.hpp`/
//! `.cpp`: a power-of-two ring of buffer descriptors the kernel consumes directly for
//! multishot receive and `IOSQE_BUFFER_SELECT` sends, re-provisioned by `reprovide_buffers`
//! once a completion reports which buffer id it consumed.

use io_uring::types::BufRingEntry;
use io_uring::IoUring;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use tcpbench_core::{BenchError, GroupId, Result};

pub struct ProvidedBufferPool {
    group_id: GroupId,
    buf_ring: NonNull<BufRingEntry>,
    ring_mask: u16,
    buf_len: usize,
    buf_count: u16,
    /// Backing storage for the buffers themselves (not the ring descriptors, which
    /// `buf_ring` points into — these are the actual bytes recv/send touch).
    storage: NonNull<u8>,
    storage_layout: Layout,
    local_tail: u16,
}

unsafe impl Send for ProvidedBufferPool {}

impl ProvidedBufferPool {
    /// `buf_count` must be a power of two (required by `io_uring_buf_ring` addressing).
    pub fn new(
        ring: &IoUring,
        group_id: GroupId,
        buf_count: u16,
        buf_len: usize,
    ) -> Result<Self> {
        if !buf_count.is_power_of_two() {
            return Err(BenchError::Setup(
                "provided buffer pool count must be a power of two".into(),
            ));
        }

        let storage_layout = Layout::array::<u8>(buf_count as usize * buf_len)
            .map_err(|_| BenchError::Setup("buffer storage layout overflow".into()))?;
        let storage = NonNull::new(unsafe { alloc(storage_layout) })
            .ok_or_else(|| BenchError::Setup("buffer storage allocation failed".into()))?;

        let (buf_ring_ptr, _) = ring
            .submitter()
            .register_buf_ring(buf_count as u16, group_id.get())
            .map_err(|e| BenchError::Setup(format!("register_buf_ring: {e}")))?;

        let mut pool = Self {
            group_id,
            buf_ring: NonNull::new(buf_ring_ptr as *mut BufRingEntry).unwrap(),
            ring_mask: buf_count - 1,
            buf_len,
            buf_count,
            storage,
            storage_layout,
            local_tail: 0,
        };
        pool.populate_all();
        Ok(pool)
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    pub fn buf_count(&self) -> u16 {
        self.buf_count
    }

    fn buf_ptr(&self, bid: u16) -> *mut u8 {
        unsafe { self.storage.as_ptr().add(bid as usize * self.buf_len) }
    }

    /// Returns the bytes the kernel wrote for `bid`, truncated to `len`. Caller must copy out
    /// before the buffer is re-provided — ownership reverts to the kernel at that point.
    ///
    /// # Safety
    /// `bid` must come from a completion's buffer-select flags for this group, and the
    /// caller must not hold this slice across a `push_buffer` call for the same `bid`.
    pub unsafe fn view(&self, bid: u16, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.buf_ptr(bid), len.min(self.buf_len))
    }

    pub fn buf_mut_ptr(&self, bid: u16) -> *mut u8 {
        self.buf_ptr(bid)
    }

    fn ring_entry(&self, slot: u16) -> &mut BufRingEntry {
        unsafe { &mut *self.buf_ring.as_ptr().add((slot & self.ring_mask) as usize) }
    }

    /// Publishes one buffer id back into the ring at the current tail and advances it.
    /// Grounded on `reprovide_buffers`'s per-id push loop.
    pub fn push_buffer(&mut self, bid: u16) {
        let entry = self.ring_entry(self.local_tail);
        entry.set_addr(self.buf_ptr(bid) as u64);
        entry.set_len(self.buf_len as u32);
        entry.set_bid(bid);
        self.local_tail = self.local_tail.wrapping_add(1);
    }

    pub fn push_buffers(&mut self, bids: impl IntoIterator<Item = u16>) {
        for bid in bids {
            self.push_buffer(bid);
        }
        self.commit();
    }

    /// Makes pushed entries visible to the kernel. Must follow one or more `push_buffer`
    /// calls before the kernel can consume them.
    pub fn commit(&mut self) {
        unsafe { BufRingEntry::tail(self.buf_ring.as_ptr()).write(self.local_tail) };
    }

    fn populate_all(&mut self) {
        for bid in 0..self.buf_count {
            self.push_buffer(bid);
        }
        self.commit();
    }
}

impl Drop for ProvidedBufferPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.storage.as_ptr(), self.storage_layout) };
        // buf_ring registration itself is reclaimed by IoUring::drop's full teardown; an
        // explicit `unregister_buf_ring` would race the ring's own drop order, so we skip it
        // the same way `provided_buffer_pool.cpp`'s destructor defers to `io_uring_queue_exit`.
    }
}

#[cfg(test)]
mod tests {
    use tcpbench_core::ids::GroupId;

    #[test]
    fn group_id_roundtrips() {
        let g = GroupId::new(7);
        assert_eq!(g.get(), 7);
    }
}
