//! Lock-free single-producer/single-consumer byte ring.
//!
//! Carries raw interleaved sample bytes from the buffer-switch callback to
//! the renderer thread. The producer runs on the upstream driver's
//! real-time thread, so both sides are wait-free: no locks, no allocation.
//!
//! Pushes are all-or-nothing. A frame is 2-8 bytes and must never be split,
//! so a push that does not fit is dropped entirely and the write index is
//! left untouched. That dropped block is the overrun back-pressure signal.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic index on its own cache line so the producer's writes to the
/// write index never invalidate the consumer's line holding the read index.
#[repr(align(64))]
struct PaddedIndex(AtomicUsize);

pub struct ByteRing {
    buffer: UnsafeCell<Box<[u8]>>,
    mask: usize,
    capacity: usize,
    /// Monotonically increasing; advanced by the producer only.
    write_index: PaddedIndex,
    /// Monotonically increasing; advanced by the consumer only.
    read_index: PaddedIndex,
}

// One thread advances write, one advances read; the byte region is only
// touched between the index loads and the matching release store.
unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// Create a ring of `capacity` bytes. The capacity must be a power of
    /// two; the index math relies on mask-based wrapping.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        Self {
            buffer: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            mask: capacity - 1,
            capacity,
            write_index: PaddedIndex(AtomicUsize::new(0)),
            read_index: PaddedIndex(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently stored (write - read). Callable from either side.
    #[inline]
    pub fn fill_size(&self) -> usize {
        let write = self.write_index.0.load(Ordering::Acquire);
        let read = self.read_index.0.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Bytes available for reading. Same quantity as `fill_size`.
    #[inline]
    pub fn available_read(&self) -> usize {
        self.fill_size()
    }

    /// Bytes of free space left for the producer.
    #[inline]
    pub fn available_write(&self) -> usize {
        self.capacity - self.fill_size()
    }

    /// Copy `src` into the ring. Producer side only.
    ///
    /// If the free space cannot hold all of `src` the push is dropped
    /// entirely and `false` is returned; no partial write ever happens.
    pub fn push(&self, src: &[u8]) -> bool {
        let count = src.len();
        if count == 0 {
            return true;
        }

        let write = self.write_index.0.load(Ordering::Relaxed);
        let read = self.read_index.0.load(Ordering::Acquire);
        let free = self.capacity - write.wrapping_sub(read);
        if free < count {
            return false;
        }

        let start = write & self.mask;
        let first = count.min(self.capacity - start);
        unsafe {
            let buf = (*self.buffer.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(src.as_ptr(), buf.add(start), first);
            if first < count {
                // Wrapped at the capacity boundary.
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), buf, count - first);
            }
        }

        self.write_index
            .0
            .store(write.wrapping_add(count), Ordering::Release);
        true
    }

    /// Read up to `dst.len()` bytes into `dst`. Consumer side only.
    /// Returns the number of bytes actually read.
    pub fn pop(&self, dst: &mut [u8]) -> usize {
        let write = self.write_index.0.load(Ordering::Acquire);
        let read = self.read_index.0.load(Ordering::Relaxed);
        let fill = write.wrapping_sub(read);
        let count = dst.len().min(fill);
        if count == 0 {
            return 0;
        }

        let start = read & self.mask;
        let first = count.min(self.capacity - start);
        unsafe {
            let buf = (*self.buffer.get()).as_ptr();
            std::ptr::copy_nonoverlapping(buf.add(start), dst.as_mut_ptr(), first);
            if first < count {
                std::ptr::copy_nonoverlapping(buf, dst.as_mut_ptr().add(first), count - first);
            }
        }

        self.read_index
            .0
            .store(read.wrapping_add(count), Ordering::Release);
        count
    }
}
