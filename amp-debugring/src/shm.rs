//! A kfifo-style ring laid directly over a slice of the `RBUF_PAIR` shared
//! memory region: the same `in`/`out` counter-plus-modulo bookkeeping as
//! `ring_buffer.c`, except the bytes really are shared with the remote
//! core instead of staged through a local buffer. `fence` stands in for
//! the original's `wmb()`/`rmb()` barriers, same convention `amp-virtio`
//! uses around its avail/used ring indices.

use std::sync::atomic::{fence, Ordering};

const HEADER_LEN: usize = 16; // in, out, len, esize: u32 each

/// One direction of a ring pair. Not `Clone`/`Copy`: exactly one writer and
/// one reader are expected to touch a given instance, mirroring the
/// original single-producer/single-consumer kfifo.
pub struct ShmRing {
    ptr: *mut u8,
    cap: usize,
}

unsafe impl Send for ShmRing {}

impl ShmRing {
    /// Initializes the header (`in = out = 0`) at the start of `region`,
    /// same as `ring_buffer_init`. The caller must own `region` exclusively
    /// for as long as the returned ring is used.
    ///
    /// # Safety
    /// `region` must point at `len` valid, writable bytes that outlive the
    /// returned `ShmRing`.
    pub unsafe fn init(region: *mut u8, len: usize) -> Self {
        let cap = len.saturating_sub(HEADER_LEN);
        let ring = Self { ptr: region, cap };
        ring.write_u32(0, 0);
        ring.write_u32(4, 0);
        ring.write_u32(8, cap as u32);
        ring.write_u32(12, 0);
        ring
    }

    fn read_u32(&self, off: usize) -> u32 {
        unsafe { std::ptr::read_volatile(self.ptr.add(off) as *const u32) }
    }

    fn write_u32(&self, off: usize, v: u32) {
        unsafe { std::ptr::write_volatile(self.ptr.add(off) as *mut u32, v) }
    }

    fn data(&self) -> *mut u8 {
        unsafe { self.ptr.add(HEADER_LEN) }
    }

    /// Mirrors `__kfifo_in`: copies in as much of `buf` as fits, wrapping at
    /// `cap`, and reports how much was actually written.
    pub fn write(&self, buf: &[u8]) -> usize {
        let in_ = self.read_u32(0);
        let out = self.read_u32(4);
        let unused = self.cap - in_.wrapping_sub(out) as usize;
        let len = buf.len().min(unused);
        let off = in_ as usize % self.cap;
        let head = len.min(self.cap - off);
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.data().add(off), head);
            std::ptr::copy_nonoverlapping(buf.as_ptr().add(head), self.data(), len - head);
        }
        fence(Ordering::Release);
        self.write_u32(0, in_.wrapping_add(len as u32));
        len
    }

    /// Mirrors `__kfifo_out`: copies out as much as `buf` can hold, wrapping
    /// at `cap`, and reports how much was actually read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let in_ = self.read_u32(0);
        let out = self.read_u32(4);
        let avail = in_.wrapping_sub(out) as usize;
        let len = buf.len().min(avail);
        let off = out as usize % self.cap;
        let head = len.min(self.cap - off);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data().add(off), buf.as_mut_ptr(), head);
            std::ptr::copy_nonoverlapping(self.data(), buf.as_mut_ptr().add(head), len - head);
        }
        fence(Ordering::Acquire);
        self.write_u32(4, out.wrapping_add(len as u32));
        len
    }

    pub fn is_empty(&self) -> bool {
        self.read_u32(0) == self.read_u32(4)
    }

    /// Drains whatever is currently available into a freshly allocated
    /// `Vec`, up to `max` bytes.
    pub fn drain(&self, max: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max];
        let n = self.read(&mut buf);
        buf.truncate(n);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_over(len: usize) -> (Vec<u8>, ShmRing) {
        let mut backing = vec![0u8; len];
        let ring = unsafe { ShmRing::init(backing.as_mut_ptr(), len) };
        (backing, ring)
    }

    #[test]
    fn round_trips_without_wrapping() {
        let (_backing, ring) = ring_over(32);
        assert_eq!(ring.write(b"hello"), 5);
        let mut buf = [0u8; 5];
        assert_eq!(ring.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around_the_backing_region() {
        let (_backing, ring) = ring_over(16 + 8);
        assert_eq!(ring.write(b"abcdef"), 6);
        let mut buf = [0u8; 4];
        assert_eq!(ring.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(ring.write(b"ghijk"), 5);
        assert_eq!(ring.drain(16), b"efghijk");
    }

    #[test]
    fn write_past_capacity_is_truncated_not_overwritten() {
        let (_backing, ring) = ring_over(16 + 4);
        assert_eq!(ring.write(b"abcdef"), 4);
        assert_eq!(ring.drain(16), b"abcd");
    }
}
