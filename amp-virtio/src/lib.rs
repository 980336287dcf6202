//! A split virtqueue laid out directly over a shared-memory region that
//! both cores can see, with no vhost-user daemon in the middle: the
//! descriptor table, available ring and used ring are just three offsets
//! into memory the remote-processor backend already mapped for us. One
//! side of a pair of queues acts as [`Producer`] (owns the avail ring,
//! harvests the used ring), the other as [`Consumer`] (harvests the avail
//! ring, owns the used ring) — same split as a regular virtio driver/device
//! pair, just without a VMM between them.

use std::sync::atomic::{fence, Ordering};

use vm_memory::mmap::MmapRegion;
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestRegionMmap};

pub type Mem = GuestMemoryMmap<()>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to map queue memory: {0}")]
    Mmap(#[from] vm_memory::mmap::Error),
    #[error("failed to build guest memory: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
    #[error("descriptor chain too long (possible loop)")]
    ChainTooLong,
    #[error("descriptor index out of range")]
    BadDescriptor,
    #[error("queue is full")]
    QueueFull,
}

const VRING_DESC_F_NEXT: u16 = virtio_bindings::virtio_ring::VRING_DESC_F_NEXT as u16;
const VRING_DESC_F_WRITE: u16 = virtio_bindings::virtio_ring::VRING_DESC_F_WRITE as u16;
const MAX_CHAIN_LEN: usize = 1024;

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct Desc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}
unsafe impl ByteValued for Desc {}

/// Builds the `vm-memory` view of a region the caller has already mmap'd
/// (typically via an `amp-rproc` backend's `mmap`), so ring accesses can go
/// through `Bytes`/`ByteValued` instead of raw pointer arithmetic.
///
/// # Safety
/// `io.virt_base` must point at a valid mapping of at least `io.size` bytes
/// that outlives the returned memory object.
pub unsafe fn memory_over_region(io: &amp_shmpool::IoRegion) -> Result<Mem, Error> {
    let region = MmapRegion::build_raw(
        io.virt_base as *mut u8,
        io.size,
        libc_prot_read_write(),
        0,
    )?;
    let guest_region = GuestRegionMmap::new(region, GuestAddress(0))?;
    Ok(GuestMemoryMmap::from_regions(vec![guest_region])?)
}

fn libc_prot_read_write() -> i32 {
    libc::PROT_READ | libc::PROT_WRITE
}

struct Layout {
    desc_table: GuestAddress,
    avail: GuestAddress,
    used: GuestAddress,
    size: u16,
}

impl Layout {
    fn desc_addr(&self, i: u16) -> GuestAddress {
        self.desc_table
            .unchecked_add(i as u64 * std::mem::size_of::<Desc>() as u64)
    }
    fn avail_flags_addr(&self) -> GuestAddress {
        self.avail
    }
    fn avail_idx_addr(&self) -> GuestAddress {
        self.avail.unchecked_add(2)
    }
    fn avail_ring_addr(&self, i: u16) -> GuestAddress {
        self.avail.unchecked_add(4 + i as u64 * 2)
    }
    fn used_flags_addr(&self) -> GuestAddress {
        self.used
    }
    fn used_idx_addr(&self) -> GuestAddress {
        self.used.unchecked_add(2)
    }
    fn used_ring_elem_addr(&self, i: u16) -> GuestAddress {
        self.used.unchecked_add(4 + i as u64 * 8)
    }
}

/// One entry of a descriptor chain, resolved to a plain address/len/mode.
#[derive(Debug, Clone, Copy)]
pub struct BufDesc {
    pub addr: u64,
    pub len: u32,
    pub writable: bool,
}

/// The producer role: writes descriptors and avail-ring entries, reads the
/// used ring the consumer fills in.
pub struct Producer {
    mem: Mem,
    layout: Layout,
    next_desc: u16,
    last_used: u16,
}

impl Producer {
    pub fn new(mem: Mem, desc_table: GuestAddress, avail: GuestAddress, used: GuestAddress, size: u16) -> Self {
        Self {
            mem,
            layout: Layout { desc_table, avail, used, size },
            next_desc: 0,
            last_used: 0,
        }
    }

    /// Publishes a single-descriptor buffer and makes it visible to the
    /// consumer. Returns the descriptor index used, so the caller can match
    /// it up when it comes back through the used ring.
    pub fn add_buffer(&mut self, addr: u64, len: u32, writable: bool) -> Result<u16, Error> {
        let in_flight = self.next_desc.wrapping_sub(self.last_used);
        if in_flight >= self.layout.size {
            return Err(Error::QueueFull);
        }
        let head = self.next_desc % self.layout.size;
        let mut flags = 0u16;
        if writable {
            flags |= VRING_DESC_F_WRITE;
        }
        let desc = Desc { addr, len, flags, next: 0 };
        self.mem.write_obj(desc, self.layout.desc_addr(head))?;
        self.next_desc = self.next_desc.wrapping_add(1);

        let avail_idx: u16 = self.mem.read_obj(self.layout.avail_idx_addr())?;
        self.mem
            .write_obj(head, self.layout.avail_ring_addr(avail_idx % self.layout.size))?;
        fence(Ordering::Release);
        self.mem
            .write_obj(avail_idx.wrapping_add(1), self.layout.avail_idx_addr())?;
        Ok(head)
    }

    /// Drains all newly-completed entries from the used ring.
    pub fn pop_used(&mut self) -> Result<Vec<(u16, u32)>, Error> {
        let mut out = Vec::new();
        loop {
            let used_idx: u16 = self.mem.read_obj(self.layout.used_idx_addr())?;
            if used_idx == self.last_used {
                break;
            }
            let elem_addr = self.layout.used_ring_elem_addr(self.last_used % self.layout.size);
            let id: u32 = self.mem.read_obj(elem_addr)?;
            let len: u32 = self.mem.read_obj(elem_addr.unchecked_add(4))?;
            out.push((id as u16, len));
            self.last_used = self.last_used.wrapping_add(1);
        }
        Ok(out)
    }

    pub fn set_avail_no_interrupt(&mut self, suppress: bool) -> Result<(), Error> {
        let flags: u16 = if suppress { 1 } else { 0 };
        self.mem.write_obj(flags, self.layout.avail_flags_addr())?;
        Ok(())
    }

    /// Writes `data` into the region at `addr` and publishes it as a single
    /// read-only buffer, for callers that own a fixed slot of backing
    /// memory rather than building a descriptor over data written
    /// elsewhere.
    pub fn write_and_publish(&mut self, addr: GuestAddress, data: &[u8]) -> Result<u16, Error> {
        self.mem.write_slice(data, addr)?;
        self.add_buffer(addr.raw_value(), data.len() as u32, false)
    }

    pub fn mem(&self) -> &Mem {
        &self.mem
    }
}

/// The consumer role: harvests descriptor chains published in the avail
/// ring and publishes completions in the used ring.
pub struct Consumer {
    mem: Mem,
    layout: Layout,
    last_avail: u16,
}

impl Consumer {
    pub fn new(mem: Mem, desc_table: GuestAddress, avail: GuestAddress, used: GuestAddress, size: u16) -> Self {
        Self {
            mem,
            layout: Layout { desc_table, avail, used, size },
            last_avail: 0,
        }
    }

    /// True if the avail ring has at least one chain we haven't consumed.
    pub fn has_avail(&self) -> Result<bool, Error> {
        let avail_idx: u16 = self.mem.read_obj(self.layout.avail_idx_addr())?;
        Ok(avail_idx != self.last_avail)
    }

    /// Pops the next available descriptor chain, resolving `next` links.
    /// Returns the head index (to hand back via `add_used`) and the
    /// resolved buffer list.
    pub fn pop_avail(&mut self) -> Result<Option<(u16, Vec<BufDesc>)>, Error> {
        let avail_idx: u16 = self.mem.read_obj(self.layout.avail_idx_addr())?;
        if avail_idx == self.last_avail {
            return Ok(None);
        }
        fence(Ordering::Acquire);
        let head: u16 = self
            .mem
            .read_obj(self.layout.avail_ring_addr(self.last_avail % self.layout.size))?;
        self.last_avail = self.last_avail.wrapping_add(1);

        let mut chain = Vec::new();
        let mut idx = head;
        for _ in 0..MAX_CHAIN_LEN {
            if idx >= self.layout.size {
                return Err(Error::BadDescriptor);
            }
            let desc: Desc = self.mem.read_obj(self.layout.desc_addr(idx))?;
            chain.push(BufDesc {
                addr: desc.addr,
                len: desc.len,
                writable: desc.flags & VRING_DESC_F_WRITE != 0,
            });
            if desc.flags & VRING_DESC_F_NEXT == 0 {
                return Ok(Some((head, chain)));
            }
            idx = desc.next;
        }
        Err(Error::ChainTooLong)
    }

    /// Publishes a completion for the chain headed by `desc_index`.
    pub fn add_used(&mut self, desc_index: u16, written_len: u32) -> Result<(), Error> {
        let used_idx: u16 = self.mem.read_obj(self.layout.used_idx_addr())?;
        let elem_addr = self.layout.used_ring_elem_addr(used_idx % self.layout.size);
        self.mem.write_obj(desc_index as u32, elem_addr)?;
        self.mem.write_obj(written_len, elem_addr.unchecked_add(4))?;
        fence(Ordering::Release);
        self.mem
            .write_obj(used_idx.wrapping_add(1), self.layout.used_idx_addr())?;
        Ok(())
    }

    pub fn should_notify(&self) -> Result<bool, Error> {
        let flags: u16 = self.mem.read_obj(self.layout.used_flags_addr())?;
        Ok(flags == 0)
    }

    pub fn mem(&self) -> &Mem {
        &self.mem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_mem(size: usize) -> Mem {
        let region = MmapRegion::new(size).unwrap();
        let guest_region = GuestRegionMmap::new(region, GuestAddress(0)).unwrap();
        GuestMemoryMmap::from_regions(vec![guest_region]).unwrap()
    }

    const QSIZE: u16 = 4;
    const DESC_TABLE: u64 = 0;
    const AVAIL: u64 = DESC_TABLE + QSIZE as u64 * 16;
    const USED: u64 = AVAIL + 4 + QSIZE as u64 * 2 + 2;

    #[test]
    fn single_buffer_round_trips_through_the_ring() {
        let mem = anon_mem(4096);
        let mut producer = Producer::new(
            mem.clone(),
            GuestAddress(DESC_TABLE),
            GuestAddress(AVAIL),
            GuestAddress(USED),
            QSIZE,
        );
        let mut consumer = Consumer::new(mem, GuestAddress(DESC_TABLE), GuestAddress(AVAIL), GuestAddress(USED), QSIZE);

        let head = producer.add_buffer(0x1000, 64, true).unwrap();
        assert!(consumer.has_avail().unwrap());

        let (got_head, chain) = consumer.pop_avail().unwrap().unwrap();
        assert_eq!(got_head, head);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].addr, 0x1000);
        assert_eq!(chain[0].len, 64);
        assert!(chain[0].writable);

        consumer.add_used(got_head, 32).unwrap();
        let used = producer.pop_used().unwrap();
        assert_eq!(used, vec![(head, 32)]);
    }

    #[test]
    fn add_buffer_fails_fast_once_the_ring_is_full() {
        let mem = anon_mem(4096);
        let mut producer = Producer::new(
            mem,
            GuestAddress(DESC_TABLE),
            GuestAddress(AVAIL),
            GuestAddress(USED),
            QSIZE,
        );
        for _ in 0..QSIZE {
            producer.add_buffer(0x1000, 64, true).unwrap();
        }
        assert!(matches!(producer.add_buffer(0x1000, 64, true), Err(Error::QueueFull)));
    }

    #[test]
    fn pop_avail_is_empty_when_nothing_published() {
        let mem = anon_mem(4096);
        let mut consumer = Consumer::new(mem, GuestAddress(DESC_TABLE), GuestAddress(AVAIL), GuestAddress(USED), QSIZE);
        assert!(consumer.pop_avail().unwrap().is_none());
    }
}
