//! Bump allocator over a single shared-memory region that some other part
//! of the system (a remote-processor backend) has already mapped into our
//! address space, plus the phys<->virt translation callers need once they
//! hand a pointer across the core boundary.
//!
//! There is no free(): entries live for the lifetime of the client, same as
//! the pool this is modeled on.

use log::debug;

/// A single physically-contiguous region, already mapped at `virt_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRegion {
    pub phys_base: u64,
    pub virt_base: usize,
    pub size: usize,
}

impl IoRegion {
    pub fn phys_to_virt(&self, phys: u64) -> Option<usize> {
        let off = phys.checked_sub(self.phys_base)?;
        if off >= self.size as u64 {
            return None;
        }
        Some(self.virt_base + off as usize)
    }

    pub fn virt_to_phys(&self, virt: usize) -> Option<u64> {
        let off = virt.checked_sub(self.virt_base)?;
        if off >= self.size {
            return None;
        }
        Some(self.phys_base + off as u64)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    AlreadyInitialized,
    NotInitialized,
    Exhausted,
    OutOfRange,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

/// A pool backed by exactly one [`IoRegion`]. `init` may be called once;
/// a second call without an intervening reset is a bug in the caller, same
/// as registering a client's shared memory twice in the original.
pub struct Pool {
    io: Option<IoRegion>,
    unused_high: usize,
    /// Virtual ranges handed out via `alloc_at`, checked for overlap against
    /// new pins; `alloc`'s bump region is disjoint from these by construction
    /// since it never starts below `unused_high`.
    pinned: Vec<(usize, usize)>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self {
            io: None,
            unused_high: 0,
            pinned: Vec::new(),
        }
    }

    pub fn init(&mut self, io: IoRegion) -> Result<(), Error> {
        if self.io.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        debug!(
            "shmpool init: phys_base={:#x} virt_base={:#x} size={:#x}",
            io.phys_base, io.virt_base, io.size
        );
        self.unused_high = io.virt_base;
        self.io = Some(io);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.io.is_some()
    }

    pub fn region(&self) -> Option<&IoRegion> {
        self.io.as_ref()
    }

    fn io(&self) -> Result<&IoRegion, Error> {
        self.io.as_ref().ok_or(Error::NotInitialized)
    }

    /// Bump-allocate `size` bytes, returning the virtual base of the slice.
    pub fn alloc(&mut self, size: usize) -> Result<usize, Error> {
        let io = *self.io()?;
        let end = io.virt_base.checked_add(io.size).ok_or(Error::OutOfRange)?;
        let start = self.unused_high;
        let next = start.checked_add(size).ok_or(Error::OutOfRange)?;
        if next > end {
            return Err(Error::Exhausted);
        }
        self.unused_high = next;
        Ok(start)
    }

    /// Reserve `size` bytes at an explicit physical address (used to honor
    /// a CARVEOUT entry that pins a region by address rather than letting
    /// the bump allocator pick one, and to re-pin a region across a
    /// reattach after restart). Does not advance the bump cursor: the
    /// pinned region can sit anywhere in the mapped window, including
    /// below `unused_high`. Only overlap with a previously pinned range is
    /// rejected.
    pub fn alloc_at(&mut self, phys_addr: u64, size: usize) -> Result<usize, Error> {
        let io = *self.io()?;
        let virt = io.phys_to_virt(phys_addr).ok_or(Error::OutOfRange)?;
        let next = virt.checked_add(size).ok_or(Error::OutOfRange)?;
        let end = io.virt_base.checked_add(io.size).ok_or(Error::OutOfRange)?;
        if next > end {
            return Err(Error::Exhausted);
        }
        if self.pinned.iter().any(|&(s, e)| virt < e && s < next) {
            return Err(Error::OutOfRange);
        }
        self.pinned.push((virt, next));
        Ok(virt)
    }

    pub fn phys_to_virt(&self, phys: u64) -> Result<usize, Error> {
        self.io()?.phys_to_virt(phys).ok_or(Error::OutOfRange)
    }

    pub fn virt_to_phys(&self, virt: usize) -> Result<u64, Error> {
        self.io()?.virt_to_phys(virt).ok_or(Error::OutOfRange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> IoRegion {
        IoRegion {
            phys_base: 0x8000_0000,
            virt_base: 0x7f00_0000,
            size: 0x10_0000,
        }
    }

    #[test]
    fn double_init_fails() {
        let mut p = Pool::new();
        p.init(region()).unwrap();
        assert_eq!(p.init(region()).unwrap_err(), Error::AlreadyInitialized);
    }

    #[test]
    fn alloc_before_init_fails() {
        let mut p = Pool::new();
        assert_eq!(p.alloc(16).unwrap_err(), Error::NotInitialized);
    }

    #[test]
    fn bump_alloc_advances_and_exhausts() {
        let mut p = Pool::new();
        p.init(region()).unwrap();
        let a = p.alloc(0x100).unwrap();
        let b = p.alloc(0x100).unwrap();
        assert_eq!(b, a + 0x100);
        assert_eq!(p.alloc(0x10_0000).unwrap_err(), Error::Exhausted);
    }

    #[test]
    fn translation_round_trips() {
        let mut p = Pool::new();
        p.init(region()).unwrap();
        let virt = p.alloc(64).unwrap();
        let phys = p.virt_to_phys(virt).unwrap();
        assert_eq!(p.phys_to_virt(phys).unwrap(), virt);
        assert_eq!(phys, 0x8000_0000);
    }

    #[test]
    fn translation_out_of_range() {
        let mut p = Pool::new();
        p.init(region()).unwrap();
        assert_eq!(p.phys_to_virt(0x7fff_ffff).unwrap_err(), Error::OutOfRange);
        assert_eq!(p.phys_to_virt(0x8010_0000).unwrap_err(), Error::OutOfRange);
    }

    #[test]
    fn alloc_at_honors_carveout_address() {
        let mut p = Pool::new();
        p.init(region()).unwrap();
        let virt = p.alloc_at(0x8000_1000, 0x100).unwrap();
        assert_eq!(p.virt_to_phys(virt).unwrap(), 0x8000_1000);
        // overlapping the same pinned range is rejected
        assert_eq!(
            p.alloc_at(0x8000_1080, 0x10).unwrap_err(),
            Error::OutOfRange
        );
    }

    #[test]
    fn alloc_at_does_not_move_the_bump_cursor() {
        let mut p = Pool::new();
        p.init(region()).unwrap();
        p.alloc_at(0x8000_1000, 0x100).unwrap();
        let bumped = p.alloc(0x10).unwrap();
        assert_eq!(bumped, region().virt_base);
    }

    #[test]
    fn alloc_at_allows_reattach_below_a_later_bump_cursor() {
        let mut p = Pool::new();
        p.init(region()).unwrap();
        p.alloc(0x1000).unwrap();
        // a region below the current bump cursor can still be re-pinned,
        // e.g. on reattach after restart
        let virt = p.alloc_at(0x8000_0000, 0x10).unwrap();
        assert_eq!(virt, region().virt_base);
    }
}
