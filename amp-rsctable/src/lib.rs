//! Walks and patches a binary resource table: a small header (version,
//! entry count, an offset array) followed by fixed-layout entries scattered
//! at those offsets. Four entry kinds are load-time only (CARVEOUT, DEVMEM,
//! TRACE, VDEV); two are mutated after the remote core has started
//! (EPT_TABLE, RBUF_PAIR) and must go through [`CacheFlush`] so the remote
//! side observes the write.

use std::convert::TryInto;

pub const NAME_SIZE: usize = 32;
pub const MAX_NUM_OF_EPTS: usize = 64;

pub const RSC_CARVEOUT: u32 = 0;
pub const RSC_DEVMEM: u32 = 1;
pub const RSC_TRACE: u32 = 2;
pub const RSC_VDEV: u32 = 3;
pub const RSC_VENDOR_EPT_TABLE: u32 = 128;
pub const RSC_VENDOR_RBUF_PAIR: u32 = 129;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Truncated,
    BadVersion,
    NotFound,
    TooManyEndpoints,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

/// Lets a caller flush a byte range back to wherever the remote core reads
/// it from (a dcache flush, a write to an ivshmem-backed mmap, or nothing
/// at all on a coherent system). Table code calls this after every mutating
/// write; what it actually does is not this crate's concern.
pub trait CacheFlush {
    fn flush(&mut self, offset: usize, len: usize);
}

/// A flush that does nothing, for coherent backends or tests.
pub struct NoFlush;
impl CacheFlush for NoFlush {
    fn flush(&mut self, _offset: usize, _len: usize) {}
}

fn u32le(b: &[u8], off: usize) -> Result<u32, Error> {
    let s = b.get(off..off + 4).ok_or(Error::Truncated)?;
    Ok(u32::from_le_bytes(s.try_into().unwrap()))
}

fn u64le(b: &[u8], off: usize) -> Result<u64, Error> {
    let s = b.get(off..off + 8).ok_or(Error::Truncated)?;
    Ok(u64::from_le_bytes(s.try_into().unwrap()))
}

fn name_at(b: &[u8], off: usize) -> Result<[u8; NAME_SIZE], Error> {
    let s = b.get(off..off + NAME_SIZE).ok_or(Error::Truncated)?;
    let mut name = [0u8; NAME_SIZE];
    name.copy_from_slice(s);
    Ok(name)
}

pub struct Header {
    pub version: u32,
    pub num: u32,
    offsets_at: usize,
}

/// Parses the header and validates that every offset in the offset array
/// lands inside `buf`. Entry contents beyond the first `u32` type tag are
/// not validated here; each typed accessor bounds-checks its own fields.
pub fn parse_header(buf: &[u8]) -> Result<Header, Error> {
    let version = u32le(buf, 0)?;
    if version != 1 {
        return Err(Error::BadVersion);
    }
    let num = u32le(buf, 4)?;
    let offsets_at = 16;
    for i in 0..num as usize {
        let off = u32le(buf, offsets_at + i * 4)? as usize;
        if off >= buf.len() {
            return Err(Error::Truncated);
        }
    }
    Ok(Header {
        version,
        num,
        offsets_at,
    })
}

fn offset_of(buf: &[u8], header: &Header, index: usize) -> Result<usize, Error> {
    if index as u32 >= header.num {
        return Err(Error::NotFound);
    }
    Ok(u32le(buf, header.offsets_at + index * 4)? as usize)
}

/// Mirrors `find_rsc`: returns the byte offset of the `index`-th entry of
/// `rsc_type`, scanning entries in table order.
pub fn find(buf: &[u8], header: &Header, rsc_type: u32, mut index: usize) -> Result<usize, Error> {
    for i in 0..header.num as usize {
        let off = offset_of(buf, header, i)?;
        if u32le(buf, off)? == rsc_type {
            if index == 0 {
                return Ok(off);
            }
            index -= 1;
        }
    }
    Err(Error::NotFound)
}

#[derive(Debug, Clone, Copy)]
pub struct Carveout {
    pub da: u32,
    pub pa: u32,
    pub len: u32,
    pub flags: u32,
    pub name: [u8; NAME_SIZE],
}

pub fn read_carveout(buf: &[u8], off: usize) -> Result<Carveout, Error> {
    Ok(Carveout {
        da: u32le(buf, off + 4)?,
        pa: u32le(buf, off + 8)?,
        len: u32le(buf, off + 12)?,
        flags: u32le(buf, off + 16)?,
        name: name_at(buf, off + 24)?,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Devmem {
    pub da: u32,
    pub pa: u32,
    pub len: u32,
    pub flags: u32,
    pub name: [u8; NAME_SIZE],
}

pub fn read_devmem(buf: &[u8], off: usize) -> Result<Devmem, Error> {
    Ok(Devmem {
        da: u32le(buf, off + 4)?,
        pa: u32le(buf, off + 8)?,
        len: u32le(buf, off + 12)?,
        flags: u32le(buf, off + 16)?,
        name: name_at(buf, off + 24)?,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Trace {
    pub da: u32,
    pub len: u32,
    pub name: [u8; NAME_SIZE],
}

pub fn read_trace(buf: &[u8], off: usize) -> Result<Trace, Error> {
    Ok(Trace {
        da: u32le(buf, off + 4)?,
        len: u32le(buf, off + 8)?,
        name: name_at(buf, off + 16)?,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct VringDesc {
    pub da: u32,
    pub align: u32,
    pub num: u32,
    pub notifyid: u32,
}

#[derive(Debug, Clone)]
pub struct Vdev {
    pub id: u32,
    pub notifyid: u32,
    pub dfeatures: u32,
    pub gfeatures: u32,
    pub config_len: u32,
    pub status: u32,
    pub vrings: Vec<VringDesc>,
}

pub fn read_vdev(buf: &[u8], off: usize) -> Result<Vdev, Error> {
    let id = u32le(buf, off + 4)?;
    let notifyid = u32le(buf, off + 8)?;
    let dfeatures = u32le(buf, off + 12)?;
    let gfeatures = u32le(buf, off + 16)?;
    let config_len = u32le(buf, off + 20)?;
    let status = u32le(buf, off + 24)?;
    let num_of_vrings = u32le(buf, off + 28)? as usize;

    let vrings_at = off + 40;
    let mut vrings = Vec::with_capacity(num_of_vrings);
    for i in 0..num_of_vrings {
        let voff = vrings_at + i * 20;
        vrings.push(VringDesc {
            da: u32le(buf, voff)?,
            align: u32le(buf, voff + 4)?,
            num: u32le(buf, voff + 8)?,
            notifyid: u32le(buf, voff + 12)?,
        });
    }

    Ok(Vdev {
        id,
        notifyid,
        dfeatures,
        gfeatures,
        config_len,
        status,
        vrings,
    })
}

/// Writes back the device address the host chose for one of a VDEV's
/// vrings (the host owns vring memory allocation; the firmware only knows
/// the address once the table is patched after load, before start).
pub fn write_vdev_vring_da(
    buf: &mut [u8],
    vdev_off: usize,
    vring_index: usize,
    da: u32,
    flush: &mut dyn CacheFlush,
) -> Result<(), Error> {
    let field_off = vdev_off + 40 + vring_index * 20;
    let field = buf.get_mut(field_off..field_off + 4).ok_or(Error::Truncated)?;
    field.copy_from_slice(&da.to_le_bytes());
    flush.flush(field_off, 4);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct EptInfo {
    pub name: [u8; NAME_SIZE],
    pub addr: u32,
    pub dest_addr: u32,
}

const EPT_ENTRY_SIZE: usize = NAME_SIZE + 8;
const EPT_TABLE_HEADER: usize = 8;

pub fn read_ept_table(buf: &[u8], off: usize) -> Result<Vec<EptInfo>, Error> {
    let num = u32le(buf, off + 4)? as usize;
    let mut out = Vec::with_capacity(num);
    for i in 0..num {
        let eoff = off + EPT_TABLE_HEADER + i * EPT_ENTRY_SIZE;
        out.push(EptInfo {
            name: name_at(buf, eoff)?,
            addr: u32le(buf, eoff + NAME_SIZE)?,
            dest_addr: u32le(buf, eoff + NAME_SIZE + 4)?,
        });
    }
    Ok(out)
}

/// Rewrites the whole EPT_TABLE entry from scratch (the way the remote
/// endpoint table is republished after every bind/destroy), then flushes
/// it in one shot.
pub fn write_ept_table(
    buf: &mut [u8],
    off: usize,
    epts: &[EptInfo],
    flush: &mut dyn CacheFlush,
) -> Result<(), Error> {
    if epts.len() > MAX_NUM_OF_EPTS {
        return Err(Error::TooManyEndpoints);
    }
    let total = EPT_TABLE_HEADER + MAX_NUM_OF_EPTS * EPT_ENTRY_SIZE;
    let region = buf.get_mut(off..off + total).ok_or(Error::Truncated)?;
    region.fill(0);
    region[0..4].copy_from_slice(&RSC_VENDOR_EPT_TABLE.to_le_bytes());
    region[4..8].copy_from_slice(&(epts.len() as u32).to_le_bytes());
    for (i, ept) in epts.iter().enumerate() {
        let eoff = EPT_TABLE_HEADER + i * EPT_ENTRY_SIZE;
        region[eoff..eoff + NAME_SIZE].copy_from_slice(&ept.name);
        region[eoff + NAME_SIZE..eoff + NAME_SIZE + 4].copy_from_slice(&ept.addr.to_le_bytes());
        region[eoff + NAME_SIZE + 4..eoff + NAME_SIZE + 8]
            .copy_from_slice(&ept.dest_addr.to_le_bytes());
    }
    flush.flush(off, total);
    Ok(())
}

/// A shared-buffer-pair descriptor whose `state` word is the only field
/// that changes after setup: 0 means not yet ready, 1 means the remote
/// side may start consuming it.
#[derive(Debug, Clone, Copy)]
pub struct RbufPair {
    pub state: u32,
    pub tx_pa: u64,
    pub tx_len: u32,
    pub rx_pa: u64,
    pub rx_len: u32,
}

const RBUF_STATE_OFFSET: usize = 4;

/// `state` values the remote side polls for, mirroring the original
/// `rbuf_dev.c`'s `RBUF_STATE_*` enum: not yet ready, and ready for the
/// remote to start consuming.
pub const RBUF_STATE_UNINIT: u32 = 0;
pub const RBUF_STATE_INIT: u32 = 1;

pub fn read_rbuf_pair(buf: &[u8], off: usize) -> Result<RbufPair, Error> {
    Ok(RbufPair {
        state: u32le(buf, off + RBUF_STATE_OFFSET)?,
        tx_pa: u64le(buf, off + 8)?,
        tx_len: u32le(buf, off + 16)?,
        rx_pa: u64le(buf, off + 20)?,
        rx_len: u32le(buf, off + 28)?,
    })
}

/// Mutates only the `state` word and flushes only that word, per the
/// invariant that live fields are single words written and flushed alone.
pub fn set_rbuf_pair_state(
    buf: &mut [u8],
    off: usize,
    state: u32,
    flush: &mut dyn CacheFlush,
) -> Result<(), Error> {
    let field_off = off + RBUF_STATE_OFFSET;
    let field = buf
        .get_mut(field_off..field_off + 4)
        .ok_or(Error::Truncated)?;
    field.copy_from_slice(&state.to_le_bytes());
    flush.flush(field_off, 4);
    Ok(())
}

/// Writes back the physical addresses the host chose for the tx/rx halves
/// of the pair, once allocated from the shared-memory pool. Addresses are
/// the only fields the host assigns; `tx_len`/`rx_len` are declared by the
/// firmware and read-only here.
pub fn write_rbuf_pair_addrs(
    buf: &mut [u8],
    off: usize,
    tx_pa: u64,
    rx_pa: u64,
    flush: &mut dyn CacheFlush,
) -> Result<(), Error> {
    let tx_field = buf.get_mut(off + 8..off + 16).ok_or(Error::Truncated)?;
    tx_field.copy_from_slice(&tx_pa.to_le_bytes());
    let rx_field = buf.get_mut(off + 20..off + 28).ok_or(Error::Truncated)?;
    rx_field.copy_from_slice(&rx_pa.to_le_bytes());
    flush.flush(off + 8, 8);
    flush.flush(off + 20, 8);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_ept_and_rbuf() -> Vec<u8> {
        let mut buf = vec![0u8; 16 + 2 * 4];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes()); // version
        buf[4..8].copy_from_slice(&2u32.to_le_bytes()); // num

        let ept_off = buf.len();
        buf[16..20].copy_from_slice(&(ept_off as u32).to_le_bytes());
        buf.extend(vec![0u8; EPT_TABLE_HEADER + MAX_NUM_OF_EPTS * EPT_ENTRY_SIZE]);
        buf[ept_off..ept_off + 4].copy_from_slice(&RSC_VENDOR_EPT_TABLE.to_le_bytes());

        let rbuf_off = buf.len();
        buf[20..24].copy_from_slice(&(rbuf_off as u32).to_le_bytes());
        buf.extend(vec![0u8; 32]);
        buf[rbuf_off..rbuf_off + 4].copy_from_slice(&RSC_VENDOR_RBUF_PAIR.to_le_bytes());

        buf
    }

    #[test]
    fn find_locates_entries_by_type() {
        let buf = table_with_ept_and_rbuf();
        let header = parse_header(&buf).unwrap();
        let ept_off = find(&buf, &header, RSC_VENDOR_EPT_TABLE, 0).unwrap();
        assert_eq!(u32le(&buf, ept_off).unwrap(), RSC_VENDOR_EPT_TABLE);
        let rbuf_off = find(&buf, &header, RSC_VENDOR_RBUF_PAIR, 0).unwrap();
        assert_eq!(u32le(&buf, rbuf_off).unwrap(), RSC_VENDOR_RBUF_PAIR);
        assert_eq!(
            find(&buf, &header, RSC_VENDOR_RBUF_PAIR, 1).unwrap_err(),
            Error::NotFound
        );
    }

    #[test]
    fn ept_table_round_trips() {
        let mut buf = table_with_ept_and_rbuf();
        let header = parse_header(&buf).unwrap();
        let off = find(&buf, &header, RSC_VENDOR_EPT_TABLE, 0).unwrap();

        let mut name = [0u8; NAME_SIZE];
        name[..4].copy_from_slice(b"rpc\0");
        let epts = vec![EptInfo {
            name,
            addr: 0x10,
            dest_addr: 0x20,
        }];
        write_ept_table(&mut buf, off, &epts, &mut NoFlush).unwrap();

        let read_back = read_ept_table(&buf, off).unwrap();
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].addr, 0x10);
        assert_eq!(read_back[0].dest_addr, 0x20);
    }

    #[test]
    fn rbuf_pair_state_is_the_only_thing_touched() {
        let mut buf = table_with_ept_and_rbuf();
        let header = parse_header(&buf).unwrap();
        let off = find(&buf, &header, RSC_VENDOR_RBUF_PAIR, 0).unwrap();

        buf[off + 8..off + 16].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes()); // tx_pa
        set_rbuf_pair_state(&mut buf, off, RBUF_STATE_INIT, &mut NoFlush).unwrap();

        let rbuf = read_rbuf_pair(&buf, off).unwrap();
        assert_eq!(rbuf.state, RBUF_STATE_INIT);
        assert_eq!(rbuf.tx_pa, 0xDEAD_BEEF);
    }

    #[test]
    fn rbuf_pair_addrs_round_trip() {
        let mut buf = table_with_ept_and_rbuf();
        let header = parse_header(&buf).unwrap();
        let off = find(&buf, &header, RSC_VENDOR_RBUF_PAIR, 0).unwrap();

        write_rbuf_pair_addrs(&mut buf, off, 0x1000, 0x2000, &mut NoFlush).unwrap();
        let rbuf = read_rbuf_pair(&buf, off).unwrap();
        assert_eq!(rbuf.tx_pa, 0x1000);
        assert_eq!(rbuf.rx_pa, 0x2000);
        assert_eq!(rbuf.state, RBUF_STATE_UNINIT);
    }

    #[test]
    fn vring_da_patch_writes_only_that_vring() {
        let mut buf = vec![0u8; 40 + 2 * 20];
        write_vdev_vring_da(&mut buf, 0, 1, 0xCAFE, &mut NoFlush).unwrap();
        assert_eq!(u32le(&buf, 40).unwrap(), 0);
        assert_eq!(u32le(&buf, 40 + 20).unwrap(), 0xCAFE);
    }

    #[test]
    fn too_many_endpoints_rejected() {
        let mut buf = table_with_ept_and_rbuf();
        let header = parse_header(&buf).unwrap();
        let off = find(&buf, &header, RSC_VENDOR_EPT_TABLE, 0).unwrap();
        let epts = vec![
            EptInfo {
                name: [0; NAME_SIZE],
                addr: 0,
                dest_addr: 0
            };
            MAX_NUM_OF_EPTS + 1
        ];
        assert_eq!(
            write_ept_table(&mut buf, off, &epts, &mut NoFlush).unwrap_err(),
            Error::TooManyEndpoints
        );
    }
}
