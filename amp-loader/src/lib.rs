//! Turns a firmware image into a set of physical-address segments plus an
//! entry point and, when present, the location of the embedded resource
//! table. Two formats are understood: a 64-bit little-endian ELF (the
//! normal case) and a raw blob loaded whole at a caller-supplied address.
//!
//! Which format was used is always returned explicitly in
//! [`LoadedImage::format`] rather than inferred after the fact from a
//! failed parse, so a caller never has to guess why ELF parsing didn't
//! happen.

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Elf,
    RawBlob,
}

#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub paddr: u64,
    pub data_offset: usize,
    pub filesz: usize,
    pub memsz: usize,
}

#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub format: ImageFormat,
    pub entry: u64,
    pub segments: Vec<Segment>,
    /// (physical address, size) of the `.resource_table` section, if the
    /// image carries one.
    pub resource_table: Option<(u64, usize)>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    TooShort,
    UnsupportedClass,
    UnsupportedEndian,
    Truncated,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;

fn u16le(b: &[u8], off: usize) -> Result<u16, Error> {
    let s = b.get(off..off + 2).ok_or(Error::Truncated)?;
    Ok(u16::from_le_bytes([s[0], s[1]]))
}

fn u32le(b: &[u8], off: usize) -> Result<u32, Error> {
    let s = b.get(off..off + 4).ok_or(Error::Truncated)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn u64le(b: &[u8], off: usize) -> Result<u64, Error> {
    let s = b.get(off..off + 8).ok_or(Error::Truncated)?;
    Ok(u64::from_le_bytes(s.try_into().unwrap()))
}

/// Loads `bytes` as an ELF image if it carries the ELF magic, otherwise as
/// a raw blob placed at `raw_load_addr`.
pub fn load(bytes: &[u8], raw_load_addr: u64) -> Result<LoadedImage, Error> {
    if bytes.len() >= 4 && &bytes[0..4] == ELF_MAGIC {
        parse_elf64(bytes)
    } else {
        debug!("amp-loader: no ELF magic, treating as raw blob");
        Ok(LoadedImage {
            format: ImageFormat::RawBlob,
            entry: raw_load_addr,
            segments: vec![Segment {
                paddr: raw_load_addr,
                data_offset: 0,
                filesz: bytes.len(),
                memsz: bytes.len(),
            }],
            resource_table: None,
        })
    }
}

fn parse_elf64(b: &[u8]) -> Result<LoadedImage, Error> {
    if b.len() < 64 {
        return Err(Error::TooShort);
    }
    if b[4] != ELFCLASS64 {
        return Err(Error::UnsupportedClass);
    }
    if b[5] != ELFDATA2LSB {
        return Err(Error::UnsupportedEndian);
    }

    let entry = u64le(b, 24)?;
    let phoff = u64le(b, 32)? as usize;
    let shoff = u64le(b, 40)? as usize;
    let phentsize = u16le(b, 54)? as usize;
    let phnum = u16le(b, 56)? as usize;
    let shentsize = u16le(b, 58)? as usize;
    let shnum = u16le(b, 60)? as usize;
    let shstrndx = u16le(b, 62)? as usize;

    let mut segments = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        let p_type = u32le(b, off)?;
        if p_type != PT_LOAD {
            continue;
        }
        let p_offset = u64le(b, off + 8)? as usize;
        let p_paddr = u64le(b, off + 24)?;
        let p_filesz = u64le(b, off + 32)? as usize;
        let p_memsz = u64le(b, off + 40)? as usize;
        if b.get(p_offset..p_offset + p_filesz).is_none() {
            return Err(Error::Truncated);
        }
        segments.push(Segment {
            paddr: p_paddr,
            data_offset: p_offset,
            filesz: p_filesz,
            memsz: p_memsz,
        });
    }

    let resource_table = find_resource_table(b, shoff, shentsize, shnum, shstrndx)?;

    debug!(
        "amp-loader: elf entry={:#x} segments={} rsc_table={:?}",
        entry,
        segments.len(),
        resource_table
    );

    Ok(LoadedImage {
        format: ImageFormat::Elf,
        entry,
        segments,
        resource_table,
    })
}

fn find_resource_table(
    b: &[u8],
    shoff: usize,
    shentsize: usize,
    shnum: usize,
    shstrndx: usize,
) -> Result<Option<(u64, usize)>, Error> {
    if shnum == 0 || shentsize == 0 {
        return Ok(None);
    }
    let strtab_hdr_off = shoff + shstrndx * shentsize;
    let strtab_off = u64le(b, strtab_hdr_off + 24)? as usize;
    let strtab_size = u64le(b, strtab_hdr_off + 32)? as usize;
    let strtab = b.get(strtab_off..strtab_off + strtab_size).ok_or(Error::Truncated)?;

    for i in 0..shnum {
        let off = shoff + i * shentsize;
        let name_off = u32le(b, off)? as usize;
        let name = read_cstr(strtab, name_off)?;
        if name == b".resource_table" {
            let sh_addr = u64le(b, off + 16)?;
            let sh_size = u64le(b, off + 32)? as usize;
            return Ok(Some((sh_addr, sh_size)));
        }
    }
    Ok(None)
}

fn read_cstr(b: &[u8], off: usize) -> Result<&[u8], Error> {
    let tail = b.get(off..).ok_or(Error::Truncated)?;
    let end = tail.iter().position(|&c| c == 0).ok_or(Error::Truncated)?;
    Ok(&tail[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_elf() -> Vec<u8> {
        // ehdr(64) + 1 phdr(56, PT_LOAD) + 1 segment payload(16) +
        // shstrtab(".resource_table\0", 17 bytes) + 2 shdrs(64 each, idx0=null,
        // idx1=.resource_table pointing back at the segment payload)
        let mut img = vec![0u8; 64];
        img[0..4].copy_from_slice(ELF_MAGIC);
        img[4] = ELFCLASS64;
        img[5] = ELFDATA2LSB;
        img[24..32].copy_from_slice(&0x1000u64.to_le_bytes()); // e_entry
        img[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        img[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        img[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        img[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
        img[60..62].copy_from_slice(&2u16.to_le_bytes()); // e_shnum
        img[62..64].copy_from_slice(&1u16.to_le_bytes()); // e_shstrndx

        let payload_off = 64 + 56;
        let mut phdr = vec![0u8; 56];
        phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        phdr[8..16].copy_from_slice(&(payload_off as u64).to_le_bytes()); // p_offset
        phdr[24..32].copy_from_slice(&0x1000u64.to_le_bytes()); // p_paddr
        phdr[32..40].copy_from_slice(&16u64.to_le_bytes()); // p_filesz
        phdr[40..48].copy_from_slice(&16u64.to_le_bytes()); // p_memsz
        img.extend_from_slice(&phdr);

        let payload = vec![0xABu8; 16];
        img.extend_from_slice(&payload);

        let shstrtab_off = img.len();
        let mut shstrtab = vec![0u8]; // index 0: empty name
        shstrtab.extend_from_slice(b".resource_table\0");
        img.extend_from_slice(&shstrtab);

        let shoff = img.len();
        let mut shdr0 = vec![0u8; 64]; // null section
        let mut shdr1 = vec![0u8; 64];
        shdr1[0..4].copy_from_slice(&1u32.to_le_bytes()); // sh_name = offset 1 in shstrtab
        shdr1[16..24].copy_from_slice(&0x1000u64.to_le_bytes()); // sh_addr
        shdr1[24..32].copy_from_slice(&(payload_off as u64).to_le_bytes()); // sh_offset
        shdr1[32..40].copy_from_slice(&16u64.to_le_bytes()); // sh_size
        img.extend_from_slice(&shdr0);
        img.extend_from_slice(&shdr1);

        img[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
        // fix up shstrtab section header's own location isn't needed since
        // shstrndx points at shdr0 slot conceptually; patch shdr0 to describe
        // the shstrtab region instead so find_resource_table can read it.
        let shdr0_off = shoff;
        img[shdr0_off + 24..shdr0_off + 32]
            .copy_from_slice(&(shstrtab_off as u64).to_le_bytes());
        img[shdr0_off + 32..shdr0_off + 40]
            .copy_from_slice(&(shstrtab.len() as u64).to_le_bytes());

        img
    }

    #[test]
    fn raw_blob_when_no_magic() {
        let img = load(&[1, 2, 3, 4], 0x4000_0000).unwrap();
        assert_eq!(img.format, ImageFormat::RawBlob);
        assert_eq!(img.entry, 0x4000_0000);
        assert_eq!(img.segments.len(), 1);
        assert_eq!(img.segments[0].filesz, 4);
        assert!(img.resource_table.is_none());
    }

    #[test]
    fn elf_entry_and_segment_and_resource_table() {
        let img = load(&fake_elf(), 0).unwrap();
        assert_eq!(img.format, ImageFormat::Elf);
        assert_eq!(img.entry, 0x1000);
        assert_eq!(img.segments.len(), 1);
        assert_eq!(img.segments[0].paddr, 0x1000);
        assert_eq!(img.segments[0].filesz, 16);
        assert_eq!(img.resource_table, Some((0x1000, 16)));
    }

    #[test]
    fn truncated_elf_rejected() {
        let bytes = ELF_MAGIC.to_vec();
        assert_eq!(load(&bytes, 0).unwrap_err(), Error::TooShort);
    }
}
