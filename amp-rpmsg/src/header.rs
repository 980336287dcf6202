//! The fixed rpmsg wire header: src/dst addresses, a reserved word, and a
//! length/flags pair, little-endian, 16 bytes, followed immediately by the
//! payload. Parsed by hand rather than cast through a `#[repr(packed)]`
//! struct since the backing buffer isn't guaranteed to be aligned.

pub const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src: u32,
    pub dst: u32,
    pub reserved: u32,
    pub len: u16,
    pub flags: u16,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Truncated,
    PayloadTooLong,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl Header {
    pub fn encode(&self, out: &mut [u8]) -> Result<(), Error> {
        let buf = out.get_mut(..HEADER_SIZE).ok_or(Error::Truncated)?;
        buf[0..4].copy_from_slice(&self.src.to_le_bytes());
        buf[4..8].copy_from_slice(&self.dst.to_le_bytes());
        buf[8..12].copy_from_slice(&self.reserved.to_le_bytes());
        buf[12..14].copy_from_slice(&self.len.to_le_bytes());
        buf[14..16].copy_from_slice(&self.flags.to_le_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Header, Error> {
        let b = buf.get(..HEADER_SIZE).ok_or(Error::Truncated)?;
        Ok(Header {
            src: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            dst: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            reserved: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            len: u16::from_le_bytes(b[12..14].try_into().unwrap()),
            flags: u16::from_le_bytes(b[14..16].try_into().unwrap()),
        })
    }
}

/// Encodes a full frame (header + payload) into `out`, returning the
/// number of bytes written.
pub fn encode_frame(header: &Header, payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::PayloadTooLong);
    }
    let total = HEADER_SIZE + payload.len();
    let buf = out.get_mut(..total).ok_or(Error::Truncated)?;
    header.encode(&mut buf[..HEADER_SIZE])?;
    buf[HEADER_SIZE..].copy_from_slice(payload);
    Ok(total)
}

/// Decodes a full frame, returning the header and a slice over just its
/// payload (`header.len` bytes, not whatever trailing space `buf` has).
pub fn decode_frame(buf: &[u8]) -> Result<(Header, &[u8]), Error> {
    let header = Header::decode(buf)?;
    let payload = buf
        .get(HEADER_SIZE..HEADER_SIZE + header.len as usize)
        .ok_or(Error::Truncated)?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let header = Header {
            src: 0x10,
            dst: 0x35,
            reserved: 0,
            len: 5,
            flags: 0,
        };
        let mut buf = [0u8; 64];
        let n = encode_frame(&header, b"hello", &mut buf).unwrap();
        assert_eq!(n, HEADER_SIZE + 5);

        let (decoded, payload) = decode_frame(&buf[..n]).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn truncated_header_rejected() {
        let buf = [0u8; 10];
        assert_eq!(Header::decode(&buf).unwrap_err(), Error::Truncated);
    }

    #[test]
    fn truncated_payload_rejected() {
        let header = Header { src: 1, dst: 2, reserved: 0, len: 100, flags: 0 };
        let mut buf = [0u8; HEADER_SIZE + 4];
        header.encode(&mut buf).unwrap();
        assert_eq!(decode_frame(&buf).unwrap_err(), Error::Truncated);
    }
}
