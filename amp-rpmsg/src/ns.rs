//! Name-service announcements: a fixed-format message sent over the
//! well-known name-service endpoint whenever a remote endpoint is
//! created or destroyed, so the host side can bind a matching local
//! service without any prior configuration.

pub const RPMSG_NS_EPT_ADDR: u32 = 0x35;
pub const RPMSG_ADDR_ANY: u32 = 0xFFFF_FFFF;
pub const NAME_SIZE: usize = 32;
pub const NS_MSG_SIZE: usize = NAME_SIZE + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsFlags {
    Create,
    Destroy,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Truncated,
    NameTooLong,
    UnknownFlags(u32),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsMsg {
    pub name: String,
    pub addr: u32,
    pub flags: NsFlags,
}

impl NsMsg {
    pub fn encode(&self, out: &mut [u8]) -> Result<(), Error> {
        if self.name.len() >= NAME_SIZE {
            return Err(Error::NameTooLong);
        }
        let buf = out.get_mut(..NS_MSG_SIZE).ok_or(Error::Truncated)?;
        buf.fill(0);
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[NAME_SIZE..NAME_SIZE + 4].copy_from_slice(&self.addr.to_le_bytes());
        let flags: u32 = match self.flags {
            NsFlags::Create => 0,
            NsFlags::Destroy => 1,
        };
        buf[NAME_SIZE + 4..NAME_SIZE + 8].copy_from_slice(&flags.to_le_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<NsMsg, Error> {
        let b = buf.get(..NS_MSG_SIZE).ok_or(Error::Truncated)?;
        let name_bytes = &b[..NAME_SIZE];
        let end = name_bytes.iter().position(|&c| c == 0).unwrap_or(NAME_SIZE);
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
        let addr = u32::from_le_bytes(b[NAME_SIZE..NAME_SIZE + 4].try_into().unwrap());
        let raw_flags = u32::from_le_bytes(b[NAME_SIZE + 4..NAME_SIZE + 8].try_into().unwrap());
        let flags = match raw_flags {
            0 => NsFlags::Create,
            1 => NsFlags::Destroy,
            other => return Err(Error::UnknownFlags(other)),
        };
        Ok(NsMsg { name, addr, flags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_msg_round_trips() {
        let msg = NsMsg {
            name: "rpmsg-rpc".to_string(),
            addr: 0x10,
            flags: NsFlags::Create,
        };
        let mut buf = [0u8; NS_MSG_SIZE];
        msg.encode(&mut buf).unwrap();
        assert_eq!(NsMsg::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn destroy_flag_round_trips() {
        let msg = NsMsg {
            name: "rpmsg-rpc".to_string(),
            addr: 0x10,
            flags: NsFlags::Destroy,
        };
        let mut buf = [0u8; NS_MSG_SIZE];
        msg.encode(&mut buf).unwrap();
        assert_eq!(NsMsg::decode(&buf).unwrap().flags, NsFlags::Destroy);
    }

    #[test]
    fn unknown_flags_rejected() {
        let mut buf = [0u8; NS_MSG_SIZE];
        buf[NAME_SIZE + 4..NAME_SIZE + 8].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(NsMsg::decode(&buf).unwrap_err(), Error::UnknownFlags(7));
    }
}
