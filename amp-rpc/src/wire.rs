//! Request/reply framing carried inside an rpmsg payload. Unlike the
//! original's hand-packed C structs, the wire encoding here is this crate's
//! own: `bincode` over plain Rust structs, since nothing on the wire needs
//! to match a foreign ABI.

use bincode::{Decode, Encode};

/// Conservative rpmsg payload budget: headroom below the 512-byte class of
/// buffer `amp-rpmsg`'s sender carves, after the rpc header itself.
pub const MAX_RPC_PAYLOAD: usize = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Overlong = 1,
    InvalidId = 2,
    NoMemory = 3,
    Invalid = 4,
    Corrupted = 5,
    NotSupported = 6,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Request {
    pub trace_id: u32,
    pub function_id: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Reply {
    pub trace_id: u32,
    pub status: Status,
    pub errnum: i32,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn ok(trace_id: u32, body: Vec<u8>) -> Self {
        Self {
            trace_id,
            status: Status::Ok,
            errnum: 0,
            body,
        }
    }

    pub fn err(trace_id: u32, status: Status, errnum: i32) -> Self {
        Self {
            trace_id,
            status,
            errnum,
            body: Vec::new(),
        }
    }

    /// Builds a reply from a syscall-style `Result<T, i32>` where the error
    /// is an errno value, encoding `T` as the reply body on success.
    pub fn from_result<T: Encode>(trace_id: u32, result: Result<T, i32>) -> Self {
        match result {
            Ok(v) => {
                let body = bincode::encode_to_vec(&v, bincode::config::standard())
                    .unwrap_or_default();
                Self::ok(trace_id, body)
            }
            Err(errno) => Self::err(trace_id, Status::Ok, errno),
        }
    }
}

pub fn decode_request(buf: &[u8]) -> Result<Request, bincode::error::DecodeError> {
    let (req, _) = bincode::decode_from_slice(buf, bincode::config::standard())?;
    Ok(req)
}

pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    bincode::encode_to_vec(reply, bincode::config::standard())
        .expect("Reply encoding is infallible for owned data")
}

/// One entry of a `getaddrinfo` result list, mirroring the original's
/// `iaddrinfo_t` header fields plus the trailing sockaddr bytes and
/// optional canonical name, without needing to share its exact C layout.
#[derive(Debug, Clone, Encode, Decode)]
pub struct AddrInfoEntry {
    pub flags: i32,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: Vec<u8>,
    pub canonname: Option<String>,
}

/// A resolved host record, mirroring `hostent`'s shape without its pointer
/// chasing: a name, alias list, and a flat list of fixed-length address
/// bytes (length implied by `addrtype`/`length`).
#[derive(Debug, Clone, Encode, Decode)]
pub struct HostEntry {
    pub name: Option<String>,
    pub aliases: Vec<String>,
    pub addrtype: i32,
    pub length: i32,
    pub addresses: Vec<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = Request {
            trace_id: 7,
            function_id: 3,
            body: vec![1, 2, 3],
        };
        let bytes = bincode::encode_to_vec(&req, bincode::config::standard()).unwrap();
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded.trace_id, 7);
        assert_eq!(decoded.body, vec![1, 2, 3]);
    }

    #[test]
    fn reply_round_trips() {
        let reply = Reply::ok(9, vec![42]);
        let bytes = encode_reply(&reply);
        let (decoded, _): (Reply, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded.trace_id, 9);
        assert_eq!(decoded.status, Status::Ok);
        assert_eq!(decoded.body, vec![42]);
    }

    #[test]
    fn addrinfo_entry_round_trips() {
        let e = AddrInfoEntry {
            flags: 0,
            family: libc::AF_INET,
            socktype: libc::SOCK_STREAM,
            protocol: 0,
            addr: vec![1, 2, 3, 4],
            canonname: Some("host.example".to_string()),
        };
        let bytes = bincode::encode_to_vec(&e, bincode::config::standard()).unwrap();
        let (decoded, _): (AddrInfoEntry, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded.family, libc::AF_INET);
        assert_eq!(decoded.canonname.as_deref(), Some("host.example"));
    }
}
