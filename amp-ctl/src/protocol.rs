//! Wire types for the control plane, grounded in the original's
//! `socket_listener.c`: a well-known create socket that takes a
//! `struct create_msg { cpu, name, path }` in one `recv`, and a per-client
//! socket that takes a short plain-text verb (`start`/`stop`/`status`) and
//! replies with one line.

use bincode::{Decode, Encode};

/// Directory the daemon publishes its sockets under, mirrors
/// `MICA_SOCKET_DIRECTORY`.
pub const SOCKET_DIR: &str = "/run/amp";
/// Name of the well-known socket that takes create requests, mirrors the
/// original's `"mica-create"` listener name.
pub const CREATE_SOCKET_NAME: &str = "amp-create";

/// One-shot read/write size budgets. The originals used fixed-size
/// `recv()` buffers rather than length-prefixed framing; a create request
/// and a verb command both comfortably fit in a single read on a
/// `SOCK_STREAM` socket in practice, so this crate keeps that shape.
pub const MAX_CREATE_MSG: usize = 512;
pub const MAX_VERB_MSG: usize = 32;
pub const MAX_RESPONSE_MSG: usize = 512;

pub const MSG_SUCCESS: &str = "AMP-SUCCESS";
pub const MSG_FAILED: &str = "AMP-FAILED";

/// Mirrors `struct create_msg`, minus the fixed-size char arrays: a client
/// is identified by `name`, runs on `cpu`, and boots from `firmware_path`.
#[derive(Debug, Clone, Encode, Decode)]
pub struct CreateRequest {
    pub cpu: u32,
    pub name: String,
    pub firmware_path: String,
}

/// The three verbs `client_ctrl_handler` recognizes over a per-client
/// socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
    Status,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Status => "status",
        }
    }
}

impl std::str::FromStr for Verb {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "start" => Ok(Verb::Start),
            "stop" => Ok(Verb::Stop),
            "status" => Ok(Verb::Status),
            _ => Err(()),
        }
    }
}

/// Path a client's control socket lives at, `<dir>/<name>.socket`.
pub fn client_socket_path(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    dir.join(format!("{name}.socket"))
}

/// Path the well-known create socket lives at.
pub fn create_socket_path(dir: &std::path::Path) -> std::path::PathBuf {
    dir.join(format!("{CREATE_SOCKET_NAME}.socket"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn create_request_round_trips() {
        let req = CreateRequest {
            cpu: 2,
            name: "rt0".to_string(),
            firmware_path: "/lib/firmware/rt0.elf".to_string(),
        };
        let bytes = bincode::encode_to_vec(&req, bincode::config::standard()).unwrap();
        let (decoded, _): (CreateRequest, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded.cpu, 2);
        assert_eq!(decoded.name, "rt0");
    }

    #[test]
    fn verb_parses_case_sensitively_and_trims_whitespace() {
        assert_eq!(Verb::from_str("start\n"), Ok(Verb::Start));
        assert_eq!(Verb::from_str("bogus"), Err(()));
    }

    #[test]
    fn client_socket_path_matches_the_name_dot_socket_convention() {
        let dir = std::path::Path::new("/run/amp");
        assert_eq!(client_socket_path(dir, "rt0"), dir.join("rt0.socket"));
    }
}
