//! The local control plane: UNIX-domain sockets a CLI uses to create,
//! start, stop, and query clients, grounded in the original's
//! `socket_listener.c`. One well-known socket accepts create requests;
//! each created client gets its own socket accepting `start`/`stop`/
//! `status` verbs and replying with a single line.

pub mod client;
pub mod protocol;
pub mod server;

pub use protocol::{CreateRequest, Verb, SOCKET_DIR};
pub use server::{ClientActions, ClientFactory, ClientListener, CreateListener};
