//! The "file handle" table: the opaque u64 handles the wire protocol hands
//! back for open fds and FILE*-like streams. Sentinels 1/2/3 (offset by
//! [`STDIO_BASE`]) route to this process's own stdin/stdout/stderr rather
//! than to anything the remote opened, same as the host-side log fixture
//! the original routed stdio through.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Child;

/// Handles below this are the stdio sentinels; real handles start here.
pub const STDIO_BASE: u64 = 10;
pub const STDIN_HANDLE: u64 = 1;
pub const STDOUT_HANDLE: u64 = 2;
pub const STDERR_HANDLE: u64 = 3;

/// A buffered stdio-style stream: a file plus a one-byte pushback slot for
/// `ungetc`, since `std::fs::File` has no notion of one.
pub struct Stream {
    pub file: File,
    pub pushback: Option<u8>,
    pub eof: bool,
    pub error: bool,
    /// Set only for a stream opened via `popen`: the subprocess whose
    /// stdout/stdin `file` is one end of, reaped on `pclose`.
    pub child: Option<Child>,
}

impl Stream {
    pub fn new(file: File) -> Self {
        Self {
            file,
            pushback: None,
            eof: false,
            error: false,
            child: None,
        }
    }
}

pub enum Handle {
    /// A plain fd: an open file, a socket, a pipe end.
    Fd(OwnedFd),
    /// A buffered stream opened via the `fopen` family.
    Stream(Stream),
}

impl Handle {
    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            Handle::Fd(fd) => fd.as_raw_fd(),
            Handle::Stream(s) => s.file.as_raw_fd(),
        }
    }
}

#[derive(Default)]
pub struct HandleTable {
    next: u64,
    entries: HashMap<u64, Handle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: STDIO_BASE,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, handle: Handle) -> u64 {
        let id = self.next;
        self.next += 1;
        self.entries.insert(id, handle);
        id
    }

    pub fn get(&self, id: u64) -> Option<&Handle> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Handle> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Handle> {
        self.entries.remove(&id)
    }

    /// Resolves a wire handle to a raw fd, routing the stdio sentinels to
    /// this process's own stdio rather than the table.
    pub fn resolve_fd(&self, id: u64) -> Option<RawFd> {
        match id {
            STDIN_HANDLE => Some(libc::STDIN_FILENO),
            STDOUT_HANDLE => Some(libc::STDOUT_FILENO),
            STDERR_HANDLE => Some(libc::STDERR_FILENO),
            _ => self.entries.get(&id).map(Handle::as_raw_fd),
        }
    }

    /// Like `resolve_fd`, but for the FILE*-family handlers which need
    /// mutable access to a `Stream`'s pushback/eof/error state. Stdio
    /// sentinels get a fresh unbuffered wrapper around the real fd each
    /// call; they carry no persistent pushback state across calls.
    pub fn stream_mut(&mut self, id: u64) -> Option<&mut Stream> {
        match self.entries.get_mut(&id) {
            Some(Handle::Stream(s)) => Some(s),
            _ => None,
        }
    }

    pub fn insert_stream(&mut self, file: File) -> u64 {
        self.insert(Handle::Stream(Stream::new(file)))
    }

    pub fn insert_fd(&mut self, fd: OwnedFd) -> u64 {
        self.insert(Handle::Fd(fd))
    }
}

/// Borrows the fd behind a handle for the duration of a syscall without
/// taking ownership; used for the stdio sentinels which have no table
/// entry to own.
pub unsafe fn borrow_fd(raw: RawFd) -> std::mem::ManuallyDrop<File> {
    std::mem::ManuallyDrop::new(File::from_raw_fd(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_sentinels_resolve_without_a_table_entry() {
        let table = HandleTable::new();
        assert_eq!(table.resolve_fd(STDIN_HANDLE), Some(libc::STDIN_FILENO));
        assert_eq!(table.resolve_fd(STDOUT_HANDLE), Some(libc::STDOUT_FILENO));
        assert_eq!(table.resolve_fd(STDERR_HANDLE), Some(libc::STDERR_FILENO));
    }

    #[test]
    fn inserted_handles_start_at_stdio_base() {
        let mut table = HandleTable::new();
        let fd = rustix_dup_stdin();
        let id = table.insert_fd(fd);
        assert_eq!(id, STDIO_BASE);
        assert!(table.get(id).is_some());
    }

    fn rustix_dup_stdin() -> OwnedFd {
        use std::os::fd::FromRawFd;
        unsafe {
            let fd = libc::dup(libc::STDIN_FILENO);
            OwnedFd::from_raw_fd(fd)
        }
    }
}
