//! The RPC function-ID space: one entry per host-kernel operation the
//! remote core may ask the host to perform on its behalf. IDs are grouped
//! the way the original function table grouped them (filesystem, stdio,
//! sockets/name-resolution, logging), with round numbers at each group
//! boundary so additions don't renumber an existing group.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum FunctionId {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    Lseek = 5,
    Fcntl = 6,
    Ioctl = 7,
    Unlink = 8,
    Getdents64 = 9,
    Stat = 10,
    Fstat = 11,
    Lstat = 12,
    Readlink = 13,
    Access = 14,
    Chmod = 15,
    Chdir = 16,
    Mkdir = 17,
    Rmdir = 18,
    Rename = 19,
    Remove = 20,
    Mkstemp = 21,
    Mkfifo = 22,
    Dup2 = 23,
    Pipe = 24,

    Fopen = 40,
    Fclose = 41,
    Fread = 42,
    Fwrite = 43,
    Freopen = 44,
    Fputs = 45,
    Fgets = 46,
    Feof = 47,
    Fprintf = 48,
    Getc = 49,
    Ferror = 50,
    GetcUnlocked = 51,
    Pclose = 52,
    Tmpfile = 53,
    Clearerr = 54,
    Popen = 55,
    Ungetc = 56,
    Fseeko = 57,
    Ftello = 58,
    Fseek = 59,
    Ftell = 60,
    Fflush = 61,
    Getwc = 62,
    Putwc = 63,
    Putc = 64,
    Ungetwc = 65,
    Fdopen = 66,
    Fileno = 67,
    Setvbuf = 68,
    FscanfOneArg = 69,

    Socket = 100,
    Bind = 101,
    Connect = 102,
    Listen = 103,
    Accept = 104,
    Accept4 = 105,
    Send = 106,
    Sendto = 107,
    Recv = 108,
    Recvfrom = 109,
    Shutdown = 110,
    Setsockopt = 111,
    Getsockopt = 112,
    Getpeername = 113,
    Getsockname = 114,
    Gethostname = 115,
    Gethostbyaddr = 116,
    Gethostbyname = 117,
    Getaddrinfo = 118,
    Freeaddrinfo = 119,
    GaiStrerror = 120,
    IfNameindex = 121,
    Select = 122,
    Poll = 123,
    Writev = 124,

    Printf = 200,
    Putchar = 201,
}

impl FunctionId {
    pub fn from_u32(v: u32) -> Option<Self> {
        use FunctionId::*;
        const ALL: &[FunctionId] = &[
            Open, Close, Read, Write, Lseek, Fcntl, Ioctl, Unlink, Getdents64, Stat, Fstat, Lstat,
            Readlink, Access, Chmod, Chdir, Mkdir, Rmdir, Rename, Remove, Mkstemp, Mkfifo, Dup2,
            Pipe, Fopen, Fclose, Fread, Fwrite, Freopen, Fputs, Fgets, Feof, Fprintf, Getc,
            Ferror, GetcUnlocked, Pclose, Tmpfile, Clearerr, Popen, Ungetc, Fseeko, Ftello, Fseek,
            Ftell, Fflush, Getwc, Putwc, Putc, Ungetwc, Fdopen, Fileno, Setvbuf, FscanfOneArg,
            Socket, Bind, Connect, Listen, Accept, Accept4, Send, Sendto, Recv, Recvfrom,
            Shutdown, Setsockopt, Getsockopt, Getpeername, Getsockname, Gethostname,
            Gethostbyaddr, Gethostbyname, Getaddrinfo, Freeaddrinfo, GaiStrerror, IfNameindex,
            Select, Poll, Writev, Printf, Putchar,
        ];
        ALL.iter().copied().find(|f| *f as u32 == v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u32() {
        assert_eq!(FunctionId::from_u32(FunctionId::Read as u32), Some(FunctionId::Read));
        assert_eq!(FunctionId::from_u32(FunctionId::Getaddrinfo as u32), Some(FunctionId::Getaddrinfo));
    }

    #[test]
    fn unknown_id_is_none() {
        assert_eq!(FunctionId::from_u32(0xFFFF_FFFF), None);
    }
}
