//! Handler implementations for the function-ID table. Each handler decodes
//! its own request body, performs the host-kernel operation the remote
//! asked for, and returns a `Reply` with the trace id echoed and `errnum`
//! set from `errno` on failure — the same contract every `rpmsg_handle_*`
//! function in the original followed.
//!
//! Not every function ID in [`crate::function_id::FunctionId`] has a full
//! implementation here; the ones that don't fall through to
//! [`not_supported`] in the dispatch table built by [`crate::RpcServer`].
//! The wide-char stdio family (`getwc`/`putwc`/`ungetwc`) is aliased onto
//! its byte-oriented counterpart since a byte-oriented remote-fs proxy has
//! no meaningful distinction between the two.

use std::ffi::{CStr, CString};
use std::fs::OpenOptions;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use bincode::{Decode, Encode};

use crate::handles::{Handle, HandleTable, Stream, STDIN_HANDLE, STDOUT_HANDLE};
use crate::wire::{AddrInfoEntry, HostEntry, Reply, Status};

fn decode_body<T: Decode<()>>(body: &[u8]) -> Result<T, ()> {
    bincode::decode_from_slice(body, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|_| ())
}

fn encode_body<T: Encode>(v: &T) -> Vec<u8> {
    bincode::encode_to_vec(v, bincode::config::standard()).unwrap_or_default()
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

pub fn corrupted(trace_id: u32) -> Reply {
    Reply::err(trace_id, Status::Corrupted, 0)
}

pub fn not_supported(trace_id: u32) -> Reply {
    Reply::err(trace_id, Status::NotSupported, libc::ENOSYS)
}

#[derive(Encode, Decode)]
pub struct OpenReq {
    pub path: String,
    pub flags: i32,
    pub mode: u32,
}
#[derive(Encode, Decode)]
pub struct HandleResp {
    pub handle: u64,
}

pub fn open(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<OpenReq>(body) else {
        return corrupted(trace_id);
    };
    let mut opts = OpenOptions::new();
    opts.custom_flags(req.flags & !(libc::O_CREAT | libc::O_EXCL));
    match req.flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    if req.flags & libc::O_CREAT != 0 {
        opts.create(true).mode(req.mode);
    }
    if req.flags & libc::O_EXCL != 0 {
        opts.create_new(true);
    }
    if req.flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    match opts.open(&req.path) {
        Ok(file) => {
            let handle = table.insert_fd(OwnedFd::from(file));
            Reply::ok(trace_id, encode_body(&HandleResp { handle }))
        }
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

#[derive(Encode, Decode)]
pub struct CloseReq {
    pub handle: u64,
}

pub fn close(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match table.remove(req.handle) {
        Some(_) => Reply::ok(trace_id, Vec::new()),
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

#[derive(Encode, Decode)]
pub struct ReadReq {
    pub handle: u64,
    pub len: u32,
}
#[derive(Encode, Decode)]
pub struct DataResp {
    pub data: Vec<u8>,
}

pub fn read(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<ReadReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut buf = vec![0u8; req.len as usize];
    match nix::unistd::read(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &mut buf) {
        Ok(n) => {
            buf.truncate(n);
            Reply::ok(trace_id, encode_body(&DataResp { data: buf }))
        }
        Err(e) => Reply::err(trace_id, Status::Ok, e as i32),
    }
}

#[derive(Encode, Decode)]
pub struct WriteReq {
    pub handle: u64,
    pub data: Vec<u8>,
}
#[derive(Encode, Decode)]
pub struct CountResp {
    pub count: i64,
}

pub fn write(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<WriteReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &req.data) {
        Ok(n) => Reply::ok(trace_id, encode_body(&CountResp { count: n as i64 })),
        Err(e) => Reply::err(trace_id, Status::Ok, e as i32),
    }
}

#[derive(Encode, Decode)]
pub struct LseekReq {
    pub handle: u64,
    pub offset: i64,
    pub whence: i32,
}
#[derive(Encode, Decode)]
pub struct OffsetResp {
    pub offset: i64,
}

pub fn lseek(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<LseekReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(handle_entry) = table.get_mut(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut file = unsafe { std::fs::File::from_raw_fd(handle_entry.as_raw_fd()) };
    let whence = match req.whence {
        libc::SEEK_SET => SeekFrom::Start(req.offset as u64),
        libc::SEEK_CUR => SeekFrom::Current(req.offset),
        libc::SEEK_END => SeekFrom::End(req.offset),
        _ => {
            std::mem::forget(file);
            return Reply::err(trace_id, Status::Ok, libc::EINVAL);
        }
    };
    let result = file.seek(whence);
    std::mem::forget(file);
    match result {
        Ok(off) => Reply::ok(trace_id, encode_body(&OffsetResp { offset: off as i64 })),
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

#[derive(Encode, Decode)]
pub struct PathReq {
    pub path: String,
}

pub fn unlink(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    path_op(trace_id, body, std::fs::remove_file)
}

pub fn mkdir(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    path_op(trace_id, body, |p| std::fs::create_dir(p))
}

pub fn rmdir(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    path_op(trace_id, body, std::fs::remove_dir)
}

pub fn remove(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    path_op(trace_id, body, |p| {
        std::fs::remove_file(p).or_else(|_| std::fs::remove_dir(p))
    })
}

fn path_op(trace_id: u32, body: &[u8], f: impl FnOnce(&str) -> std::io::Result<()>) -> Reply {
    let Ok(req) = decode_body::<PathReq>(body) else {
        return corrupted(trace_id);
    };
    match f(&req.path) {
        Ok(()) => Reply::ok(trace_id, Vec::new()),
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

#[derive(Encode, Decode)]
pub struct RenameReq {
    pub from: String,
    pub to: String,
}

pub fn rename(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<RenameReq>(body) else {
        return corrupted(trace_id);
    };
    match std::fs::rename(&req.from, &req.to) {
        Ok(()) => Reply::ok(trace_id, Vec::new()),
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

#[derive(Encode, Decode)]
pub struct AccessReq {
    pub path: String,
    pub mode: i32,
}

pub fn access(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<AccessReq>(body) else {
        return corrupted(trace_id);
    };
    let Ok(cpath) = CString::new(req.path) else {
        return Reply::err(trace_id, Status::Ok, libc::EINVAL);
    };
    let rc = unsafe { libc::access(cpath.as_ptr(), req.mode) };
    if rc == 0 {
        Reply::ok(trace_id, Vec::new())
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

#[derive(Encode, Decode)]
pub struct ChmodReq {
    pub path: String,
    pub mode: u32,
}

pub fn chmod(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<ChmodReq>(body) else {
        return corrupted(trace_id);
    };
    match std::fs::set_permissions(&req.path, std::os::unix::fs::PermissionsExt::from_mode(req.mode))
    {
        Ok(()) => Reply::ok(trace_id, Vec::new()),
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

#[derive(Encode, Decode)]
pub struct Dup2Req {
    pub old: u64,
    pub new_fd_hint: i32,
}

pub fn dup2(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<Dup2Req>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.old) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    let handle = table.insert_fd(unsafe { OwnedFd::from_raw_fd(dup) });
    Reply::ok(trace_id, encode_body(&HandleResp { handle }))
}

pub fn pipe(table: &mut HandleTable, trace_id: u32, _body: &[u8]) -> Reply {
    match nix::unistd::pipe() {
        Ok((r, w)) => {
            let rh = table.insert_fd(r);
            let wh = table.insert_fd(w);
            #[derive(Encode)]
            struct PipeResp {
                read: u64,
                write: u64,
            }
            Reply::ok(trace_id, encode_body(&PipeResp { read: rh, write: wh }))
        }
        Err(e) => Reply::err(trace_id, Status::Ok, e as i32),
    }
}

/// `printf`/`fprintf`-family: the remote sends already-formatted bytes (the
/// original did the `vsnprintf` on the remote side too); the host just
/// writes them to the log fixture's stdout.
pub fn printf(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<DataResp>(body) else {
        return corrupted(trace_id);
    };
    write_to_stdio(table, STDOUT_HANDLE, &req.data);
    Reply::ok(trace_id, Vec::new())
}

#[derive(Encode, Decode)]
pub struct PutcharReq {
    pub c: i32,
}

pub fn putchar(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<PutcharReq>(body) else {
        return corrupted(trace_id);
    };
    write_to_stdio(table, STDOUT_HANDLE, &[req.c as u8]);
    Reply::ok(trace_id, Vec::new())
}

fn write_to_stdio(_table: &HandleTable, which: u64, bytes: &[u8]) {
    let fd = if which == STDIN_HANDLE {
        libc::STDIN_FILENO
    } else {
        libc::STDOUT_FILENO
    };
    let _ = nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, bytes);
}

#[derive(Encode, Decode)]
pub struct SocketReq {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
}

/// Raw `libc` calls rather than `nix`'s socket wrappers for this whole
/// family: the wire `SockAddrReq.addr` bytes are already a raw
/// `sockaddr`-shaped buffer from the remote, so there's nothing gained by
/// decoding into `nix`'s own address types before handing the bytes to the
/// syscall.
pub fn socket(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<SocketReq>(body) else {
        return corrupted(trace_id);
    };
    let fd = unsafe { libc::socket(req.family, req.socktype, req.protocol) };
    if fd < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    let handle = table.insert_fd(unsafe { OwnedFd::from_raw_fd(fd) });
    Reply::ok(trace_id, encode_body(&HandleResp { handle }))
}

#[derive(Encode, Decode)]
pub struct SockAddrReq {
    pub handle: u64,
    pub addr: Vec<u8>,
}

pub fn bind(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<SockAddrReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let rc = unsafe {
        libc::bind(
            fd,
            req.addr.as_ptr() as *const libc::sockaddr,
            req.addr.len() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Reply::ok(trace_id, Vec::new())
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

pub fn connect(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<SockAddrReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let rc = unsafe {
        libc::connect(
            fd,
            req.addr.as_ptr() as *const libc::sockaddr,
            req.addr.len() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Reply::ok(trace_id, Vec::new())
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

#[derive(Encode, Decode)]
pub struct ListenReq {
    pub handle: u64,
    pub backlog: i32,
}

pub fn listen(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<ListenReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let rc = unsafe { libc::listen(fd, req.backlog) };
    if rc == 0 {
        Reply::ok(trace_id, Vec::new())
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

pub fn accept(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<HandleResp>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let client_fd = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if client_fd < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    let handle = table.insert_fd(unsafe { OwnedFd::from_raw_fd(client_fd) });
    Reply::ok(trace_id, encode_body(&HandleResp { handle }))
}

#[derive(Encode, Decode)]
pub struct SendReq {
    pub handle: u64,
    pub data: Vec<u8>,
    pub flags: i32,
}

pub fn send(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<SendReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let n = unsafe {
        libc::send(
            fd,
            req.data.as_ptr() as *const libc::c_void,
            req.data.len(),
            req.flags,
        )
    };
    if n < 0 {
        Reply::err(trace_id, Status::Ok, errno())
    } else {
        Reply::ok(trace_id, encode_body(&CountResp { count: n as i64 }))
    }
}

#[derive(Encode, Decode)]
pub struct RecvReq {
    pub handle: u64,
    pub len: u32,
    pub flags: i32,
}

pub fn recv(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<RecvReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut buf = vec![0u8; req.len as usize];
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            req.flags,
        )
    };
    if n < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    buf.truncate(n as usize);
    Reply::ok(trace_id, encode_body(&DataResp { data: buf }))
}

#[derive(Encode, Decode)]
pub struct ShutdownReq {
    pub handle: u64,
    pub how: i32,
}

pub fn shutdown(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<ShutdownReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let rc = unsafe { libc::shutdown(fd, req.how) };
    if rc == 0 {
        Reply::ok(trace_id, Vec::new())
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

pub fn gethostname(_table: &mut HandleTable, trace_id: u32, _body: &[u8]) -> Reply {
    match nix::unistd::gethostname() {
        Ok(name) => Reply::ok(
            trace_id,
            encode_body(&DataResp {
                data: name.to_string_lossy().into_owned().into_bytes(),
            }),
        ),
        Err(e) => Reply::err(trace_id, Status::Ok, e as i32),
    }
}

#[derive(Encode, Decode)]
pub struct GetaddrinfoReq {
    pub node: Option<String>,
    pub service: Option<String>,
}
#[derive(Encode, Decode)]
pub struct AddrInfoListResp {
    pub entries: Vec<AddrInfoEntry>,
}

/// Resolution via the host's own `getaddrinfo`, using the standard library's
/// socket-address lookup since it already does the name resolution without
/// needing raw libc struct plumbing.
pub fn getaddrinfo(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<GetaddrinfoReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(node) = req.node else {
        return Reply::err(trace_id, Status::Ok, libc::EINVAL);
    };
    let lookup = format!("{}:{}", node, req.service.as_deref().unwrap_or("0"));
    match std::net::ToSocketAddrs::to_socket_addrs(&lookup) {
        Ok(addrs) => {
            let entries = addrs
                .map(|a| {
                    let (family, addr) = match a {
                        std::net::SocketAddr::V4(v4) => (libc::AF_INET, v4.ip().octets().to_vec()),
                        std::net::SocketAddr::V6(v6) => (libc::AF_INET6, v6.ip().octets().to_vec()),
                    };
                    AddrInfoEntry {
                        flags: 0,
                        family,
                        socktype: libc::SOCK_STREAM,
                        protocol: 0,
                        addr,
                        canonname: None,
                    }
                })
                .collect();
            Reply::ok(trace_id, encode_body(&AddrInfoListResp { entries }))
        }
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EAI_FAIL)),
    }
}

pub fn freeaddrinfo(_table: &mut HandleTable, trace_id: u32, _body: &[u8]) -> Reply {
    // Nothing to free: entries live in the reply body, owned by the caller
    // once decoded, not in a host-side table.
    Reply::ok(trace_id, Vec::new())
}

// --- fcntl/ioctl, extended posix-file, getdents64 ---------------------

#[derive(Encode, Decode)]
pub struct FcntlReq {
    pub handle: u64,
    pub cmd: i32,
    pub arg: i64,
}
#[derive(Encode, Decode)]
pub struct IntResp {
    pub value: i64,
}

/// Only the int-arg commands the remote actually issues (`F_GETFL`,
/// `F_SETFL`, `F_DUPFD`, and similar) are supported; commands that take a
/// pointer (`F_SETLK` and kin) aren't represented on this wire.
pub fn fcntl(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FcntlReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let rc = unsafe { libc::fcntl(fd, req.cmd, req.arg as libc::c_int) };
    if rc < 0 {
        Reply::err(trace_id, Status::Ok, errno())
    } else {
        Reply::ok(trace_id, encode_body(&IntResp { value: rc as i64 }))
    }
}

#[derive(Encode, Decode)]
pub struct IoctlReq {
    pub handle: u64,
    pub request: u64,
    pub arg: Vec<u8>,
}
#[derive(Encode, Decode)]
pub struct IoctlResp {
    pub arg: Vec<u8>,
    pub result: i32,
}

/// Supports ioctls with a fixed-size in/out buffer argument: the remote
/// sends the buffer, this copies it, issues the ioctl, and hands the
/// (possibly mutated) buffer back.
pub fn ioctl(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<IoctlReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut buf = req.arg;
    let rc = unsafe { libc::ioctl(fd, req.request as _, buf.as_mut_ptr()) };
    if rc < 0 {
        Reply::err(trace_id, Status::Ok, errno())
    } else {
        Reply::ok(trace_id, encode_body(&IoctlResp { arg: buf, result: rc }))
    }
}

#[derive(Encode, Decode)]
pub struct GetdentsReq {
    pub handle: u64,
    pub len: u32,
}

/// Returns raw `dirent64`-shaped bytes straight from the host kernel; the
/// remote parses them with the same struct layout a local `getdents64`
/// call would hand back.
pub fn getdents64(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<GetdentsReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut buf = vec![0u8; req.len as usize];
    let n = unsafe { libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len()) };
    if n < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    buf.truncate(n as usize);
    Reply::ok(trace_id, encode_body(&DataResp { data: buf }))
}

#[derive(Encode, Decode)]
pub struct StatResp {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

fn stat_to_resp(st: &libc::stat) -> StatResp {
    StatResp {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
        mode: st.st_mode as u32,
        nlink: st.st_nlink as u64,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u64,
        size: st.st_size,
        blksize: st.st_blksize as i64,
        blocks: st.st_blocks,
        atime: st.st_atime,
        mtime: st.st_mtime,
        ctime: st.st_ctime,
    }
}

pub fn stat(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<PathReq>(body) else {
        return corrupted(trace_id);
    };
    let Ok(cpath) = CString::new(req.path) else {
        return Reply::err(trace_id, Status::Ok, libc::EINVAL);
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::stat(cpath.as_ptr(), &mut st) };
    if rc == 0 {
        Reply::ok(trace_id, encode_body(&stat_to_resp(&st)))
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

pub fn lstat(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<PathReq>(body) else {
        return corrupted(trace_id);
    };
    let Ok(cpath) = CString::new(req.path) else {
        return Reply::err(trace_id, Status::Ok, libc::EINVAL);
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::lstat(cpath.as_ptr(), &mut st) };
    if rc == 0 {
        Reply::ok(trace_id, encode_body(&stat_to_resp(&st)))
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

pub fn fstat(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc == 0 {
        Reply::ok(trace_id, encode_body(&stat_to_resp(&st)))
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

#[derive(Encode, Decode)]
pub struct ReadlinkReq {
    pub path: String,
    pub len: u32,
}

pub fn readlink(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<ReadlinkReq>(body) else {
        return corrupted(trace_id);
    };
    let Ok(cpath) = CString::new(req.path) else {
        return Reply::err(trace_id, Status::Ok, libc::EINVAL);
    };
    let mut buf = vec![0u8; req.len as usize];
    let n = unsafe { libc::readlink(cpath.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if n < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    buf.truncate(n as usize);
    Reply::ok(trace_id, encode_body(&DataResp { data: buf }))
}

pub fn chdir(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    path_op(trace_id, body, std::env::set_current_dir)
}

fn mkstemp_open(template: &str) -> Result<(std::fs::File, String), i32> {
    let mut buf = CString::new(template)
        .map_err(|_| libc::EINVAL)?
        .into_bytes_with_nul();
    let fd = unsafe { libc::mkstemp(buf.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(errno());
    }
    buf.pop();
    let path = String::from_utf8_lossy(&buf).into_owned();
    Ok((unsafe { std::fs::File::from_raw_fd(fd) }, path))
}

#[derive(Encode, Decode)]
pub struct MkstempReq {
    pub template: String,
}
#[derive(Encode, Decode)]
pub struct MkstempResp {
    pub handle: u64,
    pub path: String,
}

pub fn mkstemp(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<MkstempReq>(body) else {
        return corrupted(trace_id);
    };
    match mkstemp_open(&req.template) {
        Ok((file, path)) => {
            let handle = table.insert_fd(OwnedFd::from(file));
            Reply::ok(trace_id, encode_body(&MkstempResp { handle, path }))
        }
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

pub fn mkfifo(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<ChmodReq>(body) else {
        return corrupted(trace_id);
    };
    let Ok(cpath) = CString::new(req.path) else {
        return Reply::err(trace_id, Status::Ok, libc::EINVAL);
    };
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), req.mode as libc::mode_t) };
    if rc == 0 {
        Reply::ok(trace_id, Vec::new())
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

// --- stdio (FILE*) family -----------------------------------------------

fn open_options_for_mode(mode: &str) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match mode.trim_end_matches(['b', 't']) {
        "r" => {
            opts.read(true);
        }
        "r+" => {
            opts.read(true).write(true);
        }
        "w" => {
            opts.write(true).create(true).truncate(true);
        }
        "w+" => {
            opts.read(true).write(true).create(true).truncate(true);
        }
        "a" => {
            opts.append(true).create(true);
        }
        "a+" => {
            opts.read(true).append(true).create(true);
        }
        _ => {
            opts.read(true);
        }
    }
    opts
}

/// Shared read path for `fread`/`fgets`/`getc`: drains a stream's pushback
/// byte first, then reads straight off the file. Stdio sentinels have no
/// table entry, so they fall back to a plain fd read with no buffering.
fn stream_read(table: &mut HandleTable, handle: u64, max: usize) -> Result<Vec<u8>, i32> {
    if let Some(stream) = table.stream_mut(handle) {
        let mut out = Vec::with_capacity(max);
        if let Some(b) = stream.pushback.take() {
            out.push(b);
        }
        if out.len() < max {
            let mut buf = vec![0u8; max - out.len()];
            match stream.file.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    if n == 0 {
                        stream.eof = true;
                    }
                    out.extend_from_slice(&buf);
                }
                Err(e) => {
                    stream.error = true;
                    return Err(e.raw_os_error().unwrap_or(libc::EIO));
                }
            }
        }
        Ok(out)
    } else if let Some(fd) = table.resolve_fd(handle) {
        let mut buf = vec![0u8; max];
        match nix::unistd::read(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(e as i32),
        }
    } else {
        Err(libc::EBADF)
    }
}

fn stream_read_byte(table: &mut HandleTable, handle: u64) -> Result<Option<u8>, i32> {
    Ok(stream_read(table, handle, 1)?.first().copied())
}

fn stream_write(table: &mut HandleTable, handle: u64, data: &[u8]) -> Result<usize, i32> {
    if let Some(stream) = table.stream_mut(handle) {
        match stream.file.write(data) {
            Ok(n) => Ok(n),
            Err(e) => {
                stream.error = true;
                Err(e.raw_os_error().unwrap_or(libc::EIO))
            }
        }
    } else if let Some(fd) = table.resolve_fd(handle) {
        nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, data)
            .map_err(|e| e as i32)
    } else {
        Err(libc::EBADF)
    }
}

fn seek(table: &mut HandleTable, handle: u64, offset: i64, whence: i32) -> Result<i64, i32> {
    let seek_from = match whence {
        libc::SEEK_SET => SeekFrom::Start(offset as u64),
        libc::SEEK_CUR => SeekFrom::Current(offset),
        libc::SEEK_END => SeekFrom::End(offset),
        _ => return Err(libc::EINVAL),
    };
    if let Some(stream) = table.stream_mut(handle) {
        stream
            .file
            .seek(seek_from)
            .map(|off| off as i64)
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    } else if let Some(fd) = table.resolve_fd(handle) {
        let off = unsafe { libc::lseek(fd, offset, whence) };
        if off < 0 {
            Err(errno())
        } else {
            Ok(off)
        }
    } else {
        Err(libc::EBADF)
    }
}

#[derive(Encode, Decode)]
pub struct FopenReq {
    pub path: String,
    pub mode: String,
}

pub fn fopen(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FopenReq>(body) else {
        return corrupted(trace_id);
    };
    match open_options_for_mode(&req.mode).open(&req.path) {
        Ok(file) => {
            let handle = table.insert_stream(file);
            Reply::ok(trace_id, encode_body(&HandleResp { handle }))
        }
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

pub fn fclose(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match table.remove(req.handle) {
        Some(_) => Reply::ok(trace_id, Vec::new()),
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

pub fn fread(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<ReadReq>(body) else {
        return corrupted(trace_id);
    };
    match stream_read(table, req.handle, req.len as usize) {
        Ok(data) => Reply::ok(trace_id, encode_body(&DataResp { data })),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

pub fn fwrite(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<WriteReq>(body) else {
        return corrupted(trace_id);
    };
    match stream_write(table, req.handle, &req.data) {
        Ok(n) => Reply::ok(trace_id, encode_body(&CountResp { count: n as i64 })),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

#[derive(Encode, Decode)]
pub struct FreopenReq {
    pub handle: u64,
    pub path: String,
    pub mode: String,
}

pub fn freopen(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FreopenReq>(body) else {
        return corrupted(trace_id);
    };
    match open_options_for_mode(&req.mode).open(&req.path) {
        Ok(file) => match table.stream_mut(req.handle) {
            Some(stream) => {
                stream.file = file;
                stream.pushback = None;
                stream.eof = false;
                stream.error = false;
                Reply::ok(trace_id, encode_body(&HandleResp { handle: req.handle }))
            }
            None => Reply::err(trace_id, Status::Ok, libc::EBADF),
        },
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

#[derive(Encode, Decode)]
pub struct FputsReq {
    pub handle: u64,
    pub data: String,
}

pub fn fputs(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FputsReq>(body) else {
        return corrupted(trace_id);
    };
    match stream_write(table, req.handle, req.data.as_bytes()) {
        Ok(_) => Reply::ok(trace_id, Vec::new()),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

#[derive(Encode, Decode)]
pub struct FgetsReq {
    pub handle: u64,
    pub len: u32,
}
#[derive(Encode, Decode)]
pub struct FgetsResp {
    pub data: Vec<u8>,
    pub eof: bool,
}

pub fn fgets(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FgetsReq>(body) else {
        return corrupted(trace_id);
    };
    let max = req.len.saturating_sub(1) as usize;
    let mut data = Vec::new();
    let mut eof = false;
    while data.len() < max {
        match stream_read_byte(table, req.handle) {
            Ok(Some(b)) => {
                data.push(b);
                if b == b'\n' {
                    break;
                }
            }
            Ok(None) => {
                eof = true;
                break;
            }
            Err(e) => return Reply::err(trace_id, Status::Ok, e),
        }
    }
    Reply::ok(trace_id, encode_body(&FgetsResp { data, eof }))
}

#[derive(Encode, Decode)]
pub struct BoolResp {
    pub value: bool,
}

pub fn feof(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match table.stream_mut(req.handle) {
        Some(s) => Reply::ok(trace_id, encode_body(&BoolResp { value: s.eof })),
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

pub fn ferror(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match table.stream_mut(req.handle) {
        Some(s) => Reply::ok(trace_id, encode_body(&BoolResp { value: s.error })),
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

pub fn clearerr(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match table.stream_mut(req.handle) {
        Some(s) => {
            s.eof = false;
            s.error = false;
            Reply::ok(trace_id, Vec::new())
        }
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

#[derive(Encode, Decode)]
pub struct FprintfReq {
    pub handle: u64,
    pub data: Vec<u8>,
}

pub fn fprintf(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FprintfReq>(body) else {
        return corrupted(trace_id);
    };
    match stream_write(table, req.handle, &req.data) {
        Ok(n) => Reply::ok(trace_id, encode_body(&CountResp { count: n as i64 })),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

#[derive(Encode, Decode)]
pub struct CharResp {
    pub c: i32,
}

pub fn getc(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match stream_read_byte(table, req.handle) {
        Ok(Some(b)) => Reply::ok(trace_id, encode_body(&CharResp { c: b as i32 })),
        Ok(None) => Reply::ok(trace_id, encode_body(&CharResp { c: -1 })),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

/// No distinct locking story on a single handler thread per request, so
/// `getc_unlocked` is exactly `getc`.
pub fn getc_unlocked(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    getc(table, trace_id, body)
}

#[derive(Encode, Decode)]
pub struct UngetcReq {
    pub handle: u64,
    pub c: i32,
}

pub fn ungetc(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<UngetcReq>(body) else {
        return corrupted(trace_id);
    };
    match table.stream_mut(req.handle) {
        Some(s) => {
            s.pushback = Some(req.c as u8);
            Reply::ok(trace_id, encode_body(&CharResp { c: req.c }))
        }
        // Stdio sentinels carry no persistent pushback slot (see
        // `HandleTable::stream_mut`); accept the call without buffering.
        None if table.resolve_fd(req.handle).is_some() => {
            Reply::ok(trace_id, encode_body(&CharResp { c: req.c }))
        }
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

#[derive(Encode, Decode)]
pub struct PutcReq {
    pub handle: u64,
    pub c: i32,
}

pub fn putc(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<PutcReq>(body) else {
        return corrupted(trace_id);
    };
    match stream_write(table, req.handle, &[req.c as u8]) {
        Ok(_) => Reply::ok(trace_id, encode_body(&CharResp { c: req.c })),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

/// The wide-char stdio family has no meaningful distinction from its
/// byte-oriented counterpart for a byte-oriented remote-fs proxy.
pub fn getwc(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    getc(table, trace_id, body)
}
pub fn putwc(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    putc(table, trace_id, body)
}
pub fn ungetwc(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    ungetc(table, trace_id, body)
}

#[derive(Encode, Decode)]
pub struct FseekReq {
    pub handle: u64,
    pub offset: i64,
    pub whence: i32,
}

pub fn fseeko(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FseekReq>(body) else {
        return corrupted(trace_id);
    };
    match seek(table, req.handle, req.offset, req.whence) {
        Ok(_) => Reply::ok(trace_id, Vec::new()),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

pub fn fseek(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    fseeko(table, trace_id, body)
}

pub fn ftello(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match seek(table, req.handle, 0, libc::SEEK_CUR) {
        Ok(offset) => Reply::ok(trace_id, encode_body(&OffsetResp { offset })),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

pub fn ftell(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    ftello(table, trace_id, body)
}

pub fn fflush(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match table.stream_mut(req.handle) {
        Some(s) => match s.file.flush() {
            Ok(()) => Reply::ok(trace_id, Vec::new()),
            Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
        },
        None if table.resolve_fd(req.handle).is_some() => Reply::ok(trace_id, Vec::new()),
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

#[derive(Encode, Decode)]
pub struct FdopenReq {
    pub handle: u64,
    pub mode: String,
}

pub fn fdopen(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FdopenReq>(body) else {
        return corrupted(trace_id);
    };
    if matches!(table.get(req.handle), Some(Handle::Stream(_))) {
        return Reply::ok(trace_id, encode_body(&HandleResp { handle: req.handle }));
    }
    match table.remove(req.handle) {
        Some(Handle::Fd(fd)) => {
            let handle = table.insert_stream(std::fs::File::from(fd));
            Reply::ok(trace_id, encode_body(&HandleResp { handle }))
        }
        Some(_) => Reply::err(trace_id, Status::Ok, libc::EINVAL),
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

#[derive(Encode, Decode)]
pub struct FdResp {
    pub fd: i32,
}

pub fn fileno(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match table.resolve_fd(req.handle) {
        Some(fd) => Reply::ok(trace_id, encode_body(&FdResp { fd })),
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

#[derive(Encode, Decode)]
pub struct SetvbufReq {
    pub handle: u64,
    pub mode: i32,
    pub size: u32,
}

/// Every stream here is backed directly by an unbuffered `File`, so there
/// is no buffering discipline to change; just validate the handle.
pub fn setvbuf(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<SetvbufReq>(body) else {
        return corrupted(trace_id);
    };
    if table.get(req.handle).is_some() || table.resolve_fd(req.handle).is_some() {
        Reply::ok(trace_id, Vec::new())
    } else {
        Reply::err(trace_id, Status::Ok, libc::EBADF)
    }
}

#[derive(Encode, Decode)]
pub struct PopenReq {
    pub command: String,
    pub mode: String,
}

pub fn popen(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<PopenReq>(body) else {
        return corrupted(trace_id);
    };
    let want_write = req.mode.starts_with('w');
    let mut cmd = std::process::Command::new("/bin/sh");
    cmd.arg("-c").arg(&req.command);
    if want_write {
        cmd.stdin(std::process::Stdio::piped());
    } else {
        cmd.stdout(std::process::Stdio::piped());
    }
    match cmd.spawn() {
        Ok(mut child) => {
            let file = if want_write {
                std::fs::File::from(OwnedFd::from(child.stdin.take().expect("stdin was piped")))
            } else {
                std::fs::File::from(OwnedFd::from(child.stdout.take().expect("stdout was piped")))
            };
            let mut stream = Stream::new(file);
            stream.child = Some(child);
            let handle = table.insert(Handle::Stream(stream));
            Reply::ok(trace_id, encode_body(&HandleResp { handle }))
        }
        Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

pub fn pclose(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    match table.remove(req.handle) {
        Some(Handle::Stream(mut s)) => {
            drop(s.file);
            match s.child.take() {
                Some(mut child) => match child.wait() {
                    Ok(status) => Reply::ok(
                        trace_id,
                        encode_body(&IntResp {
                            value: status.code().unwrap_or(-1) as i64,
                        }),
                    ),
                    Err(e) => Reply::err(trace_id, Status::Ok, e.raw_os_error().unwrap_or(libc::EIO)),
                },
                None => Reply::err(trace_id, Status::Ok, libc::EINVAL),
            }
        }
        Some(_) => Reply::err(trace_id, Status::Ok, libc::EINVAL),
        None => Reply::err(trace_id, Status::Ok, libc::EBADF),
    }
}

pub fn tmpfile(table: &mut HandleTable, trace_id: u32, _body: &[u8]) -> Reply {
    let template = format!("{}/amp-rpc-tmpXXXXXX", std::env::temp_dir().display());
    match mkstemp_open(&template) {
        Ok((file, path)) => {
            let _ = std::fs::remove_file(&path);
            let handle = table.insert_stream(file);
            Reply::ok(trace_id, encode_body(&HandleResp { handle }))
        }
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

#[derive(Encode, Decode)]
pub struct FscanfReq {
    pub handle: u64,
    pub format: String,
}
#[derive(Encode, Decode)]
pub struct FscanfResp {
    pub matched: bool,
    pub int_value: i64,
    pub float_value: f64,
    pub text_value: String,
}

/// Only the single-argument case the function id itself names: skip
/// leading whitespace, collect one whitespace-delimited token, and parse
/// it according to whether the format string asks for an int, a float, or
/// a bare string.
pub fn fscanf_one_arg(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<FscanfReq>(body) else {
        return corrupted(trace_id);
    };
    let mut token = Vec::new();
    loop {
        match stream_read_byte(table, req.handle) {
            Ok(Some(b)) if b.is_ascii_whitespace() && token.is_empty() => continue,
            Ok(Some(b)) if b.is_ascii_whitespace() => break,
            Ok(Some(b)) => token.push(b),
            Ok(None) => break,
            Err(e) => return Reply::err(trace_id, Status::Ok, e),
        }
    }
    if token.is_empty() {
        return Reply::ok(
            trace_id,
            encode_body(&FscanfResp {
                matched: false,
                int_value: 0,
                float_value: 0.0,
                text_value: String::new(),
            }),
        );
    }
    let text = String::from_utf8_lossy(&token).into_owned();
    let resp = if req.format.contains("%d") || req.format.contains("%i") {
        FscanfResp {
            matched: true,
            int_value: text.parse().unwrap_or(0),
            float_value: 0.0,
            text_value: String::new(),
        }
    } else if req.format.contains("%f") || req.format.contains("%g") || req.format.contains("%e") {
        FscanfResp {
            matched: true,
            int_value: 0,
            float_value: text.parse().unwrap_or(0.0),
            text_value: String::new(),
        }
    } else {
        FscanfResp {
            matched: true,
            int_value: 0,
            float_value: 0.0,
            text_value: text,
        }
    };
    Reply::ok(trace_id, encode_body(&resp))
}

// --- extended socket/name-resolution family -----------------------------

#[derive(Encode, Decode)]
pub struct Accept4Req {
    pub handle: u64,
    pub flags: i32,
}

pub fn accept4(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<Accept4Req>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let client_fd = unsafe { libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), req.flags) };
    if client_fd < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    let handle = table.insert_fd(unsafe { OwnedFd::from_raw_fd(client_fd) });
    Reply::ok(trace_id, encode_body(&HandleResp { handle }))
}

#[derive(Encode, Decode)]
pub struct SendtoReq {
    pub handle: u64,
    pub data: Vec<u8>,
    pub flags: i32,
    pub addr: Vec<u8>,
}

pub fn sendto(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<SendtoReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let n = unsafe {
        libc::sendto(
            fd,
            req.data.as_ptr() as *const libc::c_void,
            req.data.len(),
            req.flags,
            req.addr.as_ptr() as *const libc::sockaddr,
            req.addr.len() as libc::socklen_t,
        )
    };
    if n < 0 {
        Reply::err(trace_id, Status::Ok, errno())
    } else {
        Reply::ok(trace_id, encode_body(&CountResp { count: n as i64 }))
    }
}

#[derive(Encode, Decode)]
pub struct RecvfromReq {
    pub handle: u64,
    pub len: u32,
    pub flags: i32,
}
#[derive(Encode, Decode)]
pub struct RecvfromResp {
    pub data: Vec<u8>,
    pub addr: Vec<u8>,
}

pub fn recvfrom(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<RecvfromReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut buf = vec![0u8; req.len as usize];
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            req.flags,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addrlen,
        )
    };
    if n < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    buf.truncate(n as usize);
    let addr_bytes =
        unsafe { std::slice::from_raw_parts(&addr as *const _ as *const u8, addrlen as usize) }.to_vec();
    Reply::ok(
        trace_id,
        encode_body(&RecvfromResp { data: buf, addr: addr_bytes }),
    )
}

#[derive(Encode, Decode)]
pub struct SetsockoptReq {
    pub handle: u64,
    pub level: i32,
    pub optname: i32,
    pub optval: Vec<u8>,
}

pub fn setsockopt(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<SetsockoptReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            req.level,
            req.optname,
            req.optval.as_ptr() as *const libc::c_void,
            req.optval.len() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Reply::ok(trace_id, Vec::new())
    } else {
        Reply::err(trace_id, Status::Ok, errno())
    }
}

#[derive(Encode, Decode)]
pub struct GetsockoptReq {
    pub handle: u64,
    pub level: i32,
    pub optname: i32,
    pub optlen: u32,
}
#[derive(Encode, Decode)]
pub struct GetsockoptResp {
    pub optval: Vec<u8>,
}

pub fn getsockopt(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<GetsockoptReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut buf = vec![0u8; req.optlen as usize];
    let mut actual = req.optlen as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            req.level,
            req.optname,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut actual,
        )
    };
    if rc != 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    buf.truncate(actual as usize);
    Reply::ok(trace_id, encode_body(&GetsockoptResp { optval: buf }))
}

enum SockNameWhich {
    Peer,
    Local,
}

fn sockname(fd: i32, which: SockNameWhich) -> Result<Vec<u8>, i32> {
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        match which {
            SockNameWhich::Peer => {
                libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
            }
            SockNameWhich::Local => {
                libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
            }
        }
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
    }
    Ok(unsafe { std::slice::from_raw_parts(&addr as *const _ as *const u8, len as usize) }.to_vec())
}

#[derive(Encode, Decode)]
pub struct AddrResp {
    pub addr: Vec<u8>,
}

pub fn getpeername(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    match sockname(fd, SockNameWhich::Peer) {
        Ok(addr) => Reply::ok(trace_id, encode_body(&AddrResp { addr })),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

pub fn getsockname(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<CloseReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    match sockname(fd, SockNameWhich::Local) {
        Ok(addr) => Reply::ok(trace_id, encode_body(&AddrResp { addr })),
        Err(e) => Reply::err(trace_id, Status::Ok, e),
    }
}

unsafe fn hostent_from_raw(ptr: *mut libc::hostent) -> Option<HostEntry> {
    if ptr.is_null() {
        return None;
    }
    let he = &*ptr;
    let name = if he.h_name.is_null() {
        None
    } else {
        Some(CStr::from_ptr(he.h_name).to_string_lossy().into_owned())
    };
    let mut aliases = Vec::new();
    if !he.h_aliases.is_null() {
        let mut i = 0isize;
        loop {
            let p = *he.h_aliases.offset(i);
            if p.is_null() {
                break;
            }
            aliases.push(CStr::from_ptr(p).to_string_lossy().into_owned());
            i += 1;
        }
    }
    let mut addresses = Vec::new();
    if !he.h_addr_list.is_null() {
        let mut i = 0isize;
        loop {
            let p = *he.h_addr_list.offset(i);
            if p.is_null() {
                break;
            }
            addresses.push(std::slice::from_raw_parts(p as *const u8, he.h_length as usize).to_vec());
            i += 1;
        }
    }
    Some(HostEntry {
        name,
        aliases,
        addrtype: he.h_addrtype,
        length: he.h_length,
        addresses,
    })
}

#[derive(Encode, Decode)]
pub struct HostEntryResp {
    pub entry: Option<HostEntry>,
}

#[derive(Encode, Decode)]
pub struct GethostbynameReq {
    pub name: String,
}

pub fn gethostbyname(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<GethostbynameReq>(body) else {
        return corrupted(trace_id);
    };
    let Ok(cname) = CString::new(req.name) else {
        return Reply::err(trace_id, Status::Ok, libc::EINVAL);
    };
    let ptr = unsafe { libc::gethostbyname(cname.as_ptr()) };
    match unsafe { hostent_from_raw(ptr) } {
        Some(entry) => Reply::ok(trace_id, encode_body(&HostEntryResp { entry: Some(entry) })),
        None => Reply::err(trace_id, Status::Ok, libc::ENOENT),
    }
}

#[derive(Encode, Decode)]
pub struct GethostbyaddrReq {
    pub addr: Vec<u8>,
    pub addrtype: i32,
}

pub fn gethostbyaddr(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<GethostbyaddrReq>(body) else {
        return corrupted(trace_id);
    };
    let ptr = unsafe {
        libc::gethostbyaddr(
            req.addr.as_ptr() as *const libc::c_void,
            req.addr.len() as libc::socklen_t,
            req.addrtype,
        )
    };
    match unsafe { hostent_from_raw(ptr) } {
        Some(entry) => Reply::ok(trace_id, encode_body(&HostEntryResp { entry: Some(entry) })),
        None => Reply::err(trace_id, Status::Ok, libc::ENOENT),
    }
}

#[derive(Encode, Decode)]
pub struct GaiStrerrorReq {
    pub code: i32,
}
#[derive(Encode, Decode)]
pub struct StringResp {
    pub text: String,
}

pub fn gai_strerror(_table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<GaiStrerrorReq>(body) else {
        return corrupted(trace_id);
    };
    let ptr = unsafe { libc::gai_strerror(req.code) };
    let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
    Reply::ok(trace_id, encode_body(&StringResp { text }))
}

#[derive(Encode, Decode)]
pub struct IfNameindexResp {
    pub interfaces: Vec<(u32, String)>,
}

pub fn if_nameindex(_table: &mut HandleTable, trace_id: u32, _body: &[u8]) -> Reply {
    let ptr = unsafe { libc::if_nameindex() };
    if ptr.is_null() {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    let mut interfaces = Vec::new();
    let mut i = 0isize;
    loop {
        let entry = unsafe { &*ptr.offset(i) };
        if entry.if_index == 0 {
            break;
        }
        let name = unsafe { CStr::from_ptr(entry.if_name) }.to_string_lossy().into_owned();
        interfaces.push((entry.if_index, name));
        i += 1;
    }
    unsafe { libc::if_freenameindex(ptr) };
    Reply::ok(trace_id, encode_body(&IfNameindexResp { interfaces }))
}

fn add_interest(
    entries: &mut Vec<(u64, i16)>,
    index: &mut std::collections::HashMap<u64, usize>,
    handle: u64,
    event: i16,
) {
    if let Some(&i) = index.get(&handle) {
        entries[i].1 |= event;
    } else {
        index.insert(handle, entries.len());
        entries.push((handle, event));
    }
}

#[derive(Encode, Decode)]
pub struct SelectReq {
    pub read_handles: Vec<u64>,
    pub write_handles: Vec<u64>,
    pub except_handles: Vec<u64>,
    pub timeout_ms: Option<i32>,
}
#[derive(Encode, Decode)]
pub struct SelectResp {
    pub ready_read: Vec<u64>,
    pub ready_write: Vec<u64>,
    pub ready_except: Vec<u64>,
}

/// Implemented on top of `poll(2)` rather than hand-rolling `fd_set` bit
/// manipulation — the wire request already groups handles by interest the
/// same way a pollfd set does.
pub fn select(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<SelectReq>(body) else {
        return corrupted(trace_id);
    };
    let mut entries = Vec::new();
    let mut index = std::collections::HashMap::new();
    for &h in &req.read_handles {
        add_interest(&mut entries, &mut index, h, libc::POLLIN);
    }
    for &h in &req.write_handles {
        add_interest(&mut entries, &mut index, h, libc::POLLOUT);
    }
    for &h in &req.except_handles {
        add_interest(&mut entries, &mut index, h, libc::POLLPRI);
    }

    let mut pollfds = Vec::with_capacity(entries.len());
    for &(h, events) in &entries {
        let Some(fd) = table.resolve_fd(h) else {
            return Reply::err(trace_id, Status::Ok, libc::EBADF);
        };
        pollfds.push(libc::pollfd { fd, events, revents: 0 });
    }
    let timeout = req.timeout_ms.unwrap_or(-1);
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
    if rc < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    let mut resp = SelectResp {
        ready_read: Vec::new(),
        ready_write: Vec::new(),
        ready_except: Vec::new(),
    };
    for (i, &(h, _)) in entries.iter().enumerate() {
        let revents = pollfds[i].revents;
        if revents & libc::POLLIN != 0 {
            resp.ready_read.push(h);
        }
        if revents & libc::POLLOUT != 0 {
            resp.ready_write.push(h);
        }
        if revents & libc::POLLPRI != 0 {
            resp.ready_except.push(h);
        }
    }
    Reply::ok(trace_id, encode_body(&resp))
}

#[derive(Encode, Decode)]
pub struct PollReq {
    pub handles: Vec<u64>,
    pub events: Vec<i16>,
    pub timeout_ms: i32,
}
#[derive(Encode, Decode)]
pub struct PollResp {
    pub revents: Vec<i16>,
}

pub fn poll(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<PollReq>(body) else {
        return corrupted(trace_id);
    };
    if req.handles.len() != req.events.len() {
        return Reply::err(trace_id, Status::Invalid, libc::EINVAL);
    }
    let mut pollfds = Vec::with_capacity(req.handles.len());
    for (i, &h) in req.handles.iter().enumerate() {
        let Some(fd) = table.resolve_fd(h) else {
            return Reply::err(trace_id, Status::Ok, libc::EBADF);
        };
        pollfds.push(libc::pollfd {
            fd,
            events: req.events[i],
            revents: 0,
        });
    }
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, req.timeout_ms) };
    if rc < 0 {
        return Reply::err(trace_id, Status::Ok, errno());
    }
    Reply::ok(
        trace_id,
        encode_body(&PollResp {
            revents: pollfds.iter().map(|p| p.revents).collect(),
        }),
    )
}

#[derive(Encode, Decode)]
pub struct WritevReq {
    pub handle: u64,
    pub chunks: Vec<Vec<u8>>,
}

/// Issues each chunk as its own `write` rather than a single real
/// `writev`, to avoid raw `iovec` pointer juggling here — the remote only
/// observes the total byte count, which this preserves.
pub fn writev(table: &mut HandleTable, trace_id: u32, body: &[u8]) -> Reply {
    let Ok(req) = decode_body::<WritevReq>(body) else {
        return corrupted(trace_id);
    };
    let Some(fd) = table.resolve_fd(req.handle) else {
        return Reply::err(trace_id, Status::Ok, libc::EBADF);
    };
    let mut total = 0i64;
    for chunk in &req.chunks {
        match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, chunk) {
            Ok(n) => {
                total += n as i64;
                if n < chunk.len() {
                    break;
                }
            }
            Err(e) => return Reply::err(trace_id, Status::Ok, e as i32),
        }
    }
    Reply::ok(trace_id, encode_body(&CountResp { count: total }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_round_trip_on_a_temp_file() {
        let mut table = HandleTable::new();
        let path = std::env::temp_dir().join("amp-rpc-handlers-test");
        let req = OpenReq {
            path: path.to_string_lossy().into_owned(),
            flags: libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            mode: 0o600,
        };
        let body = encode_body(&req);
        let reply = open(&mut table, 1, &body);
        assert_eq!(reply.status, Status::Ok);
        let resp: HandleResp = decode_body(&reply.body).unwrap();
        assert!(resp.handle >= crate::handles::STDIO_BASE);

        let close_body = encode_body(&CloseReq { handle: resp.handle });
        let reply = close(&mut table, 2, &close_body);
        assert_eq!(reply.status, Status::Ok);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn close_of_unknown_handle_reports_ebadf() {
        let mut table = HandleTable::new();
        let body = encode_body(&CloseReq { handle: 9999 });
        let reply = close(&mut table, 3, &body);
        assert_eq!(reply.errnum, libc::EBADF);
    }

    #[test]
    fn corrupted_body_reports_corrupted_status() {
        let mut table = HandleTable::new();
        let reply = open(&mut table, 4, &[0xff, 0xff]);
        assert_eq!(reply.status, Status::Corrupted);
    }
}
