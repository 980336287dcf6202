//! The `rpmsg-rpc` service: binds the well-known endpoint name the remote
//! core's libc shim talks to, decodes a function-id-tagged request per
//! message, dispatches it to the matching host-kernel operation, and sends
//! a reply carrying the echoed trace id and the syscall's outcome.
//!
//! Two concurrency modes mirror the original: [`Mode::Inline`] runs every
//! handler on the receive-loop thread; [`Mode::Worker`] hands it to a
//! bounded queue plus fixed thread pool instead, so one slow handler (a
//! blocking `read` on a remote-opened fd, say) doesn't stall delivery to
//! every other bound service.

pub mod function_id;
pub mod handles;
pub mod handlers;
pub mod wire;
pub mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use amp_rpmsg::{EndpointSender, Service};

use function_id::FunctionId;
use handles::HandleTable;
use wire::{Reply, Status};

/// The endpoint name the remote core's rpmsg-rpc client announces.
pub const ENDPOINT_NAME: &str = "rpmsg-rpc";

/// Fixed local address this service binds at. There is only ever one
/// rpmsg-rpc instance per client, so a constant is simpler than minting
/// one dynamically the way ordinary rpmsg channel addresses are.
const LOCAL_ADDR: u32 = 0x401;

type HandlerFn = fn(&mut HandleTable, u32, &[u8]) -> Reply;

#[derive(Clone, Copy)]
pub enum Mode {
    Inline,
    Worker {
        pool_size: usize,
        queue_depth: usize,
    },
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Worker {
            pool_size: worker::DEFAULT_POOL_SIZE,
            queue_depth: worker::DEFAULT_QUEUE_DEPTH,
        }
    }
}

fn dispatch_table() -> HashMap<u32, HandlerFn> {
    use FunctionId::*;
    let mut t: HashMap<u32, HandlerFn> = HashMap::new();
    let mut add = |id: FunctionId, f: HandlerFn| {
        t.insert(id as u32, f);
    };
    add(Open, handlers::open);
    add(Close, handlers::close);
    add(Read, handlers::read);
    add(Write, handlers::write);
    add(Lseek, handlers::lseek);
    add(Fcntl, handlers::fcntl);
    add(Ioctl, handlers::ioctl);
    add(Unlink, handlers::unlink);
    add(Getdents64, handlers::getdents64);
    add(Stat, handlers::stat);
    add(Fstat, handlers::fstat);
    add(Lstat, handlers::lstat);
    add(Readlink, handlers::readlink);
    add(Access, handlers::access);
    add(Chmod, handlers::chmod);
    add(Chdir, handlers::chdir);
    add(Mkdir, handlers::mkdir);
    add(Rmdir, handlers::rmdir);
    add(Rename, handlers::rename);
    add(Remove, handlers::remove);
    add(Mkstemp, handlers::mkstemp);
    add(Mkfifo, handlers::mkfifo);
    add(Dup2, handlers::dup2);
    add(Pipe, handlers::pipe);

    add(Fopen, handlers::fopen);
    add(Fclose, handlers::fclose);
    add(Fread, handlers::fread);
    add(Fwrite, handlers::fwrite);
    add(Freopen, handlers::freopen);
    add(Fputs, handlers::fputs);
    add(Fgets, handlers::fgets);
    add(Feof, handlers::feof);
    add(Fprintf, handlers::fprintf);
    add(Getc, handlers::getc);
    add(Ferror, handlers::ferror);
    add(GetcUnlocked, handlers::getc_unlocked);
    add(Pclose, handlers::pclose);
    add(Tmpfile, handlers::tmpfile);
    add(Clearerr, handlers::clearerr);
    add(Popen, handlers::popen);
    add(Ungetc, handlers::ungetc);
    add(Fseeko, handlers::fseeko);
    add(Ftello, handlers::ftello);
    add(Fseek, handlers::fseek);
    add(Ftell, handlers::ftell);
    add(Fflush, handlers::fflush);
    add(Getwc, handlers::getwc);
    add(Putwc, handlers::putwc);
    add(Putc, handlers::putc);
    add(Ungetwc, handlers::ungetwc);
    add(Fdopen, handlers::fdopen);
    add(Fileno, handlers::fileno);
    add(Setvbuf, handlers::setvbuf);
    add(FscanfOneArg, handlers::fscanf_one_arg);

    add(Printf, handlers::printf);
    add(Putchar, handlers::putchar);
    add(Socket, handlers::socket);
    add(Bind, handlers::bind);
    add(Connect, handlers::connect);
    add(Listen, handlers::listen);
    add(Accept, handlers::accept);
    add(Accept4, handlers::accept4);
    add(Send, handlers::send);
    add(Sendto, handlers::sendto);
    add(Recv, handlers::recv);
    add(Recvfrom, handlers::recvfrom);
    add(Shutdown, handlers::shutdown);
    add(Setsockopt, handlers::setsockopt);
    add(Getsockopt, handlers::getsockopt);
    add(Getpeername, handlers::getpeername);
    add(Getsockname, handlers::getsockname);
    add(Gethostname, handlers::gethostname);
    add(Gethostbyaddr, handlers::gethostbyaddr);
    add(Gethostbyname, handlers::gethostbyname);
    add(Getaddrinfo, handlers::getaddrinfo);
    add(Freeaddrinfo, handlers::freeaddrinfo);
    add(GaiStrerror, handlers::gai_strerror);
    add(IfNameindex, handlers::if_nameindex);
    add(Select, handlers::select);
    add(Poll, handlers::poll);
    add(Writev, handlers::writev);
    t
}

pub struct RpcServer {
    handles: Arc<Mutex<HandleTable>>,
    table: Arc<HashMap<u32, HandlerFn>>,
    mode: Mode,
    pool: Option<worker::Pool>,
    sender: Option<Arc<dyn EndpointSender>>,
    remote_addr: Option<u32>,
}

impl RpcServer {
    pub fn new(mode: Mode) -> Self {
        let pool = match mode {
            Mode::Worker {
                pool_size,
                queue_depth,
            } => Some(worker::Pool::new(pool_size, queue_depth)),
            Mode::Inline => None,
        };
        Self {
            handles: Arc::new(Mutex::new(HandleTable::new())),
            table: Arc::new(dispatch_table()),
            mode,
            pool,
            sender: None,
            remote_addr: None,
        }
    }

    fn run_request(
        table: &HashMap<u32, HandlerFn>,
        handles: &Mutex<HandleTable>,
        payload: &[u8],
    ) -> Reply {
        if payload.len() > wire::MAX_RPC_PAYLOAD {
            return Reply::err(0, Status::Overlong, 0);
        }
        let req = match wire::decode_request(payload) {
            Ok(req) => req,
            Err(_) => return Reply::err(0, Status::Corrupted, 0),
        };
        match table.get(&req.function_id) {
            Some(handler) => {
                let mut handles = handles.lock().unwrap();
                handler(&mut handles, req.trace_id, &req.body)
            }
            None => Reply::err(req.trace_id, Status::InvalidId, 0),
        }
    }
}

impl Service for RpcServer {
    fn name(&self) -> &str {
        ENDPOINT_NAME
    }

    fn ns_bind(&mut self, _name: &str, remote_addr: u32) -> Option<u32> {
        self.remote_addr = Some(remote_addr);
        Some(LOCAL_ADDR)
    }

    fn bind_sender(&mut self, sender: Arc<dyn EndpointSender>) {
        self.sender = Some(sender);
    }

    fn on_message(&mut self, payload: &[u8]) {
        let Some(sender) = self.sender.clone() else {
            log::warn!("rpmsg-rpc: message arrived before a send path was bound, dropping");
            return;
        };
        let Some(remote_addr) = self.remote_addr else {
            return;
        };

        let table = self.table.clone();
        let handles = self.handles.clone();
        let payload = payload.to_vec();

        let send_reply = move |reply: Reply| {
            let bytes = wire::encode_reply(&reply);
            if let Err(e) = sender.send(LOCAL_ADDR, remote_addr, &bytes) {
                log::warn!("rpmsg-rpc: failed to send reply: {e}");
            }
        };

        match &self.pool {
            Some(pool) => {
                let job = worker::Job::new(move || {
                    let reply = Self::run_request(&table, &handles, &payload);
                    send_reply(reply);
                });
                if let Err(_full) = pool.try_submit(job) {
                    log::warn!("rpmsg-rpc: worker queue full, replying no-memory");
                    send_reply(Reply::err(0, Status::NoMemory, 0));
                }
            }
            None => {
                let reply = Self::run_request(&table, &handles, &payload);
                send_reply(reply);
            }
        }
    }

    fn remove(&mut self) {
        self.sender = None;
        self.remote_addr = None;
    }
}

impl Drop for RpcServer {
    /// Mirrors the original's `rpmsg_rpc_service_terminate`: let whatever
    /// is queued or in flight finish rather than abandoning it mid-syscall.
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSender {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl EndpointSender for RecordingSender {
        fn send(&self, _local: u32, _remote: u32, payload: &[u8]) -> Result<(), amp_rpmsg::sender::Error> {
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    #[test]
    fn unknown_function_id_gets_invalid_id_status() {
        let table = dispatch_table();
        let handles = Mutex::new(HandleTable::new());
        let req = wire::Request {
            trace_id: 5,
            function_id: 0xdead_beef,
            body: Vec::new(),
        };
        let bytes = bincode::encode_to_vec(&req, bincode::config::standard()).unwrap();
        let reply = RpcServer::run_request(&table, &handles, &bytes);
        assert_eq!(reply.status, Status::InvalidId);
        assert_eq!(reply.trace_id, 5);
    }

    #[test]
    fn overlong_payload_is_rejected_before_decoding() {
        let table = dispatch_table();
        let handles = Mutex::new(HandleTable::new());
        let bytes = vec![0u8; wire::MAX_RPC_PAYLOAD + 1];
        let reply = RpcServer::run_request(&table, &handles, &bytes);
        assert_eq!(reply.status, Status::Overlong);
    }

    #[test]
    fn inline_mode_dispatches_and_replies_synchronously() {
        let mut server = RpcServer::new(Mode::Inline);
        let remote_addr = 0x20;
        assert_eq!(server.ns_bind("rpmsg-rpc", remote_addr), Some(LOCAL_ADDR));
        let recorder = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        });
        server.bind_sender(recorder.clone());

        let req = wire::Request {
            trace_id: 42,
            function_id: FunctionId::Putchar as u32,
            body: bincode::encode_to_vec(
                &handlers::PutcharReq { c: b'x' as i32 },
                bincode::config::standard(),
            )
            .unwrap(),
        };
        let payload = bincode::encode_to_vec(&req, bincode::config::standard()).unwrap();
        server.on_message(&payload);

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (reply, _): (Reply, usize) =
            bincode::decode_from_slice(&sent[0], bincode::config::standard()).unwrap();
        assert_eq!(reply.trace_id, 42);
        assert_eq!(reply.status, Status::Ok);
    }

    #[test]
    fn worker_mode_eventually_delivers_a_reply() {
        let mut server = RpcServer::new(Mode::Worker {
            pool_size: 1,
            queue_depth: 4,
        });
        server.ns_bind("rpmsg-rpc", 0x30);
        let recorder = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        });
        server.bind_sender(recorder.clone());

        let count = AtomicUsize::new(0);
        let req = wire::Request {
            trace_id: 7,
            function_id: FunctionId::Gethostname as u32,
            body: Vec::new(),
        };
        let payload = bincode::encode_to_vec(&req, bincode::config::standard()).unwrap();
        server.on_message(&payload);
        drop(server);

        // drop() joins the worker pool, so by now the reply has landed.
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        count.fetch_add(1, Ordering::SeqCst);
    }
}
