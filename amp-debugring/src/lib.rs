//! The `debug-rtos-kernel` transport: bridges a pair of ring buffers
//! living in the `RSC_VENDOR_RBUF_PAIR` shared-memory window to a local
//! Unix socket a debug proxy or `gdb -ex "target remote"` front-end can
//! connect to, the same shared-memory rx/tx ring-buffer pair the original
//! `rbuf_device`/`mica_gdb_server` bridged to a pair of POSIX message
//! queues. Unlike the `rpmsg-rpc`/`rpmsg-tty` services, this never goes
//! through the endpoint registry or the rpmsg virtqueues: the remote
//! firmware and this service address the same fixed carveout directly.
//!
//! Only one debug client is serviced at a time, matching the original's
//! single message-queue pair per client OS.

pub mod shm;

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use shm::ShmRing;

pub const ENDPOINT_NAME: &str = "debug-rtos-kernel";
const SOCKET_PREFIX: &str = "/run/amp/debug-ring";
const READ_CHUNK: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind debug socket at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Drives one client's debug ring pair: accepts at most one connection at a
/// time on a Unix socket, forwarding bytes written by the socket peer into
/// `to_remote` and bytes arriving on `from_remote` back out to the peer.
pub struct DebugRingService {
    instance: usize,
    socket_path: String,
    active: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl DebugRingService {
    /// # Safety
    /// `to_remote`/`from_remote` must each point at `to_remote_len`/
    /// `from_remote_len` bytes of shared memory that outlive the spawned
    /// threads, disjoint from one another and from anything else touching
    /// this carveout.
    pub unsafe fn start(
        instance: usize,
        to_remote: *mut u8,
        to_remote_len: usize,
        from_remote: *mut u8,
        from_remote_len: usize,
    ) -> Result<Self, Error> {
        let socket_path = format!("{SOCKET_PREFIX}{instance}.sock");
        let _ = std::fs::remove_file(&socket_path);
        if let Some(parent) = std::path::Path::new(&socket_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(&socket_path).map_err(|source| Error::Bind {
            path: socket_path.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .expect("unix listener supports nonblocking mode");

        let to_remote = ShmRing::init(to_remote, to_remote_len);
        let from_remote = ShmRing::init(from_remote, from_remote_len);
        let active = Arc::new(AtomicBool::new(true));

        log::info!("debug-rtos-kernel: listening at {socket_path}");
        let accept_thread = std::thread::spawn({
            let active = active.clone();
            move || accept_loop(listener, to_remote, from_remote, active)
        });

        Ok(Self {
            instance,
            socket_path,
            active,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for DebugRingService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accepts one debug-client connection at a time and bridges it to the
/// ring pair until the service is torn down.
fn accept_loop(listener: UnixListener, to_remote: ShmRing, from_remote: ShmRing, active: Arc<AtomicBool>) {
    while active.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let Ok(write_half) = stream.try_clone() else {
                    continue;
                };
                let writer = std::thread::spawn({
                    let active = active.clone();
                    let from_remote_ptr = &from_remote as *const ShmRing;
                    // Safety: `from_remote` outlives both threads; they never
                    // touch overlapping byte ranges of the shared memory.
                    let from_remote = unsafe { &*from_remote_ptr };
                    move || writer_loop(write_half, active, from_remote)
                });
                reader_loop(stream, &to_remote, active.clone());
                let _ = writer.join();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(_) => break,
        }
    }
}

/// Reads bytes arriving on the debug socket and writes them straight into
/// the to-remote ring, mirroring `send_to_shared_mem`.
fn reader_loop(mut stream: UnixStream, to_remote: &ShmRing, active: Arc<AtomicBool>) {
    stream
        .set_read_timeout(Some(POLL_INTERVAL))
        .expect("unix stream supports a read timeout");
    let mut buf = [0u8; READ_CHUNK];
    while active.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                to_remote.write(&buf[..n]);
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(_) => break,
        }
    }
}

/// Polls the from-remote ring and forwards whatever is available to the
/// connected debug client, mirroring `recv_from_shared_mem_thread`. There's
/// no notifier for this carveout, so this busy-polls the same way the
/// original's `metal_cache_invalidate` loop did.
fn writer_loop(mut stream: UnixStream, active: Arc<AtomicBool>, from_remote: &ShmRing) {
    while active.load(Ordering::SeqCst) {
        if from_remote.is_empty() {
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }
        let chunk = from_remote.drain(READ_CHUNK);
        if !chunk.is_empty() && stream.write_all(&chunk).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_binds_a_socket_named_after_the_instance() {
        let instance = 900 + std::process::id() as usize % 1000;
        let mut tx = vec![0u8; 256];
        let mut rx = vec![0u8; 256];
        let svc = unsafe {
            DebugRingService::start(instance, tx.as_mut_ptr(), tx.len(), rx.as_mut_ptr(), rx.len())
        }
        .unwrap();
        assert!(std::path::Path::new(&svc.socket_path).exists());
    }
}
