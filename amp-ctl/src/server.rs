//! The daemon side of the control plane: a listener thread per socket,
//! same shape as the original's `epoll`-driven `wait_create_msg` loop
//! minus the epoll — each socket gets its own accept thread since nothing
//! here needs to multiplex thousands of descriptors, just the handful of
//! clients a host actually runs.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::protocol::{
    client_socket_path, create_socket_path, CreateRequest, Verb, MAX_CREATE_MSG, MAX_VERB_MSG,
    MSG_FAILED, MSG_SUCCESS, SOCKET_DIR,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to prepare socket directory {path}: {source}")]
    Dir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Recreates the socket directory empty, mirroring `register_socket_listener`'s
/// `rmrf` + `mkdir` pair.
pub fn prepare_socket_dir(dir: &Path) -> Result<(), Error> {
    let _ = std::fs::remove_dir_all(dir);
    std::fs::create_dir_all(dir).map_err(|source| Error::Dir {
        path: dir.display().to_string(),
        source,
    })
}

/// Removes the socket directory, mirroring `unregister_socket_listener`.
pub fn cleanup_socket_dir(dir: &Path) {
    let _ = std::fs::remove_dir_all(dir);
}

/// What a client's per-socket listener drives into the running daemon.
/// Kept deliberately thin — this crate owns socket plumbing and the text
/// protocol, not client lifecycle policy.
pub trait ClientActions: Send {
    fn start(&mut self) -> Result<(), String>;
    fn stop(&mut self) -> Result<(), String>;
    fn status(&self) -> String;
}

/// What the well-known create socket drives: given a parsed request,
/// either stand up a new client (and its per-client listener) or report
/// why it couldn't.
pub trait ClientFactory: Send {
    fn create(&mut self, req: CreateRequest) -> Result<(), String>;
}

fn bind(path: &Path) -> Result<UnixListener, Error> {
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).map_err(|source| Error::Bind {
        path: path.display().to_string(),
        source,
    })
}

fn respond(mut stream: UnixStream, ok: bool, detail: Option<&str>) {
    let line = match (ok, detail) {
        (true, _) => MSG_SUCCESS.to_string(),
        (false, Some(d)) => format!("{MSG_FAILED}: {d}"),
        (false, None) => MSG_FAILED.to_string(),
    };
    let _ = stream.write_all(line.as_bytes());
    let _ = stream.shutdown(std::net::Shutdown::Write);
}

/// The well-known `amp-create` listener: accepts connections in a loop,
/// decodes a [`CreateRequest`] from each, and hands it to `factory`.
pub struct CreateListener {
    listener: UnixListener,
    path: PathBuf,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CreateListener {
    pub fn bind(dir: &Path) -> Result<Self, Error> {
        let path = create_socket_path(dir);
        let listener = bind(&path)?;
        Ok(Self {
            listener,
            path,
            active: Arc::new(AtomicBool::new(true)),
            thread: None,
        })
    }

    pub fn serve(&mut self, mut factory: impl ClientFactory + 'static) {
        let listener = self.listener.try_clone().expect("listener fd is dup-able");
        let active = self.active.clone();
        self.thread = Some(std::thread::spawn(move || {
            for conn in listener.incoming() {
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(mut stream) = conn else { continue };
                let mut buf = [0u8; MAX_CREATE_MSG];
                let n = match stream.read(&mut buf) {
                    Ok(n) if n > 0 => n,
                    _ => continue,
                };
                match bincode::decode_from_slice::<CreateRequest, _>(&buf[..n], bincode::config::standard()) {
                    Ok((req, _)) => match factory.create(req) {
                        Ok(()) => respond(stream, true, None),
                        Err(reason) => respond(stream, false, Some(&reason)),
                    },
                    Err(e) => {
                        log::warn!("amp-create: malformed create request: {e}");
                        respond(stream, false, Some("malformed request"));
                    }
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        // Nudge the blocking `accept()` loop so it notices `active` went
        // false instead of waiting for the next real connection.
        let _ = UnixStream::connect(&self.path);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// A per-client listener driving start/stop/status verbs into a
/// [`ClientActions`] implementation, same contract as `client_ctrl_handler`.
pub struct ClientListener {
    name: String,
    listener: UnixListener,
    path: PathBuf,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ClientListener {
    pub fn bind(dir: &Path, name: &str) -> Result<Self, Error> {
        let path = client_socket_path(dir, name);
        let listener = bind(&path)?;
        Ok(Self {
            name: name.to_string(),
            listener,
            path,
            active: Arc::new(AtomicBool::new(true)),
            thread: None,
        })
    }

    pub fn serve(&mut self, actions: impl ClientActions + 'static) {
        let listener = self.listener.try_clone().expect("listener fd is dup-able");
        let active = self.active.clone();
        let actions = std::sync::Mutex::new(actions);
        self.thread = Some(std::thread::spawn(move || {
            for conn in listener.incoming() {
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(mut stream) = conn else { continue };
                let mut buf = [0u8; MAX_VERB_MSG];
                let n = match stream.read(&mut buf) {
                    Ok(n) if n > 0 => n,
                    _ => continue,
                };
                let text = String::from_utf8_lossy(&buf[..n]);
                let mut guard = actions.lock().unwrap();
                match text.parse::<Verb>() {
                    Ok(Verb::Start) => match guard.start() {
                        Ok(()) => respond(stream, true, None),
                        Err(reason) => respond(stream, false, Some(&reason)),
                    },
                    Ok(Verb::Stop) => match guard.stop() {
                        Ok(()) => respond(stream, true, None),
                        Err(reason) => respond(stream, false, Some(&reason)),
                    },
                    Ok(Verb::Status) => {
                        let line = guard.status();
                        let _ = stream.write_all(line.as_bytes());
                        let _ = stream.shutdown(std::net::Shutdown::Write);
                    }
                    Err(()) => respond(stream, false, Some("invalid command")),
                }
            }
        }));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = UnixStream::connect(&self.path);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::sync::Mutex;

    struct RecordingFactory {
        seen: Arc<Mutex<Vec<CreateRequest>>>,
    }

    impl ClientFactory for RecordingFactory {
        fn create(&mut self, req: CreateRequest) -> Result<(), String> {
            self.seen.lock().unwrap().push(req);
            Ok(())
        }
    }

    struct FixedActions;

    impl ClientActions for FixedActions {
        fn start(&mut self) -> Result<(), String> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), String> {
            Err("not running".to_string())
        }
        fn status(&self) -> String {
            "running".to_string()
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("amp-ctl-test-{tag}-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn create_listener_round_trips_a_request() {
        let dir = temp_dir("create");
        let mut listener = CreateListener::bind(&dir).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        listener.serve(RecordingFactory { seen: seen.clone() });

        let req = CreateRequest {
            cpu: 1,
            name: "rt0".to_string(),
            firmware_path: "/fw/rt0.elf".to_string(),
        };
        let bytes = bincode::encode_to_vec(&req, bincode::config::standard()).unwrap();
        let mut stream = UnixStream::connect(create_socket_path(&dir)).unwrap();
        stream.write_all(&bytes).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).unwrap();
        assert_eq!(resp, MSG_SUCCESS);

        listener.stop();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].name, "rt0");
        cleanup_socket_dir(&dir);
    }

    #[test]
    fn client_listener_dispatches_verbs() {
        let dir = temp_dir("client");
        let mut listener = ClientListener::bind(&dir, "rt0").unwrap();
        listener.serve(FixedActions);

        let mut stream = UnixStream::connect(client_socket_path(&dir, "rt0")).unwrap();
        stream.write_all(b"status").unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).unwrap();
        assert_eq!(resp, "running");

        listener.stop();
        cleanup_socket_dir(&dir);
    }
}
