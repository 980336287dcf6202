//! The CLI side of the control plane: connect to a socket under
//! [`SOCKET_DIR`], send one request, read back the one-line reply.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::protocol::{create_socket_path, client_socket_path, CreateRequest, Verb, MAX_RESPONSE_MSG};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error talking to the daemon: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

fn connect(path: &Path) -> Result<UnixStream, Error> {
    UnixStream::connect(path).map_err(|source| Error::Connect {
        path: path.display().to_string(),
        source,
    })
}

fn read_response(mut stream: UnixStream) -> Result<String, Error> {
    let mut buf = Vec::with_capacity(MAX_RESPONSE_MSG);
    stream.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Sends a create request to the well-known socket under `dir` and returns
/// the daemon's one-line reply.
pub fn create(dir: &Path, cpu: u32, name: &str, firmware_path: &str) -> Result<String, Error> {
    let req = CreateRequest {
        cpu,
        name: name.to_string(),
        firmware_path: firmware_path.to_string(),
    };
    let bytes = bincode::encode_to_vec(&req, bincode::config::standard())?;
    let mut stream = connect(&create_socket_path(dir))?;
    stream.write_all(&bytes)?;
    stream.shutdown(std::net::Shutdown::Write)?;
    read_response(stream)
}

/// Sends a verb to a client's per-client socket under `dir` and returns
/// the daemon's one-line reply.
pub fn send_verb(dir: &Path, name: &str, verb: Verb) -> Result<String, Error> {
    let mut stream = connect(&client_socket_path(dir, name))?;
    stream.write_all(verb.as_str().as_bytes())?;
    stream.shutdown(std::net::Shutdown::Write)?;
    read_response(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ClientActions, ClientFactory, ClientListener, CreateListener};
    use std::sync::{Arc, Mutex};

    struct Recorder(Arc<Mutex<Vec<CreateRequest>>>);
    impl ClientFactory for Recorder {
        fn create(&mut self, req: CreateRequest) -> Result<(), String> {
            self.0.lock().unwrap().push(req);
            Ok(())
        }
    }

    struct Noop;
    impl ClientActions for Noop {
        fn start(&mut self) -> Result<(), String> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), String> {
            Ok(())
        }
        fn status(&self) -> String {
            "idle".to_string()
        }
    }

    #[test]
    fn create_client_round_trips_against_a_real_listener() {
        let dir = std::env::temp_dir().join(format!("amp-ctl-client-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let mut listener = CreateListener::bind(&dir).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        listener.serve(Recorder(seen.clone()));

        let resp = create(&dir, 3, "rt1", "/fw/rt1.elf").unwrap();
        assert_eq!(resp, "AMP-SUCCESS");
        assert_eq!(seen.lock().unwrap()[0].cpu, 3);

        listener.stop();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn verb_client_round_trips_against_a_real_listener() {
        let dir = std::env::temp_dir().join(format!("amp-ctl-verb-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let mut listener = ClientListener::bind(&dir, "rt1").unwrap();
        listener.serve(Noop);

        let resp = send_verb(&dir, "rt1", Verb::Status).unwrap();
        assert_eq!(resp, "idle");

        listener.stop();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
