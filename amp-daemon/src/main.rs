//! The host coordinator daemon: binds the control-plane sockets and, for
//! every client the CLI creates, wires up an `amp_core::Client` with the
//! `rpmsg-rpc`, `rpmsg-tty`, and `debug-rtos-kernel` services registered,
//! then drives its lifecycle off the per-client control socket.
//!
//! Grounded in the original's `main.c`: signal-driven shutdown instead of
//! the semaphore/`sigaction` pair, no double-fork daemonization or pidfile
//! (out of scope; run under whatever supervises the process — systemd,
//! runit, or a plain foreground shell).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Parser, ValueEnum};

use amp_core::{Client, ClientConfig};
use amp_ctl::protocol::SOCKET_DIR;
use amp_ctl::server::{cleanup_socket_dir, prepare_socket_dir, ClientActions, ClientFactory, ClientListener, CreateListener};
use amp_ctl::CreateRequest;
use amp_rproc::Backend;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    BareMetal,
    Partition,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// directory the control-plane sockets live under
    #[arg(long, default_value = SOCKET_DIR)]
    socket_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = BackendKind::BareMetal)]
    backend: BackendKind,

    /// bare-metal backend: the cpu-control device; partition backend: the
    /// hypervisor cli binary
    #[arg(long, default_value = "/dev/amp-ctl0")]
    backend_path: PathBuf,

    /// partition backend only: the UIO device node for the inter-partition
    /// shared-memory doorbell
    #[arg(long)]
    uio: Option<PathBuf>,

    /// partition backend only: cell config handed to the hypervisor cli on create
    #[arg(long)]
    cell_config: Option<PathBuf>,

    #[arg(long, default_value_t = 0x7000_0000)]
    shmem_phys_base: u64,

    #[arg(long, default_value_t = 0x30000)]
    shmem_size: usize,

    #[arg(long, default_value_t = 0)]
    raw_blob_load_addr: u64,
}

struct Daemon {
    args: Args,
    next_instance: AtomicUsize,
    clients: Mutex<HashMap<String, Arc<Mutex<Client>>>>,
    listeners: Mutex<Vec<ClientListener>>,
}

impl Daemon {
    fn build_backend(&self, cpu: u32) -> Result<Box<dyn Backend>, amp_rproc::Error> {
        match self.args.backend {
            BackendKind::BareMetal => Ok(Box::new(amp_rproc::baremetal::BareMetalBackend::new(
                &self.args.backend_path,
                cpu,
            )?)),
            BackendKind::Partition => {
                let uio = self.args.uio.clone().ok_or(amp_rproc::Error::Unsupported)?;
                let cell_config = self.args.cell_config.clone().ok_or(amp_rproc::Error::Unsupported)?;
                Ok(Box::new(amp_rproc::partition::PartitionBackend::new(
                    &self.args.backend_path,
                    format!("amp-{cpu}"),
                    uio,
                    cell_config,
                )?))
            }
        }
    }

    /// Loads the image and maps shared memory. The fixed set of services a
    /// client carries (`rpmsg-rpc`, `rpmsg-tty`) is registered once the
    /// client's first `start()` brings the receive loop up — `amp_core::
    /// Client` only accepts new services while `Running`, so registration
    /// lives in `ClientHandle::start` rather than here. The debug-ring
    /// transport needs no such registration: `Client::start` wires it up
    /// directly from the `RSC_VENDOR_RBUF_PAIR` resource-table entry.
    fn create_client(&self, req: CreateRequest) -> Result<(), String> {
        let mut clients = self.clients.lock().unwrap();
        if clients.contains_key(&req.name) {
            return Err(format!("client {} already exists", req.name));
        }

        let image_bytes = std::fs::read(&req.firmware_path)
            .map_err(|e| format!("reading {}: {e}", req.firmware_path))?;

        let backend = self.build_backend(req.cpu).map_err(|e| e.to_string())?;
        let config = ClientConfig {
            name: req.name.clone(),
            cpu_id: req.cpu,
            shmem_phys_base: self.args.shmem_phys_base,
            shmem_size: self.args.shmem_size,
            raw_blob_load_addr: self.args.raw_blob_load_addr,
        };

        let mut client = Client::new(config, backend);
        client.configure(&image_bytes).map_err(|e| e.to_string())?;

        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(Mutex::new(client));
        let mut listener =
            ClientListener::bind(&self.args.socket_dir, &req.name).map_err(|e| e.to_string())?;
        listener.serve(ClientHandle { client: client.clone(), instance });

        clients.insert(req.name.clone(), client);
        self.listeners.lock().unwrap().push(listener);
        Ok(())
    }

    fn shutdown(&self) {
        for listener in self.listeners.lock().unwrap().iter_mut() {
            listener.stop();
        }
        for (name, client) in self.clients.lock().unwrap().drain() {
            if let Err(e) = client.lock().unwrap().stop() {
                log::warn!("{name}: error stopping during shutdown: {e}");
            }
        }
    }
}

struct DaemonFactory(Arc<Daemon>);

impl ClientFactory for DaemonFactory {
    fn create(&mut self, req: CreateRequest) -> Result<(), String> {
        self.0.create_client(req)
    }
}

struct ClientHandle {
    client: Arc<Mutex<Client>>,
    instance: usize,
}

impl ClientActions for ClientHandle {
    /// Brings the receive loop up, then (re-)registers the fixed service
    /// set. Registering after `start` rather than before means a stop
    /// immediately followed by a start re-registers the same services
    /// against the same long-lived registry, instead of losing them.
    fn start(&mut self) -> Result<(), String> {
        let mut client = self.client.lock().unwrap();
        client.start().map_err(|e| e.to_string())?;
        client
            .register_service(Box::new(amp_pty::PtyService::new(self.instance)))
            .map_err(|e| e.to_string())?;
        client
            .register_service(Box::new(amp_rpc::RpcServer::new(amp_rpc::Mode::default())))
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        self.client.lock().unwrap().stop().map_err(|e| e.to_string())
    }

    fn status(&self) -> String {
        self.client.lock().unwrap().status()
    }
}

fn wait_for_termination() {
    let term = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(e) = signal_hook::flag::register(sig, term.clone()) {
            log::warn!("failed to register handler for signal {sig}: {e}");
        }
    }
    while !term.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = prepare_socket_dir(&args.socket_dir) {
        log::error!("failed to prepare control socket directory: {e}");
        std::process::exit(1);
    }

    let daemon = Arc::new(Daemon {
        args,
        next_instance: AtomicUsize::new(0),
        clients: Mutex::new(HashMap::new()),
        listeners: Mutex::new(Vec::new()),
    });

    let mut create_listener = match CreateListener::bind(&daemon.args.socket_dir) {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind create socket: {e}");
            cleanup_socket_dir(&daemon.args.socket_dir);
            std::process::exit(1);
        }
    };
    create_listener.serve(DaemonFactory(daemon.clone()));
    log::info!("amp-daemon started, control sockets under {}", daemon.args.socket_dir.display());

    wait_for_termination();

    log::info!("shutting down");
    create_listener.stop();
    daemon.shutdown();
    cleanup_socket_dir(&daemon.args.socket_dir);
}
