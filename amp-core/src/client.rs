//! The lifecycle orchestrator: one `Client` per remote core, carrying it
//! through Offline -> Configured -> Ready -> Running (and back down again
//! through Suspended/Offline), driving the lower layers in the same order
//! the original host daemon did: load the image, map shared memory, patch
//! the resource table, release the core, then stand up rpmsg on top.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use amp_notify::Notifier;
use amp_rproc::{Backend, MmapAttrs};
use amp_rpmsg::{Registry, VqSender};
use amp_virtio::{Consumer, Producer};
use vm_memory::GuestAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Offline,
    Configured,
    Ready,
    Running,
    Suspended,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("client is in state {actual:?}, expected {expected:?}")]
    WrongState { expected: State, actual: State },
    #[error("remote-processor backend error: {0}")]
    Rproc(#[from] amp_rproc::Error),
    #[error("shared-memory pool error: {0}")]
    Shmpool(#[from] amp_shmpool::Error),
    #[error("image load error: {0}")]
    Loader(#[from] amp_loader::Error),
    #[error("resource table error: {0}")]
    RscTable(#[from] amp_rsctable::Error),
    #[error("virtqueue error: {0}")]
    Virtio(#[from] amp_virtio::Error),
    #[error("backend exposes no event notifier")]
    NoNotifier,
    #[error("image segment lands outside the mapped shared-memory region")]
    SegmentOutOfRange,
    #[error("debug ring transport error: {0}")]
    DebugRing(#[from] amp_debugring::Error),
}

pub struct ClientConfig {
    pub name: String,
    pub cpu_id: u32,
    pub shmem_phys_base: u64,
    pub shmem_size: usize,
    /// load address used when the image is a raw blob, not an ELF
    pub raw_blob_load_addr: u64,
}

/// Number and size of the pre-carved buffers backing the host->remote
/// (TX) virtqueue. One rpmsg frame per buffer, same assumption OpenAMP's
/// fixed-size rpmsg buffer pool makes.
const TX_BUF_COUNT: usize = 16;
const TX_BUF_SIZE: usize = 512;

struct RunningHandle {
    notifier: Arc<Notifier>,
    thread: std::thread::JoinHandle<()>,
}

/// "No fixed address": the remoteproc convention for a vring `da` the host
/// is free to place wherever it likes, as opposed to a concrete address the
/// firmware already expects.
const RSC_ANY_ADDR: u32 = 0xFFFF_FFFF;

pub struct Client {
    config: ClientConfig,
    backend: Arc<Mutex<Box<dyn Backend>>>,
    pool: amp_shmpool::Pool,
    state: State,
    image: Option<amp_loader::LoadedImage>,
    rsc_table_virt: Option<usize>,
    /// Outlives any single `start`/`stop` cycle: the services a caller
    /// registers survive a stop immediately followed by a start, since
    /// nothing ever takes this out of the client the way the receive-loop
    /// thread used to.
    registry: Arc<Mutex<Registry>>,
    running: Option<RunningHandle>,
    debug_ring: Option<amp_debugring::DebugRingService>,
    /// Whether `backend.start()` succeeded during the current (or most
    /// recently attempted) `start()` call, independent of `state` — lets
    /// `stop()`/rollback know whether the backend genuinely needs undoing.
    backend_started: bool,
}

impl Client {
    pub fn new(config: ClientConfig, backend: Box<dyn Backend>) -> Self {
        Self {
            config,
            backend: Arc::new(Mutex::new(backend)),
            pool: amp_shmpool::Pool::new(),
            state: State::Offline,
            image: None,
            rsc_table_virt: None,
            registry: Arc::new(Mutex::new(Registry::new())),
            running: None,
            debug_ring: None,
            backend_started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn require_state(&self, expected: State) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::WrongState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Registers a service against an already-running receive loop. Remote
    /// announcements the firmware sent before this call — including ones
    /// `start` seeded from a surviving EPT_TABLE entry — are matched
    /// immediately.
    pub fn register_service(&mut self, svc: Box<dyn amp_rpmsg::Service>) -> Result<(), Error> {
        self.require_state(State::Running)?;
        self.registry.lock().unwrap().register_service(svc);
        Ok(())
    }

    /// Maps shared memory, copies the image's loadable segments in, and
    /// locates (but does not yet start using) the embedded resource table.
    pub fn configure(&mut self, image_bytes: &[u8]) -> Result<(), Error> {
        self.require_state(State::Offline)?;

        let image = amp_loader::load(image_bytes, self.config.raw_blob_load_addr)?;

        let io = {
            let mut backend = self.backend.lock().unwrap();
            backend.mmap(
                self.config.shmem_phys_base,
                self.config.shmem_size,
                MmapAttrs::SHARED,
            )?
        };
        self.pool.init(io)?;

        let mem = unsafe { std::slice::from_raw_parts_mut(io.virt_base as *mut u8, io.size) };
        for seg in &image.segments {
            let dst_off = seg
                .paddr
                .checked_sub(io.phys_base)
                .ok_or(Error::SegmentOutOfRange)? as usize;
            let dst = mem
                .get_mut(dst_off..dst_off + seg.filesz)
                .ok_or(Error::SegmentOutOfRange)?;
            dst.copy_from_slice(&image_bytes[seg.data_offset..seg.data_offset + seg.filesz]);
            if seg.memsz > seg.filesz {
                mem.get_mut(dst_off + seg.filesz..dst_off + seg.memsz)
                    .ok_or(Error::SegmentOutOfRange)?
                    .fill(0);
            }
        }

        if let Some((rsc_pa, rsc_size)) = image.resource_table {
            let rsc_virt = self.pool.phys_to_virt(rsc_pa)?;
            self.rsc_table_virt = Some(rsc_virt);
            self.backend.lock().unwrap().configure(rsc_pa, rsc_size)?;
        }

        self.image = Some(image);
        self.state = State::Configured;
        Ok(())
    }

    /// Allocates vring memory for the VDEV entry (if any), patches the
    /// table with the chosen addresses, sets up the debug ring and rpmsg
    /// receive loop, and only then releases the core. The VDEV's first
    /// vring is treated as the host-receive ring (remote publishes, host
    /// consumes); the second, if present, as the host-transmit ring (host
    /// publishes, remote consumes) and backs the services' reply path.
    ///
    /// Any step failing restores the client to `Configured`: whichever of
    /// the backend start, receive thread, and debug ring already came up
    /// get undone in reverse order before the error is returned.
    pub fn start(&mut self) -> Result<(), Error> {
        self.require_state(State::Configured)?;

        match self.try_start() {
            Ok(()) => {
                self.state = State::Running;
                Ok(())
            }
            Err(e) => {
                if let Some(mut svc) = self.debug_ring.take() {
                    svc.stop();
                }
                if let Some(running) = self.running.take() {
                    let _ = running.notifier.cancel();
                    let _ = running.thread.join();
                }
                if self.backend_started {
                    self.backend_started = false;
                    let _ = self.backend.lock().unwrap().stop();
                }
                Err(e)
            }
        }
    }

    fn try_start(&mut self) -> Result<(), Error> {
        let io = *self.pool.region().expect("configure() already ran");
        let image = self.image.as_ref().expect("configure() already ran");
        let entry = image.entry;

        let mut rx_vring = None;
        let mut tx_vring = None;
        let mut rbuf_pair = None;
        let mut ept_seed = Vec::new();
        let mut bind_change_ctx = None;

        if let Some(rsc_virt) = self.rsc_table_virt {
            let (_, rsc_size) = image.resource_table.expect("set alongside rsc_table_virt");
            let rsc_off = rsc_virt - io.virt_base;
            let mem = unsafe { std::slice::from_raw_parts_mut(io.virt_base as *mut u8, io.size) };
            let table = &mut mem[rsc_off..rsc_off + rsc_size];

            let header = amp_rsctable::parse_header(table)?;
            if let Ok(vdev_off) = amp_rsctable::find(table, &header, amp_rsctable::RSC_VDEV, 0) {
                let vdev = amp_rsctable::read_vdev(table, vdev_off)?;
                for (i, vring) in vdev.vrings.iter().enumerate() {
                    let size = ring_region_size(vring.num.max(1));
                    let virt = if vring.da == RSC_ANY_ADDR {
                        self.pool.alloc(size)?
                    } else {
                        self.pool.alloc_at(vring.da as u64, size)?
                    };
                    let pa = self.pool.virt_to_phys(virt)?;
                    amp_rsctable::write_vdev_vring_da(
                        table,
                        vdev_off,
                        i,
                        pa as u32,
                        &mut amp_rsctable::NoFlush,
                    )?;
                    let entry = (pa, vring.num.max(1) as u16, vring.notifyid);
                    if i == 0 {
                        rx_vring = Some(entry);
                    } else if i == 1 {
                        tx_vring = Some(entry);
                    }
                }
            }

            if let Ok(rbuf_off) = amp_rsctable::find(table, &header, amp_rsctable::RSC_VENDOR_RBUF_PAIR, 0)
            {
                let rbuf = amp_rsctable::read_rbuf_pair(table, rbuf_off)?;
                let virt = self.pool.alloc(rbuf.tx_len as usize + rbuf.rx_len as usize)?;
                let tx_virt = virt;
                let rx_virt = virt + rbuf.tx_len as usize;
                let tx_pa = self.pool.virt_to_phys(tx_virt)?;
                let rx_pa = self.pool.virt_to_phys(rx_virt)?;
                amp_rsctable::write_rbuf_pair_addrs(
                    table,
                    rbuf_off,
                    tx_pa,
                    rx_pa,
                    &mut amp_rsctable::NoFlush,
                )?;
                amp_rsctable::set_rbuf_pair_state(
                    table,
                    rbuf_off,
                    amp_rsctable::RBUF_STATE_INIT,
                    &mut amp_rsctable::NoFlush,
                )?;
                rbuf_pair = Some((tx_virt, rbuf.tx_len as usize, rx_virt, rbuf.rx_len as usize));
            }

            if let Ok(ept_off) =
                amp_rsctable::find(table, &header, amp_rsctable::RSC_VENDOR_EPT_TABLE, 0)
            {
                let epts = amp_rsctable::read_ept_table(table, ept_off)?;
                for ept in &epts {
                    if ept.dest_addr != 0 {
                        let len = ept
                            .name
                            .iter()
                            .position(|&b| b == 0)
                            .unwrap_or(ept.name.len());
                        ept_seed.push((
                            String::from_utf8_lossy(&ept.name[..len]).into_owned(),
                            ept.dest_addr,
                        ));
                    }
                }
                bind_change_ctx = Some((rsc_off, rsc_size, ept_off));
            }
        }

        if !ept_seed.is_empty() {
            self.registry.lock().unwrap().seed_pending(&ept_seed);
        }
        if let Some((rsc_off, rsc_size, ept_off)) = bind_change_ctx {
            self.registry
                .lock()
                .unwrap()
                .set_on_bind_change(Box::new(move |projection| {
                    let mem = unsafe { std::slice::from_raw_parts_mut(io.virt_base as *mut u8, io.size) };
                    let table = &mut mem[rsc_off..rsc_off + rsc_size];
                    let epts: Vec<amp_rsctable::EptInfo> = projection
                        .iter()
                        .map(|(name, local_addr, remote_addr)| {
                            let mut name_buf = [0u8; amp_rsctable::NAME_SIZE];
                            let bytes = name.as_bytes();
                            let n = bytes.len().min(amp_rsctable::NAME_SIZE);
                            name_buf[..n].copy_from_slice(&bytes[..n]);
                            amp_rsctable::EptInfo {
                                name: name_buf,
                                addr: *local_addr,
                                dest_addr: *remote_addr,
                            }
                        })
                        .collect();
                    if let Err(e) = amp_rsctable::write_ept_table(table, ept_off, &epts, &mut amp_rsctable::NoFlush)
                    {
                        log::warn!("client: failed to regenerate EPT_TABLE entry: {e}");
                    }
                }));
        }

        let mem = if rx_vring.is_some() || tx_vring.is_some() {
            Some(unsafe { amp_virtio::memory_over_region(&io) }?)
        } else {
            None
        };

        if let (Some((tx_pa, qsize, vqid)), Some(mem)) = (tx_vring, mem.clone()) {
            let tx_bufs_virt = self.pool.alloc(TX_BUF_COUNT * TX_BUF_SIZE)?;
            let tx_bufs_pa = self.pool.virt_to_phys(tx_bufs_virt)?;
            let desc = GuestAddress(tx_pa - io.phys_base);
            let avail = desc.unchecked_add(qsize as u64 * 16);
            let used = avail.unchecked_add(4 + qsize as u64 * 2 + 2);
            let producer = Producer::new(mem, desc, avail, used, qsize);
            let backend = self.backend.clone();
            let sender = VqSender::new(
                producer,
                GuestAddress(tx_bufs_pa - io.phys_base),
                TX_BUF_SIZE,
                TX_BUF_COUNT,
                vqid,
                Box::new(move |vqid| {
                    backend
                        .lock()
                        .unwrap()
                        .notify(vqid)
                        .map_err(|e| e.to_string())
                }),
            );
            self.registry.lock().unwrap().set_sender(Arc::new(sender));
        }

        let consumer = match (rx_vring, mem) {
            (Some((rx_pa, qsize, _vqid)), Some(mem)) => {
                let desc = GuestAddress(rx_pa - io.phys_base);
                let avail = desc.unchecked_add(qsize as u64 * 16);
                let used = avail.unchecked_add(4 + qsize as u64 * 2 + 2);
                Some(Consumer::new(mem, desc, avail, used, qsize))
            }
            _ => None,
        };

        self.backend.lock().unwrap().start(entry)?;
        self.backend_started = true;

        if let Some(consumer) = consumer {
            let notifier = self
                .backend
                .lock()
                .unwrap()
                .notifier()
                .ok_or(Error::NoNotifier)?;
            let thread = amp_rpmsg::spawn_recv_loop(consumer, notifier.clone(), self.registry.clone());
            self.running = Some(RunningHandle { notifier, thread });
        }

        if let Some((tx_virt, tx_len, rx_virt, rx_len)) = rbuf_pair {
            let svc = unsafe {
                amp_debugring::DebugRingService::start(
                    self.config.cpu_id as usize,
                    tx_virt as *mut u8,
                    tx_len,
                    rx_virt as *mut u8,
                    rx_len,
                )
            }?;
            self.debug_ring = Some(svc);
        }

        Ok(())
    }

    /// Tears down the receive thread, debug ring, and backend, and leaves
    /// the client in `Configured` (not `Offline`) whenever it had
    /// previously made it past `configure()`, so a subsequent `start()` can
    /// bring the same registered services back up. Only a client that was
    /// already `Offline` stays there.
    pub fn stop(&mut self) -> Result<(), Error> {
        if self.state == State::Offline {
            return Ok(());
        }
        if let Some(mut svc) = self.debug_ring.take() {
            svc.stop();
        }
        if let Some(running) = self.running.take() {
            let _ = running.notifier.cancel();
            let _ = running.thread.join();
        }
        if self.backend_started {
            self.backend_started = false;
            self.backend.lock().unwrap().stop()?;
        }
        self.state = State::Configured;
        Ok(())
    }

    pub fn destroy(mut self) -> Result<(), Error> {
        self.stop()?;
        self.backend.lock().unwrap().shutdown()?;
        Ok(())
    }

    /// Textual status, one line per registered service, in the vein of a
    /// simple operator-facing status dump.
    pub fn status(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}: {:?}", self.config.name, self.state);
        for (name, addr) in self.registry.lock().unwrap().service_status() {
            match addr {
                Some(a) => {
                    let _ = writeln!(out, "  {name}: bound@{a:#x}");
                }
                None => {
                    let _ = writeln!(out, "  {name}: unbound");
                }
            }
        }
        out
    }
}

fn ring_region_size(num: u32) -> usize {
    let desc = num as usize * 16;
    let avail = 4 + num as usize * 2 + 2;
    let used = 4 + num as usize * 8 + 2;
    let page = 0x1000usize;
    let page_round = |n: usize| (n + page - 1) & !(page - 1);
    page_round(desc + avail) + page_round(used)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_region_size_is_page_aligned() {
        let size = ring_region_size(256);
        assert_eq!(size % 0x1000, 0);
        assert!(size > 0);
    }
}
