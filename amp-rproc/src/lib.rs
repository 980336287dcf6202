//! The remote-processor driver: a small vtable (`Backend`) that the rest of
//! the system talks to without caring whether the remote core is a
//! bare-metal CPU brought up by a privileged ioctl, or a cell managed by a
//! partitioning hypervisor's CLI. Two concrete backends are provided.

pub mod baremetal;
pub mod partition;

use amp_shmpool::IoRegion;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("remote core busy, cannot take control")]
    Busy,
    #[error("backend does not support this operation")]
    Unsupported,
    #[error("backend control path failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("ioctl failed: {0}")]
    Ioctl(#[from] nix::Error),
    #[error("hypervisor cli exited with status {0}")]
    Cli(i32),
    #[error("notifier setup failed: {0}")]
    Notify(String),
}

/// Whether a mapping request is for device/register memory (no caching,
/// ordering matters) or plain shared data memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapAttrs {
    pub device: bool,
}

impl MmapAttrs {
    pub const SHARED: Self = Self { device: false };
    pub const DEVICE: Self = Self { device: true };
}

/// Operations a remote-processor backend must provide. `start`/`stop` take
/// no resource-table argument: any resource-table address patching happens
/// before `start` via `mmap`+`configure`, mirroring a boot sequence where
/// the image and table are fully prepared before the core is released.
pub trait Backend: Send {
    fn mmap(&mut self, phys: u64, size: usize, attrs: MmapAttrs) -> Result<IoRegion, Error>;

    /// Point the backend at the resource table's physical location, if it
    /// needs to know (most backends don't; the bare-metal one ignores this).
    fn configure(&mut self, _rsc_table_phys: u64, _rsc_table_size: usize) -> Result<(), Error> {
        Ok(())
    }

    fn start(&mut self, entry_phys: u64) -> Result<(), Error>;
    fn stop(&mut self) -> Result<(), Error>;
    fn shutdown(&mut self) -> Result<(), Error>;

    /// Ring the remote core's doorbell for virtqueue `vqid`.
    fn notify(&mut self, vqid: u32) -> Result<(), Error>;

    /// The notifier to block on for incoming doorbell/irq events, if this
    /// backend exposes one (both of ours do). Shared via `Arc` so a
    /// receive-loop thread can hold its own handle independent of whatever
    /// else is using the backend.
    fn notifier(&self) -> Option<std::sync::Arc<amp_notify::Notifier>>;

    /// Give the backend first refusal on a vendor-specific resource-table
    /// entry it understands natively. Returns `Ok(true)` if handled.
    fn handle_vendor_resource(&mut self, kind: u32, data: &mut [u8]) -> Result<bool, Error> {
        let _ = (kind, data);
        Ok(false)
    }
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Backend")
    }
}
