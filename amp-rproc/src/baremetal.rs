//! Backend for a remote core controlled directly through a privileged
//! control device: cpu-on to start, a send-ipi ioctl to ring the doorbell,
//! and the device fd itself as the thing to `poll()` for incoming irqs.
//! Modeled on a kernel driver that exposes one misc device per controllable
//! core and refuses to hand out control of a core that's already up.

use crate::{Backend, Error, MmapAttrs};
use amp_notify::Notifier;
use amp_shmpool::IoRegion;
use nix::{ioctl_read, ioctl_write_ptr};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

const CPU_STATE_OFF: u32 = 0;

#[repr(C)]
struct CpuOnInfo {
    cpu: u32,
    boot_addr: u64,
}

#[repr(C)]
struct SendIpiInfo {
    cpu: u32,
}

#[repr(C)]
struct AffinityInfo {
    cpu: u32,
    state: u32,
}

ioctl_write_ptr!(ioc_cpuon, b'm', 1, CpuOnInfo);
ioctl_write_ptr!(ioc_sendipi, b'm', 2, SendIpiInfo);
ioctl_read!(ioc_affinity_info, b'm', 3, AffinityInfo);

pub struct BareMetalBackend {
    ctl: File,
    cpu_id: u32,
    notifier: Arc<Notifier>,
    mappings: Vec<memmap2::MmapRaw>,
}

impl BareMetalBackend {
    pub fn new(dev_path: impl AsRef<Path>, cpu_id: u32) -> Result<Self, Error> {
        let ctl = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev_path)?;

        let mut info = AffinityInfo { cpu: cpu_id, state: 0 };
        unsafe { ioc_affinity_info(ctl.as_raw_fd(), &mut info)? };
        if info.state != CPU_STATE_OFF {
            return Err(Error::Busy);
        }

        let dup = ctl.try_clone()?;
        let notifier =
            Arc::new(Notifier::new(dup.into()).map_err(|e| Error::Notify(e.to_string()))?);

        Ok(Self {
            ctl,
            cpu_id,
            notifier,
            mappings: Vec::new(),
        })
    }
}

impl Backend for BareMetalBackend {
    fn mmap(&mut self, phys: u64, size: usize, _attrs: MmapAttrs) -> Result<IoRegion, Error> {
        let page = 0x1000u64;
        let aligned_phys = phys & !(page - 1);
        let pad = (phys - aligned_phys) as usize;
        let aligned_size = (size + pad + page as usize - 1) & !(page as usize - 1);

        let map = memmap2::MmapOptions::new()
            .offset(aligned_phys)
            .len(aligned_size)
            .map_raw(&self.ctl)?;
        let virt_base = map.as_ptr() as usize + pad;
        self.mappings.push(map);

        Ok(IoRegion {
            phys_base: phys,
            virt_base,
            size,
        })
    }

    fn start(&mut self, entry_phys: u64) -> Result<(), Error> {
        let info = CpuOnInfo {
            cpu: self.cpu_id,
            boot_addr: entry_phys,
        };
        unsafe { ioc_cpuon(self.ctl.as_raw_fd(), &info)? };
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        // the control device offers no graceful stop for a running core
        Err(Error::Unsupported)
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn notify(&mut self, _vqid: u32) -> Result<(), Error> {
        let info = SendIpiInfo { cpu: self.cpu_id };
        unsafe { ioc_sendipi(self.ctl.as_raw_fd(), &info)? };
        Ok(())
    }

    fn notifier(&self) -> Option<Arc<Notifier>> {
        Some(self.notifier.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment_math() {
        let page = 0x1000u64;
        let phys = 0x8000_0123u64;
        let aligned = phys & !(page - 1);
        assert_eq!(aligned, 0x8000_0000);
        assert_eq!(phys - aligned, 0x123);
    }
}
