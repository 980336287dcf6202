//! Backend for a remote core running as a cell under a partitioning
//! hypervisor: cell lifecycle is driven through the hypervisor's CLI
//! (create/load/start/shutdown/destroy), and the doorbell is a register in
//! an inter-partition shared-memory device's register page, reached
//! through a UIO device node so the irq can be `poll()`-ed from userspace.

use crate::{Backend, Error, MmapAttrs};
use amp_notify::Notifier;
use amp_shmpool::IoRegion;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// ivshmem doorbell register layout, register-page offsets.
const REG_INT_CONTROL: usize = 0x0c;

pub struct PartitionBackend {
    cli: PathBuf,
    cell_name: String,
    uio: File,
    notifier: Arc<Notifier>,
    regs: memmap2::MmapRaw,
    mappings: Vec<memmap2::MmapRaw>,
}

impl PartitionBackend {
    pub fn new(
        cli: impl Into<PathBuf>,
        cell_name: impl Into<String>,
        uio_path: impl AsRef<Path>,
        cell_config: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let cli = cli.into();
        let cell_name = cell_name.into();

        run_cli(&cli, &cell_args("create", &cell_name, Some(cell_config.as_ref())))?;

        let uio = OpenOptions::new().read(true).write(true).open(uio_path)?;
        let regs = memmap2::MmapOptions::new().len(0x1000).map_raw(&uio)?;

        let dup = uio.try_clone()?;
        let notifier = Arc::new(Notifier::new(dup.into()).map_err(|e| Error::Notify(e.to_string()))?);

        Ok(Self {
            cli,
            cell_name,
            uio,
            notifier,
            regs,
            mappings: Vec::new(),
        })
    }
}

fn cell_args<'a>(verb: &'a str, name: &'a str, config: Option<&'a Path>) -> Vec<String> {
    let mut args = vec!["cell".to_string(), verb.to_string()];
    if let Some(path) = config {
        args.push(path.to_string_lossy().into_owned());
    } else {
        args.push(name.to_string());
    }
    args
}

fn run_cli(cli: &Path, args: &[String]) -> Result<(), Error> {
    let status = Command::new(cli).args(args).status()?;
    if !status.success() {
        return Err(Error::Cli(status.code().unwrap_or(-1)));
    }
    Ok(())
}

impl Backend for PartitionBackend {
    fn mmap(&mut self, phys: u64, size: usize, attrs: MmapAttrs) -> Result<IoRegion, Error> {
        if attrs.device {
            return Ok(IoRegion {
                phys_base: phys,
                virt_base: self.regs.as_ptr() as usize,
                size,
            });
        }
        // shared data memory lives behind a separate mapping of the uio
        // device's second resource region; callers that need this path
        // should have already resolved its physical base out of band
        // (sysfs) and pass it here to be mapped.
        let page = 0x1000u64;
        let aligned_phys = phys & !(page - 1);
        let pad = (phys - aligned_phys) as usize;
        let aligned_size = (size + pad + page as usize - 1) & !(page as usize - 1);
        let map = memmap2::MmapOptions::new()
            .offset(aligned_phys)
            .len(aligned_size)
            .map_raw(&self.uio)?;
        let virt_base = map.as_ptr() as usize + pad;
        self.mappings.push(map);
        Ok(IoRegion {
            phys_base: phys,
            virt_base,
            size,
        })
    }

    fn start(&mut self, _entry_phys: u64) -> Result<(), Error> {
        run_cli(&self.cli, &cell_args("start", &self.cell_name, None))
    }

    fn stop(&mut self) -> Result<(), Error> {
        run_cli(&self.cli, &cell_args("shutdown", &self.cell_name, None))
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        run_cli(&self.cli, &cell_args("destroy", &self.cell_name, None))
    }

    fn notify(&mut self, _vqid: u32) -> Result<(), Error> {
        let ptr = unsafe { self.regs.as_mut_ptr().add(REG_INT_CONTROL) as *mut u32 };
        unsafe { std::ptr::write_volatile(ptr, 1) };
        Ok(())
    }

    fn notifier(&self) -> Option<Arc<Notifier>> {
        Some(self.notifier.clone())
    }
}

impl Drop for PartitionBackend {
    fn drop(&mut self) {
        let _ = run_cli(&self.cli, &cell_args("destroy", &self.cell_name, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_args_create_uses_config_path() {
        let args = cell_args("create", "amp0", Some(Path::new("/etc/amp/amp0.cell")));
        assert_eq!(args, vec!["cell", "create", "/etc/amp/amp0.cell"]);
    }

    #[test]
    fn cell_args_other_verbs_use_name() {
        let args = cell_args("shutdown", "amp0", None);
        assert_eq!(args, vec!["cell", "shutdown", "amp0"]);
    }
}
