//! Memory-mapped register access.
//!
//! The EDA board exposes its FPGA fabric to the host CPU through two
//! bridge windows mapped from a `/dev/mem`-like character device: the
//! lightweight HPS-to-FPGA bridge (configuration and status registers)
//! and the wide HPS-to-FPGA bridge (hit FIFOs and the slow-control RAM).
//! Register traffic is 32-bit and little-endian on the bus regardless of
//! host endianness.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{ErrorKind, Result};

/// Physical base of the lightweight HPS-to-FPGA window.
pub const LW_BASE: i64 = 0xFF20_0000;
/// Span of the lightweight window.
pub const LW_SPAN: usize = 0x0002_0000;
/// Physical base of the wide HPS-to-FPGA window.
pub const H2F_BASE: i64 = 0xC000_0000;
/// Span of the wide window.
pub const H2F_SPAN: usize = 0x0010_0000;

/// 32-bit register window. Every accessor reports failures explicitly;
/// there is no deferred-error state on the window itself.
pub trait Mmio {
    fn read32(&self, off: usize) -> Result<u32>;
    fn write32(&self, off: usize, v: u32) -> Result<()>;

    /// Raw byte-block copy into a RAM region of the window.
    fn write_block(&self, off: usize, data: &[u8]) -> Result<()>;

    /// Raw byte-block copy out of a RAM region of the window.
    fn read_block(&self, off: usize, data: &mut [u8]) -> Result<()>;
}

/// One `mmap(2)`-ed bridge window.
///
/// The mapping is shared with the FPGA; only the driver thread may touch
/// it, which is what makes the `Send`/`Sync` implementations below sound.
pub struct DevMem {
    base: *mut u8,
    span: usize,
    _dev: File,
}

unsafe impl Send for DevMem {}
unsafe impl Sync for DevMem {}

impl DevMem {
    /// Map `span` bytes of the device at physical offset `phys`.
    pub fn open<P: AsRef<Path>>(path: P, phys: i64, span: usize) -> Result<Self> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_SYNC.bits())
            .open(path.as_ref())?;
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                span,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                dev.as_raw_fd(),
                phys,
            )?
        };
        Ok(Self {
            base: base as *mut u8,
            span,
            _dev: dev,
        })
    }

    fn check(&self, off: usize, len: usize) -> Result<()> {
        if off % 4 != 0 && len == 4 {
            Err(ErrorKind::General(format!(
                "misaligned register offset {:#x}",
                off
            )))?
        }
        if off + len > self.span {
            Err(ErrorKind::General(format!(
                "access at {:#x}+{} outside {:#x}-byte window",
                off, len, self.span
            )))?
        }
        Ok(())
    }
}

impl Mmio for DevMem {
    fn read32(&self, off: usize) -> Result<u32> {
        self.check(off, 4)?;
        let ptr = unsafe { self.base.add(off) } as *const u32;
        Ok(u32::from_le(unsafe { ptr.read_volatile() }))
    }

    fn write32(&self, off: usize, v: u32) -> Result<()> {
        self.check(off, 4)?;
        let ptr = unsafe { self.base.add(off) } as *mut u32;
        unsafe { ptr.write_volatile(v.to_le()) };
        Ok(())
    }

    fn write_block(&self, off: usize, data: &[u8]) -> Result<()> {
        self.check(off, data.len())?;
        for (i, &b) in data.iter().enumerate() {
            unsafe { self.base.add(off + i).write_volatile(b) };
        }
        Ok(())
    }

    fn read_block(&self, off: usize, data: &mut [u8]) -> Result<()> {
        self.check(off, data.len())?;
        for (i, b) in data.iter_mut().enumerate() {
            *b = unsafe { self.base.add(off + i).read_volatile() };
        }
        Ok(())
    }
}

impl Drop for DevMem {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.base as *mut _, self.span) };
    }
}
