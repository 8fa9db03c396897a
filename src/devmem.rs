//! Physical memory access.
//!
//! This module maps regions of physical address space through `/dev/mem`. It
//! is used to reach the FPGA register banks and memories, which sit at fixed
//! addresses in the programmable logic address map.

use anyhow::{Context, Result};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Physical memory device.
#[derive(Debug)]
pub struct DevMem {
    path: PathBuf,
    file: fs::File,
}

/// Physical memory mapping.
///
/// This struct corresponds to a region of physical memory mapped into the
/// address space of the process. Dropping this struct unmaps the region.
#[derive(Debug)]
pub struct Mapping {
    base: *mut libc::c_void,
    map_size: usize,
}

impl DevMem {
    /// Opens a physical memory device.
    ///
    /// Usually `path` is `/dev/mem`, which requires root privileges.
    pub async fn open(path: impl AsRef<Path>) -> Result<DevMem> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(DevMem { path, file })
    }

    /// Maps `size` bytes of physical memory starting at `phys_addr`.
    ///
    /// The address must be page aligned. The size is rounded up to a whole
    /// number of pages.
    pub fn map(&self, phys_addr: usize, size: usize) -> Result<Mapping> {
        let page = page_size::get();
        if phys_addr % page != 0 {
            anyhow::bail!("physical address {phys_addr:#x} is not page aligned");
        }
        let map_size = size.div_ceil(page) * page;
        let fd = self.file.as_raw_fd();
        let base = unsafe {
            match libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                phys_addr as libc::off_t,
            ) {
                libc::MAP_FAILED => anyhow::bail!(
                    "mmap {} at {phys_addr:#x} failed: {}",
                    self.path.display(),
                    std::io::Error::last_os_error()
                ),
                x => x,
            }
        };
        tracing::debug!(phys_addr, map_size, "mapped physical memory");
        Ok(Mapping { base, map_size })
    }
}

impl Mapping {
    /// Gives the virtual address of the mapping.
    pub fn addr(&self) -> *mut libc::c_void {
        self.base
    }

    /// Gives the size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.map_size
    }

    /// Returns `true` if the mapping is empty.
    ///
    /// Mappings are never empty, since they span at least one page.
    pub fn is_empty(&self) -> bool {
        self.map_size == 0
    }
}

/// Unmaps the physical memory mapping.
impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.base, self.map_size) != 0 {
                tracing::error!(
                    "munmap failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn open_missing_device() {
        let err = DevMem::open("/nonexistent/mem").await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/mem"));
    }
}
