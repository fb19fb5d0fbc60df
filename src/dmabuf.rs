// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DMA heap allocation and dma-buf CPU synchronization.
//!
//! Buffers minted here are plain dma-buf file descriptors: the decoder
//! imports them on its queues, the display imports them as framebuffer
//! planes, and the CPU maps them to fill compressed input. The fd is owned
//! by the [`DmaBuffer`] alone for its whole lifetime; every other subsystem
//! only ever holds a view of it.

use std::ffi::CString;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::NonNull;
use std::slice;

use nix::errno::Errno;
use nix::libc;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use thiserror::Error;

// Defined in include/uapi/linux/dma-heap.h
#[repr(C)]
struct dma_heap_allocation_data {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

const DMA_HEAP_IOC_MAGIC: u8 = b'H';
nix::ioctl_readwrite!(dma_heap_ioctl_alloc, DMA_HEAP_IOC_MAGIC, 0x0, dma_heap_allocation_data);

// Defined in include/uapi/linux/dma-buf.h
const DMA_BUF_BASE: u8 = b'b';
const DMA_BUF_IOCTL_SYNC: u8 = 0;
const DMA_BUF_SET_NAME: u8 = 1;
const DMA_BUF_SYNC_RW: u64 = 3;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct dma_buf_sync {
    flags: u64,
}

nix::ioctl_write_ptr!(dma_buf_ioctl_sync, DMA_BUF_BASE, DMA_BUF_IOCTL_SYNC, dma_buf_sync);

/// DMA heap devices to try, in order of preference: the video-cached heap of
/// recent Raspberry Pi kernels, then the generic CMA heap.
const HEAP_PATHS: [&str; 2] = ["/dev/dma_heap/vidbuf_cached", "/dev/dma_heap/linux,cma"];

/// Allocations above this are rejected before reaching the kernel.
const MAX_ALLOC_SIZE: u64 = u32::MAX as u64;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no DMA heap device could be opened")]
    Unavailable,
    #[error("invalid allocation size {0}")]
    InvalidSize(u64),
    #[error("DMA heap allocation failed: {0}")]
    AllocFailed(Errno),
    #[error("failed to map dma-buf: {0}")]
    MapFailed(Errno),
}

fn check_alloc_len(len: u64) -> Result<(), AllocError> {
    if len == 0 || len > MAX_ALLOC_SIZE {
        Err(AllocError::InvalidSize(len))
    } else {
        Ok(())
    }
}

/// Retries a syscall closure until it returns something other than `EINTR`.
fn retry_eintr<T>(mut cb: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match cb() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// One kernel-minted DMA buffer object.
///
/// The fd is closed exactly once, on drop, after any CPU mapping has been
/// released.
#[derive(Debug)]
pub struct DmaBuffer {
    file: File,
    size: usize,
    mapping: Option<NonNull<libc::c_void>>,
}

// SAFETY: the mapping is a process-private region owned exclusively by this
// buffer; the raw pointer is its only non-Send member and is never shared.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    pub fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Actual byte length of the buffer, as reported by the kernel. May
    /// exceed the requested length.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Creates a shared read-write CPU mapping covering the whole buffer.
    /// A no-op if the buffer is already mapped.
    pub fn map(&mut self) -> Result<(), AllocError> {
        if self.mapping.is_some() {
            return Ok(());
        }
        let len = NonZeroUsize::new(self.size).ok_or(AllocError::InvalidSize(0))?;
        // SAFETY: mapping a dma-buf fd we own, for its full kernel-reported
        // length, at offset 0.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.file,
                0,
            )
        }
        .map_err(AllocError::MapFailed)?;
        self.mapping = Some(addr);
        Ok(())
    }

    /// Releases the CPU mapping. A no-op when not mapped.
    pub fn unmap(&mut self) {
        if let Some(addr) = self.mapping.take() {
            // SAFETY: addr/size came from a successful mmap on this buffer.
            if let Err(e) = unsafe { munmap(addr, self.size) } {
                log::warn!("munmap of dma-buf fd {} failed: {}", self.fd(), e);
            }
        }
    }

    pub fn as_slice(&self) -> Option<&[u8]> {
        // SAFETY: the mapping covers exactly `size` bytes and lives until
        // unmap/drop, which take &mut self.
        self.mapping
            .map(|addr| unsafe { slice::from_raw_parts(addr.as_ptr() as *const u8, self.size) })
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        // SAFETY: as above, plus &mut self guarantees exclusive access.
        self.mapping
            .map(|addr| unsafe { slice::from_raw_parts_mut(addr.as_ptr() as *mut u8, self.size) })
    }

    /// Starts a CPU access window. Must be paired with [`Self::sync_end`]
    /// around every CPU read or write of the mapping, or the decoder may see
    /// stale cache lines on non-coherent architectures.
    pub fn sync_start(&self) -> nix::Result<()> {
        self.sync(DMA_BUF_SYNC_START)
    }

    /// Ends a CPU access window, flushing cache lines back to memory.
    pub fn sync_end(&self) -> nix::Result<()> {
        self.sync(DMA_BUF_SYNC_END)
    }

    fn sync(&self, direction: u64) -> nix::Result<()> {
        let sync = dma_buf_sync { flags: direction | DMA_BUF_SYNC_RW };
        // SAFETY: the fd is a valid dma-buf and the struct outlives the call.
        retry_eintr(|| unsafe { dma_buf_ioctl_sync(self.fd(), &sync) })?;
        Ok(())
    }

    /// Labels the buffer in kernel debug interfaces. Best-effort.
    fn set_name(&self, name: &str) {
        let Ok(name) = CString::new(name) else { return };
        let request = nix::request_code_write!(
            DMA_BUF_BASE,
            DMA_BUF_SET_NAME,
            std::mem::size_of::<u64>()
        );
        // SAFETY: DMA_BUF_SET_NAME takes the name pointer as its argument
        // and copies the string before returning.
        let ret = unsafe { libc::ioctl(self.fd(), request as _, name.as_ptr()) };
        if ret < 0 {
            log::debug!("failed to set dma-buf name (ignored): {}", Errno::last());
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.unmap();
        // The fd itself closes with `file`, strictly after the unmap.
    }
}

/// Mints [`DmaBuffer`]s from one opened DMA heap device.
#[derive(Debug)]
pub struct DmaHeapAllocator {
    heap: File,
}

impl DmaHeapAllocator {
    /// Opens the first usable DMA heap from the preferred list.
    pub fn open() -> Result<Self, AllocError> {
        for path in HEAP_PATHS {
            match std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_CLOEXEC)
                .open(path)
            {
                Ok(heap) => {
                    log::info!("opened DMA heap {}", path);
                    return Ok(Self { heap });
                }
                Err(e) => log::debug!("cannot open DMA heap {}: {}", path, e),
            }
        }
        log::error!("no DMA heap available (tried {:?})", HEAP_PATHS);
        Err(AllocError::Unavailable)
    }

    /// Allocates a buffer of at least `len` bytes. The returned buffer's
    /// [`DmaBuffer::size`] is the kernel-reported length and is what every
    /// later consumer of the fd must use.
    pub fn allocate(&self, len: usize) -> Result<DmaBuffer, AllocError> {
        check_alloc_len(len as u64)?;

        let mut request = dma_heap_allocation_data {
            len: len as u64,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        // SAFETY: the heap fd is valid and the request struct outlives the
        // call; on success the kernel hands us a fresh fd in `request.fd`.
        unsafe { dma_heap_ioctl_alloc(self.heap.as_raw_fd(), &mut request) }
            .map_err(AllocError::AllocFailed)?;

        // SAFETY: the fd was just returned by the allocation ioctl and is
        // owned by nobody else.
        let file = unsafe { <File as std::os::fd::FromRawFd>::from_raw_fd(request.fd as i32) };
        let size = file.metadata().map(|m| m.len() as usize).unwrap_or(len);

        let buffer = DmaBuffer { file, size, mapping: None };
        buffer.set_name(&format!("player-buffer-{}", size));
        log::debug!(
            "allocated dma-buf fd {} of {} bytes ({} requested)",
            buffer.fd(),
            size,
            len
        );
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_allocation() {
        assert!(matches!(check_alloc_len(0), Err(AllocError::InvalidSize(0))));
    }

    #[test]
    fn rejects_oversized_allocation() {
        let too_big = MAX_ALLOC_SIZE + 1;
        assert!(matches!(
            check_alloc_len(too_big),
            Err(AllocError::InvalidSize(n)) if n == too_big
        ));
    }

    #[test]
    fn accepts_sane_sizes() {
        assert!(check_alloc_len(1).is_ok());
        assert!(check_alloc_len(2 * 1024 * 1024).is_ok());
        assert!(check_alloc_len(MAX_ALLOC_SIZE).is_ok());
    }

    #[test]
    fn eintr_is_retried() {
        let mut attempts = 0;
        let ret = retry_eintr(|| {
            attempts += 1;
            if attempts < 3 {
                Err(Errno::EINTR)
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(ret, Ok(3));
    }
}
