//! The named shared-memory framebuffer region the library hands frames to
//! the out-of-process consumer through.
//!
//! Created once, on the first display switch, sized for the maximum
//! resolution the RDP protocol supports at 32 bits per pixel. Exclusive
//! writer is this library; exclusive reader is the consumer process,
//! arbitrated by the ack protocol in the display crate (not here — this
//! crate only owns the mapping's lifecycle).

use std::ptr::NonNull;

use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm::ShmOFlags;

/// Maximum framebuffer width the RDP protocol supports.
pub const MAX_WIDTH: u32 = 4096;
/// Maximum framebuffer height the RDP protocol supports.
pub const MAX_HEIGHT: u32 = 2048;
/// Bytes per pixel at the maximum supported pixel depth (32 bpp).
pub const MAX_BYTES_PER_PIXEL: u32 = 4;
/// Total size, in bytes, of the shared region: `4096 * 2048 * 4`.
pub const SHM_SIZE: usize =
    (MAX_WIDTH as usize) * (MAX_HEIGHT as usize) * (MAX_BYTES_PER_PIXEL as usize);

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shm_open({name}) failed: {source}")]
    Open { name: String, #[source] source: rustix::io::Errno },

    #[error("ftruncate to {size} bytes failed: {source}")]
    Truncate { size: usize, #[source] source: rustix::io::Errno },

    #[error("mmap failed: {0}")]
    Map(#[source] rustix::io::Errno),

    #[error("write of {len} bytes at offset {offset} exceeds region size {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

/// A mapped, named POSIX shared-memory region.
///
/// The library is the exclusive writer; the consumer process is the
/// exclusive reader, synchronized by the ack protocol layered on top in
/// `rdpmux-display`. Unmapped and unlinked on drop.
pub struct SharedFrame {
    name: String,
    #[allow(dead_code)]
    fd: OwnedFd,
    size: usize,
    ptr: NonNull<u8>,
}

// SAFETY: the mapping is exclusively written by this library under a frame
// lock held by `rdpmux-display`; `SharedFrame` itself performs no
// synchronization and relies entirely on the caller serializing access.
unsafe impl Send for SharedFrame {}
unsafe impl Sync for SharedFrame {}

impl SharedFrame {
    /// Create and map a new shared region named `/<vm_id>.rdpmux`, sized to
    /// [`SHM_SIZE`]. Created with mode `0444`: the creating process retains
    /// the read/write access requested at `shm_open` time regardless of the
    /// mode bits, while later openers (the consumer) get read-only access.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError`] if the region already exists, cannot be sized,
    /// or cannot be mapped. On error, any prior mapping held by the caller
    /// is left untouched — the caller aborts just this switch.
    pub fn create(vm_id: i32) -> Result<Self, ShmError> {
        let name = format!("/{vm_id}.rdpmux");

        let fd = rustix::shm::shm_open(
            name.as_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::from_raw_mode(0o444),
        )
        .map_err(|source| ShmError::Open { name: name.clone(), source })?;

        rustix::fs::ftruncate(&fd, SHM_SIZE as u64)
            .map_err(|source| ShmError::Truncate { size: SHM_SIZE, source })?;

        // SAFETY: `fd` was just created and sized above; no other mapping
        // of it exists yet.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                SHM_SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(ShmError::Map)?;

        let ptr = NonNull::new(ptr.cast::<u8>()).expect("mmap returned null without erroring");

        tracing::info!(name = %name, size = SHM_SIZE, "Shared frame buffer created");

        Ok(Self { name, fd, size: SHM_SIZE, ptr })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `data` into the region starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::OutOfBounds`] if `offset + data.len()` exceeds
    /// the region size; no partial write happens in that case.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        let end = offset.checked_add(data.len()).unwrap_or(usize::MAX);
        if end > self.size {
            return Err(ShmError::OutOfBounds { offset, len: data.len(), size: self.size });
        }

        // SAFETY: `offset + data.len() <= self.size` was just checked, and
        // `self.ptr` is a valid mapping of at least `self.size` bytes for
        // the lifetime of `self`. The caller (the refresh engine) holds the
        // frame lock for the duration of this call, so no concurrent writer
        // exists; the consumer process only reads after observing an ack,
        // which is sent after this call returns.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

impl Drop for SharedFrame {
    fn drop(&mut self) {
        // SAFETY: `self.ptr` was produced by `mmap` of exactly `self.size`
        // bytes in `create`, and this is the only place it is unmapped.
        unsafe {
            if let Err(e) = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::warn!(name = %self.name, "munmap failed: {e}");
            }
        }
        if let Err(e) = rustix::shm::shm_unlink(self.name.as_str()) {
            tracing::warn!(name = %self.name, "shm_unlink failed: {e}");
        }
        tracing::info!(name = %self.name, "Shared frame buffer torn down");
    }
}

impl std::fmt::Debug for SharedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrame")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_map_write_and_unlink() {
        // Use the test's own pid to avoid clashing with a concurrently
        // running test binary.
        let vm_id = 900_000 + (std::process::id() as i32 % 100_000);
        let frame = SharedFrame::create(vm_id).expect("create should succeed");
        assert_eq!(frame.size(), SHM_SIZE);

        let payload = vec![0xABu8; 64];
        frame.write_at(0, &payload).expect("write within bounds should succeed");

        let name = frame.name().to_string();
        drop(frame);

        // After drop, the name should be unlinked: creating again with the
        // same id should succeed rather than failing with EEXIST.
        let frame2 = SharedFrame::create(vm_id).expect("region should have been unlinked");
        assert_eq!(frame2.name(), name);
    }

    #[test]
    fn write_out_of_bounds_is_rejected() {
        let vm_id = 800_000 + (std::process::id() as i32 % 100_000);
        let frame = SharedFrame::create(vm_id).expect("create should succeed");
        let huge = vec![0u8; SHM_SIZE + 1];
        assert!(matches!(
            frame.write_at(0, &huge),
            Err(ShmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn second_create_without_unlink_fails() {
        let vm_id = 700_000 + (std::process::id() as i32 % 100_000);
        let first = SharedFrame::create(vm_id).expect("create should succeed");
        let second = SharedFrame::create(vm_id);
        assert!(second.is_err());
        drop(first);
    }
}
