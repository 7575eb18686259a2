//! Host memory: the system heap allocator, the local copy engine and a
//! backend that only knows the host space.

use crate::backend::MemoryBackend;
use crate::error::{Error, Result};
use crate::space::{MemorySpace, TransferKind};
use core::ptr::NonNull;
use rayon::prelude::*;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::env;

const DEFAULT_PARALLEL_THRESHOLD: usize = 4 << 20;

pub const PARALLEL_THRESHOLD_ENV: &str = "SPACEMAT_PARALLEL_COPY_THRESHOLD";
pub const COPY_CHUNKS_ENV: &str = "SPACEMAT_COPY_CHUNKS";

/// Tuning for local (host addressable to host addressable) copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyConfig {
    /// Copies of at least this many bytes are split across the rayon pool.
    pub parallel_threshold: usize,
    /// Number of pieces a parallel copy is split into.
    pub chunks: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            chunks: num_cpus::get(),
        }
    }
}

impl CopyConfig {
    /// Defaults overridden by `SPACEMAT_PARALLEL_COPY_THRESHOLD` and
    /// `SPACEMAT_COPY_CHUNKS`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_usize(PARALLEL_THRESHOLD_ENV) {
            cfg.parallel_threshold = v;
        }
        if let Some(v) = env_usize(COPY_CHUNKS_ENV) {
            cfg.chunks = v;
        }
        cfg
    }

    pub fn with_parallel_threshold(mut self, bytes: usize) -> Self {
        self.parallel_threshold = bytes;
        self
    }

    pub fn with_chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks;
        self
    }

    /// Copies `bytes` bytes between two non-overlapping host-addressable
    /// regions.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for `bytes` bytes and the regions must not
    /// overlap.
    pub(crate) unsafe fn local_copy(&self, dst: NonNull<u8>, src: NonNull<u8>, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let chunks = self.chunks.max(1);
        if bytes < self.parallel_threshold || chunks == 1 {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), bytes);
            return;
        }
        let d = std::slice::from_raw_parts_mut(dst.as_ptr(), bytes);
        let s = std::slice::from_raw_parts(src.as_ptr(), bytes);
        let chunk = (bytes + chunks - 1) / chunks;
        d.par_chunks_mut(chunk)
            .zip(s.par_chunks(chunk))
            .for_each(|(d, s)| d.copy_from_slice(s));
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let v = env::var(key).ok()?;
    match v.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not an unsigned integer", key, v);
            None
        }
    }
}

/// Zeroed system heap allocation. Zero-sized layouts get a dangling pointer.
pub(crate) fn heap_alloc(layout: Layout, space: MemorySpace) -> Result<NonNull<u8>> {
    if layout.size() == 0 {
        return Ok(dangling(layout));
    }
    let ptr = unsafe { alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or(Error::AllocationFailure {
        space,
        bytes: layout.size(),
    })
}

/// # Safety
///
/// `ptr` must come from [`heap_alloc`] with the same `layout`.
pub(crate) unsafe fn heap_release(ptr: NonNull<u8>, layout: Layout) {
    if layout.size() != 0 {
        dealloc(ptr.as_ptr(), layout);
    }
}

fn dangling(layout: Layout) -> NonNull<u8> {
    // SAFETY: alignments are never zero.
    unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
}

/// A backend with no accelerator: host allocations come from the system
/// heap, device and coherent requests fail with
/// [`Error::UnsupportedSpace`].
#[derive(Debug, Clone, Default)]
pub struct HostBackend {
    config: CopyConfig,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CopyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CopyConfig {
        &self.config
    }

    fn unsupported(&self, space: MemorySpace) -> Error {
        Error::UnsupportedSpace {
            backend: self.name(),
            space,
        }
    }
}

impl MemoryBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn allocate_host(&self, layout: Layout) -> Result<NonNull<u8>> {
        heap_alloc(layout, MemorySpace::Host)
    }

    fn allocate_device(&self, _layout: Layout) -> Result<NonNull<u8>> {
        Err(self.unsupported(MemorySpace::Device))
    }

    fn allocate_coherent(&self, _layout: Layout) -> Result<NonNull<u8>> {
        Err(self.unsupported(MemorySpace::Coherent))
    }

    unsafe fn transfer(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
        kind: TransferKind,
    ) -> Result<()> {
        match kind {
            TransferKind::HostToHost => {
                self.config.local_copy(dst, src, bytes);
                Ok(())
            }
            _ => Err(Error::InvalidTransfer {
                kind,
                reason: "the host backend has no device memory".to_string(),
            }),
        }
    }

    unsafe fn release_host(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        heap_release(ptr, layout);
        Ok(())
    }

    unsafe fn release_device_or_coherent(&self, ptr: NonNull<u8>, _layout: Layout) -> Result<()> {
        Err(Error::UnknownAllocation {
            space: MemorySpace::Device,
            addr: ptr.as_ptr() as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_copy_parallel() {
        let cfg = CopyConfig::default()
            .with_parallel_threshold(16)
            .with_chunks(3);
        let src: Vec<u8> = (0..100u8).collect();
        let mut dst = vec![0u8; 100];
        unsafe {
            cfg.local_copy(
                NonNull::new(dst.as_mut_ptr()).unwrap(),
                NonNull::new(src.as_ptr() as *mut u8).unwrap(),
                100,
            );
        }
        assert_eq!(src, dst);
    }

    #[test]
    fn test_local_copy_serial() {
        let cfg = CopyConfig::default();
        let src = [7u8; 10];
        let mut dst = [0u8; 10];
        unsafe {
            cfg.local_copy(
                NonNull::new(dst.as_mut_ptr()).unwrap(),
                NonNull::new(src.as_ptr() as *mut u8).unwrap(),
                10,
            );
        }
        assert_eq!(src, dst);
    }

    #[test]
    fn test_host_backend_spaces() {
        let b = HostBackend::new();
        let layout = Layout::array::<f32>(8).unwrap();
        let p = b.allocate_host(layout).unwrap();
        let zeros = unsafe { std::slice::from_raw_parts(p.as_ptr(), layout.size()) };
        assert!(zeros.iter().all(|&x| x == 0));
        unsafe { b.release_host(p, layout).unwrap() };

        assert!(matches!(
            b.allocate_device(layout),
            Err(Error::UnsupportedSpace {
                space: MemorySpace::Device,
                ..
            })
        ));
        assert!(matches!(
            b.allocate_coherent(layout),
            Err(Error::UnsupportedSpace {
                space: MemorySpace::Coherent,
                ..
            })
        ));
    }

    #[test]
    fn test_zero_sized_alloc() {
        let layout = Layout::array::<u64>(0).unwrap();
        let p = heap_alloc(layout, MemorySpace::Host).unwrap();
        assert_eq!(p.as_ptr() as usize % layout.align(), 0);
        unsafe { heap_release(p, layout) };
    }

    #[test]
    fn test_config_builder() {
        let cfg = CopyConfig::default().with_chunks(2).with_parallel_threshold(1);
        assert_eq!(cfg.chunks, 2);
        assert_eq!(cfg.parallel_threshold, 1);
        assert_eq!(CopyConfig::default().chunks, num_cpus::get());
    }
}
