//! Matrices that live in host, device or coherent memory behind a single
//! handle type.
//!
//! A [`MatrixHandle`] owns one contiguous row-major buffer allocated by a
//! [`MemoryBackend`] in one [`MemorySpace`]. Moving data between spaces is
//! always explicit: allocate a handle in the target space and copy into it,
//! and the pair of spaces decides which transfer the backend performs.
//!
//! ```
//! use std::sync::Arc;
//! use spacemat::{MatrixHandle, MemorySpace, SimBackend, TransferKind};
//!
//! let sim = Arc::new(SimBackend::new());
//! let host = MatrixHandle::from_slice(sim.clone(), 2, 2, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
//! let dev = MatrixHandle::create_device_from(&host).unwrap();
//! assert_eq!(dev.space(), MemorySpace::Device);
//!
//! let mut back = MatrixHandle::<f32>::create_coherent(sim.clone(), 2, 2).unwrap();
//! assert_eq!(back.copy_from(&dev).unwrap(), Some(TransferKind::DeviceToHost));
//! assert_eq!(back[(1, 0)], 2.0);
//! ```

mod backend;
#[cfg(feature = "cuda")]
mod cuda;
mod element;
mod error;
mod host;
mod matrix;
mod sim;
mod space;

pub use backend::MemoryBackend;
#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;
pub use element::Element;
pub use error::{Error, Result};
pub use host::{CopyConfig, HostBackend, COPY_CHUNKS_ENV, PARALLEL_THRESHOLD_ENV};
pub use matrix::{Iter, IterMut, MatrixHandle};
pub use sim::{SimBackend, SimStats};
pub use space::{transfer_kind, MemorySpace, TransferKind};

use lazy_static::lazy_static;
use std::sync::Arc;

lazy_static! {
    static ref DEFAULT_BACKEND: Arc<dyn MemoryBackend> =
        Arc::new(HostBackend::with_config(CopyConfig::from_env()));
}

/// The process-wide host-only backend used by [`MatrixHandle::host`] and
/// [`MatrixHandle::from_vec`].
pub fn default_backend() -> Arc<dyn MemoryBackend> {
    DEFAULT_BACKEND.clone()
}

pub fn create_host_matrix<T: Element>(
    backend: Arc<dyn MemoryBackend>,
    cols: usize,
    rows: usize,
) -> Result<MatrixHandle<T>> {
    MatrixHandle::create_host(backend, cols, rows)
}

pub fn create_device_matrix<T: Element>(
    backend: Arc<dyn MemoryBackend>,
    cols: usize,
    rows: usize,
) -> Result<MatrixHandle<T>> {
    MatrixHandle::create_device(backend, cols, rows)
}

pub fn create_coherent_matrix<T: Element>(
    backend: Arc<dyn MemoryBackend>,
    cols: usize,
    rows: usize,
) -> Result<MatrixHandle<T>> {
    MatrixHandle::create_coherent(backend, cols, rows)
}

/// Releases `m`, leaving it empty.
pub fn free_matrix<T: Element>(m: &mut MatrixHandle<T>) -> Result<()> {
    m.free()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backend_is_shared() {
        let a = default_backend();
        let b = default_backend();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "host");
    }

    #[test]
    fn test_free_functions() {
        let sim = Arc::new(SimBackend::new());
        let mut h = create_host_matrix::<f32>(sim.clone(), 2, 3).unwrap();
        let mut d = create_device_matrix::<f32>(sim.clone(), 2, 3).unwrap();
        let mut c = create_coherent_matrix::<f32>(sim.clone(), 2, 3).unwrap();
        assert_eq!(
            [h.space(), d.space(), c.space()],
            [MemorySpace::Host, MemorySpace::Device, MemorySpace::Coherent]
        );
        for m in [&mut h, &mut d, &mut c] {
            free_matrix(m).unwrap();
            assert!(m.is_empty());
        }
        assert_eq!(sim.live_regions(), 0);
    }
}
