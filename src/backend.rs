//! The memory backend seam.
//!
//! A backend owns the space-specific allocators and copy engines. Handles
//! never touch memory except through a backend, apart from dereferencing
//! host-addressable storage.

use crate::error::{Error, Result};
use crate::space::{MemorySpace, TransferKind};
use core::ptr::NonNull;
use std::alloc::Layout;

/// Allocation, transfer and release primitives for the three memory spaces.
///
/// Every allocation is zero-filled. Pointers passed back to `transfer` and
/// the release primitives are always ones this backend handed out, together
/// with the layout they were allocated with.
pub trait MemoryBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    fn allocate_host(&self, layout: Layout) -> Result<NonNull<u8>>;

    fn allocate_device(&self, layout: Layout) -> Result<NonNull<u8>>;

    fn allocate_coherent(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Copies `bytes` bytes from `src` to `dst` using the primitive `kind`
    /// names. The two regions never overlap.
    ///
    /// # Safety
    ///
    /// `dst` and `src` must be valid for `bytes` bytes in the spaces `kind`
    /// names.
    unsafe fn transfer(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
        kind: TransferKind,
    ) -> Result<()>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate_host` with the same `layout` and must
    /// not be used afterwards.
    unsafe fn release_host(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()>;

    /// Releases device and coherent memory alike.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_device` or `allocate_coherent` with the
    /// same `layout` and must not be used afterwards.
    unsafe fn release_device_or_coherent(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()>;
}

/// Allocates in `space` through the matching primitive.
pub(crate) fn allocate_in(
    backend: &dyn MemoryBackend,
    space: MemorySpace,
    layout: Layout,
) -> Result<NonNull<u8>> {
    let ptr = match space {
        MemorySpace::Host => backend.allocate_host(layout)?,
        MemorySpace::Device => backend.allocate_device(layout)?,
        MemorySpace::Coherent => backend.allocate_coherent(layout)?,
        MemorySpace::Empty => return Err("cannot allocate in the empty space".into()),
    };
    log::trace!(
        "{}: allocated {} bytes of {} memory at {:p}",
        backend.name(),
        layout.size(),
        space,
        ptr
    );
    Ok(ptr)
}

/// Releases through the primitive `space` requires.
///
/// # Safety
///
/// `ptr` must be a live allocation of `backend` made in `space` with `layout`.
pub(crate) unsafe fn release_in(
    backend: &dyn MemoryBackend,
    space: MemorySpace,
    ptr: NonNull<u8>,
    layout: Layout,
) -> Result<()> {
    log::trace!(
        "{}: releasing {} bytes of {} memory at {:p}",
        backend.name(),
        layout.size(),
        space,
        ptr
    );
    match space {
        MemorySpace::Host => backend.release_host(ptr, layout),
        MemorySpace::Device | MemorySpace::Coherent => {
            backend.release_device_or_coherent(ptr, layout)
        }
        MemorySpace::Empty => Ok(()),
    }
}

/// Layout of `cols * rows` elements of `T`, or `CapacityOverflow`.
pub(crate) fn matrix_layout<T>(cols: usize, rows: usize) -> Result<Layout> {
    cols.checked_mul(rows)
        .and_then(|n| Layout::array::<T>(n).ok())
        .ok_or(Error::CapacityOverflow { cols, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_layout() {
        let l = matrix_layout::<f32>(3, 4).unwrap();
        assert_eq!(l.size(), 48);
        assert_eq!(l.align(), std::mem::align_of::<f32>());

        assert!(matches!(
            matrix_layout::<f64>(usize::MAX, 2),
            Err(Error::CapacityOverflow { .. })
        ));
        assert!(matches!(
            matrix_layout::<f64>(usize::MAX / 4, 1),
            Err(Error::CapacityOverflow { .. })
        ));
    }
}
