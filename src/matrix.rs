use crate::backend::{allocate_in, matrix_layout, release_in, MemoryBackend};
use crate::element::Element;
use crate::error::{Error, Result};
use crate::space::{transfer_kind, MemorySpace, TransferKind};
use crate::{default_backend, CopyConfig};
use core::ptr::NonNull;
use rawpointer::PointerExt;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// A row-major `cols x rows` matrix living in one memory space.
///
/// The handle is the sole owner of its buffer. It cannot be cloned; the
/// `create_*_from` factories allocate fresh storage and copy into it, which
/// is also how a matrix moves between spaces. `free` releases the buffer
/// and leaves the handle [`MemorySpace::Empty`]; a handle dropped while
/// still allocated is released the same way.
///
/// Element `(c, r)` is stored at flat offset `r * cols + c`.
pub struct MatrixHandle<T: Element> {
    data: Option<NonNull<T>>,
    cols: usize,
    rows: usize,
    space: MemorySpace,
    backend: Option<Arc<dyn MemoryBackend>>,
}

// SAFETY: the handle owns its buffer exclusively, `T` is `Send + Sync` and
// backends are required to be `Send + Sync`.
unsafe impl<T: Element> Send for MatrixHandle<T> {}
unsafe impl<T: Element> Sync for MatrixHandle<T> {}

impl<T: Element> Default for MatrixHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Element> MatrixHandle<T> {
    pub const fn empty() -> Self {
        Self {
            data: None,
            cols: 0,
            rows: 0,
            space: MemorySpace::Empty,
            backend: None,
        }
    }

    fn create(
        backend: Arc<dyn MemoryBackend>,
        space: MemorySpace,
        cols: usize,
        rows: usize,
    ) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Ok(Self::empty());
        }
        let layout = matrix_layout::<T>(cols, rows)?;
        let ptr = allocate_in(backend.as_ref(), space, layout)?;
        Ok(Self {
            data: Some(ptr.cast()),
            cols,
            rows,
            space,
            backend: Some(backend),
        })
    }

    /// Allocates a zeroed matrix in host memory.
    ///
    /// A zero `cols` or `rows` yields an empty handle without touching the
    /// backend.
    pub fn create_host(backend: Arc<dyn MemoryBackend>, cols: usize, rows: usize) -> Result<Self> {
        Self::create(backend, MemorySpace::Host, cols, rows)
    }

    /// Allocates a zeroed matrix in device memory. Its elements cannot be
    /// read from host code.
    pub fn create_device(
        backend: Arc<dyn MemoryBackend>,
        cols: usize,
        rows: usize,
    ) -> Result<Self> {
        Self::create(backend, MemorySpace::Device, cols, rows)
    }

    /// Allocates a zeroed matrix in coherent memory, addressable from host
    /// and accelerator alike.
    pub fn create_coherent(
        backend: Arc<dyn MemoryBackend>,
        cols: usize,
        rows: usize,
    ) -> Result<Self> {
        Self::create(backend, MemorySpace::Coherent, cols, rows)
    }

    fn create_from(space: MemorySpace, other: &Self) -> Result<Self> {
        let backend = match &other.backend {
            Some(b) if !other.is_empty() => b.clone(),
            _ => return Ok(Self::empty()),
        };
        let mut m = Self::create(backend, space, other.cols, other.rows)?;
        m.copy_from(other)?;
        Ok(m)
    }

    /// Host copy of `other`, allocated through `other`'s backend. An empty
    /// `other` gives an empty result and no allocation.
    pub fn create_host_from(other: &Self) -> Result<Self> {
        Self::create_from(MemorySpace::Host, other)
    }

    /// Device copy of `other`, allocated through `other`'s backend.
    pub fn create_device_from(other: &Self) -> Result<Self> {
        Self::create_from(MemorySpace::Device, other)
    }

    /// Coherent copy of `other`, allocated through `other`'s backend.
    pub fn create_coherent_from(other: &Self) -> Result<Self> {
        Self::create_from(MemorySpace::Coherent, other)
    }

    /// Host matrix on `backend` holding `data` in row-major order.
    pub fn from_slice(
        backend: Arc<dyn MemoryBackend>,
        cols: usize,
        rows: usize,
        data: &[T],
    ) -> Result<Self> {
        let n = cols
            .checked_mul(rows)
            .ok_or(Error::CapacityOverflow { cols, rows })?;
        if n != data.len() {
            return Err(Error::ShapeMismatch {
                dst: n,
                src: data.len(),
            });
        }
        let mut m = Self::create_host(backend, cols, rows)?;
        if let Some(s) = m.as_mut_slice() {
            s.copy_from_slice(data);
        }
        Ok(m)
    }

    /// Zeroed host matrix on the process-wide default backend.
    pub fn host(cols: usize, rows: usize) -> Result<Self> {
        Self::create_host(default_backend(), cols, rows)
    }

    /// Host matrix on the process-wide default backend holding `v`.
    pub fn from_vec(cols: usize, rows: usize, v: Vec<T>) -> Result<Self> {
        Self::from_slice(default_backend(), cols, rows, &v)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn size(&self) -> usize {
        self.rows * self.cols
    }

    pub fn byte_len(&self) -> usize {
        self.size() * std::mem::size_of::<T>()
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    pub fn backend(&self) -> Option<&Arc<dyn MemoryBackend>> {
        self.backend.as_ref()
    }

    /// Raw buffer pointer, null when empty. Device pointers are only
    /// meaningful to the accelerator.
    pub fn as_ptr(&self) -> *const T {
        self.data
            .map_or(core::ptr::null(), |p| p.as_ptr() as *const T)
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.data.map_or(core::ptr::null_mut(), |p| p.as_ptr())
    }

    /// Host code may read the elements: the space is host addressable, or
    /// there are no elements at all.
    fn host_readable(&self) -> bool {
        self.space.is_host_addressable() || self.is_empty()
    }

    fn ptr(&self) -> *mut T {
        self.data.unwrap_or(NonNull::dangling()).as_ptr()
    }

    /// Element at column `c`, row `r`, without any checks.
    ///
    /// # Safety
    ///
    /// `c < cols()`, `r < rows()`, and the handle must be host addressable
    /// (Host or Coherent). Reading device memory from host code or reading
    /// out of range is undefined behavior.
    #[inline]
    pub unsafe fn at(&self, c: usize, r: usize) -> &T {
        debug_assert!(c < self.cols && r < self.rows, "({}, {}) out of range", c, r);
        self.at_flat(r * self.cols + c)
    }

    /// # Safety
    ///
    /// Same contract as [`MatrixHandle::at`].
    #[inline]
    pub unsafe fn at_mut(&mut self, c: usize, r: usize) -> &mut T {
        debug_assert!(c < self.cols && r < self.rows, "({}, {}) out of range", c, r);
        let cols = self.cols;
        self.at_flat_mut(r * cols + c)
    }

    /// Element at flat offset `i`, without any checks.
    ///
    /// # Safety
    ///
    /// `i < size()` and the handle must be host addressable.
    #[inline]
    pub unsafe fn at_flat(&self, i: usize) -> &T {
        debug_assert!(i < self.size(), "flat index {} out of range", i);
        debug_assert!(
            self.space.is_host_addressable(),
            "host access to {} memory",
            self.space
        );
        &*self.ptr().add(i)
    }

    /// # Safety
    ///
    /// Same contract as [`MatrixHandle::at_flat`].
    #[inline]
    pub unsafe fn at_flat_mut(&mut self, i: usize) -> &mut T {
        debug_assert!(i < self.size(), "flat index {} out of range", i);
        debug_assert!(
            self.space.is_host_addressable(),
            "host access to {} memory",
            self.space
        );
        &mut *self.ptr().add(i)
    }

    /// Checked [`MatrixHandle::at`]: `None` when out of range or not host
    /// addressable.
    pub fn get(&self, c: usize, r: usize) -> Option<&T> {
        if c < self.cols && r < self.rows {
            self.get_flat(r * self.cols + c)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, c: usize, r: usize) -> Option<&mut T> {
        if c < self.cols && r < self.rows {
            let cols = self.cols;
            self.get_flat_mut(r * cols + c)
        } else {
            None
        }
    }

    pub fn get_flat(&self, i: usize) -> Option<&T> {
        if i < self.size() && self.space.is_host_addressable() {
            Some(unsafe { self.at_flat(i) })
        } else {
            None
        }
    }

    pub fn get_flat_mut(&mut self, i: usize) -> Option<&mut T> {
        if i < self.size() && self.space.is_host_addressable() {
            Some(unsafe { self.at_flat_mut(i) })
        } else {
            None
        }
    }

    /// All elements in storage order, or `None` for device memory.
    pub fn as_slice(&self) -> Option<&[T]> {
        if self.host_readable() {
            Some(unsafe { std::slice::from_raw_parts(self.ptr(), self.size()) })
        } else {
            None
        }
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        if self.host_readable() {
            Some(unsafe { std::slice::from_raw_parts_mut(self.ptr(), self.size()) })
        } else {
            None
        }
    }

    /// Iterates the elements in storage order.
    ///
    /// # Panics
    ///
    /// If the handle lives in device memory.
    pub fn iter(&self) -> Iter<'_, T> {
        assert!(
            self.host_readable(),
            "cannot iterate {} memory from host code",
            self.space
        );
        let ptr = self.ptr() as *const T;
        Iter {
            ptr,
            end: unsafe { ptr.add(self.size()) },
            life: PhantomData,
        }
    }

    /// # Panics
    ///
    /// If the handle lives in device memory.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        assert!(
            self.host_readable(),
            "cannot iterate {} memory from host code",
            self.space
        );
        let ptr = self.ptr();
        IterMut {
            ptr,
            end: unsafe { ptr.add(self.size()) },
            life: PhantomData,
        }
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: T) -> Result<()> {
        let space = self.space;
        match self.as_mut_slice() {
            Some(s) => {
                s.fill(value);
                Ok(())
            }
            None => Err(Error::InvalidSpaceForOperation { op: "fill", space }),
        }
    }

    /// Reads the contents back to host memory, staging through a temporary
    /// host matrix when the handle lives on the device.
    pub fn to_host_vec(&self) -> Result<Vec<T>> {
        if let Some(s) = self.as_slice() {
            return Ok(s.to_vec());
        }
        let staging = Self::create_host_from(self)?;
        Ok(staging.as_slice().map(<[T]>::to_vec).unwrap_or_default())
    }

    /// Copies `src` into this matrix with the transfer the pair of spaces
    /// calls for (see [`transfer_kind`]) and returns it.
    ///
    /// When either handle is empty nothing is copied and `Ok(None)` is
    /// returned; this is logged as a warning since it usually means the
    /// caller skipped an allocation.
    ///
    /// Both handles must hold the same number of elements. Transfers that
    /// touch device memory also require both handles to come from the same
    /// backend.
    pub fn copy_from(&mut self, src: &Self) -> Result<Option<TransferKind>> {
        let kind = match transfer_kind(self.space, src.space) {
            Some(kind) => kind,
            None => {
                log::warn!(
                    "copy into {} matrix from {} matrix skipped",
                    self.space,
                    src.space
                );
                return Ok(None);
            }
        };
        if self.size() != src.size() {
            return Err(Error::ShapeMismatch {
                dst: self.size(),
                src: src.size(),
            });
        }
        let (dst_ptr, src_ptr) = match (self.data, src.data) {
            (Some(d), Some(s)) => (d.cast::<u8>(), s.cast::<u8>()),
            _ => return Ok(None),
        };
        let bytes = self.byte_len();
        match (&self.backend, &src.backend) {
            (Some(d), Some(s)) if same_backend(d, s) => unsafe {
                d.transfer(dst_ptr, src_ptr, bytes, kind)?;
            },
            (Some(_), Some(_)) if !kind.touches_device() => unsafe {
                // Both sides are host addressable; no backend needs to be involved.
                CopyConfig::default().local_copy(dst_ptr, src_ptr, bytes);
            },
            _ => return Err(Error::BackendMismatch { kind }),
        }
        log::debug!(
            "copied {} bytes {} ({} <- {})",
            bytes,
            kind,
            self.space,
            src.space
        );
        Ok(Some(kind))
    }

    /// Releases the buffer and leaves the handle empty. Freeing an empty
    /// handle does nothing.
    ///
    /// The handle is empty afterwards even when the backend reports an
    /// error.
    pub fn free(&mut self) -> Result<()> {
        let layout = matrix_layout::<T>(self.cols, self.rows);
        let space = std::mem::take(&mut self.space);
        let data = self.data.take();
        let backend = self.backend.take();
        self.cols = 0;
        self.rows = 0;
        match (data, backend) {
            (Some(ptr), Some(backend)) => unsafe {
                release_in(backend.as_ref(), space, ptr.cast(), layout?)
            },
            _ => Ok(()),
        }
    }
}

fn same_backend(a: &Arc<dyn MemoryBackend>, b: &Arc<dyn MemoryBackend>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}

impl<T: Element> Drop for MatrixHandle<T> {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        let space = self.space;
        if let Err(e) = self.free() {
            log::error!("releasing {} matrix on drop failed: {}", space, e);
        }
    }
}

impl<T: Element> Index<(usize, usize)> for MatrixHandle<T> {
    type Output = T;

    /// Indexes by `(column, row)`.
    fn index(&self, (c, r): (usize, usize)) -> &T {
        match self.get(c, r) {
            Some(v) => v,
            None => panic!(
                "index ({}, {}) invalid for {}x{} {} matrix",
                c, r, self.cols, self.rows, self.space
            ),
        }
    }
}

impl<T: Element> IndexMut<(usize, usize)> for MatrixHandle<T> {
    fn index_mut(&mut self, (c, r): (usize, usize)) -> &mut T {
        let (cols, rows, space) = (self.cols, self.rows, self.space);
        match self.get_mut(c, r) {
            Some(v) => v,
            None => panic!(
                "index ({}, {}) invalid for {}x{} {} matrix",
                c, r, cols, rows, space
            ),
        }
    }
}

impl<T: Element> Index<usize> for MatrixHandle<T> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        match self.get_flat(i) {
            Some(v) => v,
            None => panic!(
                "flat index {} invalid for {} element {} matrix",
                i,
                self.size(),
                self.space
            ),
        }
    }
}

impl<T: Element> IndexMut<usize> for MatrixHandle<T> {
    fn index_mut(&mut self, i: usize) -> &mut T {
        let (size, space) = (self.size(), self.space);
        match self.get_flat_mut(i) {
            Some(v) => v,
            None => panic!(
                "flat index {} invalid for {} element {} matrix",
                i, size, space
            ),
        }
    }
}

/// Storage-order iterator over a host-addressable matrix.
#[derive(Clone)]
pub struct Iter<'a, T> {
    ptr: *const T,
    end: *const T,
    life: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<&'a T> {
        if self.ptr == self.end {
            None
        } else {
            unsafe { Some(&*self.ptr.post_inc()) }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = remaining(self.ptr, self.end);
        (n, Some(n))
    }
}

impl<'a, T> DoubleEndedIterator for Iter<'a, T> {
    #[inline]
    fn next_back(&mut self) -> Option<&'a T> {
        if self.ptr == self.end {
            None
        } else {
            unsafe { Some(&*self.end.pre_dec()) }
        }
    }
}

impl<'a, T> ExactSizeIterator for Iter<'a, T> {}

pub struct IterMut<'a, T> {
    ptr: *mut T,
    end: *mut T,
    life: PhantomData<&'a mut T>,
}

impl<'a, T> Iterator for IterMut<'a, T> {
    type Item = &'a mut T;

    #[inline]
    fn next(&mut self) -> Option<&'a mut T> {
        if self.ptr == self.end {
            None
        } else {
            unsafe { Some(&mut *self.ptr.post_inc()) }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = remaining(self.ptr, self.end);
        (n, Some(n))
    }
}

impl<'a, T> DoubleEndedIterator for IterMut<'a, T> {
    #[inline]
    fn next_back(&mut self) -> Option<&'a mut T> {
        if self.ptr == self.end {
            None
        } else {
            unsafe { Some(&mut *self.end.pre_dec()) }
        }
    }
}

impl<'a, T> ExactSizeIterator for IterMut<'a, T> {}

fn remaining<T>(ptr: *const T, end: *const T) -> usize {
    (end as usize - ptr as usize) / std::mem::size_of::<T>().max(1)
}

impl<'a, T: Element> IntoIterator for &'a MatrixHandle<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

impl<'a, T: Element> IntoIterator for &'a mut MatrixHandle<T> {
    type Item = &'a mut T;
    type IntoIter = IterMut<'a, T>;

    fn into_iter(self) -> IterMut<'a, T> {
        self.iter_mut()
    }
}

impl<T: Element + fmt::Debug> fmt::Debug for MatrixHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} matrix {}x{}", self.space, self.cols, self.rows)?;
        let v = match self.as_slice() {
            Some(v) if !v.is_empty() => v,
            _ => return Ok(()),
        };
        f.write_str(" [")?;
        for (r, row) in v.chunks(self.cols).enumerate() {
            if r > 0 {
                f.write_str(",")?;
            }
            f.write_str("\n  [")?;
            f.write_str(&format!("{:?}", row[0]))?;
            for x in &row[1..] {
                f.write_str(&format!(", {:?}", x))?;
            }
            f.write_str("]")?;
        }
        f.write_str("\n]")
    }
}
