//! An accelerator simulator.
//!
//! Device and coherent memory live on the system heap like host memory, but
//! every region is recorded with the space it was allocated in. Transfers and
//! releases are checked against that table, so a copy that names the wrong
//! direction, a release through the wrong primitive or a double free is
//! reported instead of silently succeeding.

use crate::backend::MemoryBackend;
use crate::error::{Error, Result};
use crate::host::{heap_alloc, heap_release, CopyConfig};
use crate::space::{MemorySpace, TransferKind};
use core::ptr::NonNull;
use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy)]
struct Region {
    space: MemorySpace,
    layout: Layout,
}

/// Counters kept by a [`SimBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub host_allocations: usize,
    pub device_allocations: usize,
    pub coherent_allocations: usize,
    pub releases: usize,
    /// Every successful transfer, in issue order.
    pub transfers: Vec<TransferKind>,
}

impl SimStats {
    pub fn allocations(&self) -> usize {
        self.host_allocations + self.device_allocations + self.coherent_allocations
    }
}

#[derive(Default)]
struct State {
    regions: HashMap<usize, Region>,
    accel_bytes: usize,
    stats: SimStats,
}

#[derive(Default)]
pub struct SimBackend {
    config: CopyConfig,
    /// Limit on live device plus coherent bytes.
    accel_capacity: Option<usize>,
    state: Mutex<State>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CopyConfig) -> Self {
        Self {
            config,
            accel_capacity: None,
            state: Mutex::default(),
        }
    }

    /// Simulates an accelerator with `bytes` of memory shared by the device
    /// and coherent spaces.
    pub fn with_accelerator_capacity(mut self, bytes: usize) -> Self {
        self.accel_capacity = Some(bytes);
        self
    }

    pub fn stats(&self) -> SimStats {
        self.lock().map(|s| s.stats.clone()).unwrap_or_default()
    }

    /// Number of regions allocated and not yet released.
    pub fn live_regions(&self) -> usize {
        self.lock().map(|s| s.regions.len()).unwrap_or(0)
    }

    /// Space of the live region starting at `ptr`, if any.
    pub fn space_of(&self, ptr: *const u8) -> Option<MemorySpace> {
        let state = self.lock().ok()?;
        state.regions.get(&(ptr as usize)).map(|r| r.space)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::from("simulator state poisoned"))
    }

    fn allocate(&self, layout: Layout, space: MemorySpace) -> Result<NonNull<u8>> {
        let mut state = self.lock()?;
        let accel = space != MemorySpace::Host;
        if accel {
            if let Some(cap) = self.accel_capacity {
                if state.accel_bytes + layout.size() > cap {
                    return Err(Error::AllocationFailure {
                        space,
                        bytes: layout.size(),
                    });
                }
            }
        }
        let ptr = heap_alloc(layout, space)?;
        match space {
            MemorySpace::Host => state.stats.host_allocations += 1,
            MemorySpace::Device => state.stats.device_allocations += 1,
            MemorySpace::Coherent => state.stats.coherent_allocations += 1,
            MemorySpace::Empty => {}
        }
        if layout.size() != 0 {
            if accel {
                state.accel_bytes += layout.size();
            }
            state
                .regions
                .insert(ptr.as_ptr() as usize, Region { space, layout });
        }
        Ok(ptr)
    }

    unsafe fn release(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        accepts: fn(MemorySpace) -> bool,
        expected: MemorySpace,
    ) -> Result<()> {
        if layout.size() == 0 {
            return Ok(());
        }
        let mut state = self.lock()?;
        let addr = ptr.as_ptr() as usize;
        let region = match state.regions.get(&addr) {
            Some(r) if accepts(r.space) && r.layout == layout => *r,
            _ => {
                return Err(Error::UnknownAllocation {
                    space: expected,
                    addr,
                })
            }
        };
        state.regions.remove(&addr);
        if region.space != MemorySpace::Host {
            state.accel_bytes -= layout.size();
        }
        state.stats.releases += 1;
        heap_release(ptr, layout);
        Ok(())
    }

    fn check_region(
        state: &State,
        ptr: NonNull<u8>,
        bytes: usize,
        kind: TransferKind,
        side: &str,
        accepts: fn(MemorySpace) -> bool,
    ) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        match state.regions.get(&addr) {
            None => Err(Error::InvalidTransfer {
                kind,
                reason: format!("{} {:#x} is not a live region", side, addr),
            }),
            Some(r) if !accepts(r.space) => Err(Error::InvalidTransfer {
                kind,
                reason: format!("{} {:#x} lives in {} memory", side, addr, r.space),
            }),
            Some(r) if r.layout.size() < bytes => Err(Error::InvalidTransfer {
                kind,
                reason: format!(
                    "{} region holds {} bytes, {} requested",
                    side,
                    r.layout.size(),
                    bytes
                ),
            }),
            Some(_) => Ok(()),
        }
    }
}

fn is_device(s: MemorySpace) -> bool {
    s == MemorySpace::Device
}

fn is_host_addressable(s: MemorySpace) -> bool {
    s.is_host_addressable()
}

fn is_host(s: MemorySpace) -> bool {
    s == MemorySpace::Host
}

fn is_accel(s: MemorySpace) -> bool {
    matches!(s, MemorySpace::Device | MemorySpace::Coherent)
}

impl MemoryBackend for SimBackend {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn allocate_host(&self, layout: Layout) -> Result<NonNull<u8>> {
        self.allocate(layout, MemorySpace::Host)
    }

    fn allocate_device(&self, layout: Layout) -> Result<NonNull<u8>> {
        self.allocate(layout, MemorySpace::Device)
    }

    fn allocate_coherent(&self, layout: Layout) -> Result<NonNull<u8>> {
        self.allocate(layout, MemorySpace::Coherent)
    }

    unsafe fn transfer(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
        kind: TransferKind,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if bytes != 0 {
            let (dst_ok, src_ok): (fn(MemorySpace) -> bool, fn(MemorySpace) -> bool) = match kind
            {
                TransferKind::HostToHost => (is_host_addressable, is_host_addressable),
                TransferKind::HostToDevice => (is_device, is_host_addressable),
                TransferKind::DeviceToHost => (is_host_addressable, is_device),
                TransferKind::DeviceToDevice => (is_device, is_device),
            };
            Self::check_region(&state, dst, bytes, kind, "destination", dst_ok)?;
            Self::check_region(&state, src, bytes, kind, "source", src_ok)?;
            self.config.local_copy(dst, src, bytes);
        }
        log::debug!("sim: {} transfer of {} bytes", kind, bytes);
        state.stats.transfers.push(kind);
        Ok(())
    }

    unsafe fn release_host(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        self.release(ptr, layout, is_host, MemorySpace::Host)
    }

    unsafe fn release_device_or_coherent(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        self.release(ptr, layout, is_accel, MemorySpace::Device)
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        if !state.regions.is_empty() {
            log::warn!("sim: {} regions leaked", state.regions.len());
        }
        for (addr, region) in state.regions.drain() {
            // SAFETY: every tracked region came from heap_alloc with this layout.
            unsafe { heap_release(NonNull::new_unchecked(addr as *mut u8), region.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(n: usize) -> Layout {
        Layout::array::<u32>(n).unwrap()
    }

    #[test]
    fn test_tracks_spaces() {
        let b = SimBackend::new();
        let h = b.allocate_host(layout(4)).unwrap();
        let d = b.allocate_device(layout(4)).unwrap();
        let c = b.allocate_coherent(layout(4)).unwrap();
        assert_eq!(b.space_of(h.as_ptr()), Some(MemorySpace::Host));
        assert_eq!(b.space_of(d.as_ptr()), Some(MemorySpace::Device));
        assert_eq!(b.space_of(c.as_ptr()), Some(MemorySpace::Coherent));
        assert_eq!(b.live_regions(), 3);

        unsafe {
            b.release_host(h, layout(4)).unwrap();
            b.release_device_or_coherent(d, layout(4)).unwrap();
            b.release_device_or_coherent(c, layout(4)).unwrap();
        }
        assert_eq!(b.live_regions(), 0);
        assert_eq!(b.stats().releases, 3);
        assert_eq!(b.stats().allocations(), 3);
    }

    #[test]
    fn test_wrong_release_primitive() {
        let b = SimBackend::new();
        let d = b.allocate_device(layout(2)).unwrap();
        let r = unsafe { b.release_host(d, layout(2)) };
        assert!(matches!(r, Err(Error::UnknownAllocation { .. })));
        let h = b.allocate_host(layout(2)).unwrap();
        let r = unsafe { b.release_device_or_coherent(h, layout(2)) };
        assert!(matches!(r, Err(Error::UnknownAllocation { .. })));
        assert_eq!(b.live_regions(), 2);
    }

    #[test]
    fn test_double_free() {
        let b = SimBackend::new();
        let h = b.allocate_host(layout(2)).unwrap();
        unsafe {
            b.release_host(h, layout(2)).unwrap();
            assert!(b.release_host(h, layout(2)).is_err());
        }
    }

    #[test]
    fn test_transfer_checks_direction() {
        let b = SimBackend::new();
        let h = b.allocate_host(layout(4)).unwrap();
        let d = b.allocate_device(layout(4)).unwrap();
        unsafe {
            assert!(b.transfer(d, h, 16, TransferKind::HostToDevice).is_ok());
            assert!(matches!(
                b.transfer(d, h, 16, TransferKind::HostToHost),
                Err(Error::InvalidTransfer { .. })
            ));
            assert!(matches!(
                b.transfer(h, d, 16, TransferKind::DeviceToDevice),
                Err(Error::InvalidTransfer { .. })
            ));
            assert!(matches!(
                b.transfer(h, d, 32, TransferKind::DeviceToHost),
                Err(Error::InvalidTransfer { .. })
            ));
        }
        assert_eq!(b.stats().transfers, vec![TransferKind::HostToDevice]);
    }

    #[test]
    fn test_accelerator_capacity() {
        let b = SimBackend::new().with_accelerator_capacity(32);
        let d = b.allocate_device(layout(6)).unwrap();
        assert!(matches!(
            b.allocate_coherent(layout(4)),
            Err(Error::AllocationFailure {
                space: MemorySpace::Coherent,
                bytes: 16
            })
        ));
        let h = b.allocate_host(layout(64)).unwrap();
        unsafe { b.release_device_or_coherent(d, layout(6)).unwrap() };
        let c = b.allocate_coherent(layout(4)).unwrap();
        unsafe {
            b.release_device_or_coherent(c, layout(4)).unwrap();
            b.release_host(h, layout(64)).unwrap();
        }
    }
}
