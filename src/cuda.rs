//! Device and managed memory through the CUDA driver API.

use crate::backend::MemoryBackend;
use crate::error::{Error, Result};
use crate::host::{heap_alloc, heap_release, CopyConfig};
use crate::space::{MemorySpace, TransferKind};
use core::ptr::NonNull;
use cudarc::driver::result;
use cudarc::driver::sys::{CUdeviceptr, CUmemAttach_flags_enum};
use std::alloc::Layout;
use std::sync::Arc;

pub struct CudaBackend {
    device: Arc<cudarc::driver::CudaDevice>,
    ordinal: usize,
    config: CopyConfig,
}

impl CudaBackend {
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = cudarc::driver::CudaDevice::new(ordinal)?;
        log::debug!("cuda: opened device {}", ordinal);
        Ok(Self {
            device,
            ordinal,
            config: CopyConfig::from_env(),
        })
    }

    pub fn with_config(mut self, config: CopyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn bind(&self) -> Result<()> {
        self.device.bind_to_thread()?;
        Ok(())
    }

    fn alloc_accel(&self, layout: Layout, space: MemorySpace) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return heap_alloc(layout, space);
        }
        self.bind()?;
        let dptr = unsafe {
            let dptr = match space {
                MemorySpace::Coherent => result::malloc_managed(
                    layout.size(),
                    CUmemAttach_flags_enum::CU_MEM_ATTACH_GLOBAL,
                ),
                _ => result::malloc_sync(layout.size()),
            }
            .map_err(|e| {
                log::debug!("cuda: {} allocation failed: {}", space, e);
                Error::AllocationFailure {
                    space,
                    bytes: layout.size(),
                }
            })?;
            result::memset_d8_sync(dptr, 0, layout.size())?;
            dptr
        };
        NonNull::new(dptr as usize as *mut u8).ok_or(Error::AllocationFailure {
            space,
            bytes: layout.size(),
        })
    }
}

fn dev(ptr: NonNull<u8>) -> CUdeviceptr {
    ptr.as_ptr() as usize as CUdeviceptr
}

impl MemoryBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn allocate_host(&self, layout: Layout) -> Result<NonNull<u8>> {
        heap_alloc(layout, MemorySpace::Host)
    }

    fn allocate_device(&self, layout: Layout) -> Result<NonNull<u8>> {
        self.alloc_accel(layout, MemorySpace::Device)
    }

    fn allocate_coherent(&self, layout: Layout) -> Result<NonNull<u8>> {
        self.alloc_accel(layout, MemorySpace::Coherent)
    }

    unsafe fn transfer(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
        kind: TransferKind,
    ) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        log::debug!("cuda: {} transfer of {} bytes", kind, bytes);
        match kind {
            TransferKind::HostToHost => {
                self.config.local_copy(dst, src, bytes);
            }
            TransferKind::HostToDevice => {
                self.bind()?;
                let src = std::slice::from_raw_parts(src.as_ptr() as *const u8, bytes);
                result::memcpy_htod_sync(dev(dst), src)?;
            }
            TransferKind::DeviceToHost => {
                self.bind()?;
                let dst = std::slice::from_raw_parts_mut(dst.as_ptr(), bytes);
                result::memcpy_dtoh_sync(dst, dev(src))?;
            }
            TransferKind::DeviceToDevice => {
                self.bind()?;
                result::memcpy_dtod_sync(dev(dst), dev(src), bytes)?;
            }
        }
        Ok(())
    }

    unsafe fn release_host(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        heap_release(ptr, layout);
        Ok(())
    }

    unsafe fn release_device_or_coherent(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        if layout.size() == 0 {
            heap_release(ptr, layout);
            return Ok(());
        }
        self.bind()?;
        result::free_sync(dev(ptr))?;
        Ok(())
    }
}
