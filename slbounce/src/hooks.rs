//! Wrappers around `GetMemoryMap` and `ExitBootServices`.
//!
//! The last memory map the OS loader asked for is remembered so that, right
//! after the real `ExitBootServices` succeeds, every region the applet or the
//! monitor might look at can be cleaned to the point of coherency before the
//! bounce is finished.

use alloc::vec::Vec;
use core::mem::size_of;

use uefi_raw::table::boot::{MemoryDescriptor, MemoryType};
use uefi_raw::{Handle, Status};

use crate::arch::Platform;
use crate::bounce::PendingBounce;
use crate::config::PAGE_SIZE;

/// Memory types cleaned before the bounce.
pub const FLUSHED_TYPES: [MemoryType; 7] = [
    MemoryType::LOADER_CODE,
    MemoryType::LOADER_DATA,
    MemoryType::BOOT_SERVICES_CODE,
    MemoryType::BOOT_SERVICES_DATA,
    MemoryType::RUNTIME_SERVICES_CODE,
    MemoryType::RUNTIME_SERVICES_DATA,
    MemoryType::ACPI_RECLAIM,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub ty: MemoryType,
    pub base: u64,
    pub pages: u64,
}

impl MemoryRegion {
    pub fn len(&self) -> u64 {
        self.pages * PAGE_SIZE as u64
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }
}

/// Regions of the most recent memory map, in a buffer reserved up front.
#[derive(Debug)]
pub struct MemoryMapSnapshot {
    regions: Vec<MemoryRegion>,
    descriptor_size: usize,
    truncated: bool,
}

impl MemoryMapSnapshot {
    pub const DEFAULT_CAPACITY: usize = 512;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            regions: Vec::with_capacity(capacity),
            descriptor_size: 0,
            truncated: false,
        }
    }

    /// Replace the snapshot with the descriptors in `map`, laid out
    /// `descriptor_size` bytes apart (firmware may use a larger stride than
    /// `EFI_MEMORY_DESCRIPTOR`).
    ///
    /// Never grows the buffer; descriptors beyond its capacity are dropped and
    /// [`Self::truncated`] is set.
    pub fn record(&mut self, map: &[u8], descriptor_size: usize) {
        self.regions.clear();
        self.truncated = false;
        self.descriptor_size = descriptor_size;
        if descriptor_size < size_of::<MemoryDescriptor>() {
            return;
        }
        for raw in map.chunks_exact(descriptor_size) {
            if self.regions.len() == self.regions.capacity() {
                self.truncated = true;
                break;
            }
            // SAFETY: `raw` holds at least one descriptor, and every bit
            // pattern is a valid `MemoryDescriptor`.
            let desc = unsafe { raw.as_ptr().cast::<MemoryDescriptor>().read_unaligned() };
            self.regions.push(MemoryRegion {
                ty: desc.ty,
                base: desc.phys_start,
                pages: desc.page_count,
            });
        }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn flushable(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(|r| FLUSHED_TYPES.contains(&r.ty))
    }
}

/// The boot services being wrapped.
pub trait FirmwareServices {
    /// # Safety
    ///
    /// Pointers as for `EFI_BOOT_SERVICES.GetMemoryMap`.
    unsafe fn get_memory_map(
        &self,
        map_size: *mut usize,
        map: *mut MemoryDescriptor,
        map_key: *mut usize,
        descriptor_size: *mut usize,
        descriptor_version: *mut u32,
    ) -> Status;

    /// # Safety
    ///
    /// As for `EFI_BOOT_SERVICES.ExitBootServices`.
    unsafe fn exit_boot_services(&self, image: Handle, map_key: usize) -> Status;
}

/// State shared by the two wrappers.
#[derive(Debug)]
pub struct BoundaryHooks<F, P: Platform> {
    firmware: F,
    pending: Option<PendingBounce<P>>,
    eligible: bool,
    map: MemoryMapSnapshot,
}

impl<F: FirmwareServices, P: Platform> BoundaryHooks<F, P> {
    pub fn new(firmware: F, pending: PendingBounce<P>, eligible: bool) -> Self {
        Self {
            firmware,
            pending: Some(pending),
            eligible,
            map: MemoryMapSnapshot::with_capacity(MemoryMapSnapshot::DEFAULT_CAPACITY),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_eligible(&self) -> bool {
        self.eligible
    }

    pub fn memory_map(&self) -> &MemoryMapSnapshot {
        &self.map
    }

    /// Forward to the firmware and remember the map it returned.
    ///
    /// # Safety
    ///
    /// Pointers as for `EFI_BOOT_SERVICES.GetMemoryMap`.
    pub unsafe fn get_memory_map(
        &mut self,
        map_size: *mut usize,
        map: *mut MemoryDescriptor,
        map_key: *mut usize,
        descriptor_size: *mut usize,
        descriptor_version: *mut u32,
    ) -> Status {
        let status = self.firmware.get_memory_map(
            map_size,
            map,
            map_key,
            descriptor_size,
            descriptor_version,
        );
        if !status.is_error() && !map.is_null() && !map_size.is_null() && !descriptor_size.is_null()
        {
            let bytes = core::slice::from_raw_parts(map.cast::<u8>(), *map_size);
            self.map.record(bytes, *descriptor_size);
        }
        status
    }

    /// Call the real `ExitBootServices`, then finish the bounce.
    ///
    /// Firmware errors are returned untouched so the loader can retry with a
    /// fresh map key. If the bounce fails the platform halts.
    ///
    /// # Safety
    ///
    /// As for `EFI_BOOT_SERVICES.ExitBootServices`.
    pub unsafe fn exit_boot_services(&mut self, image: Handle, map_key: usize) -> Status {
        let status = self.firmware.exit_boot_services(image, map_key);
        if status.is_error() || !self.eligible {
            return status;
        }
        let Some(pending) = self.pending.take() else {
            return status;
        };
        self.flush_boot_memory(pending.platform());
        pending.finish();
        status
    }

    /// Clean every region the secure world might read.
    pub fn flush_boot_memory<Q: Platform + ?Sized>(&self, platform: &Q) {
        for region in self.map.flushable() {
            platform.clean_dcache_range(region.base, region.len());
        }
    }
}
