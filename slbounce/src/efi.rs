//! UEFI glue: page allocation, file and variable access, and installation of
//! the boundary hooks into the live boot services table.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::{addr_of_mut, NonNull};

use log::{info, warn};
use spin::{Mutex, Once};
use uefi::prelude::*;
use uefi::proto::loaded_image::LoadedImage;
use uefi::proto::media::file::{File, FileAttribute, FileInfo, FileMode};
use uefi::table::boot::{AllocateType, BootServices, MemoryType, Tpl};
use uefi::table::runtime::{RuntimeServices, VariableVendor};
use uefi::{cstr16, guid, CString16};
use uefi_raw::table::boot::{BootServices as RawBootServices, MemoryDescriptor};
use uefi_raw::table::system::SystemTable as RawSystemTable;
use uefi_raw::Handle as RawHandle;

use crate::arch::aarch64::Aarch64;
use crate::bootcfg::VARIABLE_NAME;
use crate::bounce::PendingBounce;
use crate::error::AllocationError;
use crate::hooks::{BoundaryHooks, FirmwareServices};
use crate::memory::PageAllocator;

/// `AllocatePages(AnyPages, EfiLoaderData)`.
pub struct UefiPages<'a> {
    boot_services: &'a BootServices,
}

impl<'a> UefiPages<'a> {
    pub fn new(boot_services: &'a BootServices) -> Self {
        Self { boot_services }
    }
}

impl PageAllocator for UefiPages<'_> {
    fn allocate_pages(&self, count: usize) -> Result<NonNull<u8>, AllocationError> {
        let err = AllocationError { pages: count };
        let addr = self
            .boot_services
            .allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, count)
            .map_err(|_| err)?;
        NonNull::new(addr as *mut u8).ok_or(err)
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize) {
        if let Err(e) = self.boot_services.free_pages(base.as_ptr() as u64, count) {
            warn!("FreePages({:p}, {}) failed: {:?}", base, count, e.status());
        }
    }
}

/// The image's load options as text; empty when none were given.
pub fn load_options(boot_services: &BootServices, image: Handle) -> Result<String, Status> {
    let loaded = boot_services
        .open_protocol_exclusive::<LoadedImage>(image)
        .map_err(|e| e.status())?;
    Ok(loaded
        .load_options_as_cstr16()
        .map(|options| options.to_string())
        .unwrap_or_default())
}

/// Read `path` from the volume this image was loaded from.
pub fn read_file(boot_services: &BootServices, image: Handle, path: &str) -> Result<Vec<u8>, Status> {
    let path = CString16::try_from(path.replace('/', "\\").as_str())
        .map_err(|_| Status::NOT_FOUND)?;
    let mut fs = boot_services
        .get_image_file_system(image)
        .map_err(|e| e.status())?;
    let mut root = fs.open_volume().map_err(|e| e.status())?;
    let mut file = root
        .open(&path, FileMode::Read, FileAttribute::empty())
        .map_err(|e| e.status())?
        .into_regular_file()
        .ok_or(Status::NOT_FOUND)?;
    let size = file
        .get_boxed_info::<FileInfo>()
        .map_err(|e| e.status())?
        .file_size();

    let mut data = vec![0u8; size as usize];
    let read = file.read(&mut data).map_err(|e| e.status())?;
    data.truncate(read);
    info!("read {} ({:#x} bytes)", path, read);
    Ok(data)
}

/// Contents of the `SlBounceConfig` variable, `None` when it does not exist.
pub fn read_boot_config(runtime_services: &RuntimeServices) -> Option<Vec<u8>> {
    let vendor = VariableVendor(guid!("b8d7d1c6-33b0-4c1e-9b8f-5a1e7d3c2f10"));
    let mut buf = [0u8; 64];
    match runtime_services.get_variable(cstr16!("SlBounceConfig"), &vendor, &mut buf) {
        Ok((data, _)) => Some(data.to_vec()),
        Err(e) if e.status() == Status::NOT_FOUND => None,
        Err(e) => {
            warn!("reading {} failed: {:?}", VARIABLE_NAME, e.status());
            Some(Vec::new())
        }
    }
}

type GetMemoryMapFn = unsafe extern "efiapi" fn(
    *mut usize,
    *mut MemoryDescriptor,
    *mut usize,
    *mut usize,
    *mut u32,
) -> Status;
type ExitBootServicesFn = unsafe extern "efiapi" fn(RawHandle, usize) -> Status;

/// The firmware's own entries, captured before patching.
#[derive(Clone, Copy)]
pub struct OriginalServices {
    get_memory_map: GetMemoryMapFn,
    exit_boot_services: ExitBootServicesFn,
}

impl FirmwareServices for OriginalServices {
    unsafe fn get_memory_map(
        &self,
        map_size: *mut usize,
        map: *mut MemoryDescriptor,
        map_key: *mut usize,
        descriptor_size: *mut usize,
        descriptor_version: *mut u32,
    ) -> Status {
        (self.get_memory_map)(map_size, map, map_key, descriptor_size, descriptor_version)
    }

    unsafe fn exit_boot_services(&self, image: RawHandle, map_key: usize) -> Status {
        (self.exit_boot_services)(image, map_key)
    }
}

static ORIGINAL: Once<OriginalServices> = Once::new();
static HOOKS: Once<Mutex<BoundaryHooks<OriginalServices, Aarch64>>> = Once::new();

unsafe extern "efiapi" fn hooked_get_memory_map(
    map_size: *mut usize,
    map: *mut MemoryDescriptor,
    map_key: *mut usize,
    descriptor_size: *mut usize,
    descriptor_version: *mut u32,
) -> Status {
    // ExitBootServices notifications may call back in while the hooks are
    // locked; those calls just go to the firmware.
    if let Some(mut hooks) = HOOKS.get().and_then(|m| m.try_lock()) {
        return hooks.get_memory_map(map_size, map, map_key, descriptor_size, descriptor_version);
    }
    match ORIGINAL.get() {
        Some(original) => {
            original.get_memory_map(map_size, map, map_key, descriptor_size, descriptor_version)
        }
        None => Status::NOT_READY,
    }
}

unsafe extern "efiapi" fn hooked_exit_boot_services(image: RawHandle, map_key: usize) -> Status {
    match HOOKS.get() {
        Some(hooks) => hooks.lock().exit_boot_services(image, map_key),
        None => match ORIGINAL.get() {
            Some(original) => original.exit_boot_services(image, map_key),
            None => Status::NOT_READY,
        },
    }
}

/// Patch `GetMemoryMap` and `ExitBootServices` so the bounce finishes right
/// after the OS loader leaves boot services.
///
/// # Safety
///
/// Must run at most once, before any other code caches the two entries.
pub unsafe fn install_hooks(
    system_table: &SystemTable<Boot>,
    pending: PendingBounce<Aarch64>,
    eligible: bool,
) -> Result<(), Status> {
    if HOOKS.get().is_some() {
        return Err(Status::ALREADY_STARTED);
    }

    let table = system_table.as_ptr().cast::<RawSystemTable>();
    let bs: *mut RawBootServices = (*table).boot_services;
    let original = *ORIGINAL.call_once(|| OriginalServices {
        get_memory_map: (*bs).get_memory_map,
        exit_boot_services: (*bs).exit_boot_services,
    });
    HOOKS.call_once(|| Mutex::new(BoundaryHooks::new(original, pending, eligible)));

    let _tpl = system_table.boot_services().raise_tpl(Tpl::NOTIFY);
    addr_of_mut!((*bs).get_memory_map).write_volatile(hooked_get_memory_map);
    addr_of_mut!((*bs).exit_boot_services).write_volatile(hooked_exit_boot_services);
    // The table CRC is left stale; nothing downstream verifies it.
    Ok(())
}
