//! Diagnostic queries against the secure world. Not used on the launch path.

use log::info;

use crate::arch::{Platform, SmcResponse};
use crate::config::PAGE_SIZE;
use crate::error::AllocationError;
use crate::memory::{PageAllocator, Pages};

/// QSEE `APP_LOOKUP` (SiP, fast call).
pub const QSEE_APP_LOOKUP: u32 = 0x3200_0103;
/// Parameter id: one buffer, one length.
pub const QSEE_APP_LOOKUP_PARAMS: u64 = 0x22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppLookup {
    pub status: u64,
    pub app_id: u64,
    pub raw: SmcResponse,
}

impl AppLookup {
    pub fn found(&self) -> bool {
        self.status == 0 && self.app_id != 0
    }
}

/// Ask QSEE for the id of the trusted application called `name`,
/// e.g. `qcom.tz.mssecapp`.
pub fn lookup_app<P, A>(platform: &P, allocator: &A, name: &str) -> Result<AppLookup, AllocationError>
where
    P: Platform + ?Sized,
    A: PageAllocator + ?Sized,
{
    let len = name.len().min(PAGE_SIZE);
    let mut page = Pages::zeroed(allocator, 1)?;
    page.as_mut_slice()[..len].copy_from_slice(&name.as_bytes()[..len]);
    platform.clean_dcache_range(page.addr(), page.len() as u64);

    let raw = platform.smc_ext(
        QSEE_APP_LOOKUP,
        [QSEE_APP_LOOKUP_PARAMS, page.addr(), len as u64, 0, 0, 0],
    );
    let lookup = AppLookup {
        status: raw.regs[0],
        app_id: raw.regs[3],
        raw,
    };
    info!(
        "lookup {}: ret={:#x} type={:#x} id={:#x}",
        name, raw.regs[0], raw.regs[2], raw.regs[3]
    );
    Ok(lookup)
}
