//! Privileged instructions behind a small platform interface.
//!
//! [`aarch64::Aarch64`] issues the real instructions; the simulated platform in
//! [`crate::sim`] scripts secure-monitor replies for host tests.

#[cfg(all(target_arch = "aarch64", target_os = "uefi"))]
pub mod aarch64;

use crate::config::HaltPolicy;
use crate::recovery::RecoveryContext;

/// PSCI 0.2 SYSTEM_OFF.
pub const PSCI_SYSTEM_OFF: u32 = 0x8400_0008;
/// PSCI 0.2 SYSTEM_RESET.
pub const PSCI_SYSTEM_RESET: u32 = 0x8400_0009;

/// Registers x0..x6 after an SMC, for calls that answer with more than a status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmcResponse {
    pub regs: [u64; 7],
}

impl SmcResponse {
    pub fn status(&self) -> u64 {
        self.regs[0]
    }
}

impl From<[u64; 7]> for SmcResponse {
    fn from(regs: [u64; 7]) -> Self {
        Self { regs }
    }
}

/// Where the recovery trampoline lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineInfo {
    /// Address the applet jumps to on failure.
    pub entry: u64,
    /// Page-aligned start of the region holding the trampoline.
    pub base: u64,
    pub size: u64,
}

pub trait Platform {
    /// Current exception level (0..=3).
    fn current_el(&self) -> u8;

    /// Clean and invalidate the data cache to the point of coherency.
    fn clean_dcache_range(&self, start: u64, len: u64);

    /// `smc #0` with IRQs masked for the duration of the call. Returns x0.
    fn smc(&self, fid: u32, args: [u64; 3]) -> u64;

    /// `smc #0` returning x0..x6.
    fn smc_ext(&self, fid: u32, args: [u64; 6]) -> SmcResponse;

    /// Save `context`, flush it, and issue `smc #0` with IRQs masked.
    ///
    /// Returns the monitor's x0, or [`crate::recovery::TRAMPOLINE_SENTINEL`]
    /// when control came back through the trampoline instead.
    fn armed_smc(&self, context: &mut RecoveryContext, fid: u32, args: [u64; 3]) -> u64;

    fn trampoline(&self) -> TrampolineInfo;

    fn reset(&self) -> !;

    fn power_off(&self) -> !;

    fn spin(&self) -> !;
}

impl<T: Platform + ?Sized> Platform for &T {
    fn current_el(&self) -> u8 {
        (**self).current_el()
    }

    fn clean_dcache_range(&self, start: u64, len: u64) {
        (**self).clean_dcache_range(start, len)
    }

    fn smc(&self, fid: u32, args: [u64; 3]) -> u64 {
        (**self).smc(fid, args)
    }

    fn smc_ext(&self, fid: u32, args: [u64; 6]) -> SmcResponse {
        (**self).smc_ext(fid, args)
    }

    fn armed_smc(&self, context: &mut RecoveryContext, fid: u32, args: [u64; 3]) -> u64 {
        (**self).armed_smc(context, fid, args)
    }

    fn trampoline(&self) -> TrampolineInfo {
        (**self).trampoline()
    }

    fn reset(&self) -> ! {
        (**self).reset()
    }

    fn power_off(&self) -> ! {
        (**self).power_off()
    }

    fn spin(&self) -> ! {
        (**self).spin()
    }
}

/// Stop the machine according to `policy`.
pub fn halt<P: Platform + ?Sized>(platform: &P, policy: HaltPolicy) -> ! {
    match policy {
        HaltPolicy::Reset => platform.reset(),
        HaltPolicy::Spin => platform.spin(),
    }
}
