//! Launch configuration and the applet compatibility table.

use crate::launch::DmaRange;
use crate::pe::Validation;

/// Granule used for every allocation handed to the secure monitor.
pub const PAGE_SIZE: usize = 4096;

/// Byte the boot-parameter region is filled with.
///
/// The applet validates this block when it resumes normally; a poisoned block
/// makes it bail out instead of trusting garbage.
pub const BOOT_PARAMS_POISON: u8 = 0xff;

/// Layout numbers tied to one family of `tcblaunch.exe` builds.
///
/// Only self-consistency of the resulting control blocks is enforced; the
/// concrete values are what known applet versions accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatProfile {
    pub name: &'static str,
    /// `TzArgs::version`.
    pub tz_version: u32,
    /// Measurement (TCG) log format version.
    pub log_version: u32,
    /// Scratch pages reserved for the applet's C runtime.
    pub crt_pages: usize,
    /// Pages reserved for the measurement log.
    pub log_pages: usize,
    /// Pages of poisoned boot parameters.
    pub boot_params_pages: usize,
    /// Upper bound for the loaded image; the applet's own layout decides how
    /// much of it is used.
    pub image_pages: usize,
    /// Reject images whose subsystem is not a boot application.
    pub require_boot_subsystem: bool,
}

impl CompatProfile {
    pub const TCBLAUNCH: CompatProfile = CompatProfile {
        name: "tcblaunch",
        tz_version: 1,
        log_version: 2,
        crt_pages: 24,
        log_pages: 2,
        boot_params_pages: 3,
        image_pages: 0x800,
        require_boot_subsystem: true,
    };

    /// Early builds that do not carry the boot-application subsystem tag.
    pub const TCBLAUNCH_LEGACY: CompatProfile = CompatProfile {
        name: "tcblaunch-legacy",
        require_boot_subsystem: false,
        ..CompatProfile::TCBLAUNCH
    };

    pub const KNOWN: &'static [CompatProfile] =
        &[CompatProfile::TCBLAUNCH, CompatProfile::TCBLAUNCH_LEGACY];

    pub fn by_name(name: &str) -> Option<CompatProfile> {
        Self::KNOWN.iter().copied().find(|p| p.name == name)
    }

    pub fn validation(&self) -> Validation {
        if self.require_boot_subsystem {
            Validation::BootApplication
        } else {
            Validation::Pe64
        }
    }
}

/// What to do once the system can no longer be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltPolicy {
    /// PSCI SYSTEM_RESET.
    Reset,
    /// Park the CPU forever and leave the diagnostic output on screen.
    Spin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub profile: CompatProfile,
    /// Failure while installing, with the console still readable.
    pub install_halt: HaltPolicy,
    /// Failure inside the `ExitBootServices` hook, where nobody can read the
    /// console any more.
    pub exit_halt: HaltPolicy,
    /// Range registered with `RESERVE_MEM` before authentication, on targets
    /// that want a DMA-visible window.
    pub reserve_dma: Option<DmaRange>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            profile: CompatProfile::TCBLAUNCH,
            install_halt: HaltPolicy::Spin,
            exit_halt: HaltPolicy::Reset,
            reserve_dma: None,
        }
    }
}
