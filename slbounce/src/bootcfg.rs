//! `SlBounceConfig` UEFI variable.
//!
//! Lets a user disable the bounce or change its failure behaviour without
//! touching the boot entry. The variable holds a [`RawBootConfig`].

use bitflags::bitflags;
use log::{info, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{CompatProfile, HaltPolicy, LaunchConfig};
use crate::error::BootConfigError;

pub const VARIABLE_NAME: &str = "SlBounceConfig";
pub const VENDOR_GUID: &str = "b8d7d1c6-33b0-4c1e-9b8f-5a1e7d3c2f10";

/// "SLBC"
pub const BOOT_CONFIG_MAGIC: u32 = u32::from_le_bytes(*b"SLBC");
pub const BOOT_CONFIG_VERSION: u32 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BootFlags: u64 {
        /// Do not bounce on this machine.
        const HYP_DISABLED = 1 << 0;
        /// Park the CPU instead of resetting when the bounce fails after
        /// `ExitBootServices`.
        const SPIN_ON_FAILURE = 1 << 1;
        /// Accept applets without the boot-application subsystem tag.
        const LEGACY_APPLET = 1 << 2;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawBootConfig {
    pub magic: u32,
    pub version: u32,
    pub flags: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootConfig {
    pub flags: BootFlags,
}

impl BootConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self, BootConfigError> {
        let (raw, _) = RawBootConfig::read_from_prefix(bytes)
            .map_err(|_| BootConfigError::Truncated(bytes.len()))?;
        if raw.magic != BOOT_CONFIG_MAGIC {
            return Err(BootConfigError::BadMagic(raw.magic));
        }
        if raw.version != BOOT_CONFIG_VERSION {
            return Err(BootConfigError::UnsupportedVersion(raw.version));
        }
        Ok(Self {
            flags: BootFlags::from_bits_truncate(raw.flags),
        })
    }

    pub fn is_eligible(&self) -> bool {
        !self.flags.contains(BootFlags::HYP_DISABLED)
    }

    pub fn apply(&self, config: &mut LaunchConfig) {
        if self.flags.contains(BootFlags::SPIN_ON_FAILURE) {
            config.exit_halt = HaltPolicy::Spin;
        }
        if self.flags.contains(BootFlags::LEGACY_APPLET) {
            config.profile = CompatProfile::TCBLAUNCH_LEGACY;
        }
    }

    /// Apply the variable contents, if any, and decide whether to bounce.
    ///
    /// A missing variable means defaults; a malformed one disables the bounce.
    pub fn resolve(variable: Option<&[u8]>, config: &mut LaunchConfig) -> bool {
        let Some(bytes) = variable else {
            return true;
        };
        match Self::parse(bytes) {
            Ok(boot) => {
                info!("{}: flags {:?}", VARIABLE_NAME, boot.flags);
                boot.apply(config);
                boot.is_eligible()
            }
            Err(err) => {
                warn!("ignoring {}: {}; bounce disabled", VARIABLE_NAME, err);
                false
            }
        }
    }
}
