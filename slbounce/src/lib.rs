#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

extern crate alloc;

pub mod arch;
pub mod bootcfg;
pub mod bounce;
pub mod cli;
pub mod config;
pub mod diag;
#[cfg(all(feature = "uefi-runtime", target_arch = "aarch64", target_os = "uefi"))]
pub mod efi;
pub mod error;
pub mod hooks;
pub mod launch;
pub mod memory;
pub mod pe;
pub mod recovery;
#[cfg(any(test, feature = "std"))]
pub mod sim;
pub mod smc;

pub use bounce::{prepare, PendingBounce};
pub use config::{CompatProfile, HaltPolicy, LaunchConfig};
pub use error::{BounceError, BuildError, FormatError, SequenceError};

// Panic handler for the UEFI image only; host builds and tests use std's.
#[cfg(all(not(test), not(feature = "std"), target_os = "uefi"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("panic: {}", info);
    #[cfg(target_arch = "aarch64")]
    {
        use arch::Platform;
        arch::aarch64::Aarch64.spin()
    }
    #[cfg(not(target_arch = "aarch64"))]
    loop {}
}
