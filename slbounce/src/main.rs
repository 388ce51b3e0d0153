//! slbounce.efi: install the secure-launch bounce and return to the shell.
#![no_std]
#![no_main]

#[cfg(not(target_arch = "aarch64"))]
compile_error!("slbounce.efi only makes sense on aarch64");

use log::{error, info};
use uefi::prelude::*;

use slbounce::arch::aarch64::Aarch64;
use slbounce::arch::Platform;
use slbounce::bootcfg::BootConfig;
use slbounce::cli::{self, USAGE};
use slbounce::efi::{self, UefiPages};
use slbounce::error::read_status;
use slbounce::{bounce, LaunchConfig};

#[entry]
fn main(image: Handle, mut system_table: SystemTable<Boot>) -> Status {
    if uefi_services::init(&mut system_table).is_err() {
        return Status::ABORTED;
    }

    let platform = Aarch64;
    let el = platform.current_el();
    info!("SL-Bounce");
    info!("Running in EL={}", el);
    if el != 1 {
        info!("Already in EL2!");
        return Status::SUCCESS;
    }

    let boot_services = system_table.boot_services();
    let options = match efi::load_options(boot_services, image) {
        Ok(options) => options,
        Err(status) => {
            error!("cannot read load options: {:?}", status);
            return status;
        }
    };
    let args = match cli::parse_load_options(&options) {
        Ok(args) => args,
        Err(err) => {
            error!("{}", err);
            info!("{}", USAGE);
            return err.status();
        }
    };

    let applet = match efi::read_file(boot_services, image, args.applet) {
        Ok(applet) => applet,
        Err(status) => {
            error!("cannot read {}: {:?}", args.applet, status);
            return read_status(status);
        }
    };

    let mut config = LaunchConfig::default();
    let variable = efi::read_boot_config(system_table.runtime_services());
    let eligible = BootConfig::resolve(variable.as_deref(), &mut config);

    let allocator = UefiPages::new(boot_services);
    let pending = match bounce::prepare(platform, &allocator, &applet, &config) {
        Ok(pending) => pending,
        Err(err) => {
            error!("preparing the bounce failed: {}", err);
            return err.status();
        }
    };
    drop(applet);

    // SAFETY: first and only installation, straight from the entry point.
    if let Err(status) = unsafe { efi::install_hooks(&system_table, pending, eligible) } {
        error!("installing the hooks failed: {:?}", status);
        return status;
    }

    info!("=================================================");
    info!(" BS->ExitBootServices() was replaced with a hook");
    info!("  that performs Secure-Launch right after");
    info!("exiting UEFI. Your system will reset if SL fails.");
    info!("=================================================");
    Status::SUCCESS
}
