//! Control blocks consumed by the secure monitor and the launched applet.
//!
//! Control region layout, in pages:
//!
//! | Page              | Usage                        |
//! |-------------------|------------------------------|
//! | 0                 | unused                       |
//! | 1                 | [`SmcParams`]                |
//! | 2                 | [`TzArgs`], start of the argument region |
//! | 3 ..              | applet CRT scratch           |
//! | 3 + crt           | certificate copy, then log   |
//!
//! The image and the boot parameters get their own allocations.

use core::mem::size_of;

use log::{debug, info};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::arch::{Platform, TrampolineInfo};
use crate::config::{LaunchConfig, BOOT_PARAMS_POISON, PAGE_SIZE};
use crate::error::BuildError;
use crate::memory::{PageAllocator, PageSpan, Pages};
use crate::pe::PeImage;
use crate::smc::SmcParams;

pub const MAX_DMA_RANGES: usize = 2;

const SMC_PAGE: usize = 1;
const TZ_PAGE: usize = 2;

/// Scratch words handed to the trampoline in `x0`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TrampolineData {
    /// Address of the [`crate::recovery::RecoveryContext`] to restore.
    pub recovery_context: u64,
    pub reserved: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DmaRange {
    pub base: u64,
    pub size: u64,
    pub attributes: u64,
}

/// Argument block read by both the monitor and the applet. Layout is fixed.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TzArgs {
    pub version: u32,
    /// Offsets are relative to the start of this block.
    pub cert_offset: u32,
    pub cert_size: u32,
    pub log_offset: u32,
    pub log_size: u32,
    pub log_used: u32,
    pub log_version: u32,
    pub _pad0: u32,
    pub this_size: u64,
    pub this_phys: u64,
    pub crt_offset: u32,
    pub crt_pages: u32,
    pub boot_params: u64,
    pub boot_params_size: u32,
    pub _pad1: u32,
    pub tb_entry_point: u64,
    pub tb_virt: u64,
    pub tb_phys: u64,
    pub tb_size: u64,
    pub tb_data: TrampolineData,
    pub dma_ranges: [DmaRange; MAX_DMA_RANGES],
    pub dma_range_count: u32,
    pub _pad2: u32,
}

const _: () = assert!(size_of::<TrampolineData>() == 0x28);
const _: () = assert!(size_of::<DmaRange>() == 0x18);
const _: () = assert!(size_of::<TzArgs>() == 0xc8);
const _: () = assert!(core::mem::offset_of!(TzArgs, tb_data) == 0x68);
const _: () = assert!(core::mem::offset_of!(TzArgs, dma_range_count) == 0xc0);

fn violated(what: &'static str) -> BuildError {
    BuildError::Invariant(what)
}

impl TzArgs {
    pub const SIZE: usize = size_of::<Self>();

    /// Check that the offsets and sizes describe a consistent block.
    pub fn check(&self) -> Result<(), BuildError> {
        let this_size = self.this_size;
        let header = Self::SIZE as u64;

        let cert_start = u64::from(self.cert_offset);
        let cert_end = cert_start + u64::from(self.cert_size);
        if cert_start < header {
            return Err(violated("certificate overlaps the argument header"));
        }
        if self.cert_size == 0 {
            return Err(violated("empty certificate"));
        }
        if cert_end > this_size {
            return Err(violated("certificate exceeds the argument region"));
        }

        let log_start = u64::from(self.log_offset);
        let log_end = log_start + u64::from(self.log_size);
        if log_start < header {
            return Err(violated("log overlaps the argument header"));
        }
        if self.log_size == 0 {
            return Err(violated("empty measurement log"));
        }
        if log_end > this_size {
            return Err(violated("log exceeds the argument region"));
        }
        if log_start < cert_end && cert_start < log_end {
            return Err(violated("log overlaps the certificate"));
        }

        let crt_start = u64::from(self.crt_offset);
        let crt_end = crt_start + u64::from(self.crt_pages) * PAGE_SIZE as u64;
        if crt_start < header || crt_end > this_size {
            return Err(violated("CRT scratch lies outside the argument region"));
        }
        if crt_start < cert_end && cert_start < crt_end {
            return Err(violated("CRT scratch overlaps the certificate"));
        }

        if self.dma_range_count as usize > MAX_DMA_RANGES {
            return Err(violated("too many DMA ranges"));
        }
        if self.boot_params == 0 || self.boot_params_size == 0 {
            return Err(violated("missing boot parameters"));
        }
        Ok(())
    }
}

/// Where things go inside the control region for a given certificate size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlLayout {
    pub total_pages: usize,
    pub crt_pages: usize,
    pub cert_pages: usize,
    pub log_pages: usize,
    pub cert_size: usize,
}

impl ControlLayout {
    pub fn new(config: &LaunchConfig, cert_size: usize) -> Self {
        let profile = &config.profile;
        let cert_pages = cert_size.div_ceil(PAGE_SIZE);
        Self {
            total_pages: TZ_PAGE + 1 + profile.crt_pages + cert_pages + profile.log_pages,
            crt_pages: profile.crt_pages,
            cert_pages,
            log_pages: profile.log_pages,
            cert_size,
        }
    }

    /// Byte offset of the SMC block inside the region.
    pub fn smc_offset(&self) -> usize {
        SMC_PAGE * PAGE_SIZE
    }

    /// Byte offset of the TZ block inside the region.
    pub fn tz_offset(&self) -> usize {
        TZ_PAGE * PAGE_SIZE
    }

    /// Size of the argument region, from the TZ block to the end.
    pub fn this_size(&self) -> usize {
        (self.total_pages - TZ_PAGE) * PAGE_SIZE
    }

    /// Offsets below are relative to the TZ block.
    pub fn crt_offset(&self) -> usize {
        PAGE_SIZE
    }

    pub fn cert_offset(&self) -> usize {
        (1 + self.crt_pages) * PAGE_SIZE
    }

    pub fn log_offset(&self) -> usize {
        self.cert_offset() + self.cert_size
    }

    pub fn log_size(&self) -> usize {
        self.log_pages * PAGE_SIZE
    }
}

/// Everything the sequencer needs to address the control blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchHandles {
    pub smc_block: u64,
    pub image: u64,
    pub image_size: u64,
    pub args: u64,
    pub args_size: u64,
}

/// Leaked allocations after [`LaunchData::hand_over`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handoff {
    pub handles: LaunchHandles,
    pub image: PageSpan,
    pub control: PageSpan,
    pub boot_params: PageSpan,
}

impl Handoff {
    pub fn spans(&self) -> [PageSpan; 3] {
        [self.image, self.control, self.boot_params]
    }
}

/// Owned control blocks.
///
/// Fields drop in declaration order, the reverse of allocation order.
#[derive(Debug)]
pub struct LaunchData<'a, A: PageAllocator + ?Sized> {
    boot_params: Pages<'a, A>,
    control: Pages<'a, A>,
    image: Pages<'a, A>,
    layout: ControlLayout,
}

/// Build the control blocks for `image_bytes`.
///
/// `context_addr` is the recovery context the trampoline restores.
pub fn create_launch_data<'a, A: PageAllocator + ?Sized>(
    image_bytes: &[u8],
    allocator: &'a A,
    trampoline: TrampolineInfo,
    context_addr: u64,
    config: &LaunchConfig,
) -> Result<LaunchData<'a, A>, BuildError> {
    let profile = &config.profile;
    let pe = PeImage::parse(image_bytes, profile.validation())?;
    debug!(
        "applet: {} sections, image size {:#x}, entry {:#x}",
        pe.sections().count(),
        pe.size_of_image(),
        pe.entry_point()
    );

    let mut image = Pages::zeroed(allocator, profile.image_pages)?;
    let report = pe.load_into(image.as_mut_slice())?;
    info!(
        "loaded {:#x} header + {:#x} section bytes at {:#x}",
        report.header_bytes,
        report.section_bytes,
        image.addr()
    );

    let cert = pe.certificate()?;
    let layout = ControlLayout::new(config, cert.len());
    let mut control = Pages::zeroed(allocator, layout.total_pages)?;
    let boot_params = Pages::allocate(allocator, profile.boot_params_pages, BOOT_PARAMS_POISON)?;
    info!(
        "control blocks: {} pages at {:#x}, boot params at {:#x}",
        layout.total_pages,
        control.addr(),
        boot_params.addr()
    );

    let narrow = |v: usize, what| u32::try_from(v).map_err(|_| violated(what));
    let tz_addr = control.addr() + layout.tz_offset() as u64;

    let mut tz = TzArgs {
        version: profile.tz_version,
        cert_offset: narrow(layout.cert_offset(), "certificate offset")?,
        cert_size: narrow(layout.cert_size, "certificate size")?,
        log_offset: narrow(layout.log_offset(), "log offset")?,
        log_size: narrow(layout.log_size(), "log size")?,
        log_used: 0,
        log_version: profile.log_version,
        this_size: layout.this_size() as u64,
        this_phys: tz_addr,
        crt_offset: narrow(layout.crt_offset(), "CRT offset")?,
        crt_pages: narrow(layout.crt_pages, "CRT pages")?,
        boot_params: boot_params.addr(),
        boot_params_size: narrow(boot_params.len(), "boot parameter size")?,
        tb_entry_point: trampoline.entry,
        tb_virt: trampoline.base,
        tb_phys: trampoline.base,
        tb_size: trampoline.size,
        tb_data: TrampolineData {
            recovery_context: context_addr,
            reserved: [0; 4],
        },
        ..TzArgs::default()
    };
    if let Some(range) = config.reserve_dma {
        tz.dma_ranges[0] = range;
        tz.dma_range_count = 1;
    }
    tz.check()?;

    let handles = handles_for(&image, &control, &layout);
    let params = SmcParams::stamped(&handles, 0);

    let region = control.as_mut_slice();
    let cert_at = layout.tz_offset() + layout.cert_offset();
    region[cert_at..cert_at + cert.len()].copy_from_slice(cert);
    region[layout.tz_offset()..layout.tz_offset() + TzArgs::SIZE].copy_from_slice(tz.as_bytes());
    region[layout.smc_offset()..layout.smc_offset() + SmcParams::SIZE]
        .copy_from_slice(params.as_bytes());

    Ok(LaunchData {
        boot_params,
        control,
        image,
        layout,
    })
}

fn handles_for<A: PageAllocator + ?Sized>(
    image: &Pages<'_, A>,
    control: &Pages<'_, A>,
    layout: &ControlLayout,
) -> LaunchHandles {
    LaunchHandles {
        smc_block: control.addr() + layout.smc_offset() as u64,
        image: image.addr(),
        image_size: image.len() as u64,
        args: control.addr() + layout.tz_offset() as u64,
        args_size: layout.this_size() as u64,
    }
}

impl<'a, A: PageAllocator + ?Sized> LaunchData<'a, A> {
    pub fn handles(&self) -> LaunchHandles {
        handles_for(&self.image, &self.control, &self.layout)
    }

    pub fn layout(&self) -> &ControlLayout {
        &self.layout
    }

    /// Copy of the TZ block as currently stored.
    pub fn tz_args(&self) -> TzArgs {
        let at = self.layout.tz_offset();
        TzArgs::read_from_bytes(&self.control.as_slice()[at..at + TzArgs::SIZE])
            .unwrap_or_default()
    }

    pub fn tz_bytes(&self) -> &[u8] {
        let at = self.layout.tz_offset();
        &self.control.as_slice()[at..at + TzArgs::SIZE]
    }

    pub fn smc_params(&self) -> SmcParams {
        let at = self.layout.smc_offset();
        SmcParams::read_from_bytes(&self.control.as_slice()[at..at + SmcParams::SIZE])
            .unwrap_or_default()
    }

    pub fn image(&self) -> &[u8] {
        self.image.as_slice()
    }

    pub fn boot_params(&self) -> &[u8] {
        self.boot_params.as_slice()
    }

    /// Clean every allocation to the point of coherency.
    pub fn clean_caches<P: Platform + ?Sized>(&self, platform: &P) {
        for pages in [&self.image, &self.control, &self.boot_params] {
            platform.clean_dcache_range(pages.addr(), pages.len() as u64);
        }
    }

    /// Give every allocation to the secure monitor.
    pub fn hand_over(self) -> Handoff {
        let handles = self.handles();
        let Self {
            boot_params,
            control,
            image,
            ..
        } = self;
        Handoff {
            handles,
            image: image.leak(),
            control: control.leak(),
            boot_params: boot_params.leak(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompatProfile;
    use crate::error::FormatError;
    use crate::sim::{SimPages, SimPlatform, SyntheticApplet};

    fn build<'a>(
        allocator: &'a SimPages,
        bytes: &[u8],
        config: &LaunchConfig,
    ) -> Result<LaunchData<'a, SimPages>, BuildError> {
        let platform = SimPlatform::new();
        create_launch_data(bytes, allocator, platform.trampoline(), 0x8000_1000, config)
    }

    fn cert_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn tz_block_matches_the_layout() {
        let allocator = SimPages::new();
        let applet = SyntheticApplet::new().certificate(0x200, 2, &cert_payload(0x1234)).build();
        let data = build(&allocator, &applet, &LaunchConfig::default()).unwrap();
        let tz = data.tz_args();
        let handles = data.handles();

        assert_eq!(tz.version, 1);
        assert_eq!(tz.cert_offset, 25 * 0x1000);
        assert_eq!(tz.cert_size, 0x1234 + 8);
        assert_eq!(tz.log_offset, tz.cert_offset + tz.cert_size);
        assert_eq!(tz.log_size, 0x2000);
        assert_eq!(tz.log_version, 2);
        assert_eq!(tz.crt_offset, 0x1000);
        assert_eq!(tz.crt_pages, 24);
        assert_eq!(tz.this_phys, handles.args);
        assert_eq!(tz.this_size, handles.args_size);
        assert_eq!(tz.boot_params_size, 3 * 0x1000);
        assert_eq!(tz.tb_data.recovery_context, 0x8000_1000);
        assert_eq!(tz.dma_range_count, 0);
        assert!(u64::from(tz.log_offset + tz.log_size) <= tz.this_size);
        tz.check().unwrap();
    }

    #[test]
    fn certificate_is_copied_behind_the_crt_scratch() {
        let allocator = SimPages::new();
        let payload = cert_payload(0x300);
        let applet = SyntheticApplet::new().certificate(0x200, 2, &payload).build();
        let data = build(&allocator, &applet, &LaunchConfig::default()).unwrap();
        let tz = data.tz_args();

        let region = data.control.as_slice();
        let at = data.layout().tz_offset() + tz.cert_offset as usize;
        assert_eq!(&region[at + 8..at + 8 + payload.len()], &payload[..]);
        assert_eq!(&region[..PAGE_SIZE], &[0u8; PAGE_SIZE][..]);
    }

    #[test]
    fn smc_block_points_at_image_and_arguments() {
        let allocator = SimPages::new();
        let data = build(&allocator, &SyntheticApplet::new().build(), &LaunchConfig::default()).unwrap();
        let handles = data.handles();
        let params = data.smc_params();

        assert_eq!((params.a, params.b, params.version), (1, 0, 0x10));
        assert_eq!(params.pe_data, handles.image);
        assert_eq!(params.pe_size, 0x800 * PAGE_SIZE as u64);
        assert_eq!(params.arg_data, handles.args);
        assert_eq!(params.arg_size, handles.args_size);
    }

    #[test]
    fn boot_params_are_poisoned() {
        let allocator = SimPages::new();
        let data = build(&allocator, &SyntheticApplet::new().build(), &LaunchConfig::default()).unwrap();
        assert!(data.boot_params().iter().all(|&b| b == BOOT_PARAMS_POISON));
    }

    #[test]
    fn reserve_range_is_recorded() {
        let allocator = SimPages::new();
        let range = DmaRange {
            base: 0x9000_0000,
            size: 0x10_0000,
            attributes: 1,
        };
        let config = LaunchConfig {
            reserve_dma: Some(range),
            ..LaunchConfig::default()
        };
        let data = build(&allocator, &SyntheticApplet::new().build(), &config).unwrap();
        let tz = data.tz_args();
        assert_eq!(tz.dma_range_count, 1);
        assert_eq!(tz.dma_ranges[0], range);
    }

    #[test]
    fn failures_release_everything_allocated_so_far() {
        let allocator = SimPages::new();
        allocator.fail_at(2);
        let err = build(&allocator, &SyntheticApplet::new().build(), &LaunchConfig::default())
            .unwrap_err();

        assert!(matches!(err, BuildError::Allocation(_)));
        assert_eq!(allocator.live(), 0);
        assert_eq!(allocator.frees(), 2);
    }

    #[test]
    fn format_errors_happen_before_any_allocation() {
        let allocator = SimPages::new();
        let applet = SyntheticApplet::new().subsystem(10).build();
        let err = build(&allocator, &applet, &LaunchConfig::default()).unwrap_err();
        assert_eq!(err, BuildError::Format(FormatError::NotBootApplication(10)));
        assert_eq!(allocator.allocations(), 0);

        let legacy = LaunchConfig {
            profile: CompatProfile::TCBLAUNCH_LEGACY,
            ..LaunchConfig::default()
        };
        assert!(build(&allocator, &applet, &legacy).is_ok());
    }

    #[test]
    fn missing_certificate_frees_the_image() {
        let allocator = SimPages::new();
        let applet = SyntheticApplet::new().without_certificate().build();
        let err = build(&allocator, &applet, &LaunchConfig::default()).unwrap_err();
        assert_eq!(err, BuildError::Format(FormatError::MissingCertificate));
        assert_eq!(allocator.live(), 0);
    }

    #[test]
    fn hand_over_leaks_all_three_regions() {
        let allocator = SimPages::new();
        let data = build(&allocator, &SyntheticApplet::new().build(), &LaunchConfig::default()).unwrap();
        let handles = data.handles();

        let handoff = data.hand_over();

        assert_eq!(handoff.handles, handles);
        assert!(handoff.control.contains(handles.smc_block));
        assert!(handoff.image.contains(handles.image));
        assert_eq!(allocator.live(), 3);
        assert_eq!(allocator.frees(), 0);
    }

    #[test]
    fn check_rejects_inconsistent_blocks() {
        let allocator = SimPages::new();
        let data = build(&allocator, &SyntheticApplet::new().build(), &LaunchConfig::default()).unwrap();
        let good = data.tz_args();

        let mut tz = good;
        tz.cert_size = tz.this_size as u32;
        assert!(tz.check().is_err());

        let mut tz = good;
        tz.log_offset = 0x10;
        assert!(tz.check().is_err());

        let mut tz = good;
        tz.crt_pages = 25;
        assert!(tz.check().is_err());

        let mut tz = good;
        tz.dma_range_count = 3;
        assert!(tz.check().is_err());

        let mut tz = good;
        tz.log_size = 0;
        assert!(tz.check().is_err());
    }
}
