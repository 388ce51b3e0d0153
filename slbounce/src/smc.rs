//! Secure-launch SMC protocol.
//!
//! `IS_AVAILABLE → [RESERVE_MEM] → AUTH → LAUNCH`, with the parameter block
//! re-stamped and flushed before every call because the monitor may zero the
//! page while changing its mapping.

use core::mem::size_of;

use log::{debug, info};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::arch::Platform;
use crate::config::PAGE_SIZE;
use crate::error::SequenceError;
use crate::launch::LaunchHandles;
use crate::recovery::{ArmedOutcome, RecoveryPoint, TRAMPOLINE_SENTINEL};

/// SiP service function id of the secure-launch interface.
pub const SMC_SL_ID: u32 = 0xc300_0001;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    IsAvailable = 1,
    Auth = 2,
    ReserveMem = 3,
    Launch = 4,
    /// Defined by the monitor; never sent.
    UnmapAll = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Probed,
    Authenticated,
    /// Only observable in tests: on hardware LAUNCH leaves us at EL2.
    Launched,
    Failed,
    Corrupted,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SmcParams {
    pub a: u16,
    pub b: u16,
    pub version: u32,
    pub num: u32,
    pub _pad: u32,
    pub pe_data: u64,
    pub pe_size: u64,
    pub arg_data: u64,
    pub arg_size: u64,
}

const _: () = assert!(size_of::<SmcParams>() == 48);

impl SmcParams {
    pub const SIZE: usize = size_of::<Self>();
    pub const VERSION: u32 = 0x10;

    pub fn stamped(handles: &LaunchHandles, num: u32) -> Self {
        Self {
            a: 1,
            b: 0,
            version: Self::VERSION,
            num,
            _pad: 0,
            pe_data: handles.image,
            pe_size: handles.image_size,
            arg_data: handles.args,
            arg_size: handles.args_size,
        }
    }
}

/// Drives the secure-launch commands against one set of control blocks.
#[derive(Debug)]
pub struct Sequencer<P> {
    platform: P,
    handles: LaunchHandles,
    state: State,
    dumped: bool,
}

impl<P: Platform> Sequencer<P> {
    /// # Safety
    ///
    /// `handles.smc_block` must point to a writable page that stays valid for
    /// the lifetime of the sequencer.
    pub unsafe fn new(platform: P, handles: LaunchHandles) -> Self {
        Self {
            platform,
            handles,
            state: State::Init,
            dumped: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn handles(&self) -> &LaunchHandles {
        &self.handles
    }

    /// `IS_AVAILABLE`. Nonzero means the platform has no secure launch.
    pub fn probe(&mut self) -> Result<(), SequenceError> {
        self.expect(Command::IsAvailable, State::Init)?;
        match self.call(Command::IsAvailable) {
            0 => {
                self.state = State::Probed;
                Ok(())
            }
            status => {
                self.state = State::Failed;
                Err(SequenceError::ProbeUnsupported(status))
            }
        }
    }

    /// `RESERVE_MEM`, only between the probe and `AUTH`.
    pub fn reserve_memory(&mut self) -> Result<(), SequenceError> {
        self.expect(Command::ReserveMem, State::Probed)?;
        match self.call(Command::ReserveMem) {
            0 => Ok(()),
            status => Err(self.corrupted(Command::ReserveMem, status)),
        }
    }

    pub fn authenticate(&mut self) -> Result<(), SequenceError> {
        self.expect(Command::Auth, State::Probed)?;
        match self.call(Command::Auth) {
            0 => {
                self.state = State::Authenticated;
                Ok(())
            }
            status => Err(self.corrupted(Command::Auth, status)),
        }
    }

    /// `LAUNCH` through `recovery`. On hardware a successful launch continues
    /// at EL2; a return through the trampoline is reported as corruption.
    pub fn launch(&mut self, recovery: &mut RecoveryPoint) -> Result<(), SequenceError> {
        self.expect(Command::Launch, State::Authenticated)?;
        self.stamp(Command::Launch);
        info!("SMC {:?}", Command::Launch);
        match recovery.call(&self.platform, SMC_SL_ID, self.args(Command::Launch)) {
            ArmedOutcome::Completed(0) => {
                info!("SMC {:?} -> 0", Command::Launch);
                self.state = State::Launched;
                Ok(())
            }
            ArmedOutcome::Completed(status) => {
                info!("SMC {:?} -> {:#x}", Command::Launch, status);
                Err(self.corrupted(Command::Launch, status))
            }
            ArmedOutcome::Bounced => {
                info!("SMC {:?} came back through the trampoline", Command::Launch);
                Err(self.corrupted(Command::Launch, TRAMPOLINE_SENTINEL))
            }
        }
    }

    fn expect(&self, command: Command, state: State) -> Result<(), SequenceError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SequenceError::OutOfOrder {
                command,
                state: self.state,
            })
        }
    }

    fn corrupted(&mut self, command: Command, status: u64) -> SequenceError {
        self.state = State::Corrupted;
        SequenceError::Corrupted { command, status }
    }

    fn args(&self, command: Command) -> [u64; 3] {
        [self.handles.smc_block, command as u64, 0]
    }

    fn stamp(&mut self, command: Command) {
        let params = SmcParams::stamped(&self.handles, command as u32);
        // SAFETY: guaranteed by the contract of `new`. Volatile because the
        // monitor reads this page behind the compiler's back.
        unsafe { core::ptr::write_volatile(self.handles.smc_block as *mut SmcParams, params) };
        if !self.dumped {
            self.dumped = true;
            debug!(
                "SMC params: [{}/{}/{:#x}] pe {:#x} ({:#x} b) arg {:#x} ({:#x} b)",
                params.a,
                params.b,
                params.version,
                params.pe_data,
                params.pe_size,
                params.arg_data,
                params.arg_size
            );
        }
        self.platform
            .clean_dcache_range(self.handles.smc_block, PAGE_SIZE as u64);
    }

    fn call(&mut self, command: Command) -> u64 {
        self.stamp(command);
        info!("SMC {:?}", command);
        let status = self.platform.smc(SMC_SL_ID, self.args(command));
        info!("SMC {:?} -> {:#x}", command, status);
        status
    }
}
