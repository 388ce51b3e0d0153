//! Recovery point for the LAUNCH call.
//!
//! If the applet fails its own checks it may jump back to "whoever called it"
//! through the trampoline advertised in the TZ block instead of returning a
//! status. Before LAUNCH the caller's execution context is saved here; the
//! trampoline restores it and makes the armed call return
//! [`TRAMPOLINE_SENTINEL`].

use alloc::boxed::Box;

use crate::arch::Platform;

/// Number of 64-bit slots in a [`RecoveryContext`].
pub const CONTEXT_WORDS: usize = 21;
pub const CONTEXT_BYTES: usize = CONTEXT_WORDS * 8;

/// Value the armed call yields when control came back through the trampoline.
pub const TRAMPOLINE_SENTINEL: u64 = 0x534c_5452_4150_0001;

/// Slot of x19; x20..x29 follow.
pub const SLOT_X19: usize = 0;
pub const SLOT_LR: usize = 11;
pub const SLOT_SP: usize = 12;
/// Slot of d8; d9..d15 follow.
pub const SLOT_D8: usize = 13;

/// Callee-saved registers, link register and stack pointer of the armed call.
#[repr(C, align(64))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryContext {
    pub words: [u64; CONTEXT_WORDS],
}

impl RecoveryContext {
    pub fn addr(&self) -> u64 {
        self as *const Self as u64
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    NotArmed,
    Armed,
    /// Control came back through the trampoline.
    Returned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmedOutcome {
    /// The monitor returned normally with this status.
    Completed(u64),
    /// The applet jumped to the trampoline.
    Bounced,
}

/// Owns the context buffer whose address is baked into the TZ block.
///
/// The buffer is boxed so its address stays put when the owner moves.
#[derive(Debug)]
pub struct RecoveryPoint {
    context: Box<RecoveryContext>,
    state: ArmState,
}

impl RecoveryPoint {
    pub fn new() -> Self {
        Self {
            context: Box::default(),
            state: ArmState::NotArmed,
        }
    }

    pub fn context_addr(&self) -> u64 {
        self.context.addr()
    }

    pub fn context(&self) -> &RecoveryContext {
        &self.context
    }

    pub fn state(&self) -> ArmState {
        self.state
    }

    /// Arm the recovery point and issue `smc` in one step.
    pub fn call<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        fid: u32,
        args: [u64; 3],
    ) -> ArmedOutcome {
        self.state = ArmState::Armed;
        let ret = platform.armed_smc(&mut self.context, fid, args);
        if ret == TRAMPOLINE_SENTINEL {
            self.state = ArmState::Returned;
            ArmedOutcome::Bounced
        } else {
            self.state = ArmState::NotArmed;
            ArmedOutcome::Completed(ret)
        }
    }
}

impl Default for RecoveryPoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Software stand-in for the trampoline: hand back the sentinel for a context
/// that was actually saved.
///
/// The real trampoline never checks; this exists so simulated platforms
/// exercise the same contract.
pub fn resume(context: &RecoveryContext) -> Option<u64> {
    if context.is_empty() {
        None
    } else {
        Some(TRAMPOLINE_SENTINEL)
    }
}
