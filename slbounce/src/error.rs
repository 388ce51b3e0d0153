//! Error types shared across the bounce pipeline.
//!
//! Everything up to and including the secure-monitor probe is recoverable:
//! the caller gets an error and all memory is released. Once the probe has
//! succeeded, any failure is reported as [`SequenceError::Corrupted`], which
//! the orchestration layer turns into a halt instead of handing it back.

use thiserror::Error;
use uefi_raw::Status;

use crate::smc::{Command, State};

/// The applet image does not have the shape the loader expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("image truncated: {needed:#x} bytes needed at offset {offset:#x}")]
    Truncated { offset: usize, needed: usize },

    #[error("bad DOS magic {0:#06x}")]
    BadDosMagic(u16),

    #[error("bad NT signature {0:#010x}")]
    BadNtSignature(u32),

    #[error("bad optional header magic {0:#06x} (expected PE32+)")]
    BadOptionalMagic(u16),

    #[error("subsystem {0} is not a boot application")]
    NotBootApplication(u16),

    #[error("headers ({size:#x} bytes) do not fit a {limit:#x}-byte destination")]
    HeadersOutOfBounds { size: usize, limit: usize },

    #[error("section {index} [{start:#x}..{end:#x}) exceeds the {limit:#x}-byte destination")]
    SectionOutOfBounds {
        index: usize,
        start: u64,
        end: u64,
        limit: usize,
    },

    #[error("section {index} raw data [{start:#x}..{end:#x}) lies outside the file")]
    RawDataOutOfFile { index: usize, start: u64, end: u64 },

    #[error("image has no security directory entry")]
    MissingCertificate,

    #[error("certificate revision {revision:#x} type {kind:#x} is not PKCS signed data")]
    BadCertificate { revision: u16, kind: u16 },
}

/// The page allocator could not satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to allocate {pages} pages")]
pub struct AllocationError {
    pub pages: usize,
}

/// Building the secure-launch control blocks failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("control block invariant violated: {0}")]
    Invariant(&'static str),
}

/// Outcome of a secure-monitor command that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// `IS_AVAILABLE` returned nonzero; nothing was handed to the monitor.
    #[error("secure launch is not supported here (status {0:#x})")]
    ProbeUnsupported(u64),

    /// A command was requested in a state that does not allow it; no call was made.
    #[error("{command:?} is not allowed in state {state:?}")]
    OutOfOrder { command: Command, state: State },

    /// A call after the probe failed or the trampoline brought us back.
    #[error("{command:?} failed with {status:#x}, system state is corrupted")]
    Corrupted { command: Command, status: u64 },
}

impl SequenceError {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, SequenceError::Corrupted { .. })
    }
}

/// Top-level failure of [`crate::bounce::prepare`].
///
/// Never carries [`SequenceError::Corrupted`]: that case halts the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BounceError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

impl BounceError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BounceError::Sequence(SequenceError::ProbeUnsupported(_)))
    }

    /// Exit status of the application.
    pub fn status(&self) -> Status {
        match self {
            BounceError::Build(BuildError::Format(_)) => Status::LOAD_ERROR,
            BounceError::Build(BuildError::Allocation(_)) => Status::OUT_OF_RESOURCES,
            BounceError::Build(BuildError::Invariant(_)) => Status::ABORTED,
            BounceError::Sequence(SequenceError::ProbeUnsupported(_)) => Status::UNSUPPORTED,
            BounceError::Sequence(_) => Status::ABORTED,
        }
    }
}

/// The command line could not be understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("no applet path given")]
    MissingApplet,

    #[error("{0} unexpected extra argument(s)")]
    TooManyArguments(usize),
}

impl UsageError {
    pub fn status(&self) -> Status {
        Status::INVALID_PARAMETER
    }
}

/// Exit status for a failed read of the applet from the boot volume.
///
/// Kept apart from the usage status so the two outcomes stay distinguishable.
pub fn read_status(status: Status) -> Status {
    if status == Status::INVALID_PARAMETER {
        Status::NOT_FOUND
    } else {
        status
    }
}

/// The `SlBounceConfig` variable exists but cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BootConfigError {
    #[error("boot configuration is {0} bytes, too short")]
    Truncated(usize),

    #[error("bad boot configuration magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported boot configuration version {0}")]
    UnsupportedVersion(u32),
}
