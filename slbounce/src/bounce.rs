//! Two-phase bounce: everything that can still fail cleanly happens in
//! [`prepare`], the irreversible part in [`PendingBounce::finish`].

use log::{error, info, warn};

use crate::arch::{self, Platform};
use crate::config::{HaltPolicy, LaunchConfig};
use crate::error::{BounceError, SequenceError};
use crate::launch::{create_launch_data, Handoff};
use crate::memory::PageAllocator;
use crate::recovery::RecoveryPoint;
use crate::smc::{Sequencer, State};

/// Probed control blocks waiting for `AUTH` and `LAUNCH`.
///
/// The allocations belong to the secure monitor now and are never freed.
#[derive(Debug)]
pub struct PendingBounce<P: Platform> {
    sequencer: Sequencer<P>,
    recovery: RecoveryPoint,
    handoff: Handoff,
    exit_halt: HaltPolicy,
}

/// Build the control blocks for `applet` and probe the secure monitor.
///
/// On error nothing has been handed over and all memory is released.
pub fn prepare<P, A>(
    platform: P,
    allocator: &A,
    applet: &[u8],
    config: &LaunchConfig,
) -> Result<PendingBounce<P>, BounceError>
where
    P: Platform,
    A: PageAllocator + ?Sized,
{
    let recovery = RecoveryPoint::new();
    let data = create_launch_data(
        applet,
        allocator,
        platform.trampoline(),
        recovery.context_addr(),
        config,
    )?;
    data.clean_caches(&platform);

    // SAFETY: the SMC block lives in `data`, which is either dropped together
    // with the sequencer below or leaked by `hand_over`.
    let mut sequencer = unsafe { Sequencer::new(platform, data.handles()) };
    if let Err(err) = sequencer.probe() {
        warn!("secure launch unavailable: {}", err);
        return Err(err.into());
    }

    let handoff = data.hand_over();
    let mut pending = PendingBounce {
        sequencer,
        recovery,
        handoff,
        exit_halt: config.exit_halt,
    };

    if config.reserve_dma.is_some() {
        if let Err(err) = pending.sequencer.reserve_memory() {
            escalate(pending.platform(), err, config.install_halt);
        }
    }

    info!("secure launch available, control blocks handed over");
    Ok(pending)
}

impl<P: Platform> PendingBounce<P> {
    pub fn platform(&self) -> &P {
        self.sequencer.platform()
    }

    pub fn state(&self) -> State {
        self.sequencer.state()
    }

    pub fn handoff(&self) -> &Handoff {
        &self.handoff
    }

    pub fn recovery(&self) -> &RecoveryPoint {
        &self.recovery
    }

    /// Policy applied when `finish` fails.
    pub fn exit_halt(&self) -> HaltPolicy {
        self.exit_halt
    }

    /// `AUTH` then `LAUNCH`, reporting failures instead of halting.
    pub fn try_finish(&mut self) -> Result<(), SequenceError> {
        self.sequencer.authenticate()?;
        self.sequencer.launch(&mut self.recovery)
    }

    /// `AUTH` then `LAUNCH`. Returns only if the launch succeeded, which on
    /// hardware means we are now running at EL2.
    pub fn finish(mut self) {
        match self.try_finish() {
            Ok(()) => info!("bounce done"),
            Err(err) => escalate(self.platform(), err, self.exit_halt),
        }
    }
}

/// Report `err` and stop the machine. The monitor may still have our memory
/// mapped, so returning to firmware is not an option.
fn escalate<P: Platform + ?Sized>(platform: &P, err: SequenceError, policy: HaltPolicy) -> ! {
    error!("=============================================");
    error!(" {}", err);
    error!(" Assuming this system is in corrupted state!");
    error!(" Halting now ({:?}).", policy);
    error!("=============================================");
    arch::halt(platform, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::DmaRange;
    use crate::sim::{Halt, Reply, SimPages, SimPlatform, SyntheticApplet};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn prepare_probes_and_hands_over() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(0)]);

        let pending = prepare(
            &platform,
            &allocator,
            &SyntheticApplet::new().build(),
            &LaunchConfig::default(),
        )
        .unwrap();

        assert_eq!(pending.state(), State::Probed);
        assert_eq!(allocator.live(), 3);
        assert_eq!(platform.calls().len(), 1);
    }

    #[test]
    fn unsupported_probe_frees_everything() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(1)]);

        let err = prepare(
            &platform,
            &allocator,
            &SyntheticApplet::new().build(),
            &LaunchConfig::default(),
        )
        .unwrap_err();

        assert!(err.is_unsupported());
        assert_eq!(allocator.live(), 0);
        assert_eq!(allocator.frees(), 3);
    }

    #[test]
    fn bad_image_makes_no_calls() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();

        let err = prepare(&platform, &allocator, b"not a PE", &LaunchConfig::default()).unwrap_err();

        assert!(matches!(err, BounceError::Build(_)));
        assert!(platform.calls().is_empty());
    }

    #[test]
    fn reserve_memory_follows_the_probe() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(0), Reply::Status(0)]);
        prepare(&platform, &allocator, &SyntheticApplet::new().build(), &dma_config()).unwrap();

        let nums: Vec<_> = platform.calls().iter().map(|c| c.args[1]).collect();
        assert_eq!(nums, vec![1, 3]);
    }

    fn dma_config() -> LaunchConfig {
        LaunchConfig {
            reserve_dma: Some(DmaRange {
                base: 0x9000_0000,
                size: 0x1000,
                attributes: 0,
            }),
            ..LaunchConfig::default()
        }
    }

    #[test]
    fn reserve_failure_parks_by_default() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(0), Reply::Status(7)]);
        let applet = SyntheticApplet::new().build();

        let result = catch_unwind(AssertUnwindSafe(|| {
            prepare(&platform, &allocator, &applet, &dma_config())
        }));

        assert!(result.is_err());
        assert_eq!(platform.halted(), Some(Halt::Spin));
        assert_eq!(platform.calls().len(), 2);
    }

    #[test]
    fn reserve_failure_follows_the_install_policy() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(0), Reply::Status(7)]);
        let applet = SyntheticApplet::new().build();
        let config = LaunchConfig {
            install_halt: HaltPolicy::Reset,
            exit_halt: HaltPolicy::Spin,
            ..dma_config()
        };

        let result = catch_unwind(AssertUnwindSafe(|| prepare(&platform, &allocator, &applet, &config)));

        assert!(result.is_err());
        assert_eq!(platform.halted(), Some(Halt::Reset));
    }

    #[test]
    fn finish_launches() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(0), Reply::Status(0), Reply::Status(0)]);

        let pending = prepare(
            &platform,
            &allocator,
            &SyntheticApplet::new().build(),
            &LaunchConfig::default(),
        )
        .unwrap();
        pending.finish();

        assert_eq!(platform.halted(), None);
        assert!(platform.calls()[2].armed);
    }

    #[test]
    fn failed_auth_resets_by_default() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(0), Reply::Status(9)]);

        let pending = prepare(
            &platform,
            &allocator,
            &SyntheticApplet::new().build(),
            &LaunchConfig::default(),
        )
        .unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| pending.finish()));

        assert!(result.is_err());
        assert_eq!(platform.halted(), Some(Halt::Reset));
    }

    #[test]
    fn failed_auth_halts_per_exit_policy() {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(0), Reply::Status(9)]);
        let config = LaunchConfig {
            exit_halt: HaltPolicy::Spin,
            ..LaunchConfig::default()
        };

        let pending = prepare(&platform, &allocator, &SyntheticApplet::new().build(), &config).unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| pending.finish()));

        assert!(result.is_err());
        assert_eq!(platform.halted(), Some(Halt::Spin));
        assert_eq!(platform.calls().len(), 2);
    }
}
