use std::panic::{catch_unwind, AssertUnwindSafe};

use zerocopy::FromBytes;

use slbounce::arch::Platform;
use slbounce::config::BOOT_PARAMS_POISON;
use slbounce::error::SequenceError;
use slbounce::launch::{create_launch_data, TzArgs};
use slbounce::pe::{extract_certificate, load, Validation};
use slbounce::recovery::{ArmState, RecoveryPoint, TRAMPOLINE_SENTINEL};
use slbounce::sim::{Halt, MonitorView, Reply, SimPages, SimPlatform, SyntheticApplet};
use slbounce::smc::{Command, SmcParams, Sequencer, State, SMC_SL_ID};
use slbounce::{prepare, BounceError, HaltPolicy, LaunchConfig};

fn applet() -> Vec<u8> {
    SyntheticApplet::new()
        .section(".text", 0x1000, &[0xd5; 0x200])
        .certificate(0x200, 2, &[0x30; 0x900])
        .build()
}

fn commands(platform: &SimPlatform) -> Vec<u64> {
    platform.calls().iter().map(|c| c.args[1]).collect()
}

#[test]
fn probe_auth_launch_in_order() {
    let platform = SimPlatform::new();
    let allocator = SimPages::new();
    platform.script([Reply::Status(0), Reply::Status(0), Reply::Status(0)]);

    let mut pending = prepare(&platform, &allocator, &applet(), &LaunchConfig::default()).unwrap();
    pending.try_finish().unwrap();

    assert_eq!(pending.state(), State::Launched);
    assert_eq!(commands(&platform), vec![1, 2, 4]);
    let calls = platform.calls();
    assert!(calls.iter().all(|c| c.fid == SMC_SL_ID && c.args[2] == 0));
    assert!(calls.iter().all(|c| c.args[0] == pending.handoff().handles.smc_block));
    assert_eq!(calls.iter().map(|c| c.armed).collect::<Vec<_>>(), vec![false, false, true]);
}

#[test]
fn every_region_is_cleaned_before_the_probe() {
    let platform = SimPlatform::new();
    let allocator = SimPages::new();
    platform.script([Reply::Status(0)]);

    let pending = prepare(&platform, &allocator, &applet(), &LaunchConfig::default()).unwrap();

    let flushes = platform.flushes();
    for span in pending.handoff().spans() {
        assert!(flushes.contains(&(span.base, span.len() as u64)), "{span:?} not cleaned");
    }
}

/// Checks the monitor's view against what building the control blocks writes:
/// the loaded applet, poisoned boot parameters, and a TZ block followed only
/// by the certificate with zeroed scratch and log space.
fn assert_untouched(view: &MonitorView, applet: &[u8]) {
    let mut image = vec![0u8; view.image.len()];
    load(applet, &mut image, Validation::BootApplication).unwrap();
    assert!(view.image == image, "image differs from the loaded applet");

    assert!(view.boot_params.iter().all(|&b| b == BOOT_PARAMS_POISON));

    let (tz, _) = TzArgs::read_from_prefix(&view.args).unwrap();
    tz.check().unwrap();
    let cert = tz.cert_offset as usize..(tz.cert_offset + tz.cert_size) as usize;
    assert_eq!(&view.args[cert.clone()], extract_certificate(applet).unwrap());
    let stray = view.args[TzArgs::SIZE..]
        .iter()
        .enumerate()
        .map(|(i, &b)| (i + TzArgs::SIZE, b))
        .find(|&(at, b)| b != 0 && !cert.contains(&at));
    assert_eq!(stray, None);
}

#[test]
fn unsupported_probe_is_clean() {
    let platform = SimPlatform::new();
    let allocator = SimPages::new();
    platform.script([Reply::Status(0xffff_ffff), Reply::Status(0)]);
    let bytes = applet();
    let original = bytes.clone();

    let err = prepare(&platform, &allocator, &bytes, &LaunchConfig::default()).unwrap_err();

    assert_eq!(
        err,
        BounceError::Sequence(SequenceError::ProbeUnsupported(0xffff_ffff))
    );
    let calls = platform.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(platform.pending_replies(), 1);
    assert_untouched(calls[0].memory.as_ref().unwrap(), &bytes);
    assert_eq!(allocator.live(), 0);
    assert_eq!(allocator.frees(), allocator.allocations());
    assert_eq!(bytes, original);
    assert_eq!(platform.halted(), None);
}

#[test]
fn probe_only_writes_the_smc_page() {
    let platform = SimPlatform::new();
    let allocator = SimPages::new();
    platform.script([Reply::Status(0xffff_ffff)]);
    let recovery = RecoveryPoint::new();
    let data = create_launch_data(
        &applet(),
        &allocator,
        platform.trampoline(),
        recovery.context_addr(),
        &LaunchConfig::default(),
    )
    .unwrap();
    let handles = data.handles();
    let built = MonitorView {
        image: data.image().to_vec(),
        // SAFETY: `data` owns the argument region for the rest of the test.
        args: unsafe { std::slice::from_raw_parts(handles.args as *const u8, handles.args_size as usize) }
            .to_vec(),
        boot_params: data.boot_params().to_vec(),
    };

    data.clean_caches(&platform);
    // SAFETY: `data` outlives the sequencer.
    let mut sequencer = unsafe { Sequencer::new(&platform, handles) };
    assert!(sequencer.probe().is_err());

    let calls = platform.calls();
    assert_eq!(calls[0].memory.as_ref(), Some(&built));
    assert_eq!(calls[0].block, Some(SmcParams::stamped(&handles, Command::IsAvailable as u32)));
    drop(sequencer);
    drop(data);
}

#[test]
fn trampoline_bounce_is_corruption() {
    let platform = SimPlatform::new();
    let allocator = SimPages::new();
    platform.script([Reply::Status(0), Reply::Status(0), Reply::Bounce]);

    let mut pending = prepare(&platform, &allocator, &applet(), &LaunchConfig::default()).unwrap();
    let err = pending.try_finish().unwrap_err();

    assert_eq!(
        err,
        SequenceError::Corrupted {
            command: Command::Launch,
            status: TRAMPOLINE_SENTINEL
        }
    );
    assert_eq!(pending.state(), State::Corrupted);
    assert_eq!(pending.recovery().state(), ArmState::Returned);
}

#[test]
fn corruption_halts_instead_of_returning() {
    for (policy, halt) in [(HaltPolicy::Reset, Halt::Reset), (HaltPolicy::Spin, Halt::Spin)] {
        let platform = SimPlatform::new();
        let allocator = SimPages::new();
        platform.script([Reply::Status(0), Reply::Status(0), Reply::Bounce]);
        let config = LaunchConfig {
            exit_halt: policy,
            ..LaunchConfig::default()
        };

        let pending = prepare(&platform, &allocator, &applet(), &config).unwrap();
        let result = catch_unwind(AssertUnwindSafe(move || pending.finish()));

        assert!(result.is_err());
        assert_eq!(platform.halted(), Some(halt));
    }
}

#[test]
fn failed_launch_status_is_corruption() {
    let platform = SimPlatform::new();
    let allocator = SimPages::new();
    platform.script([Reply::Status(0), Reply::Status(0), Reply::Status(0x10)]);

    let mut pending = prepare(&platform, &allocator, &applet(), &LaunchConfig::default()).unwrap();

    assert_eq!(
        pending.try_finish(),
        Err(SequenceError::Corrupted {
            command: Command::Launch,
            status: 0x10
        })
    );
    assert_eq!(pending.recovery().state(), ArmState::NotArmed);
}

#[test]
fn block_survives_a_monitor_that_zeroes_it() {
    let platform = SimPlatform::new();
    let allocator = SimPages::new();
    platform.script([Reply::ZeroBlock(0), Reply::ZeroBlock(0), Reply::Status(0)]);

    let mut pending = prepare(&platform, &allocator, &applet(), &LaunchConfig::default()).unwrap();
    pending.try_finish().unwrap();

    let handles = pending.handoff().handles;
    for (call, command) in platform.calls().iter().zip([Command::IsAvailable, Command::Auth, Command::Launch]) {
        let block = call.block.expect("secure-launch call without block");
        assert_eq!(block.num, command as u32);
        assert_eq!((block.a, block.b, block.version), (1, 0, SmcParams::VERSION));
        assert_eq!((block.pe_data, block.pe_size), (handles.image, handles.image_size));
        assert_eq!((block.arg_data, block.arg_size), (handles.args, handles.args_size));
    }
}

#[test]
fn handed_over_memory_is_never_freed() {
    let platform = SimPlatform::new();
    let allocator = SimPages::new();
    platform.script([Reply::Status(0), Reply::Status(0), Reply::Status(0)]);

    let pending = prepare(&platform, &allocator, &applet(), &LaunchConfig::default()).unwrap();
    let spans = pending.handoff().spans();
    pending.finish();

    assert_eq!(allocator.frees(), 0);
    let live = allocator.live_spans();
    for span in spans {
        assert!(live.contains(&(span.base, span.count)));
    }
}
