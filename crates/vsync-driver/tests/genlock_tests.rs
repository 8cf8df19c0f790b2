//! Control loop tests against the software backend

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vsync_driver::backends::software::{ACTIVE_BIAS, ACTIVE_PLL_DIV0, ACTIVE_SSC};
use vsync_driver::vblank::VblankReport;
use vsync_driver::{
    AcquirerConfig, ChannelSource, ControllerConfig, CycleOutcome, DeviceHandle, DklCodec,
    DklField, DklRegister, GenlockLoop, LoopState, OffsetAcquirer, RetuneConfig, SoftwareDevice,
    SyncFeed, SyncReading, VsyncError,
};

fn acquirer_config() -> AcquirerConfig {
    AcquirerConfig {
        query_timeout: Duration::from_millis(50),
        max_age: Duration::from_secs(2),
    }
}

fn setup(
    phys: &[usize],
    retune: RetuneConfig,
    controller: ControllerConfig,
) -> (SoftwareDevice, SyncFeed, GenlockLoop<ChannelSource>) {
    let sim = SoftwareDevice::with_active_phys(phys);
    let (feed, source) = ChannelSource::pair();
    let lp = GenlockLoop::new(
        DeviceHandle::simulated(sim.clone()),
        DklCodec::new(Default::default(), retune),
        OffsetAcquirer::new(source, acquirer_config()),
        controller,
    )
    .expect("valid config");
    (sim, feed, lp)
}

fn cycle(lp: &mut GenlockLoop<ChannelSource>, feed: &SyncFeed, offset_ns: Option<i64>, n: u64) {
    if let Some(offset_ns) = offset_ns {
        feed.push(SyncReading::locked(offset_ns, 0));
    } else {
        feed.push(SyncReading::unsynchronized());
    }
    let t = Instant::now() + Duration::from_secs(n);
    lp.run_cycle(t).expect("cycle");
}

#[test]
fn test_divider_width_enforced() {
    let sim = SoftwareDevice::with_active_phys(&[1]);
    let mut dev = DeviceHandle::simulated(sim.clone());
    dev.map().unwrap();
    let mut codec = DklCodec::default();
    let mut phy = codec.select(&mut dev, 1).unwrap();

    phy.write_field(DklField::Divider, 200).unwrap();
    assert_eq!(phy.read_field(DklField::Divider).unwrap(), 200);
    let div0 = sim.peek(DklRegister::PllDiv0.address(1));

    let err = phy.write_field(DklField::Divider, 300).unwrap_err();
    assert!(matches!(
        err,
        VsyncError::ValueOutOfRange {
            value: 300,
            width: 8,
            ..
        }
    ));
    assert_eq!(sim.peek(DklRegister::PllDiv0.address(1)), div0);
}

#[test]
fn test_lock_after_sync_gained() {
    let (_sim, feed, mut lp) = setup(&[0], RetuneConfig::default(), ControllerConfig::default());

    for n in 0..3 {
        cycle(&mut lp, &feed, None, n);
        assert_eq!(lp.state(), LoopState::Unsynced);
    }
    for n in 3..8 {
        cycle(&mut lp, &feed, Some(-4_000), n);
        assert_ne!(lp.state(), LoopState::Unsynced);
    }
    assert_eq!(lp.state(), LoopState::Locked);
}

#[test]
fn test_decreasing_offsets_converge() {
    let (sim, feed, mut lp) = setup(&[0, 4], RetuneConfig::default(), ControllerConfig::default());
    let offsets = [80_000, 40_000, 20_000, 9_000, 5_000, 3_000, 2_000, 1_000];

    for (n, offset) in (0u64..).zip(offsets) {
        cycle(&mut lp, &feed, Some(offset), n);
    }
    assert_eq!(lp.state(), LoopState::Locked);
    assert_eq!(lp.control().good_samples, 5);

    // Both PHYs were slowed down from their original frequency
    let phys: Vec<usize> = lp.nominal_frequencies().iter().map(|&(p, _)| p).collect();
    assert_eq!(phys, [0, 4]);
    assert!(lp.control().applied_ppm < 0.0);
    for phy in [0, 4] {
        assert_ne!(sim.peek(DklRegister::Bias.address(phy)), ACTIVE_BIAS);
    }
}

#[test]
fn test_pending_retune_defers_correction() {
    // Tiny steps and a long interval keep the first retune in flight
    let retune = RetuneConfig {
        max_step_percent: 0.000_01,
        step_interval: Duration::from_secs(3600),
        apply_profile: true,
    };
    let (sim, feed, mut lp) = setup(&[0], retune, ControllerConfig::default());

    cycle(&mut lp, &feed, Some(50_000), 0);
    let applied = lp.control().applied_ppm;
    assert!(applied < 0.0);
    assert!(!lp.codec().is_done(0));

    let writes = sim.write_count();
    feed.push(SyncReading::locked(40_000, 0));
    let outcome = lp.run_cycle(Instant::now() + Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, CycleOutcome::Deferred { phy: 0 });
    assert_eq!(lp.control().applied_ppm, applied);
    assert_eq!(sim.write_count(), writes);
}

#[test]
fn test_device_lost_after_retries() {
    let controller = ControllerConfig {
        max_device_retries: 2,
        ..ControllerConfig::default()
    };
    let (sim, feed, mut lp) = setup(&[0], RetuneConfig::default(), controller);
    cycle(&mut lp, &feed, Some(20_000), 0);

    sim.detach();
    feed.push(SyncReading::locked(20_000, 0));
    let t = Instant::now();
    assert_eq!(lp.run_cycle(t).unwrap(), CycleOutcome::DeviceError);
    assert_eq!(lp.state(), LoopState::Unsynced);
    assert!(!lp.device().is_mapped());
    assert_eq!(lp.run_cycle(t).unwrap(), CycleOutcome::DeviceError);

    let err = lp.run_cycle(t).unwrap_err();
    assert!(matches!(err, VsyncError::DeviceLost { attempts: 3 }));
    // Stays lost
    assert!(matches!(lp.run_cycle(t), Err(VsyncError::DeviceLost { .. })));
}

#[test]
fn test_device_recovers_after_remap() {
    let (sim, feed, mut lp) = setup(&[0], RetuneConfig::default(), ControllerConfig::default());
    cycle(&mut lp, &feed, Some(20_000), 0);
    let maps = sim.map_count();

    sim.detach();
    feed.push(SyncReading::locked(20_000, 0));
    assert_eq!(
        lp.run_cycle(Instant::now()).unwrap(),
        CycleOutcome::DeviceError
    );
    sim.reattach();

    cycle(&mut lp, &feed, Some(15_000), 1);
    assert_eq!(sim.map_count(), maps + 1);
    assert_eq!(lp.state(), LoopState::Acquiring);
    assert_eq!(lp.control().device_failures, 0);
}

#[test]
fn test_run_restores_registers_on_stop() {
    let controller = ControllerConfig {
        period: Duration::from_millis(20),
        ..ControllerConfig::default()
    };
    let (sim, feed, lp) = setup(&[0], RetuneConfig::default(), controller);
    let monitor = lp.monitor();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = lp.spawn(Arc::clone(&stop)).unwrap();

    for _ in 0..5 {
        feed.push(SyncReading::locked(60_000, 0));
        thread::sleep(Duration::from_millis(25));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while monitor.snapshot().control.applied_ppm == 0.0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(monitor.snapshot().control.cycles > 0);
    assert_ne!(sim.peek(DklRegister::Bias.address(0)), ACTIVE_BIAS);

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap().unwrap();

    assert_eq!(sim.peek(DklRegister::PllDiv0.address(0)), ACTIVE_PLL_DIV0);
    assert_eq!(sim.peek(DklRegister::Bias.address(0)), ACTIVE_BIAS);
    assert_eq!(sim.peek(DklRegister::Ssc.address(0)), ACTIVE_SSC);
    assert_eq!(sim.live_windows(), 0);
}

#[test]
fn test_vblank_reports_steer_loop() {
    const PERIOD_US: i64 = 16_667;
    let (_sim, feed, mut lp) = setup(&[0], RetuneConfig::default(), ControllerConfig::default());
    let reference: Vec<i64> = (0..4).map(|i| 5_000_000 + i * PERIOD_US).collect();
    let last = reference[3];

    // Local vblank 30 µs late, reported three frames after the reference
    feed.push(
        VblankReport {
            reference_us: reference.clone(),
            local_us: last + 3 * PERIOD_US + 30,
        }
        .into_reading(Instant::now()),
    );
    let outcome = lp.run_cycle(Instant::now()).expect("cycle");
    assert!(matches!(outcome, CycleOutcome::Applied { .. }), "{outcome:?}");
    assert_eq!(lp.control().last_offset_ns, Some(30_000));
    assert!(lp.control().applied_ppm < 0.0);

    // A single reference timestamp gives no period: no sync
    feed.push(
        VblankReport {
            reference_us: vec![last],
            local_us: last + 10,
        }
        .into_reading(Instant::now()),
    );
    let outcome = lp.run_cycle(Instant::now() + Duration::from_secs(1)).expect("cycle");
    assert_eq!(outcome, CycleOutcome::NoSync);
}
