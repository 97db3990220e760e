//! End-to-end runs of the controller against the simulated device.

use std::thread;
use std::time::{Duration, Instant};

use daqstream::{
    AcquisitionController, Capture, CaptureStore, ChannelId, ConfigError, Configuration,
    ControllerOptions, DeviceCall, Pacing, RunState, Scaling, ScriptStep, SimulatedDevice,
    StartError, Window,
};

const WINDOW_DEADLINE: Duration = Duration::from_secs(10);

fn controller(device: SimulatedDevice) -> AcquisitionController<SimulatedDevice> {
    AcquisitionController::new(device.into_connector())
}

fn wait_window(ctl: &mut AcquisitionController<SimulatedDevice>) -> Window {
    let deadline = Instant::now() + WINDOW_DEADLINE;
    while Instant::now() < deadline {
        if let Some(window) = ctl.poll(Duration::from_millis(50)) {
            return window;
        }
    }
    panic!("no window within {WINDOW_DEADLINE:?} (status: {})", ctl.status());
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn single_request_yields_one_full_window() {
    let device = SimulatedDevice::packets(800, 25);
    let calls = device.call_log();
    let mut ctl = controller(device);
    ctl.configure(Configuration::new([0u8, 2], 5000, 2.0).unwrap())
        .unwrap();
    ctl.start().unwrap();

    let window = wait_window(&mut ctl);
    assert_eq!(window.rate, 5000);
    assert_eq!(window.dropped, 0);
    assert_eq!(window.dropped_summary(), "Dropped 0 of 20000 points.");
    assert_eq!(window.n_channels(), 2);
    for id in [ChannelId(0), ChannelId(2)] {
        let len = window.channel(id).unwrap().len();
        assert!(len.abs_diff(10_000) <= 1, "{id}: {len}");
    }
    assert_eq!(window.total_points(), 20_000);

    // No second window without a second request, and the poll honours its timeout.
    let polled_at = Instant::now();
    assert!(ctl.poll(Duration::from_millis(200)).is_none());
    let waited = polled_at.elapsed();
    assert!(waited >= Duration::from_millis(190), "{waited:?}");
    assert!(waited < Duration::from_millis(1000), "{waited:?}");
    assert_eq!(
        calls.count(|c| matches!(c, DeviceCall::Configure { .. })),
        1
    );
    assert_eq!(ctl.state(), RunState::AwaitingRequest);
    assert!(ctl.is_running());

    ctl.stop();
    assert_eq!(ctl.state(), RunState::Stopped);
    assert_eq!(ctl.status(), "Stopped.");
    assert!(!ctl.is_running());
}

#[test]
fn failed_connect_can_be_retried() {
    let mut ctl = controller(SimulatedDevice::new().failing_connect(1));
    ctl.configure(Configuration::new([0u8], 1000, 0.05).unwrap())
        .unwrap();
    assert!(matches!(ctl.start(), Err(StartError::NoDevice(_))));
    assert_eq!(ctl.status(), "No hardware connected.");
    assert!(!ctl.is_running());

    ctl.start().unwrap();
    let window = wait_window(&mut ctl);
    assert_eq!(window.total_points(), 50);
}

#[test]
fn dropped_counts_are_summed() {
    let device = SimulatedDevice::scripted([
        ScriptStep::Packet { samples: 25, missed: 0 },
        ScriptStep::Packet { samples: 25, missed: 3 },
        ScriptStep::Timeout,
        ScriptStep::Packet { samples: 25, missed: 4 },
        ScriptStep::Packet { samples: 25, missed: 0 },
    ]);
    let mut ctl = controller(device);
    ctl.configure(Configuration::new([1u8], 100, 1.0).unwrap())
        .unwrap();
    ctl.start().unwrap();

    let window = wait_window(&mut ctl);
    assert_eq!(window.dropped, 7);
    assert_eq!(window.channel(ChannelId(1)).unwrap().len(), 100);
    assert_eq!(window.dropped_summary(), "Dropped 7 of 100 points.");
}

#[test]
fn repeated_start_reuses_the_running_thread() {
    let device = SimulatedDevice::packets(4, 25).with_pacing(Pacing::Fixed(Duration::from_millis(20)));
    let calls = device.call_log();
    let mut ctl = controller(device);
    ctl.configure(Configuration::new([0u8], 50, 1.0).unwrap())
        .unwrap();
    ctl.start().unwrap();
    ctl.start().unwrap();
    assert!(ctl.is_running());

    let window = wait_window(&mut ctl);
    assert_eq!(window.total_points(), 50);
    assert!(ctl.poll(Duration::from_millis(150)).is_none());
    assert_eq!(
        calls.count(|c| matches!(c, DeviceCall::Configure { .. })),
        1
    );
}

#[test]
fn reconfigure_while_streaming_restarts_with_new_settings() {
    let device = SimulatedDevice::new().with_pacing(Pacing::Fixed(Duration::from_millis(2)));
    let calls = device.call_log();
    let mut ctl = controller(device);
    ctl.configure(Configuration::new([0u8], 1000, 10.0).unwrap())
        .unwrap();
    ctl.start().unwrap();
    assert!(wait_until(|| ctl.state() == RunState::Streaming));
    thread::sleep(Duration::from_millis(30));

    ctl.configure(Configuration::new([3u8, 1], 2000, 0.1).unwrap())
        .unwrap();
    assert!(ctl.is_running());

    let window = wait_window(&mut ctl);
    assert_eq!(window.rate, 2000);
    assert_eq!(
        window.channels.keys().copied().collect::<Vec<_>>(),
        vec![ChannelId(1), ChannelId(3)]
    );
    assert_eq!(window.total_points(), 400);
    assert_eq!(window.channel(ChannelId(1)).unwrap().len(), 200);
    assert_eq!(window.channel(ChannelId(3)).unwrap().len(), 200);

    let configures: Vec<DeviceCall> = calls
        .calls()
        .into_iter()
        .filter(|c| matches!(c, DeviceCall::Configure { .. }))
        .collect();
    assert_eq!(
        configures,
        vec![
            DeviceCall::Configure {
                channels: vec![ChannelId(0)],
                rate: 1000
            },
            DeviceCall::Configure {
                channels: vec![ChannelId(1), ChannelId(3)],
                rate: 2000
            },
        ]
    );
}

#[test]
fn reconfigure_while_idle_does_not_start() {
    let mut ctl = controller(SimulatedDevice::new());
    ctl.set_channels([4u8, 2]).unwrap();
    ctl.set_sampling(Some(1000), Some(0.5)).unwrap();
    assert!(!ctl.is_running());
    assert_eq!(ctl.state(), RunState::Idle);
    let config = ctl.configuration();
    assert_eq!(config.channels(), &[ChannelId(2), ChannelId(4)]);
    assert_eq!(config.integration_target(), 1000);
}

#[test]
fn oversized_integration_is_rejected_and_stop_stays_safe() {
    let device = SimulatedDevice::new().with_pacing(Pacing::Fixed(Duration::from_millis(1)));
    let options = ControllerOptions {
        stop_wait_factor: f64::MAX,
        ..ControllerOptions::default()
    };
    let mut ctl = AcquisitionController::with_options(device.into_connector(), options);
    assert_eq!(
        ctl.set_sampling(Some(1000), Some(1e20)),
        Err(ConfigError::InvalidIntegrationTime)
    );
    assert_eq!(ctl.configuration().integration_secs(), 2.0);

    // The stop wait overflows a Duration and falls back to one integration time.
    ctl.start().unwrap();
    assert!(wait_until(|| ctl.state() == RunState::Streaming));
    ctl.stop();
    assert_eq!(ctl.state(), RunState::Stopped);
    assert!(!ctl.is_running());
}

#[test]
fn stop_mid_window_discards_partial_data() {
    let device = SimulatedDevice::new().with_pacing(Pacing::Fixed(Duration::from_millis(1)));
    let mut ctl = controller(device);
    ctl.configure(Configuration::new([0u8], 1000, 5.0).unwrap())
        .unwrap();
    ctl.start().unwrap();
    assert!(wait_until(|| ctl.state() == RunState::Streaming));
    thread::sleep(Duration::from_millis(20));

    ctl.stop();
    assert_eq!(ctl.state(), RunState::Stopped);
    assert_eq!(ctl.status(), "Stopped.");
    assert!(!ctl.is_running());
    assert!(ctl.poll(Duration::from_millis(50)).is_none());
}

#[test]
fn slow_thread_reports_stop_timeout_and_blocks_restart() {
    let device = SimulatedDevice::new().with_pacing(Pacing::Fixed(Duration::from_millis(400)));
    let options = ControllerOptions {
        stop_wait_factor: 1.0,
        ..ControllerOptions::default()
    };
    let mut ctl = AcquisitionController::with_options(device.into_connector(), options);
    ctl.configure(Configuration::new([0u8], 100, 0.02).unwrap())
        .unwrap();
    ctl.start().unwrap();
    assert!(wait_until(|| ctl.state() == RunState::Streaming));

    ctl.stop();
    assert_eq!(ctl.status(), "Acquisition thread timed out");
    assert!(matches!(ctl.start(), Err(StartError::PreviousRunPending)));

    // Once the packet lands the thread notices the stop and exits.
    assert!(wait_until(|| ctl.state() == RunState::Stopped));
    ctl.stop();
    assert!(!ctl.is_running());
    ctl.start().unwrap();
    assert!(ctl.is_running());
}

#[test]
fn device_failure_publishes_partial_window() {
    let device = SimulatedDevice::scripted([
        ScriptStep::Packet { samples: 25, missed: 0 },
        ScriptStep::Packet { samples: 25, missed: 1 },
        ScriptStep::Fail("usb reset".into()),
    ]);
    let mut ctl = controller(device);
    ctl.configure(Configuration::new([0u8], 100, 1.0).unwrap())
        .unwrap();
    ctl.start().unwrap();

    let window = wait_window(&mut ctl);
    assert_eq!(window.total_points(), 50);
    assert_eq!(window.dropped, 1);
    match ctl.state() {
        RunState::Aborted(reason) => assert!(reason.contains("usb reset"), "{reason}"),
        other => panic!("expected abort, got {other:?}"),
    }
    assert!(ctl.status().starts_with("Aborted:"));
    assert!(wait_until(|| !ctl.is_running()));
}

#[test]
fn restart_after_abort_spawns_fresh_thread() {
    let mut steps = vec![
        ScriptStep::Packet { samples: 25, missed: 0 },
        ScriptStep::Fail("glitch".into()),
    ];
    steps.extend((0..4).map(|_| ScriptStep::Packet { samples: 25, missed: 0 }));
    let device = SimulatedDevice::scripted(steps);
    let calls = device.call_log();
    let mut ctl = controller(device);
    ctl.configure(Configuration::new([0u8], 100, 1.0).unwrap())
        .unwrap();
    ctl.start().unwrap();

    let partial = wait_window(&mut ctl);
    assert_eq!(partial.total_points(), 25);
    assert!(matches!(ctl.state(), RunState::Aborted(_)));

    ctl.start().unwrap();
    let full = wait_window(&mut ctl);
    assert_eq!(full.total_points(), 100);
    assert_eq!(ctl.state(), RunState::AwaitingRequest);
    assert_eq!(calls.count(|c| *c == DeviceCall::Start), 2);
}

#[test]
fn continuous_mode_keeps_requesting() {
    let mut ctl = controller(SimulatedDevice::new());
    ctl.configure(Configuration::new([0u8, 1], 1000, 0.05).unwrap())
        .unwrap();
    ctl.set_continuous(true);
    ctl.start().unwrap();

    for _ in 0..3 {
        let window = wait_window(&mut ctl);
        assert_eq!(window.total_points(), 100);
        assert_eq!(window.common_len(), 50);
        assert_eq!(window.dropped, 0);
    }
    ctl.stop();
    assert_eq!(ctl.state(), RunState::Stopped);
}

#[test]
fn monitor_follows_state_from_another_thread() {
    let mut ctl = controller(SimulatedDevice::new().with_pacing(Pacing::Fixed(Duration::from_millis(1))));
    ctl.configure(Configuration::new([0u8], 1000, 5.0).unwrap())
        .unwrap();
    let monitor = ctl.monitor();
    ctl.start().unwrap();

    let observer = thread::spawn(move || wait_until(|| monitor.status() == "Streaming"));
    assert!(observer.join().unwrap());
    drop(ctl);
}

#[test]
fn captured_window_survives_a_save_and_load() {
    let mut ctl = controller(SimulatedDevice::new());
    ctl.configure(Configuration::new([0u8, 5], 500, 0.1).unwrap())
        .unwrap();
    ctl.start().unwrap();
    let window = wait_window(&mut ctl);

    let capture = Capture::new(window).with_scaling(Scaling {
        prefactor: 0.5,
        unit: "mA".into(),
    });
    let dir = tempfile::tempdir().unwrap();
    let mut store = CaptureStore::new();
    store.set_save_all(dir.path()).unwrap();
    let path = store.save_continuous(&capture).unwrap().unwrap();

    let loaded = CaptureStore::load_one(&path).unwrap();
    assert_eq!(loaded, capture);
    assert_eq!(loaded.window.channel(ChannelId(5)).unwrap().len(), 50);
}
