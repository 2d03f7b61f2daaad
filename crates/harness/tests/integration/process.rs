use std::time::Duration;

use fleet_config::env;
use fleet_harness::{
    ExitInfo, HarnessError, LifecycleState, ProcessRole, RestartOptions, StartRequest, StopSignal,
};
use fleet_support::{SimSettings, TestFleet};

#[tokio::test(start_paused = true)]
async fn start_waits_until_ready() {
    let mut fleet = TestFleet::new();
    let procs = &mut fleet.harness.procs;

    let handle = procs.start(StartRequest::server("solo")).await.unwrap();
    assert_eq!(procs.state(&handle).unwrap(), LifecycleState::Running);
    assert!(handle.dbpath().is_some_and(|p| p.is_dir()));
    assert_eq!(procs.ports().owner(handle.addr().port).as_deref(), Some("solo"));

    procs.stop(&handle, StopSignal::Graceful).await.unwrap();
    assert_eq!(procs.state(&handle).unwrap(), LifecycleState::Stopped);
    assert_eq!(procs.last_exit(&handle).unwrap(), Some(ExitInfo::code(0)));
    // Stopping twice is fine.
    procs.stop(&handle, StopSignal::Kill).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn startup_failure_carries_the_output() {
    let mut fleet = TestFleet::new();
    fleet.sim.fail_startup("broken", true);
    let procs = &mut fleet.harness.procs;

    let err = procs.start(StartRequest::server("broken")).await.unwrap_err();
    match err {
        HarnessError::UnexpectedExit { name, exit, output } => {
            assert_eq!(name, "broken");
            assert_eq!(exit, ExitInfo::code(1));
            assert!(output.iter().any(|l| l.contains("simulated startup failure")), "{output:?}");
        }
        other => panic!("unexpected error: {other}"),
    }
    let handle = procs.find("broken").unwrap();
    assert_eq!(procs.state(&handle).unwrap(), LifecycleState::Crashed);
}

#[tokio::test(start_paused = true)]
async fn fixed_port_conflict_is_rejected() {
    let mut fleet = TestFleet::new();
    let procs = &mut fleet.harness.procs;

    let first = procs.start(StartRequest::server("a")).await.unwrap();
    let port = first.addr().port;
    let err = procs.start(StartRequest::server("b").port(port)).await.unwrap_err();
    assert!(matches!(err, HarnessError::PortInUse { port: p, .. } if p == port), "{err}");
}

#[tokio::test(start_paused = true)]
async fn crash_is_noticed_by_refresh() {
    let mut fleet = TestFleet::new();
    let handle = fleet.harness.procs.start(StartRequest::server("flaky")).await.unwrap();

    assert!(fleet.harness.procs.refresh().is_empty());
    assert!(fleet.sim.crash("flaky"));
    let crashed = fleet.harness.procs.refresh();
    assert_eq!(crashed.len(), 1);
    assert_eq!(crashed[0].name(), "flaky");

    let procs = &fleet.harness.procs;
    assert_eq!(procs.state(&handle).unwrap(), LifecycleState::Crashed);
    assert_eq!(procs.last_exit(&handle).unwrap().and_then(|e| e.signal), Some(6));
    // Already recorded, so not reported again.
    assert!(fleet.harness.procs.refresh().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_keeps_port_and_options() {
    let mut fleet = TestFleet::new();
    let procs = &mut fleet.harness.procs;

    let handle = procs.start(StartRequest::server("r").option("oplogSize", "64")).await.unwrap();
    let old_pid = procs.pid(&handle).unwrap();

    procs.restart(&handle, RestartOptions::default().option("verbose", "2")).await.unwrap();
    assert_ne!(procs.pid(&handle).unwrap(), old_pid);
    assert!(procs.is_running(&handle));
    let opts = procs.options(&handle).unwrap();
    assert_eq!(opts.get("oplogSize"), Some("64"));
    assert_eq!(opts.get("verbose"), Some("2"));

    let (role, launched) = fleet.sim.launched_with("r").unwrap();
    assert_eq!(role, ProcessRole::Server);
    assert_eq!(launched.get("oplogSize"), Some("64"));
    assert_eq!(launched.get("verbose"), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn restart_with_missing_data_dir_fails() {
    let mut fleet = TestFleet::new();
    let procs = &mut fleet.harness.procs;

    let handle = procs.start(StartRequest::server("gone")).await.unwrap();
    procs.stop(&handle, StopSignal::Graceful).await.unwrap();
    std::fs::remove_dir_all(handle.dbpath().unwrap()).unwrap();

    let err = procs.restart(&handle, RestartOptions::default()).await.unwrap_err();
    assert!(matches!(err, HarnessError::RestartFailed { .. }), "{err}");

    procs.restart(&handle, RestartOptions::wipe_data()).await.unwrap();
    assert!(procs.is_running(&handle));
}

/// A process that never answers within the startup timeout is killed. It
/// keeps its port until it is removed.
#[tokio::test(start_paused = true)]
async fn silent_process_times_out_and_keeps_its_port() {
    let slow = SimSettings { startup_delay: Duration::from_secs(60), ..SimSettings::default() };
    let mut fleet = TestFleet::with_sim(slow);
    let procs = &mut fleet.harness.procs;

    let err = procs.start(StartRequest::server("mute")).await.unwrap_err();
    let HarnessError::StartupTimeout { ref name, waited, ref last_error, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(name, "mute");
    assert!(waited >= env::startup_timeout(), "{waited:?}");
    assert!(last_error.contains("connection refused"), "{last_error}");
    assert!(err.is_timeout());

    let handle = procs.find("mute").unwrap();
    assert_eq!(procs.state(&handle).unwrap(), LifecycleState::Stopped);
    assert_eq!(procs.last_exit(&handle).unwrap().and_then(|e| e.signal), Some(9));
    let port = handle.addr().port;
    assert_eq!(procs.ports().owner(port).as_deref(), Some("mute"));

    procs.remove(&handle, false).await.unwrap();
    assert!(procs.ports().owner(port).is_none());
    assert!(procs.find("mute").is_none());
    assert_eq!(fleet.sim.live_processes(), 0);
}
