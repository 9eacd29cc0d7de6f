//! Stop, join, and release behaviour.

use super::common::{period_1ms, SimulatedRig};
use sqwave_common::config::{OutputConfig, OutputDriver};
use sqwave_common::{Clock, Deadline, Level, WaveError};
use sqwave_gpio::{open_sink, OutputSink, SimulatedSink};
use sqwave_runtime::{square_wave_phases, MonotonicClock, Orchestrator, OrchestratorConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn quick_start() -> OrchestratorConfig {
    OrchestratorConfig {
        start_delay: Duration::from_millis(5),
        ..OrchestratorConfig::new(period_1ms())
    }
}

fn wait_for_calls(sink: &SimulatedSink, calls: u64) {
    let start = Instant::now();
    while sink.call_count() < calls {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "only {} writes after 5s",
            sink.call_count()
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_write_failure_does_not_stop_real_threads() {
    let sink = Arc::new(SimulatedSink::new());
    sink.fail_on_call(3);
    let orchestrator = Orchestrator::new(MonotonicClock::new(), Arc::clone(&sink), quick_start());

    let handle = orchestrator.launch(&square_wave_phases(period_1ms())).unwrap();
    wait_for_calls(&sink, 20);
    handle.stop();
    let reports = handle.join().unwrap();

    let failures: u64 = reports.iter().map(|r| r.stats.write_failures).sum();
    let emissions: u64 = reports.iter().map(|r| r.stats.emissions).sum();
    assert_eq!(failures, 1);
    assert_eq!(emissions, sink.call_count() - 1);
    assert_eq!(sink.levels().len() as u64, emissions);
}

#[test]
fn test_shutdown_releases_line_once_and_close_is_idempotent() {
    let config = OutputConfig {
        driver: OutputDriver::Simulated,
        ..Default::default()
    };
    let sink = open_sink(&config).unwrap();
    let orchestrator = Orchestrator::new(MonotonicClock::new(), Arc::clone(&sink), quick_start());

    let handle = orchestrator.launch(&square_wave_phases(period_1ms())).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    handle.stop();
    let reports = handle.join().unwrap();
    assert_eq!(reports.len(), 2);

    sink.close().unwrap();
    sink.close().unwrap();
    assert!(!sink.is_open());
    assert_eq!(sink.set(Level::High), Err(WaveError::Closed));
}

#[test]
fn test_stop_before_first_deadline_emits_nothing() {
    let config = OrchestratorConfig {
        start_delay: Duration::from_secs(2),
        ..OrchestratorConfig::new(period_1ms())
    };
    let rig = SimulatedRig::launch(Deadline::new(50, 0), config);
    rig.settle();

    let SimulatedRig {
        clock,
        sink,
        handle,
        ..
    } = rig;
    let start = Instant::now();
    handle.stop();
    let reports = handle.join().unwrap();

    // The tasks left their first sleep without virtual time moving.
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(clock.now(), Deadline::new(50, 0));
    assert_eq!(clock.sleepers(), 0);
    assert!(sink.emissions().is_empty());
    assert!(reports.iter().all(|r| r.iterations == 0));
}

#[test]
fn test_writes_after_close_are_counted() {
    let config = OrchestratorConfig {
        start_delay: Duration::from_millis(1),
        ..OrchestratorConfig::new(period_1ms())
    };
    let rig = SimulatedRig::launch(Deadline::new(0, 0), config);

    rig.step(4);
    rig.sink.close().unwrap();
    rig.step(4);

    let sink = Arc::clone(&rig.sink);
    let reports = rig.finish();

    assert_eq!(sink.emissions().len(), 4);
    let failures: u64 = reports.iter().map(|r| r.stats.write_failures).sum();
    assert_eq!(failures, 4);
    assert_eq!(sink.close_count(), 1);
}

#[test]
fn test_dropped_handle_stops_tasks() {
    let sink = Arc::new(SimulatedSink::new());
    let orchestrator = Orchestrator::new(MonotonicClock::new(), Arc::clone(&sink), quick_start());
    let handle = orchestrator.launch(&square_wave_phases(period_1ms())).unwrap();
    let token = handle.stop_token();

    drop(handle);
    assert!(token.is_stop_requested());
}
