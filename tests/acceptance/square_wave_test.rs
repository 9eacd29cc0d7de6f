//! Phase-locked alternation on simulated time.

use super::common::{period_1ms, SimulatedRig};
use sqwave_common::{Clock, Deadline, Level, Period};
use sqwave_runtime::{OrchestratorConfig, PhaseTask};
use std::time::Duration;

fn delayed_config(period: Period) -> OrchestratorConfig {
    OrchestratorConfig {
        start_delay: Duration::from_millis(1),
        ..OrchestratorConfig::new(period)
    }
}

fn aligned_config(period: Period) -> OrchestratorConfig {
    OrchestratorConfig {
        start_delay: Duration::from_secs(2),
        align_to_second: true,
        ..OrchestratorConfig::new(period)
    }
}

#[test]
fn test_ten_periods_alternate_every_half_period() {
    let rig = SimulatedRig::launch(Deadline::new(100, 123_456_789), aligned_config(period_1ms()));

    // 10 periods, two edges each.
    rig.step(20);
    let emissions = rig.sink.emissions();
    let reports = rig.finish();

    assert_eq!(emissions.len(), 20);
    for (i, emission) in emissions.iter().enumerate() {
        let expected = if i % 2 == 0 { Level::High } else { Level::Low };
        assert_eq!(emission.level, expected, "emission {i}");
        assert_eq!(
            emission.at,
            Some(Deadline::new(102, 500_000 * i as u64)),
            "emission {i}"
        );
    }
    for pair in emissions.windows(2) {
        let (a, b) = (pair[0].at.unwrap(), pair[1].at.unwrap());
        assert_eq!(a.nanos_until(b), 500_000);
        assert_ne!(pair[0].level, pair[1].level);
    }

    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert_eq!(report.iterations, 10, "task {}", report.name);
        assert_eq!(report.stats.emissions, 10);
        assert_eq!(report.stats.write_failures, 0);
        assert_eq!(report.stats.overruns, 0);
    }
}

#[test]
fn test_nothing_is_emitted_before_first_deadline() {
    let rig = SimulatedRig::launch(Deadline::new(7, 900_000_000), aligned_config(period_1ms()));
    rig.settle();

    assert!(rig.sink.emissions().is_empty());
    assert_eq!(rig.clock.now(), Deadline::new(7, 900_000_000));

    rig.step(1);
    let first = rig.sink.emissions()[0];
    assert_eq!(first.at, Some(Deadline::new(9, 0)));
    assert_eq!(first.level, Level::High);

    rig.finish();
}

#[test]
fn test_odd_period_keeps_integer_phase() {
    let period = Period::from_nanos(1_000_001).unwrap();
    let rig = SimulatedRig::launch(Deadline::new(0, 0), delayed_config(period));

    rig.step(6);
    let times: Vec<Deadline> = rig.sink.emissions().iter().filter_map(|e| e.at).collect();
    rig.finish();

    let gaps: Vec<i128> = times.windows(2).map(|w| w[0].nanos_until(w[1])).collect();
    assert_eq!(gaps, vec![500_000, 500_001, 500_000, 500_001, 500_000]);
}

#[test]
fn test_three_phase_pattern() {
    let period = Period::from_nanos(900_000).unwrap();
    let phases = [
        PhaseTask::new("a", Level::High, 0),
        PhaseTask::new("b", Level::Low, 300_000),
        PhaseTask::new("c", Level::High, 600_000),
    ];
    let rig = SimulatedRig::launch_phases(Deadline::new(1, 0), delayed_config(period), &phases);

    rig.step(6);
    let levels = rig.sink.levels();
    let reports = rig.finish();

    assert_eq!(
        levels,
        vec![Level::High, Level::Low, Level::High, Level::High, Level::Low, Level::High]
    );
    let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}
