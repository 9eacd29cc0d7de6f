//! Configuration files flowing into launch parameters.

use sqwave_common::config::{CpuAffinity, SchedPolicy, WaveConfig};
use sqwave_common::WaveError;
use sqwave_runtime::OrchestratorConfig;
use std::io::Write;
use std::time::Duration;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_file_to_launch_parameters() {
    let file = write_config(
        r#"
period = "500us"
start_delay = "100ms"
align_to_second = false

[output]
driver = "simulated"
line = 5

[realtime]
policy = "rr"
priority = 42
cpu_affinity = [1, 2]
"#,
    );

    let config = WaveConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();

    let launch = OrchestratorConfig::from_wave_config(&config).unwrap();
    assert_eq!(launch.period.as_nanos(), 500_000);
    assert_eq!(launch.period.half(), 250_000);
    assert_eq!(launch.start_delay, Duration::from_millis(100));
    assert!(!launch.align_to_second);

    let sched = launch.sched.unwrap();
    assert_eq!(sched.policy, SchedPolicy::Rr);
    assert_eq!(sched.priority, 42);
    assert_eq!(launch.cpu_affinity, CpuAffinity::Set(vec![1, 2]));
}

#[test]
fn test_disabled_realtime_leaves_threads_alone() {
    let file = write_config("[realtime]\nenabled = false\ncpu_affinity = 3\n");
    let config = WaveConfig::from_file(file.path()).unwrap();

    let launch = OrchestratorConfig::from_wave_config(&config).unwrap();
    assert!(launch.sched.is_none());
    assert_eq!(launch.cpu_affinity, CpuAffinity::None);
}

#[test]
fn test_invalid_files_are_rejected() {
    let zero = write_config("period = \"0s\"\n");
    let config = WaveConfig::from_file(zero.path()).unwrap();
    assert!(matches!(config.validate(), Err(WaveError::Config(_))));

    let priority = write_config("[realtime]\npriority = 0\n");
    let config = WaveConfig::from_file(priority.path()).unwrap();
    assert!(matches!(config.validate(), Err(WaveError::Config(_))));

    let garbage = write_config("period = 12\n");
    assert!(WaveConfig::from_file(garbage.path()).is_err());
}
