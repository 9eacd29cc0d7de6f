//! Square-wave daemon entry point.
//!
//! Locks memory, claims the output line, launches the two phase-locked
//! tasks, then supervises them from the main thread until a termination
//! signal (or the optional run-time limit) arrives.

mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use sqwave_common::config::{OutputDriver, WaveConfig};
use sqwave_common::TaskStats;
use sqwave_gpio::{open_sink, OutputSink};
use sqwave_runtime::{
    init_realtime, square_wave_phases, MonotonicClock, Orchestrator, OrchestratorConfig,
    TaskReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::signals::{wait_for_shutdown, SignalHandler};

/// Interval between status lines from the supervising thread.
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// How long stopped tasks get to exit before the line is released anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Square-wave daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "sqwave-daemon",
    about = "Square-wave generator - drives a GPIO line from two phase-locked real-time tasks",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use the simulated output line instead of a GPIO chip.
    #[arg(long, short = 's')]
    simulated: bool,

    /// GPIO character device (overrides config file).
    #[arg(long, value_name = "DEVICE")]
    chip: Option<PathBuf>,

    /// Line offset on the chip (overrides config file).
    #[arg(long, value_name = "OFFSET")]
    line: Option<u32>,

    /// Wave period, e.g. "1ms" or "250us" (overrides config file).
    #[arg(long, value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// Stop after this long, e.g. "30s" (default: run until signalled).
    #[arg(long, value_parser = humantime::parse_duration)]
    max_runtime: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting square-wave daemon");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    info!(
        period = %humantime::format_duration(config.period),
        driver = ?config.output.driver,
        chip = %config.output.chip.display(),
        line = config.output.line,
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;

    run_daemon(&config, &signal_handler, args.max_runtime)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "sqwave_daemon={level},sqwave_runtime={level},sqwave_gpio={level},sqwave_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `SQWAVE_CONFIG_PATH` environment variable
/// 3. `/etc/sqwave/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<WaveConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return WaveConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("SQWAVE_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from SQWAVE_CONFIG_PATH");
            return WaveConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from SQWAVE_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "SQWAVE_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for candidate in ["/etc/sqwave/config.toml", "config/default.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!(?path, "Loading config file");
            return WaveConfig::from_file(&path)
                .with_context(|| format!("Failed to load config from {path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(WaveConfig::default())
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut WaveConfig, args: &Args) {
    if args.simulated {
        config.output.driver = OutputDriver::Simulated;
    }
    if let Some(chip) = &args.chip {
        config.output.chip.clone_from(chip);
    }
    if let Some(line) = args.line {
        config.output.line = line;
    }
    if let Some(period) = args.period {
        config.period = period;
    }
}

/// Bring the wave up, supervise it, and tear it down.
fn run_daemon(
    config: &WaveConfig,
    signal_handler: &SignalHandler,
    max_runtime: Option<Duration>,
) -> Result<()> {
    let rt_status =
        init_realtime(&config.realtime).context("Failed to initialize real-time environment")?;
    info!(memory_locked = rt_status.memory_locked, "Real-time environment ready");

    let sink = open_sink(&config.output).context("Failed to open output line")?;
    info!(chip = %config.output.chip.display(), line = config.output.line, "Output line claimed");

    let orchestrator_config = match OrchestratorConfig::from_wave_config(config) {
        Ok(c) => c,
        Err(e) => {
            release(&sink);
            return Err(e).context("Invalid task configuration");
        }
    };
    let period = orchestrator_config.period;
    let orchestrator = Orchestrator::new(MonotonicClock::new(), Arc::clone(&sink), orchestrator_config);

    let handle = match orchestrator.launch(&square_wave_phases(period)) {
        Ok(handle) => handle,
        Err(e) => {
            release(&sink);
            return Err(e).context("Failed to launch periodic tasks");
        }
    };

    info!(tasks = ?handle.task_names(), "Square wave running");

    let started = Instant::now();
    let mut last_status = Instant::now();

    loop {
        if wait_for_shutdown(signal_handler, Duration::from_millis(50)) {
            info!("Shutdown requested, stopping tasks");
            break;
        }

        if signal_handler.take_reload_request() {
            info!("Configuration reload is not supported, ignoring SIGHUP");
        }

        if max_runtime.is_some_and(|limit| started.elapsed() >= limit) {
            info!(
                runtime = %humantime::format_duration(started.elapsed()),
                "Maximum runtime reached"
            );
            break;
        }

        if last_status.elapsed() >= STATUS_LOG_INTERVAL {
            last_status = Instant::now();
            for (task, stats) in handle.stats() {
                log_stats(&task, &stats);
            }
            log_stats("all", &handle.total_stats());
        }
    }

    info!("Shutting down...");

    handle.stop();
    let grace_end = Instant::now() + SHUTDOWN_GRACE;
    while !handle.is_finished() && Instant::now() < grace_end {
        std::thread::sleep(Duration::from_millis(1));
    }
    if !handle.is_finished() {
        warn!(
            grace = %humantime::format_duration(SHUTDOWN_GRACE),
            "Tasks still running, releasing output line anyway"
        );
    }
    // A task still inside `set` gets `Closed` back, which it only counts.
    release(&sink);
    let joined = handle.join();

    let reports = joined.context("Failed to join periodic tasks")?;
    log_summary(&reports, signal_handler, started.elapsed());

    Ok(())
}

/// Close the output line, logging instead of failing.
fn release(sink: &Arc<dyn OutputSink>) {
    if let Err(e) = sink.close() {
        error!(error = %e, "Failed to release output line");
    }
}

fn log_stats(task: &str, stats: &TaskStats) {
    info!(
        task,
        emissions = stats.emissions,
        write_failures = stats.write_failures,
        overruns = stats.overruns,
        last_deadline = ?stats.last_deadline.map(|d| d.to_string()),
        "Periodic status"
    );
}

fn log_summary(reports: &[TaskReport], signal_handler: &SignalHandler, uptime: Duration) {
    for report in reports {
        info!(
            task = %report.name,
            iterations = report.iterations,
            final_state = %report.final_state,
            emissions = report.stats.emissions,
            write_failures = report.stats.write_failures,
            overruns = report.stats.overruns,
            "Task summary"
        );
    }
    let total = reports
        .iter()
        .map(|r| r.stats)
        .fold(TaskStats::default(), TaskStats::combine);
    info!(
        emissions = total.emissions,
        write_failures = total.write_failures,
        overruns = total.overruns,
        signals = signal_handler.state().signal_count(),
        uptime_secs = uptime.as_secs(),
        "Daemon shutdown complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["sqwave-daemon", "--simulated"]);
        assert!(args.simulated);
        assert!(args.config.is_none());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_args_with_overrides() {
        let args = Args::parse_from([
            "sqwave-daemon",
            "-c",
            "wave.toml",
            "--chip",
            "/dev/gpiochip1",
            "--line",
            "17",
            "--period",
            "250us",
            "--max-runtime",
            "3s",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("wave.toml")));
        assert_eq!(args.period, Some(Duration::from_micros(250)));
        assert_eq!(args.max_runtime, Some(Duration::from_secs(3)));

        let mut config = WaveConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.output.chip, PathBuf::from("/dev/gpiochip1"));
        assert_eq!(config.output.line, 17);
        assert_eq!(config.period, Duration::from_micros(250));
        assert_eq!(config.output.driver, OutputDriver::Gpio);
    }

    #[test]
    fn test_load_config_from_argument() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "period = \"2ms\"\n[output]\nline = 4").unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let args = Args::parse_from(["sqwave-daemon", "--config", path.as_str()]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.period, Duration::from_millis(2));
        assert_eq!(config.output.line, 4);
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        let args = Args::parse_from(["sqwave-daemon", "--config", "/nonexistent/sqwave.toml"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_default_config() {
        let config = WaveConfig::default();
        assert_eq!(config.period.as_millis(), 1);
        assert_eq!(config.output.line, 23);
    }

    #[test]
    fn test_simulated_run_stops_at_max_runtime() {
        let mut config = WaveConfig::default();
        config.output.driver = OutputDriver::Simulated;
        config.realtime.enabled = false;
        config.align_to_second = false;
        config.start_delay = Duration::from_millis(5);

        let handler = SignalHandler::default();
        run_daemon(&config, &handler, Some(Duration::from_millis(60))).unwrap();
    }

    #[test]
    fn test_shutdown_during_start_delay_returns_promptly() {
        let mut config = WaveConfig::default();
        config.output.driver = OutputDriver::Simulated;
        config.realtime.enabled = false;
        config.align_to_second = false;
        config.start_delay = Duration::from_secs(4);

        let handler = SignalHandler::default();
        handler.request_shutdown();

        let start = Instant::now();
        run_daemon(&config, &handler, None).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_missing_chip_is_reported() {
        let mut config = WaveConfig::default();
        config.realtime.enabled = false;
        config.output.chip = PathBuf::from("/dev/does-not-exist-gpiochip");

        let handler = SignalHandler::default();
        let err = run_daemon(&config, &handler, Some(Duration::from_millis(10))).unwrap_err();
        assert!(format!("{err:#}").contains("hardware unavailable"));
    }
}
