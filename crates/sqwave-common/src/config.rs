//! Configuration structures for the square-wave generator.
//!
//! Supports TOML deserialization with defaults that reproduce the classic
//! demo: a 1 ms wave on line 23 of `/dev/gpiochip0`, driven by two
//! `SCHED_FIFO` tasks at priority 80 that start two seconds after launch.

use crate::error::{WaveError, WaveResult};
use crate::level::Level;
use crate::time::Period;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Longest consumer label the GPIO uAPI accepts (32 bytes including NUL).
pub const MAX_CONSUMER_LEN: usize = 31;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveConfig {
    /// Full period of the generated wave.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Grace period between launch and the first emission.
    #[serde(with = "humantime_serde")]
    pub start_delay: Duration,

    /// Align the first deadline to a whole second before adding the start delay.
    pub align_to_second: bool,

    /// Log task counters every this many iterations (0 disables).
    pub status_interval: u64,

    /// Output line configuration.
    pub output: OutputConfig,

    /// Real-time configuration.
    pub realtime: RealtimeConfig,
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1),
            start_delay: Duration::from_secs(2),
            align_to_second: true,
            status_interval: 10_000,
            output: OutputConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

/// Output sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Which sink implementation to open.
    pub driver: OutputDriver,

    /// GPIO character device.
    pub chip: PathBuf,

    /// Line offset on the chip.
    pub line: u32,

    /// Level driven when the line is first claimed.
    pub initial: Level,

    /// Consumer label shown by `gpioinfo`.
    pub consumer: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            driver: OutputDriver::Gpio,
            chip: PathBuf::from("/dev/gpiochip0"),
            line: 23,
            initial: Level::Low,
            consumer: String::from("square_wave"),
        }
    }
}

/// Supported output sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputDriver {
    /// Linux GPIO character device.
    #[default]
    Gpio,
    /// In-memory line for testing without hardware.
    Simulated,
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Apply scheduling attributes and memory locking at all.
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr", or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPU affinity for the task threads.
    pub cpu_affinity: CpuAffinity,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,

    /// Treat missing RT privileges as a fatal startup error.
    /// When false, EPERM from mlockall or the scheduler is logged and
    /// the wave runs without real-time guarantees.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: SchedPolicy::Fifo,
            priority: 80,
            cpu_affinity: CpuAffinity::None,
            lock_memory: true,
            fail_fast: true,
        }
    }
}

impl RealtimeConfig {
    /// Scheduling attributes shared by every task thread.
    #[must_use]
    pub fn sched_attrs(&self) -> SchedAttrs {
        SchedAttrs {
            policy: self.policy,
            priority: self.priority,
            inherit: InheritSched::Explicit,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

/// Where a spawned thread takes its scheduling attributes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InheritSched {
    /// Attributes are set on the thread itself, never copied from the spawner.
    #[default]
    Explicit,
    /// Attributes are copied from the spawning thread.
    Inherit,
}

/// Scheduling attributes applied to every task thread at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedAttrs {
    /// Scheduler policy.
    pub policy: SchedPolicy,
    /// Fixed priority.
    pub priority: u8,
    /// Inheritance mode.
    pub inherit: InheritSched,
}

impl Default for SchedAttrs {
    fn default() -> Self {
        RealtimeConfig::default().sched_attrs()
    }
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl CpuAffinity {
    /// CPUs named by this affinity, empty for [`CpuAffinity::None`].
    #[must_use]
    pub fn cpus(&self) -> Vec<usize> {
        match self {
            CpuAffinity::None => Vec::new(),
            CpuAffinity::Single(cpu) => vec![*cpu],
            CpuAffinity::Set(cpus) => cpus.clone(),
        }
    }
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("CPU index cannot be negative"));
                }
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

impl WaveConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// The configured period as a validated [`Period`].
    ///
    /// # Errors
    ///
    /// Returns an error for a zero or out-of-range period.
    pub fn period(&self) -> WaveResult<Period> {
        Period::from_duration(self.period)
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`WaveError::Config`] describing the first violated constraint.
    pub fn validate(&self) -> WaveResult<()> {
        let period = self.period()?;
        if period.half() == 0 {
            return Err(WaveError::Config(format!(
                "period {period} is too short to split into two phases"
            )));
        }
        if period.as_duration() >= Duration::from_secs(1) {
            tracing::warn!(%period, "Period of one second or more; each advance carries whole seconds");
        }

        if self.realtime.enabled
            && self.realtime.policy != SchedPolicy::Other
            && !(1..=99).contains(&self.realtime.priority)
        {
            return Err(WaveError::Config(format!(
                "priority {} is outside 1..=99 for {:?}",
                self.realtime.priority, self.realtime.policy
            )));
        }

        if self.output.consumer.len() > MAX_CONSUMER_LEN {
            return Err(WaveError::Config(format!(
                "consumer label {:?} is longer than {MAX_CONSUMER_LEN} bytes",
                self.output.consumer
            )));
        }

        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
