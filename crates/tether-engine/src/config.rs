//! Simulation and server configuration, validation, and error types.
//!
//! [`SimulationConfig`] is the per-simulation input (tick rate, thread
//! name). [`ServerConfig`] controls the registry's reaper and the defaults
//! applied to simulations created without an explicit configuration.
//! Both are plain structs with a `Default` and a `validate()` that checks
//! invariants before any thread is spawned.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use tether_core::StartError;

// ── ThreadMode ────────────────────────────────────────────────────

/// Where a newly created simulation runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreadMode {
    /// Created parked. The builder runs on the caller's thread and the
    /// simulation waits for `start_simulation`.
    Local,
    /// Started immediately on a dedicated thread. The builder runs on that
    /// thread before the first tick.
    Thread,
}

// ── SimulationConfig ──────────────────────────────────────────────

/// Configuration for one simulation.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    /// Target ticks per second. `0.0` runs unthrottled. Default: 60.
    pub tick_rate_hz: f64,
    /// Name for the worker thread. `None` derives one from the identity.
    pub thread_name: Option<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60.0,
            thread_name: None,
        }
    }
}

impl SimulationConfig {
    /// An unthrottled configuration, mostly useful in tests.
    pub fn unthrottled() -> Self {
        Self {
            tick_rate_hz: 0.0,
            ..Self::default()
        }
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.tick_rate_hz;
        let representable = rate == 0.0 || Duration::try_from_secs_f64(1.0 / rate).is_ok();
        if !rate.is_finite() || rate < 0.0 || !representable {
            return Err(ConfigError::InvalidTickRate { value: rate });
        }
        Ok(())
    }

    /// Time budget of one tick, or `None` when unthrottled.
    pub fn tick_budget(&self) -> Option<Duration> {
        if self.tick_rate_hz > 0.0 {
            Duration::try_from_secs_f64(1.0 / self.tick_rate_hz).ok()
        } else {
            None
        }
    }
}

// ── ServerConfig ──────────────────────────────────────────────────

/// Configuration for [`SimulationServer`](crate::server::SimulationServer).
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// How often the reaper sweeps the delete queue. Default: 1 s.
    pub reaper_interval: Duration,
    /// Applied by `create_simulation` when no configuration is given.
    pub default_simulation: SimulationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(1),
            default_simulation: SimulationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::ReaperIntervalZero);
        }
        self.default_simulation.validate()
    }
}

// ── ConfigError ───────────────────────────────────────────────────

/// Errors detected while validating configuration or bringing a
/// simulation up.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// tick_rate_hz is not a finite non-negative number, or its tick
    /// budget does not fit in a `Duration`.
    InvalidTickRate {
        /// The invalid value.
        value: f64,
    },
    /// reaper_interval is zero.
    ReaperIntervalZero,
    /// A background thread could not be spawned.
    ThreadSpawnFailed {
        /// Description of which thread failed.
        reason: String,
    },
    /// The server is shutting down and accepts no new simulations.
    ShuttingDown,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTickRate { value } => {
                write!(
                    f,
                    "tick_rate_hz must be finite, non-negative and give a representable tick budget, got {value}"
                )
            }
            Self::ReaperIntervalZero => write!(f, "reaper_interval must be non-zero"),
            Self::ThreadSpawnFailed { reason } => write!(f, "thread spawn failed: {reason}"),
            Self::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

impl Error for ConfigError {}

impl From<StartError> for ConfigError {
    fn from(e: StartError) -> Self {
        Self::ThreadSpawnFailed {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SimulationConfig::default().validate().unwrap();
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_rate_is_unthrottled() {
        let cfg = SimulationConfig::unthrottled();
        cfg.validate().unwrap();
        assert_eq!(cfg.tick_budget(), None);
    }

    #[test]
    fn sixty_hz_budget() {
        let budget = SimulationConfig::default().tick_budget().unwrap();
        assert!((budget.as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_tick_rates() {
        for value in [-1.0, f64::NAN, f64::INFINITY, 1e-20, f64::MIN_POSITIVE] {
            let cfg = SimulationConfig {
                tick_rate_hz: value,
                thread_name: None,
            };
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::InvalidTickRate { .. })
            ));
        }
    }

    #[test]
    fn slow_but_representable_rate_is_accepted() {
        let cfg = SimulationConfig {
            tick_rate_hz: 0.5,
            thread_name: None,
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.tick_budget(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn rejects_zero_reaper_interval() {
        let cfg = ServerConfig {
            reaper_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ReaperIntervalZero));
    }
}
