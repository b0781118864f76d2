//! Runtime defaults loaded from TOML.
//!
//! ```toml
//! connection_timeout = 2.0
//! write_timeout = 5.0
//! settle_time = 0.0
//! positioner_timeout = 30.0
//! motion_tick = 0.02
//! ```
//!
//! Every field is optional. Durations are in seconds.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HwError, HwResult};

/// Defaults applied to signals, positioners and device connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Deadline for `connect()`.
    pub connection_timeout: f64,
    /// Timeout of the Status returned by `Signal::set()`; absent means none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_timeout: Option<f64>,
    /// Settle time of the Status returned by `Signal::set()`.
    pub settle_time: f64,
    /// Timeout of a positioner move; absent means none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positioner_timeout: Option<f64>,
    /// Update period of simulated motion.
    pub motion_tick: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connection_timeout: 2.0,
            write_timeout: None,
            settle_time: 0.0,
            positioner_timeout: None,
            motion_tick: 0.02,
        }
    }
}

impl RuntimeConfig {
    /// Deadline for `connect()`.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout)
    }

    /// Timeout for signal writes.
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout.map(Duration::from_secs_f64)
    }

    /// Settle time for signal writes.
    pub fn settle_time(&self) -> Duration {
        Duration::from_secs_f64(self.settle_time)
    }

    /// Timeout for positioner moves.
    pub fn positioner_timeout(&self) -> Option<Duration> {
        self.positioner_timeout.map(Duration::from_secs_f64)
    }

    /// Update period of simulated motion.
    pub fn motion_tick(&self) -> Duration {
        Duration::from_secs_f64(self.motion_tick)
    }

    /// Check that every duration is finite and non-negative, and that the
    /// motion tick is positive.
    pub fn validate(&self) -> HwResult<()> {
        let fields = [
            ("connection_timeout", Some(self.connection_timeout)),
            ("write_timeout", self.write_timeout),
            ("settle_time", Some(self.settle_time)),
            ("positioner_timeout", self.positioner_timeout),
            ("motion_tick", Some(self.motion_tick)),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(HwError::Configuration(format!(
                        "{field} must be a non-negative number of seconds, got {value}"
                    )));
                }
            }
        }
        if self.motion_tick == 0.0 {
            return Err(HwError::Configuration("motion_tick must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns [`HwError::Configuration`] if the file cannot be read, parsed
/// or validated.
pub fn load_config<P: AsRef<Path>>(path: P) -> HwResult<RuntimeConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| HwError::Configuration(format!("{}: {e}", path.display())))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string.
///
/// # Errors
///
/// Returns [`HwError::Configuration`] if the TOML is invalid or fails
/// validation.
pub fn parse_config(content: &str) -> HwResult<RuntimeConfig> {
    let config: RuntimeConfig =
        toml::from_str(content).map_err(|e| HwError::Configuration(e.message().to_string()))?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.write_timeout(), None);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
connection_timeout = 1.5
write_timeout = 5.0
settle_time = 0.25
positioner_timeout = 30.0
motion_tick = 0.01
"#;

        let config = parse_config(toml).unwrap();
        assert_eq!(config.connection_timeout(), Duration::from_millis(1500));
        assert_eq!(config.write_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.settle_time(), Duration::from_millis(250));
        assert_eq!(config.motion_tick(), Duration::from_millis(10));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let err = parse_config("settle_time = -1.0").unwrap_err();
        assert!(matches!(err, HwError::Configuration(_)));
    }

    #[test]
    fn test_zero_tick_rejected() {
        assert!(parse_config("motion_tick = 0.0").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse_config("velocity = 3.0").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config("/nonexistent/device-contract.toml").unwrap_err();
        assert!(matches!(err, HwError::Configuration(_)));
    }
}
