//! Configuration management for Zerogrid
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. Every section has defaults matching a single
//! household deployment (one P1 meter, one RD60xx charger, one grid-tie
//! inverter), so a partial file only needs to list what differs.

use crate::error::{Result, ZeroGridError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Smart-meter serial line
    pub meter: MeterConfig,

    /// Register-addressed DC charger
    pub charger: ChargerConfig,

    /// Packet-addressed grid-tie inverter
    pub inverter: InverterConfig,

    /// Balancing loop tuning and limits
    pub controller: ControllerConfig,

    /// Remote command server
    pub rpc: RpcConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Smart-meter serial parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Serial device path
    pub port: String,

    /// Line speed; framing is always 8N1
    pub baud_rate: u32,

    /// Upper bound for one telegram read
    pub timeout_ms: u64,

    /// Codes that must be present for a telegram to count as complete
    pub required_codes: Vec<String>,
}

/// Charger (RD60xx-family power supply) parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargerConfig {
    /// Serial device path
    pub port: String,

    pub baud_rate: u32,

    /// Register-protocol slave address
    pub address: u8,

    /// Per-transaction response deadline
    pub timeout_ms: u64,

    /// Attempts per read/write before giving up with "no data"
    pub retries: u32,

    /// Pause between attempts
    pub retry_delay_ms: u64,

    /// Pause between connect attempts
    pub reconnect_backoff_ms: u64,
}

/// Grid-tie inverter parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    /// Serial device path; when absent the first port that opens is used
    pub port: Option<String>,

    pub baud_rate: u32,

    pub timeout_ms: u64,

    /// Power ceiling in watts
    pub max_power: u16,

    /// Heartbeat period
    pub send_interval_ms: u64,

    /// Power commanded when the session starts
    pub start_power: u16,

    /// Pause between connection attempts while the port is unavailable
    pub reconnect_backoff_ms: u64,
}

/// PID balancing loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Run the control loop at all
    pub enabled: bool,

    pub kp: f64,
    pub ki: f64,
    pub kd: f64,

    /// Target grid exchange in kW (0 = zero export, zero import)
    pub setpoint: f64,

    /// Most negative output (charging) in kW
    pub min_output_kw: f64,

    /// Most positive output (inverter discharge) in kW
    pub max_output_kw: f64,

    /// No actuator change while |error| is within this band (kW)
    pub deadband_kw: f64,

    /// Optional per-cycle rate limit as a ratio of the previous output
    pub max_change_ratio: Option<f64>,

    /// Charger voltage setpoint in volts, also the fallback for current routing
    pub charge_voltage: f64,

    /// Charging current ceiling in amperes
    pub max_charging_current: f64,

    pub poll_interval_ms: u64,

    /// A cycle that runs longer than this is treated as a fault
    pub cycle_timeout_ms: u64,

    /// Consecutive stale or incomplete telegrams tolerated before faulting
    pub max_stale_cycles: u32,

    /// Append-only CSV record of every cycle
    pub log_file: String,

    /// Drive the actuators through a remote command server (host:port)
    /// instead of the local sessions
    pub remote: Option<String>,
}

/// Command server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,

    /// Listen address
    pub host: String,

    pub port: u16,

    /// Maximum concurrently served connections
    pub max_workers: usize,

    /// Connections idle for longer than this are closed
    pub idle_timeout_secs: u64,

    /// Charger health check period
    pub health_interval_secs: u64,

    /// Client-side response deadline
    pub request_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Override for the console layer
    pub console_level: Option<String>,

    /// Override for the file layer
    pub file_level: Option<String>,

    /// Path to log file (its directory receives the daily rotated files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl MeterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ChargerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl InverterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }
}

impl RpcConfig {
    /// `host:port` string for binding the listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from an explicit path, or the first default
    /// location that exists, or fall back to built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let default_paths = [
            "zerogrid.yaml",
            "/data/zerogrid.yaml",
            "/etc/zerogrid/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.meter.port.is_empty() {
            return Err(ZeroGridError::validation(
                "meter.port",
                "Port cannot be empty",
            ));
        }
        if self.meter.baud_rate == 0 {
            return Err(ZeroGridError::validation(
                "meter.baud_rate",
                "Must be greater than 0",
            ));
        }

        if self.charger.port.is_empty() {
            return Err(ZeroGridError::validation(
                "charger.port",
                "Port cannot be empty",
            ));
        }
        if self.charger.retries == 0 {
            return Err(ZeroGridError::validation(
                "charger.retries",
                "At least one attempt is required",
            ));
        }
        if self.charger.timeout_ms == 0 {
            return Err(ZeroGridError::validation(
                "charger.timeout_ms",
                "Must be greater than 0",
            ));
        }

        if self.inverter.max_power == 0 {
            return Err(ZeroGridError::validation(
                "inverter.max_power",
                "Must be greater than 0",
            ));
        }
        if self.inverter.start_power > self.inverter.max_power {
            return Err(ZeroGridError::validation(
                "inverter.start_power",
                "Cannot exceed max_power",
            ));
        }
        if self.inverter.send_interval_ms == 0 {
            return Err(ZeroGridError::validation(
                "inverter.send_interval_ms",
                "Must be greater than 0",
            ));
        }

        let c = &self.controller;
        if c.min_output_kw > 0.0 || c.max_output_kw < 0.0 || c.min_output_kw >= c.max_output_kw {
            return Err(ZeroGridError::validation(
                "controller.min_output_kw",
                "Output range must satisfy min <= 0 <= max and min < max",
            ));
        }
        if c.deadband_kw < 0.0 {
            return Err(ZeroGridError::validation(
                "controller.deadband_kw",
                "Must not be negative",
            ));
        }
        if c.charge_voltage <= 0.0 {
            return Err(ZeroGridError::validation(
                "controller.charge_voltage",
                "Must be positive",
            ));
        }
        if c.max_charging_current <= 0.0 {
            return Err(ZeroGridError::validation(
                "controller.max_charging_current",
                "Must be positive",
            ));
        }
        if matches!(c.max_change_ratio, Some(r) if r <= 0.0) {
            return Err(ZeroGridError::validation(
                "controller.max_change_ratio",
                "Must be positive when set",
            ));
        }
        if c.poll_interval_ms == 0 {
            return Err(ZeroGridError::validation(
                "controller.poll_interval_ms",
                "Must be greater than 0",
            ));
        }
        if c.cycle_timeout_ms == 0 {
            return Err(ZeroGridError::validation(
                "controller.cycle_timeout_ms",
                "Must be greater than 0",
            ));
        }

        if self.rpc.port == 0 {
            return Err(ZeroGridError::validation(
                "rpc.port",
                "Port must be greater than 0",
            ));
        }
        if self.rpc.max_workers == 0 {
            return Err(ZeroGridError::validation(
                "rpc.max_workers",
                "Must be greater than 0",
            ));
        }
        if self.rpc.health_interval_secs == 0 {
            return Err(ZeroGridError::validation(
                "rpc.health_interval_secs",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rpc.port, 6030);
        assert_eq!(config.rpc.max_workers, 20);
        assert_eq!(config.inverter.max_power, 900);
        assert_eq!(config.inverter.baud_rate, 4800);
        assert_eq!(config.charger.retries, 3);
        assert!(config.controller.max_change_ratio.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.charger.port = String::new();
        assert!(config.validate().is_err());

        config = Config::default();
        config.inverter.start_power = 1000;
        assert!(config.validate().is_err());

        config = Config::default();
        config.controller.min_output_kw = 0.5;
        assert!(config.validate().is_err());

        config = Config::default();
        config.controller.max_change_ratio = Some(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "inverter:\n  port: /dev/ttyACM0\ncontroller:\n  kp: 0.8\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.inverter.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.inverter.max_power, 900);
        assert!((config.controller.kp - 0.8).abs() < f64::EPSILON);
        assert!((config.controller.ki - 0.05).abs() < f64::EPSILON);
    }
}
