//! # Zerogrid - zero-export home battery controller
//!
//! Reads the utility meter's P1 telegrams and balances the grid connection
//! to zero by discharging a battery through a grid-tie inverter or charging
//! it from a register-controlled bench supply.
//!
//! ## Architecture
//!
//! - `meter`: P1 telegram reader with stale-data fallback
//! - `charger`: register-protocol charger session with retry and reconnect
//! - `inverter`: packet-protocol inverter session with heartbeat sender
//! - `controller`: PID balancing loop, actuator routing and cycle log
//! - `safety`: supervised control loop that zeroes the actuators on faults
//! - `rpc`: JSON command server, health monitor and client
//! - `context`: shared sessions, health records and shutdown token
//! - `config`: YAML configuration and validation
//! - `logging`: structured logging and tracing

pub mod charger;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod inverter;
pub mod logging;
pub mod meter;
pub mod rpc;
pub mod safety;

// Re-export commonly used types
pub use config::Config;
pub use context::DeviceContext;
pub use error::{Result, ZeroGridError};
