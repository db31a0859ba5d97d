//! Device health records and the background device poller.

use crate::context::{SharedCharger, SharedHealth, SharedInverter};
use crate::logging::{StructuredLogger, get_logger};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub ok: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Local>>,
}

impl ConnectionHealth {
    pub fn record_success(&mut self) {
        self.ok = true;
        self.last_error = None;
        self.consecutive_failures = 0;
        self.last_checked = Some(Local::now());
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.ok = false;
        self.last_error = Some(error.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_checked = Some(Local::now());
    }

    /// Failed at least once and has not recovered since
    pub fn is_known_dead(&self) -> bool {
        !self.ok && self.consecutive_failures > 0
    }
}

/// Polls the charger identification register on a fixed interval and,
/// when attached, watches the inverter heartbeat
pub struct HealthMonitor {
    charger: SharedCharger,
    health: SharedHealth,
    inverter: Option<(SharedInverter, SharedHealth)>,
    period: Duration,
    logger: StructuredLogger,
}

impl HealthMonitor {
    pub fn new(charger: SharedCharger, health: SharedHealth, period: Duration) -> Self {
        Self {
            charger,
            health,
            inverter: None,
            period,
            logger: get_logger("health"),
        }
    }

    /// Also track the inverter heartbeat and reconnect it after a fault
    pub fn with_inverter(mut self, inverter: SharedInverter, health: SharedHealth) -> Self {
        self.inverter = Some((inverter, health));
        self
    }

    /// Mirror the heartbeat's transmission results into the inverter
    /// health record. A dead heartbeat counts as a failure and triggers
    /// one reconnect; health recovers once the new heartbeat has sent.
    pub async fn check_inverter_once(&self) -> bool {
        let Some((inverter, health)) = &self.inverter else {
            return true;
        };
        let mut session = inverter.lock().await;
        if session.is_faulted() {
            let fault = session
                .link_status()
                .last_error
                .unwrap_or_else(|| "heartbeat stopped".to_string());
            let reconnected = session.reconnect().await;
            drop(session);
            let mut health = health.write().await;
            match reconnected {
                Ok(()) => health.record_failure(fault),
                Err(e) => health.record_failure(format!("{}; reconnect failed: {}", fault, e)),
            }
            self.logger.warn(&format!(
                "Inverter fault ({} consecutive failures): {}",
                health.consecutive_failures,
                health.last_error.as_deref().unwrap_or_default()
            ));
            return false;
        }

        let status = session.link_status();
        let running = session.is_running();
        drop(session);
        let mut health = health.write().await;
        if status.consecutive_failures > 0 {
            health.record_failure(status.last_error.unwrap_or_default());
            false
        } else if running && status.attempts > 0 {
            if !health.ok {
                self.logger.info("Inverter heartbeat healthy");
            }
            health.record_success();
            true
        } else {
            health.ok
        }
    }

    /// One identification read. A failed read drops the device handle so the next
    /// command starts from a fresh connection.
    pub async fn check_once(&self) -> bool {
        let mut charger = self.charger.lock().await;
        match charger.get_id().await {
            Some(_) => {
                let mut health = self.health.write().await;
                if !health.ok {
                    self.logger.info("Charger reachable");
                }
                health.record_success();
                true
            }
            None => {
                charger.disconnect();
                let mut health = self.health.write().await;
                health.record_failure("Identification read failed");
                self.logger.warn(&format!(
                    "Lost connection to charger ({} consecutive failures)",
                    health.consecutive_failures
                ));
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.logger
            .info(&format!("Health monitor started ({:?})", self.period));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = async {
                    self.check_once().await;
                    self.check_inverter_once().await;
                } => {}
            }
        }
        self.logger.info("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_until_success() {
        let mut h = ConnectionHealth::default();
        assert!(!h.is_known_dead());
        h.record_failure("timeout");
        h.record_failure("timeout");
        assert!(h.is_known_dead());
        assert_eq!(h.consecutive_failures, 2);
        assert_eq!(h.last_error.as_deref(), Some("timeout"));
        h.record_success();
        assert!(h.ok);
        assert_eq!(h.consecutive_failures, 0);
        assert!(h.last_error.is_none());
    }
}
