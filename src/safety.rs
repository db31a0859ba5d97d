//! Supervised control loop
//!
//! A cycle that errors, panics or overruns its deadline is a safety fault:
//! both actuators go to zero, the PID history is dropped and the next
//! cycle runs as usual.

use crate::config::ControllerConfig;
use crate::controller::{CycleReport, PowerBalanceController};
use crate::error::{Result, ZeroGridError};
use crate::logging::{StructuredLogger, get_logger};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct SafetySupervisor {
    controller: PowerBalanceController,
    poll_interval: Duration,
    cycle_timeout: Duration,
    prepared: bool,
    cycles: u64,
    faults: u64,
    logger: StructuredLogger,
}

impl SafetySupervisor {
    pub fn new(controller: PowerBalanceController, config: &ControllerConfig) -> Self {
        Self {
            controller,
            poll_interval: config.poll_interval(),
            cycle_timeout: config.cycle_timeout(),
            prepared: false,
            cycles: 0,
            faults: 0,
            logger: get_logger("safety"),
        }
    }

    pub fn controller(&self) -> &PowerBalanceController {
        &self.controller
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Run one cycle under supervision. On a fault the actuators have been
    /// zeroed by the time this returns the `Safety` error.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycles += 1;
        let guarded = AssertUnwindSafe(self.controller.run_cycle()).catch_unwind();
        let fault = match timeout(self.cycle_timeout, guarded).await {
            Ok(Ok(Ok(report))) => return Ok(report),
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(panic)) => format!("cycle panicked: {}", panic_message(panic.as_ref())),
            Err(_) => format!("cycle exceeded {:?}", self.cycle_timeout),
        };

        self.faults += 1;
        self.logger.error(&format!(
            "Control cycle fault ({} total): {}",
            self.faults, fault
        ));
        self.controller.reset();
        self.force_safe().await;
        Err(ZeroGridError::safety(fault))
    }

    /// Zero both actuators, bounded by the cycle deadline
    pub async fn force_safe(&mut self) -> bool {
        let guarded = AssertUnwindSafe(self.controller.force_safe()).catch_unwind();
        match timeout(self.cycle_timeout, guarded).await {
            Ok(Ok(Ok(()))) => {
                self.logger.info("Actuators forced to zero");
                true
            }
            Ok(Ok(Err(e))) => {
                self.logger
                    .error(&format!("Failed to zero actuators: {}", e));
                false
            }
            Ok(Err(panic)) => {
                self.logger.error(&format!(
                    "Zeroing actuators panicked: {}",
                    panic_message(panic.as_ref())
                ));
                false
            }
            Err(_) => {
                self.logger.error("Zeroing actuators timed out");
                false
            }
        }
    }

    async fn prepare(&mut self) {
        match timeout(self.cycle_timeout, self.controller.prepare()).await {
            Ok(Ok(())) => self.prepared = true,
            Ok(Err(e)) => self.logger.warn(&format!("Actuator preparation failed: {}", e)),
            Err(_) => self.logger.warn("Actuator preparation timed out"),
        }
    }

    /// Cycle every poll interval until `cancel` fires, then zero the
    /// actuators. Preparation is retried at the start of each cycle until
    /// it succeeds.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.logger.info(&format!(
            "Control loop started ({:?} interval, {:?} deadline)",
            self.poll_interval, self.cycle_timeout
        ));
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = async {
                    if !self.prepared {
                        self.prepare().await;
                    }
                    let _ = self.run_cycle().await;
                } => {}
            }
        }

        self.logger.info(&format!(
            "Control loop stopping after {} cycles ({} faults)",
            self.cycles, self.faults
        ));
        self.force_safe().await;
    }
}
