//! Shared device context
//!
//! Owns both hardware sessions behind one lock each, their health records
//! and the shutdown token. Every task gets a clone at construction.

use crate::charger::ChargerSession;
use crate::config::Config;
use crate::controller::Actuators;
use crate::error::{Result, ZeroGridError};
use crate::inverter::InverterSession;
use crate::rpc::ConnectionHealth;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

pub type SharedCharger = Arc<Mutex<ChargerSession>>;
pub type SharedInverter = Arc<Mutex<InverterSession>>;
pub type SharedHealth = Arc<RwLock<ConnectionHealth>>;

#[derive(Clone)]
pub struct DeviceContext {
    pub charger: SharedCharger,
    pub inverter: SharedInverter,
    pub charger_health: SharedHealth,
    pub inverter_health: SharedHealth,
    pub shutdown: CancellationToken,
}

impl DeviceContext {
    /// Sessions for the configured ports; nothing is opened yet
    pub fn new(config: &Config) -> Self {
        Self::from_sessions(
            ChargerSession::new(&config.charger),
            InverterSession::new(&config.inverter),
        )
    }

    pub fn from_sessions(charger: ChargerSession, inverter: InverterSession) -> Self {
        Self {
            charger: Arc::new(Mutex::new(charger)),
            inverter: Arc::new(Mutex::new(inverter)),
            charger_health: SharedHealth::default(),
            inverter_health: SharedHealth::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Retry the charger connection on `backoff` until it succeeds or
    /// shutdown is requested. The session lock is held per attempt only,
    /// so commands and the control loop keep running in between.
    pub async fn connect_charger(&self, backoff: Duration) -> Result<()> {
        loop {
            let attempt = {
                let mut charger = self.charger.lock().await;
                if charger.is_connected() {
                    Ok(())
                } else {
                    charger.connect_once().await
                }
            };
            match attempt {
                Ok(()) => {
                    self.charger_health.write().await.record_success();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Charger connect failed ({}), retrying in {:?}", e, backoff);
                    self.charger_health.write().await.record_failure(e.to_string());
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(ZeroGridError::cancelled("Charger connect abandoned"));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Open the inverter and start its heartbeat, retrying on `backoff`
    /// until it works or shutdown is requested
    pub async fn connect_inverter(&self, backoff: Duration, start_power: u16) -> Result<()> {
        loop {
            let attempt = {
                let mut inverter = self.inverter.lock().await;
                if inverter.is_running() {
                    Ok(())
                } else if inverter.is_faulted() {
                    inverter.reconnect().await
                } else {
                    match inverter.connect().await {
                        Ok(()) => inverter.start(start_power),
                        Err(e) => Err(e),
                    }
                }
            };
            match attempt {
                Ok(()) => {
                    self.inverter_health.write().await.record_success();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Inverter connect failed ({}), retrying in {:?}", e, backoff);
                    self.inverter_health.write().await.record_failure(e.to_string());
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(ZeroGridError::cancelled("Inverter connect abandoned"));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Zero both actuators directly, bypassing the controller
    pub async fn force_safe(&self) -> Result<()> {
        LocalActuators::new(self).force_safe().await
    }
}

/// The controller's view of the local sessions
pub struct LocalActuators {
    charger: SharedCharger,
    inverter: SharedInverter,
    inverter_health: SharedHealth,
}

impl LocalActuators {
    pub fn new(ctx: &DeviceContext) -> Self {
        Self {
            charger: ctx.charger.clone(),
            inverter: ctx.inverter.clone(),
            inverter_health: ctx.inverter_health.clone(),
        }
    }
}

#[async_trait]
impl Actuators for LocalActuators {
    async fn prepare(&mut self, charge_voltage: f64) -> Result<()> {
        {
            let mut charger = self.charger.lock().await;
            if !charger.set_v_set(charge_voltage).await {
                return Err(ZeroGridError::transport(
                    "Charger did not accept the voltage setpoint",
                ));
            }
            if charger.is_output().await != Some(true) && !charger.set_output(true).await {
                return Err(ZeroGridError::transport(
                    "Charger output could not be enabled",
                ));
            }
        }
        self.set_inverter_power(0).await?;
        Ok(())
    }

    async fn set_inverter_power(&mut self, watts: u16) -> Result<u16> {
        let mut inverter = self.inverter.lock().await;
        let commanded = inverter.modify_power(i64::from(watts));
        let sent = inverter.transmit().await;
        drop(inverter);

        let mut health = self.inverter_health.write().await;
        match sent {
            Ok(()) => {
                health.record_success();
                Ok(commanded)
            }
            Err(e) => {
                health.record_failure(e.to_string());
                Err(e)
            }
        }
    }

    async fn set_charger_current(&mut self, amps: f64) -> Result<()> {
        let mut charger = self.charger.lock().await;
        if charger.set_i_set(amps).await {
            Ok(())
        } else {
            Err(ZeroGridError::transport(format!(
                "Charger did not confirm {:.3} A",
                amps
            )))
        }
    }

    async fn charger_voltage(&mut self) -> Result<Option<f64>> {
        Ok(self.charger.lock().await.get_v_out().await)
    }
}
