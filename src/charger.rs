//! RD60xx charger session
//!
//! Register-oriented driver for the DC power supply used as the battery
//! charger. All traffic goes through [`ChargerSession::read`] and
//! [`ChargerSession::write`], which clear the line, retry a fixed number of
//! times and reconnect on transport faults. When retries run out they return
//! `None`/`false` instead of an error; callers must check.

use crate::config::ChargerConfig;
use crate::error::{Result, ZeroGridError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

mod model;
pub mod registers;
pub mod rtu;
mod transport;

pub use model::{ChargerModel, Multipliers};
pub use transport::{RegisterBus, RegisterLink, RtuBus, RtuLink};

use registers as reg;

/// Connection state machine; [`ChargerSession::reconnect`] is the only way
/// from `Faulted` or `Disconnected` back to `Connected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// A transport fault was seen on the open handle
    Faulted,
}

/// A commanded value and whether the device acknowledged it.
///
/// Setters cache the rounded value even when every write attempt failed;
/// `confirmed` is then `false` and the device may still hold the old value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Setpoint<T> {
    pub value: T,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Protection {
    Ovp,
    Ocp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegulationMode {
    ConstantVoltage,
    ConstantCurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatteryState {
    pub battery_mode: bool,
    pub voltage: f64,
    pub ext_temp_c: i32,
    pub ext_temp_f: i32,
    pub amp_hours: f64,
    pub watt_hours: f64,
}

/// Everything the session knows about the device
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChargerState {
    pub id: Option<u16>,
    pub model: ChargerModel,
    pub multipliers: Multipliers,
    pub serial_number: Option<String>,
    pub firmware: Option<u16>,
    pub int_temp_c: Option<i32>,
    pub int_temp_f: Option<i32>,
    pub v_set: Option<Setpoint<f64>>,
    pub i_set: Option<Setpoint<f64>>,
    pub output: Option<Setpoint<bool>>,
    pub preset: Option<Setpoint<u16>>,
    pub v_out: Option<f64>,
    pub i_out: Option<f64>,
    pub p_out: Option<f64>,
    pub v_in: Option<f64>,
    pub amp_hours: Option<f64>,
    pub keypad_locked: Option<bool>,
    pub protection: Option<Protection>,
    pub mode: Option<RegulationMode>,
    pub battery: Option<BatteryState>,
}

fn signed(sign: u16, magnitude: u16) -> i32 {
    if sign != 0 {
        -i32::from(magnitude)
    } else {
        i32::from(magnitude)
    }
}

fn joined(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Scale a physical value to register units, rounding to the nearest unit
pub fn to_register_units(value: f64, multiplier: f64) -> u16 {
    (value * multiplier).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

fn protection_from(raw: u16) -> Option<Protection> {
    match raw {
        1 => Some(Protection::Ovp),
        2 => Some(Protection::Ocp),
        _ => None,
    }
}

fn mode_from(raw: u16) -> Option<RegulationMode> {
    match raw {
        0 => Some(RegulationMode::ConstantVoltage),
        1 => Some(RegulationMode::ConstantCurrent),
        _ => None,
    }
}

/// Delay between attempts; none after the last one
async fn retry_pause(attempt: u32, retries: u32, delay: Duration) {
    if attempt < retries {
        sleep(delay).await;
    }
}

/// Driver for one charger on one serial line
pub struct ChargerSession {
    link: Box<dyn RegisterLink>,
    bus: Option<Box<dyn RegisterBus>>,
    session_state: SessionState,
    classified: bool,
    retries: u32,
    retry_delay: Duration,
    reconnect_backoff: Duration,
    state: ChargerState,
    logger: StructuredLogger,
}

impl ChargerSession {
    /// Session over the configured serial port; nothing is opened yet
    pub fn new(config: &ChargerConfig) -> Self {
        Self::with_link(Box::new(RtuLink::new(config)), config)
    }

    pub fn with_link(link: Box<dyn RegisterLink>, config: &ChargerConfig) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("charger")
                .with_device(&link.describe())
                .with_field("address", config.address.to_string()),
        );
        Self {
            link,
            bus: None,
            session_state: SessionState::Disconnected,
            classified: false,
            retries: config.retries.max(1),
            retry_delay: config.retry_delay(),
            reconnect_backoff: config.reconnect_backoff(),
            state: ChargerState::default(),
            logger,
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn is_connected(&self) -> bool {
        self.session_state == SessionState::Connected && self.bus.is_some()
    }

    /// Cached view of the device
    pub fn state(&self) -> &ChargerState {
        &self.state
    }

    pub fn model(&self) -> ChargerModel {
        self.state.model
    }

    pub fn describe(&self) -> String {
        self.link.describe()
    }

    /// Keep trying to connect on a fixed backoff until it works or `cancel`
    /// fires
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.logger.warn(&format!(
                        "Charger connect failed ({}), retrying in {:?}",
                        e, self.reconnect_backoff
                    ));
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ZeroGridError::cancelled("Charger connect abandoned"));
                }
                _ = sleep(self.reconnect_backoff) => {}
            }
        }
    }

    /// One connect attempt; classifies the model on the first success
    pub async fn connect_once(&mut self) -> Result<()> {
        self.session_state = SessionState::Connecting;
        match self.link.open().await {
            Ok(bus) => {
                self.bus = Some(bus);
                self.session_state = SessionState::Connected;
                self.logger.info("Charger connection established");
                if !self.classified {
                    if let Err(e) = self.init().await {
                        self.bus = None;
                        self.session_state = SessionState::Disconnected;
                        return Err(e);
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.bus = None;
                self.session_state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Drop the current handle and open a fresh one
    pub async fn reconnect(&mut self) -> Result<()> {
        self.bus = None;
        self.session_state = SessionState::Disconnected;
        self.connect_once().await
    }

    /// Release the handle; the next transaction reconnects
    pub fn disconnect(&mut self) {
        if self.bus.take().is_some() {
            self.logger.info("Charger handle released");
        }
        self.session_state = SessionState::Disconnected;
    }

    fn mark_faulted(&mut self, error: &ZeroGridError) {
        self.logger.warn(&format!("Transport fault: {}", error));
        self.bus = None;
        self.session_state = SessionState::Faulted;
    }

    /// One identification read to pick the scale table. A failed read
    /// leaves the unknown-model scales in place and is reported, so the
    /// connection attempt counts as failed; once a model has been
    /// classified it is never recomputed.
    pub async fn init(&mut self) -> Result<()> {
        let data = match self.bus_read(reg::ID, reg::IDENTITY_SPAN).await {
            Ok(data) => data,
            Err(e) => {
                self.logger.warn(&format!(
                    "Identification read failed ({}), using default scale factors",
                    e
                ));
                if e.is_connection_error() {
                    self.mark_faulted(&e);
                }
                self.state.model = ChargerModel::Unknown;
                self.state.multipliers = Multipliers::default();
                return Err(e);
            }
        };
        let id = data[0];
        let model = ChargerModel::from_id(id);
        self.state.id = Some(id);
        self.state.serial_number = Some(format!("{:08}", joined(data[1], data[2])));
        self.state.firmware = Some(data[3]);
        self.state.model = model;
        self.state.multipliers = model.multipliers();
        self.classified = true;
        self.logger
            .info(&format!("Charger identified: id={} model={}", id, model));
        Ok(())
    }

    /// Single transaction on the open handle, buffers cleared first
    async fn bus_read(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        let bus = self
            .bus
            .as_mut()
            .ok_or_else(|| ZeroGridError::transport("Charger handle missing"))?;
        bus.clear_buffers()?;
        let values = bus.read_holding_registers(start, count).await?;
        if values.len() != count as usize {
            return Err(ZeroGridError::protocol(format!(
                "Expected {} registers from {}, got {}",
                count,
                start,
                values.len()
            )));
        }
        Ok(values)
    }

    async fn bus_write(&mut self, register: u16, value: u16) -> Result<()> {
        let bus = self
            .bus
            .as_mut()
            .ok_or_else(|| ZeroGridError::transport("Charger handle missing"))?;
        bus.clear_buffers()?;
        bus.write_single_register(register, value).await
    }

    /// Read `count` registers from `start`; `None` once retries are spent
    pub async fn read(&mut self, start: u16, count: u16) -> Option<Vec<u16>> {
        for attempt in 1..=self.retries {
            if self.bus.is_none() {
                if let Err(e) = self.reconnect().await {
                    self.logger.warn(&format!(
                        "Read {} failed ({}/{}): {}",
                        start, attempt, self.retries, e
                    ));
                    retry_pause(attempt, self.retries, self.retry_delay).await;
                    continue;
                }
            }
            match self.bus_read(start, count).await {
                Ok(values) => return Some(values),
                Err(e) => {
                    self.logger.warn(&format!(
                        "Read {} failed ({}/{}): {}",
                        start, attempt, self.retries, e
                    ));
                    if e.is_connection_error() {
                        self.mark_faulted(&e);
                    }
                    retry_pause(attempt, self.retries, self.retry_delay).await;
                }
            }
        }
        self.logger.error(&format!(
            "Failed to read register {} after {} attempts",
            start, self.retries
        ));
        None
    }

    /// Write one register; `false` once retries are spent
    pub async fn write(&mut self, register: u16, value: u16) -> bool {
        for attempt in 1..=self.retries {
            if self.bus.is_none() {
                if let Err(e) = self.reconnect().await {
                    self.logger.warn(&format!(
                        "Write {} failed ({}/{}): {}",
                        register, attempt, self.retries, e
                    ));
                    retry_pause(attempt, self.retries, self.retry_delay).await;
                    continue;
                }
            }
            match self.bus_write(register, value).await {
                Ok(()) => return true,
                Err(e) => {
                    self.logger.warn(&format!(
                        "Write {} failed ({}/{}): {}",
                        register, attempt, self.retries, e
                    ));
                    if e.is_connection_error() {
                        self.mark_faulted(&e);
                    }
                    retry_pause(attempt, self.retries, self.retry_delay).await;
                }
            }
        }
        self.logger.error(&format!(
            "Failed to write register {} after {} attempts",
            register, self.retries
        ));
        false
    }

    async fn read_one(&mut self, register: u16) -> Option<u16> {
        self.read(register, 1).await.and_then(|v| v.first().copied())
    }

    /// Bulk refresh of the telemetry block in a single transaction
    pub async fn update(&mut self) -> bool {
        let Some(data) = self.read(reg::INT_C_S, reg::TELEMETRY_SPAN).await else {
            return false;
        };
        let at = |register: u16| data[(register - reg::INT_C_S) as usize];
        let m = self.state.multipliers;
        let s = &mut self.state;
        s.int_temp_c = Some(signed(at(reg::INT_C_S), at(reg::INT_C)));
        s.int_temp_f = Some(signed(at(reg::INT_F_S), at(reg::INT_F)));
        s.v_set = Some(Setpoint {
            value: f64::from(at(reg::V_SET)) / m.voltage,
            confirmed: true,
        });
        s.i_set = Some(Setpoint {
            value: f64::from(at(reg::I_SET)) / m.current,
            confirmed: true,
        });
        s.v_out = Some(f64::from(at(reg::V_OUT)) / m.voltage);
        s.i_out = Some(f64::from(at(reg::I_OUT)) / m.current);
        s.amp_hours = Some(f64::from(at(reg::AH)) / 1000.0);
        s.p_out = Some(f64::from(at(reg::P_OUT)) / m.power);
        s.v_in = Some(f64::from(at(reg::V_IN)) / m.input_voltage);
        s.keypad_locked = Some(at(reg::KEYPAD) != 0);
        s.protection = protection_from(at(reg::OVP_OCP));
        s.mode = mode_from(at(reg::CV_CC));
        s.output = Some(Setpoint {
            value: at(reg::OUTPUT) != 0,
            confirmed: true,
        });
        s.preset = Some(Setpoint {
            value: at(reg::PRESET),
            confirmed: true,
        });
        true
    }

    /// Refresh the battery block
    pub async fn update_battery(&mut self) -> bool {
        let Some(data) = self.read(reg::BAT_MODE, reg::BATTERY_SPAN).await else {
            return false;
        };
        let at = |register: u16| data[(register - reg::BAT_MODE) as usize];
        self.state.battery = Some(BatteryState {
            battery_mode: at(reg::BAT_MODE) != 0,
            voltage: f64::from(at(reg::V_BAT)) / self.state.multipliers.voltage,
            ext_temp_c: signed(at(reg::EXT_C_S), at(reg::EXT_C)),
            ext_temp_f: signed(at(reg::EXT_F_S), at(reg::EXT_F)),
            amp_hours: f64::from(joined(at(reg::AH_H), at(reg::AH_L))) / 1000.0,
            watt_hours: f64::from(joined(at(reg::WH_H), at(reg::WH_L))) / 1000.0,
        });
        true
    }

    pub async fn get_id(&mut self) -> Option<u16> {
        let id = self.read_one(reg::ID).await?;
        self.state.id = Some(id);
        Some(id)
    }

    pub async fn get_sn(&mut self) -> Option<String> {
        let data = self.read(reg::SN_H, 2).await?;
        let sn = format!("{:08}", joined(data[0], data[1]));
        self.state.serial_number = Some(sn.clone());
        Some(sn)
    }

    pub async fn get_fw(&mut self) -> Option<u16> {
        let fw = self.read_one(reg::FW).await?;
        self.state.firmware = Some(fw);
        Some(fw)
    }

    pub async fn get_int_temp_c(&mut self) -> Option<i32> {
        let data = self.read(reg::INT_C_S, 2).await?;
        let t = signed(data[0], data[1]);
        self.state.int_temp_c = Some(t);
        Some(t)
    }

    pub async fn get_int_temp_f(&mut self) -> Option<i32> {
        let data = self.read(reg::INT_F_S, 2).await?;
        let t = signed(data[0], data[1]);
        self.state.int_temp_f = Some(t);
        Some(t)
    }

    pub async fn get_v_set(&mut self) -> Option<f64> {
        let v = f64::from(self.read_one(reg::V_SET).await?) / self.state.multipliers.voltage;
        self.state.v_set = Some(Setpoint {
            value: v,
            confirmed: true,
        });
        Some(v)
    }

    /// Round to register units, write, and cache the rounded value
    pub async fn set_v_set(&mut self, volts: f64) -> bool {
        let multiplier = self.state.multipliers.voltage;
        let raw = to_register_units(volts, multiplier);
        let confirmed = self.write(reg::V_SET, raw).await;
        self.state.v_set = Some(Setpoint {
            value: f64::from(raw) / multiplier,
            confirmed,
        });
        confirmed
    }

    pub async fn get_i_set(&mut self) -> Option<f64> {
        let i = f64::from(self.read_one(reg::I_SET).await?) / self.state.multipliers.current;
        self.state.i_set = Some(Setpoint {
            value: i,
            confirmed: true,
        });
        Some(i)
    }

    /// Round to register units, write, and cache the rounded value
    pub async fn set_i_set(&mut self, amps: f64) -> bool {
        let multiplier = self.state.multipliers.current;
        let raw = to_register_units(amps, multiplier);
        let confirmed = self.write(reg::I_SET, raw).await;
        self.state.i_set = Some(Setpoint {
            value: f64::from(raw) / multiplier,
            confirmed,
        });
        confirmed
    }

    pub async fn get_v_out(&mut self) -> Option<f64> {
        let v = f64::from(self.read_one(reg::V_OUT).await?) / self.state.multipliers.voltage;
        self.state.v_out = Some(v);
        Some(v)
    }

    pub async fn get_i_out(&mut self) -> Option<f64> {
        let i = f64::from(self.read_one(reg::I_OUT).await?) / self.state.multipliers.current;
        self.state.i_out = Some(i);
        Some(i)
    }

    pub async fn get_p_out(&mut self) -> Option<f64> {
        let p = f64::from(self.read_one(reg::P_OUT).await?) / self.state.multipliers.power;
        self.state.p_out = Some(p);
        Some(p)
    }

    pub async fn get_v_in(&mut self) -> Option<f64> {
        let v =
            f64::from(self.read_one(reg::V_IN).await?) / self.state.multipliers.input_voltage;
        self.state.v_in = Some(v);
        Some(v)
    }

    pub async fn is_keypad_locked(&mut self) -> Option<bool> {
        let locked = self.read_one(reg::KEYPAD).await? != 0;
        self.state.keypad_locked = Some(locked);
        Some(locked)
    }

    /// Outer `None` means no data; inner `None` means nothing has tripped
    pub async fn get_protection(&mut self) -> Option<Option<Protection>> {
        let p = protection_from(self.read_one(reg::OVP_OCP).await?);
        self.state.protection = p;
        Some(p)
    }

    pub async fn get_mode(&mut self) -> Option<RegulationMode> {
        let m = mode_from(self.read_one(reg::CV_CC).await?);
        self.state.mode = m;
        m
    }

    pub async fn is_output(&mut self) -> Option<bool> {
        let on = self.read_one(reg::OUTPUT).await? != 0;
        self.state.output = Some(Setpoint {
            value: on,
            confirmed: true,
        });
        Some(on)
    }

    pub async fn set_output(&mut self, on: bool) -> bool {
        let confirmed = self.write(reg::OUTPUT, u16::from(on)).await;
        self.state.output = Some(Setpoint {
            value: on,
            confirmed,
        });
        confirmed
    }

    pub async fn get_preset(&mut self) -> Option<u16> {
        let preset = self.read_one(reg::PRESET).await?;
        self.state.preset = Some(Setpoint {
            value: preset,
            confirmed: true,
        });
        Some(preset)
    }

    pub async fn set_preset(&mut self, preset: u16) -> bool {
        let confirmed = self.write(reg::PRESET, preset).await;
        self.state.preset = Some(Setpoint {
            value: preset,
            confirmed,
        });
        confirmed
    }

    pub async fn is_buzzer(&mut self) -> Option<bool> {
        Some(self.read_one(reg::OPT_BUZZ).await? != 0)
    }

    pub async fn set_buzzer(&mut self, on: bool) -> bool {
        self.write(reg::OPT_BUZZ, u16::from(on)).await
    }

    pub async fn is_boot_power(&mut self) -> Option<bool> {
        Some(self.read_one(reg::OPT_BOOT_POW).await? != 0)
    }

    pub async fn set_boot_power(&mut self, on: bool) -> bool {
        self.write(reg::OPT_BOOT_POW, u16::from(on)).await
    }

    pub async fn get_backlight(&mut self) -> Option<u16> {
        self.read_one(reg::OPT_LIGHT).await
    }

    pub async fn set_backlight(&mut self, level: u16) -> bool {
        self.write(reg::OPT_LIGHT, level).await
    }

    /// Device clock; the RK6006 has none
    pub async fn get_date_time(&mut self) -> Option<NaiveDateTime> {
        if self.state.model == ChargerModel::Rk6006 {
            return None;
        }
        let d = self.read(reg::YEAR, reg::CLOCK_SPAN).await?;
        NaiveDate::from_ymd_opt(i32::from(d[0]), u32::from(d[1]), u32::from(d[2]))?.and_hms_opt(
            u32::from(d[3]),
            u32::from(d[4]),
            u32::from(d[5]),
        )
    }

    /// Set the device clock one register at a time
    pub async fn set_date_time(&mut self, at: NaiveDateTime) -> bool {
        let Ok(year) = u16::try_from(at.year()) else {
            return false;
        };
        let fields = [
            (reg::YEAR, year),
            (reg::MONTH, at.month() as u16),
            (reg::DAY, at.day() as u16),
            (reg::HOUR, at.hour() as u16),
            (reg::MINUTE, at.minute() as u16),
            (reg::SECOND, at.second() as u16),
        ];
        for (register, value) in fields {
            if !self.write(register, value).await {
                return false;
            }
        }
        true
    }
}
