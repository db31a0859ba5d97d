//! Zero-export balancing loop
//!
//! Every cycle reads the meter, feeds `import - export` through the PID and
//! routes the output to exactly one actuator: a positive output discharges
//! through the inverter, a negative one charges through the charger. The
//! other actuator is always driven to zero first.

use crate::config::ControllerConfig;
use crate::error::{Result, ZeroGridError};
use crate::inverter::clamp_power;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::meter::{MeterReader, PowerSample, Telegram};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;

mod pid;
mod record;

pub use pid::{PidController, PidSettings, PidTerms};
pub use record::{ControlRecord, CycleLog};

/// Anything that yields meter telegrams. A repeated `sequence` means no new
/// telegram arrived.
#[async_trait]
pub trait TelegramSource: Send {
    async fn read_telegram(&mut self) -> Telegram;
}

#[async_trait]
impl TelegramSource for MeterReader {
    async fn read_telegram(&mut self) -> Telegram {
        MeterReader::read_telegram(self).await
    }
}

/// The two actuators as the loop sees them
#[async_trait]
pub trait Actuators: Send {
    /// Apply the charge voltage, enable the charger output and zero the
    /// inverter
    async fn prepare(&mut self, charge_voltage: f64) -> Result<()>;

    /// Returns the clamped value actually commanded
    async fn set_inverter_power(&mut self, watts: u16) -> Result<u16>;

    async fn set_charger_current(&mut self, amps: f64) -> Result<()>;

    /// Measured charger output voltage, `None` when unavailable
    async fn charger_voltage(&mut self) -> Result<Option<f64>>;

    /// Drive both actuators to zero. Both are attempted even if the first
    /// one fails.
    async fn force_safe(&mut self) -> Result<()> {
        let inverter = self.set_inverter_power(0).await;
        let charger = self.set_charger_current(0.0).await;
        inverter?;
        charger
    }
}

/// Where one PID output goes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Route {
    /// Inverter at `watts`, charger at zero
    Discharge { watts: u16 },
    /// Charger at `amps`, inverter at zero
    Charge { amps: f64 },
}

/// `|kW × 1000| / V`, limited to `max_current` and rounded to mA
pub fn power_to_current(output_kw: f64, voltage: f64, max_current: f64) -> f64 {
    let amps = (output_kw * 1000.0 / voltage).abs().min(max_current);
    (amps * 1000.0).round() / 1000.0
}

pub fn route(output_kw: f64, voltage: f64, max_power: u16, max_current: f64) -> Route {
    if output_kw >= 0.0 {
        Route::Discharge {
            watts: clamp_power((output_kw * 1000.0).round() as i64, max_power),
        }
    } else {
        Route::Charge {
            amps: power_to_current(output_kw, voltage, max_current),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// First PID sample, nothing commanded
    Seeded,
    /// Error inside the deadband, nothing commanded
    Deadband,
    Discharge,
    Charge,
    /// No fresh import/export figures
    Skipped,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Seeded => "seeded",
            CycleOutcome::Deadband => "deadband",
            CycleOutcome::Discharge => "discharge",
            CycleOutcome::Charge => "charge",
            CycleOutcome::Skipped => "skipped",
        }
    }
}

/// What one cycle saw and did
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub timestamp: DateTime<Local>,
    pub sample: PowerSample,
    pub terms: Option<PidTerms>,
    pub outcome: CycleOutcome,
    pub inverter_w: Option<u16>,
    pub charger_a: Option<f64>,
}

impl CycleReport {
    fn new(sample: PowerSample, outcome: CycleOutcome) -> Self {
        Self {
            timestamp: Local::now(),
            sample,
            terms: None,
            outcome,
            inverter_w: None,
            charger_a: None,
        }
    }

    pub fn to_record(&self) -> ControlRecord {
        ControlRecord {
            timestamp: self.timestamp.to_rfc3339(),
            import_kw: self.sample.import_kw,
            export_kw: self.sample.export_kw,
            error_kw: self.terms.map(|t| t.error),
            p_term: self.terms.map(|t| t.p),
            i_term: self.terms.map(|t| t.i),
            d_term: self.terms.map(|t| t.d),
            unclamped_kw: self.terms.map(|t| t.unclamped),
            output_kw: self.terms.map(|t| t.output),
            l1_kw: self.sample.l1_kw,
            l2_kw: self.sample.l2_kw,
            l3_kw: self.sample.l3_kw,
            inverter_w: self.inverter_w,
            charger_a: self.charger_a,
            outcome: self.outcome.as_str().to_string(),
        }
    }
}

impl From<&ControllerConfig> for PidSettings {
    fn from(config: &ControllerConfig) -> Self {
        PidSettings {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
            setpoint: config.setpoint,
            min_output: config.min_output_kw,
            max_output: config.max_output_kw,
            max_change_ratio: config.max_change_ratio,
        }
    }
}

pub struct PowerBalanceController {
    config: ControllerConfig,
    max_power: u16,
    meter: Box<dyn TelegramSource>,
    actuators: Box<dyn Actuators>,
    pid: PidController,
    log: Option<CycleLog>,
    last_sequence: u64,
    stale_cycles: u32,
    logger: StructuredLogger,
}

impl PowerBalanceController {
    pub fn new(
        config: &ControllerConfig,
        max_power: u16,
        meter: Box<dyn TelegramSource>,
        actuators: Box<dyn Actuators>,
    ) -> Self {
        Self {
            config: config.clone(),
            max_power,
            meter,
            actuators,
            pid: PidController::new(PidSettings::from(config)),
            log: None,
            last_sequence: 0,
            stale_cycles: 0,
            logger: get_logger_with_context(
                LogContext::new("controller")
                    .with_field("kp", config.kp.to_string())
                    .with_field("ki", config.ki.to_string())
                    .with_field("kd", config.kd.to_string()),
            ),
        }
    }

    pub fn with_log(mut self, log: CycleLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Open the configured cycle log
    pub fn open_log(&mut self) -> Result<()> {
        let log = CycleLog::open(&self.config.log_file)?;
        self.logger
            .info(&format!("Recording cycles to {}", log.path().display()));
        self.log = Some(log);
        Ok(())
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn pid(&self) -> &PidController {
        &self.pid
    }

    pub fn stale_cycles(&self) -> u32 {
        self.stale_cycles
    }

    /// Drop the PID history; the next fresh sample seeds again
    pub fn reset(&mut self) {
        self.pid.reset();
    }

    pub async fn prepare(&mut self) -> Result<()> {
        self.actuators.prepare(self.config.charge_voltage).await?;
        self.logger.info(&format!(
            "Actuators prepared at {} V",
            self.config.charge_voltage
        ));
        Ok(())
    }

    pub async fn force_safe(&mut self) -> Result<()> {
        self.actuators.force_safe().await
    }

    /// One meter read, PID update and actuator command
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let telegram = self.meter.read_telegram().await;
        let sample = PowerSample::from_telegram(&telegram);
        let fresh = telegram.sequence != self.last_sequence;
        self.last_sequence = telegram.sequence;

        let net = if fresh { sample.net_kw() } else { None };
        let Some(net) = net else {
            self.stale_cycles += 1;
            let report = CycleReport::new(sample, CycleOutcome::Skipped);
            self.record(&report);
            if self.stale_cycles >= self.config.max_stale_cycles {
                return Err(ZeroGridError::safety(format!(
                    "{} consecutive cycles without fresh import/export readings",
                    self.stale_cycles
                )));
            }
            self.logger.warn(&format!(
                "No fresh import/export readings ({} of {})",
                self.stale_cycles, self.config.max_stale_cycles
            ));
            return Ok(report);
        };
        self.stale_cycles = 0;

        let seeded = self.pid.is_seeded();
        let terms = self.pid.update(net);
        let mut report = CycleReport::new(sample, CycleOutcome::Seeded);
        report.terms = Some(terms);

        if !seeded {
            self.logger.debug("PID seeded");
        } else if terms.error.abs() <= self.config.deadband_kw {
            report.outcome = CycleOutcome::Deadband;
            self.logger.debug(&format!("Within deadband ({:.3} kW)", terms.error));
        } else {
            self.apply(terms.output, &mut report).await?;
        }

        self.record(&report);
        Ok(report)
    }

    async fn apply(&mut self, output_kw: f64, report: &mut CycleReport) -> Result<()> {
        let voltage = if output_kw < 0.0 {
            match self.actuators.charger_voltage().await? {
                Some(v) if v > 0.0 => v,
                _ => self.config.charge_voltage,
            }
        } else {
            self.config.charge_voltage
        };

        match route(
            output_kw,
            voltage,
            self.max_power,
            self.config.max_charging_current,
        ) {
            Route::Discharge { watts } => {
                self.actuators.set_charger_current(0.0).await?;
                let commanded = self.actuators.set_inverter_power(watts).await?;
                report.outcome = CycleOutcome::Discharge;
                report.charger_a = Some(0.0);
                report.inverter_w = Some(commanded);
                self.logger
                    .info(&format!("Discharging {} W ({:.3} kW)", commanded, output_kw));
            }
            Route::Charge { amps } => {
                self.actuators.set_inverter_power(0).await?;
                self.actuators.set_charger_current(amps).await?;
                report.outcome = CycleOutcome::Charge;
                report.inverter_w = Some(0);
                report.charger_a = Some(amps);
                self.logger.info(&format!(
                    "Charging {:.3} A at {:.2} V ({:.3} kW)",
                    amps, voltage, output_kw
                ));
            }
        }
        Ok(())
    }

    fn record(&mut self, report: &CycleReport) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&report.to_record()) {
                self.logger.warn(&format!("Cycle log write failed: {}", e));
            }
        }
    }
}
