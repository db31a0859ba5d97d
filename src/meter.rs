//! P1 smart-meter reader
//!
//! Reads DSMR telegrams line by line from the meter's serial port and parses
//! them into [`Telegram`]s. A read never fails: when no complete telegram
//! arrives before the deadline the last accepted telegram is returned again,
//! and callers detect staleness through [`Telegram::sequence`].

use crate::config::MeterConfig;
use crate::error::{Result, ZeroGridError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{Instant, sleep, timeout_at};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

mod obis;
mod parser;
mod telegram;

pub use obis::describe;
pub use parser::{normalize_code, parse_line};
pub use telegram::{
    EXPORT_POWER, IMPORT_POWER, L1_POWER, L2_POWER, L3_POWER, PowerSample, Reading, Telegram,
};

const TERMINATOR: u8 = b'!';

/// Byte-line transport under the meter reader
#[async_trait]
pub trait LineSource: Send {
    /// Open the underlying handle; a no-op when already open
    async fn open(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Next raw line including its terminator. `Ok(None)` means nothing was
    /// available right now.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>>;

    fn close(&mut self);
}

/// 8N1 serial line to the meter
pub struct SerialLineSource {
    port: String,
    baud_rate: u32,
    reader: Option<BufReader<SerialStream>>,
}

impl SerialLineSource {
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            reader: None,
        }
    }
}

#[async_trait]
impl LineSource for SerialLineSource {
    async fn open(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                ZeroGridError::transport(format!("Failed to open meter port {}: {}", self.port, e))
            })?;
        self.reader = Some(BufReader::new(stream));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ZeroGridError::transport("Meter port is not open"))?;
        let mut line = Vec::with_capacity(64);
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(line)),
            Err(e) => Err(ZeroGridError::transport(format!("Meter read error: {}", e))),
        }
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Telegram reader with stale-data fallback
pub struct MeterReader {
    source: Box<dyn LineSource>,
    timeout: Duration,
    required_codes: Vec<String>,
    last_good: Telegram,
    last_read_fresh: bool,
    logger: StructuredLogger,
}

impl MeterReader {
    /// Reader over the configured serial port
    pub fn new(config: &MeterConfig) -> Self {
        let source = SerialLineSource::new(&config.port, config.baud_rate);
        Self::with_source(Box::new(source), config)
    }

    /// Reader over any line source
    pub fn with_source(source: Box<dyn LineSource>, config: &MeterConfig) -> Self {
        let logger = get_logger_with_context(LogContext::new("meter").with_device(&config.port));
        Self {
            source,
            timeout: config.timeout(),
            required_codes: config.required_codes.clone(),
            last_good: Telegram::default(),
            last_read_fresh: false,
            logger,
        }
    }

    /// Open the line; reads reopen it lazily as well
    pub async fn connect(&mut self) -> Result<()> {
        self.source.open().await?;
        self.logger.info("Connected to P1 meter");
        Ok(())
    }

    /// Last accepted telegram without touching the line
    pub fn last_telegram(&self) -> &Telegram {
        &self.last_good
    }

    /// Whether the most recent `read_telegram` produced a new telegram
    pub fn last_read_fresh(&self) -> bool {
        self.last_read_fresh
    }

    pub fn required_codes(&self) -> &[String] {
        &self.required_codes
    }

    /// Accumulate lines until the `!` terminator or the deadline. A new
    /// telegram is accepted only when the terminator was seen and every
    /// required code parsed; otherwise the previous one is returned.
    pub async fn read_telegram(&mut self) -> Telegram {
        self.last_read_fresh = false;

        if !self.source.is_open() {
            if let Err(e) = self.source.open().await {
                self.logger.warn(&format!("Meter unavailable: {}", e));
                return self.last_good.clone();
            }
        }

        let deadline = Instant::now() + self.timeout;
        let mut readings = Vec::new();
        let mut terminated = false;

        loop {
            match timeout_at(deadline, self.source.read_line()).await {
                Err(_) => {
                    self.logger.debug("Telegram read timed out");
                    break;
                }
                Ok(Ok(Some(raw))) => {
                    let line = String::from_utf8_lossy(&raw);
                    if let Some(reading) = parse_line(&line) {
                        readings.push(reading);
                    }
                    if raw.contains(&TERMINATOR) {
                        terminated = true;
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    sleep(Duration::from_millis(10)).await;
                }
                Ok(Err(e)) => {
                    self.logger.warn(&format!("Serial read error: {}", e));
                    if e.is_connection_error() {
                        self.source.close();
                    }
                    break;
                }
            }
        }

        if !terminated || readings.is_empty() {
            return self.last_good.clone();
        }

        let candidate = Telegram::new(self.last_good.sequence + 1, readings);
        if !candidate.is_complete(&self.required_codes) {
            self.logger.warn(&format!(
                "Discarding incomplete telegram, missing {:?}",
                candidate.missing(&self.required_codes)
            ));
            return self.last_good.clone();
        }

        self.last_good = candidate;
        self.last_read_fresh = true;
        self.last_good.clone()
    }

    pub fn close(&mut self) {
        if self.source.is_open() {
            self.source.close();
            self.logger.info("Meter port closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedLines {
        lines: VecDeque<&'static str>,
        open: bool,
    }

    #[async_trait]
    impl LineSource for ScriptedLines {
        async fn open(&mut self) -> Result<()> {
            self.open = true;
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open
        }
        async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.lines.pop_front().map(|l| l.as_bytes().to_vec()))
        }
        fn close(&mut self) {
            self.open = false;
        }
    }

    fn reader(lines: Vec<&'static str>) -> MeterReader {
        let config = MeterConfig {
            timeout_ms: 100,
            ..MeterConfig::default()
        };
        MeterReader::with_source(
            Box::new(ScriptedLines {
                lines: lines.into(),
                open: false,
            }),
            &config,
        )
    }

    #[tokio::test]
    async fn accepts_terminated_complete_telegram() {
        let mut m = reader(vec![
            "/ISK5\\2M550T-1012\r\n",
            "\r\n",
            "1-0:1.7.0(00.100*kW)\r\n",
            "1-0:2.7.0(00.000*kW)\r\n",
            "!1F28\r\n",
        ]);
        let t = m.read_telegram().await;
        assert_eq!(t.sequence, 1);
        assert_eq!(t.len(), 2);
        assert!(m.last_read_fresh());
    }

    #[tokio::test]
    async fn incomplete_telegram_falls_back() {
        let mut m = reader(vec!["1-0:1.7.0(00.100*kW)\r\n", "!1F28\r\n"]);
        let t = m.read_telegram().await;
        assert_eq!(t, Telegram::default());
        assert!(!m.last_read_fresh());
    }
}
