//! Serial transport for the charger's register protocol.

use super::rtu;
use crate::config::ChargerConfig;
use crate::error::{Result, ZeroGridError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

/// An open register channel
#[async_trait]
pub trait RegisterBus: Send {
    /// Drop any bytes pending in either direction
    fn clear_buffers(&mut self) -> Result<()>;

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>>;

    async fn write_single_register(&mut self, register: u16, value: u16) -> Result<()>;
}

/// Factory for register channels; every (re)connect opens a fresh bus
#[async_trait]
pub trait RegisterLink: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RegisterBus>>;

    /// Port name for logs and health reports
    fn describe(&self) -> String;
}

/// RTU over a serial port
#[derive(Debug, Clone)]
pub struct RtuLink {
    port: String,
    baud_rate: u32,
    address: u8,
    timeout: Duration,
}

impl RtuLink {
    pub fn new(config: &ChargerConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            address: config.address,
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl RegisterLink for RtuLink {
    async fn open(&self) -> Result<Box<dyn RegisterBus>> {
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| {
                ZeroGridError::transport(format!("Failed to open serial port {}: {}", self.port, e))
            })?;
        Ok(Box::new(RtuBus {
            stream,
            address: self.address,
            timeout: self.timeout,
        }))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud_rate)
    }
}

pub struct RtuBus {
    stream: SerialStream,
    address: u8,
    timeout: Duration,
}

impl RtuBus {
    /// Send one request and collect its complete response frame
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let stream = &mut self.stream;
        let io = async {
            stream.write_all(request).await?;
            stream.flush().await?;
            let mut frame = vec![0u8; rtu::HEADER_LEN];
            stream.read_exact(&mut frame).await?;
            let remaining = rtu::remaining_len(frame[1], frame[2]);
            frame.resize(rtu::HEADER_LEN + remaining, 0);
            stream.read_exact(&mut frame[rtu::HEADER_LEN..]).await?;
            Ok::<_, std::io::Error>(frame)
        };

        match timeout(self.timeout, io).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => Err(ZeroGridError::transport(format!("Serial I/O error: {}", e))),
            Err(_) => Err(ZeroGridError::timeout(format!(
                "No response within {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl RegisterBus for RtuBus {
    fn clear_buffers(&mut self) -> Result<()> {
        self.stream
            .clear(ClearBuffer::All)
            .map_err(|e| ZeroGridError::transport(format!("Failed to clear buffers: {}", e)))
    }

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        let request = rtu::read_request(self.address, start, count);
        let frame = self.exchange(&request).await?;
        rtu::parse_read_response(self.address, count, &frame)
    }

    async fn write_single_register(&mut self, register: u16, value: u16) -> Result<()> {
        let request = rtu::write_request(self.address, register, value);
        let frame = self.exchange(&request).await?;
        rtu::parse_write_response(self.address, register, value, &frame)
    }
}
