//! Grid-tie inverter session
//!
//! The inverter protocol is send-only: a fixed 8-byte packet carries the
//! wanted output in watts and must be repeated continuously, otherwise the
//! inverter falls back to zero. The session keeps the commanded value in a
//! watch channel and a supervised heartbeat task retransmits it. Every
//! transmission result is published in a [`LinkStatus`]; the heartbeat stops
//! on the first failed send and the session stays faulted until
//! [`InverterSession::reconnect`] reopens the port.

use crate::config::InverterConfig;
use crate::error::{Result, ZeroGridError};
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;

mod packet;

pub use packet::{HEADER, MARKER, PACKET_LEN, build_packet, checksum, clamp_power, decode_packet};

/// Write-only packet channel to the inverter
#[async_trait]
pub trait PacketSink: Send {
    async fn send(&mut self, packet: &[u8]) -> Result<()>;

    /// Flush and release the handle
    async fn close(&mut self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Factory for packet channels; every (re)connect opens a fresh sink
#[async_trait]
pub trait PacketLink: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PacketSink>>;

    fn describe(&self) -> String;
}

pub struct SerialPacketSink {
    port: String,
    stream: Option<SerialStream>,
    timeout: Duration,
}

impl SerialPacketSink {
    pub fn open(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let stream = tokio_serial::new(port, baud_rate)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| {
                ZeroGridError::transport(format!("Failed to open inverter port {}: {}", port, e))
            })?;
        Ok(Self {
            port: port.to_string(),
            stream: Some(stream),
            timeout,
        })
    }
}

#[async_trait]
impl PacketSink for SerialPacketSink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ZeroGridError::transport("Inverter port is closed"))?;
        let io = async {
            stream.write_all(packet).await?;
            stream.flush().await
        };
        match timeout(self.timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ZeroGridError::transport(format!("Inverter write failed: {}", e))),
            Err(_) => Err(ZeroGridError::timeout(format!(
                "Inverter write stalled for {:?}",
                self.timeout
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            match timeout(self.timeout, stream.flush()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ZeroGridError::timeout(format!(
                        "Inverter flush stalled for {:?}",
                        self.timeout
                    )));
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.port.clone()
    }
}

/// The configured serial port, or the first one that opens
#[derive(Debug, Clone)]
pub struct SerialPacketLink {
    port: Option<String>,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialPacketLink {
    pub fn new(config: &InverterConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl PacketLink for SerialPacketLink {
    async fn open(&self) -> Result<Box<dyn PacketSink>> {
        let port = match &self.port {
            Some(port) => port.clone(),
            None => detect_port(self.baud_rate, self.timeout)?,
        };
        let sink = SerialPacketSink::open(&port, self.baud_rate, self.timeout)?;
        Ok(Box::new(sink))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port.as_deref().unwrap_or("auto"), self.baud_rate)
    }
}

/// First serial device the OS lets us open. This only proves the port
/// exists and is free, not that an inverter is attached to it.
pub fn detect_port(baud_rate: u32, timeout: Duration) -> Result<String> {
    let logger = get_logger("inverter");
    let ports = tokio_serial::available_ports()
        .map_err(|e| ZeroGridError::transport(format!("Port enumeration failed: {}", e)))?;
    if ports.is_empty() {
        return Err(ZeroGridError::transport("No serial ports found"));
    }
    for info in ports {
        match tokio_serial::new(&info.port_name, baud_rate)
            .timeout(timeout)
            .open_native_async()
        {
            Ok(_port) => {
                logger.warn(&format!(
                    "Using detected serial port {} (open succeeded, protocol not verified)",
                    info.port_name
                ));
                return Ok(info.port_name);
            }
            Err(e) => logger.debug(&format!("Skipping {}: {}", info.port_name, e)),
        }
    }
    Err(ZeroGridError::transport("No usable serial ports found"))
}

/// What the line has done with the commanded power so far
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkStatus {
    /// Transmissions tried since the session was created
    pub attempts: u64,
    pub last_watts: Option<u16>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Heartbeat task alive and transmitting
    pub running: bool,
}

impl LinkStatus {
    fn record(&mut self, watts: u16, result: &Result<()>) {
        self.attempts += 1;
        self.last_watts = Some(watts);
        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.last_error = None;
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn fault(&self) -> ZeroGridError {
        ZeroGridError::transport(format!(
            "Inverter heartbeat stopped: {}",
            self.last_error.as_deref().unwrap_or("no transmission")
        ))
    }
}

/// Kick the heartbeat and wait until it has transmitted `target`, or has
/// stopped, within `limit`
async fn await_transmission(
    mut status: watch::Receiver<LinkStatus>,
    kick: Arc<Notify>,
    target: u16,
    limit: Duration,
) -> Result<()> {
    let before = status.borrow_and_update().attempts;
    kick.notify_one();
    let outcome = match timeout(
        limit,
        status.wait_for(|s| !s.running || (s.attempts > before && s.last_watts == Some(target))),
    )
    .await
    {
        Ok(Ok(current)) => current.clone(),
        Ok(Err(_)) => return Err(ZeroGridError::transport("Inverter status channel closed")),
        Err(_) => {
            return Err(ZeroGridError::timeout(format!(
                "Heartbeat did not transmit {} W within {:?}",
                target, limit
            )));
        }
    };
    if outcome.consecutive_failures > 0 || !outcome.running {
        return Err(outcome.fault());
    }
    Ok(())
}

struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<Box<dyn PacketSink>>,
}

/// Inverter driver: commanded power plus the heartbeat that keeps it alive
pub struct InverterSession {
    config: InverterConfig,
    link: Box<dyn PacketLink>,
    power: watch::Sender<u16>,
    status: Arc<watch::Sender<LinkStatus>>,
    kick: Arc<Notify>,
    sink: Option<Box<dyn PacketSink>>,
    heartbeat: Option<Heartbeat>,
    /// The heartbeat is supposed to be running
    keep_alive: bool,
    logger: StructuredLogger,
}

impl InverterSession {
    /// Session over the configured serial port; nothing is opened yet
    pub fn new(config: &InverterConfig) -> Self {
        Self::with_link(Box::new(SerialPacketLink::new(config)), config)
    }

    pub fn with_link(link: Box<dyn PacketLink>, config: &InverterConfig) -> Self {
        let (power, _) = watch::channel(clamp_power(
            i64::from(config.start_power),
            config.max_power,
        ));
        let (status, _) = watch::channel(LinkStatus::default());
        let logger = get_logger_with_context(
            LogContext::new("inverter")
                .with_device(&link.describe())
                .with_field("max_power", config.max_power.to_string()),
        );
        Self {
            config: config.clone(),
            link,
            power,
            status: Arc::new(status),
            kick: Arc::new(Notify::new()),
            sink: None,
            heartbeat: None,
            keep_alive: false,
            logger,
        }
    }

    /// Open a sink unless one is already open or in use by the heartbeat
    pub async fn connect(&mut self) -> Result<()> {
        if self.sink.is_some() || self.heartbeat.is_some() {
            return Ok(());
        }
        let sink = self.link.open().await?;
        self.logger.info(&format!(
            "Connected to {} @ {} bps",
            sink.describe(),
            self.config.baud_rate
        ));
        self.sink = Some(sink);
        Ok(())
    }

    pub fn max_power(&self) -> u16 {
        self.config.max_power
    }

    /// Commanded power in watts
    pub fn get_power(&self) -> u16 {
        *self.power.borrow()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.heartbeat
            .as_ref()
            .is_some_and(|h| !h.handle.is_finished())
            && self.status.borrow().running
    }

    /// The heartbeat should be running but is not
    pub fn is_faulted(&self) -> bool {
        self.keep_alive && !self.is_running()
    }

    /// Set the value the next heartbeat tick transmits. Never touches the
    /// line. Returns the clamped value.
    pub fn modify_power(&self, watts: i64) -> u16 {
        let clamped = clamp_power(watts, self.config.max_power);
        self.power.send_replace(clamped);
        clamped
    }

    /// Start retransmitting the commanded power every `send_interval_ms`
    pub fn start(&mut self, start_power: u16) -> Result<()> {
        if self.is_running() {
            self.logger.warn("Heartbeat already running");
            return Ok(());
        }
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| ZeroGridError::transport("Inverter is not connected"))?;
        self.modify_power(i64::from(start_power));
        self.keep_alive = true;
        self.status.send_modify(|s| s.running = true);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let rx = self.power.subscribe();
        let status = self.status.clone();
        let kick = self.kick.clone();
        let max_power = self.config.max_power;
        let period = self.config.send_interval();
        let logger = self.logger.clone();

        let handle = tokio::spawn(async move {
            logger.info("Heartbeat started");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = kick.notified() => {}
                }
                let watts = *rx.borrow();
                let frame = build_packet(i64::from(watts), max_power);
                let result = sink.send(&frame).await;
                status.send_modify(|s| s.record(watts, &result));
                match result {
                    Ok(()) => logger.trace(&format!("Sent {} W", watts)),
                    Err(e) => {
                        logger.error(&format!("Send failed, heartbeat stopping: {}", e));
                        break;
                    }
                }
            }
            status.send_modify(|s| s.running = false);
            logger.info("Heartbeat stopped");
            sink
        });

        self.heartbeat = Some(Heartbeat { cancel, handle });
        Ok(())
    }

    /// Transmit the commanded value now instead of waiting for the next
    /// tick. With the heartbeat running this waits for its transmission and
    /// reports its outcome; a stopped heartbeat is a transport fault.
    pub async fn send_now(&mut self) -> Result<()> {
        let target = self.get_power();
        if self.heartbeat.is_some() {
            if !self.is_running() {
                return Err(self.status.borrow().fault());
            }
            let limit = self.config.send_interval() + self.config.timeout();
            return await_transmission(self.status.subscribe(), self.kick.clone(), target, limit)
                .await;
        }
        let frame = build_packet(i64::from(target), self.config.max_power);
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| ZeroGridError::transport("Inverter is not connected"))?;
        let result = sink.send(&frame).await;
        self.status.send_modify(|s| s.record(target, &result));
        result
    }

    /// Reopen the port after a fault, then resume the heartbeat if it is
    /// supposed to run
    pub async fn reconnect(&mut self) -> Result<()> {
        self.stop_heartbeat().await;
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                self.logger.debug(&format!("Closing faulted sink: {}", e));
            }
        }
        self.connect().await?;
        if self.keep_alive {
            self.start(self.get_power())?;
        }
        self.logger.info("Inverter reconnected");
        Ok(())
    }

    /// Transmit the commanded value, reconnecting first when the heartbeat
    /// has died
    pub async fn transmit(&mut self) -> Result<()> {
        if self.is_faulted() {
            self.reconnect().await?;
        }
        self.send_now().await
    }

    /// Cancel the heartbeat and wait for it to finish; the sink comes back
    /// to the session still open
    pub async fn stop_heartbeat(&mut self) {
        let Some(heartbeat) = self.heartbeat.take() else {
            return;
        };
        heartbeat.cancel.cancel();
        match heartbeat.handle.await {
            Ok(sink) => self.sink = Some(sink),
            Err(e) => self.logger.error(&format!("Heartbeat task failed: {}", e)),
        }
        self.status.send_modify(|s| s.running = false);
    }

    /// Stop the heartbeat, then close the port
    pub async fn stop(&mut self) -> Result<()> {
        self.keep_alive = false;
        self.stop_heartbeat().await;
        if let Some(mut sink) = self.sink.take() {
            sink.close().await?;
            self.logger.info("Serial port closed");
        }
        Ok(())
    }

    /// Command zero, transmit it once more after the heartbeat has stopped,
    /// and close the port
    pub async fn shutdown(&mut self) -> Result<()> {
        self.modify_power(0);
        self.keep_alive = false;
        self.stop_heartbeat().await;
        if self.sink.is_some() {
            if let Err(e) = self.send_now().await {
                self.logger.warn(&format!("Final zero command failed: {}", e));
            }
        }
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl PacketLink for Recorder {
        async fn open(&self) -> Result<Box<dyn PacketSink>> {
            Ok(Box::new(self.clone()))
        }
        fn describe(&self) -> String {
            "recorder".to_string()
        }
    }

    #[async_trait]
    impl PacketSink for Recorder {
        async fn send(&mut self, packet: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(packet.to_vec());
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
        fn describe(&self) -> String {
            "recorder".to_string()
        }
    }

    fn config() -> InverterConfig {
        InverterConfig {
            send_interval_ms: 20,
            ..InverterConfig::default()
        }
    }

    #[test]
    fn modify_power_clamps_without_sending() {
        let rec = Recorder::default();
        let session = InverterSession::with_link(Box::new(rec.clone()), &config());
        assert_eq!(session.modify_power(5000), 900);
        assert_eq!(session.get_power(), 900);
        assert_eq!(session.modify_power(-5), 0);
        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_retransmits_until_stopped() {
        let rec = Recorder::default();
        let mut session = InverterSession::with_link(Box::new(rec.clone()), &config());
        session.connect().await.unwrap();
        session.start(120).unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        session.stop().await.unwrap();

        let sent = rec.sent.lock().unwrap().clone();
        assert!(sent.len() >= 2);
        assert!(sent.iter().all(|p| decode_packet(p).unwrap() == 120));
        assert!(*rec.closed.lock().unwrap());
        assert!(!session.is_running());

        let count = sent.len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.sent.lock().unwrap().len(), count);
    }

    #[tokio::test]
    async fn shutdown_sends_zero_last() {
        let rec = Recorder::default();
        let mut session = InverterSession::with_link(Box::new(rec.clone()), &config());
        session.connect().await.unwrap();
        session.start(300).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        session.shutdown().await.unwrap();
        let sent = rec.sent.lock().unwrap();
        assert_eq!(decode_packet(sent.last().unwrap()).unwrap(), 0);
    }

    #[test]
    fn start_without_connection_fails() {
        let mut session = InverterSession::with_link(Box::new(Recorder::default()), &config());
        let err = session.start(0).unwrap_err();
        assert!(err.is_connection_error());
        assert!(!session.is_faulted());
    }

    #[tokio::test]
    async fn send_now_waits_for_the_heartbeat() {
        let rec = Recorder::default();
        let mut session = InverterSession::with_link(Box::new(rec.clone()), &config());
        session.connect().await.unwrap();
        session.start(0).unwrap();
        session.modify_power(640);
        session.send_now().await.unwrap();

        let status = session.link_status();
        assert_eq!(status.last_watts, Some(640));
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.running);
        assert_eq!(decode_packet(rec.sent.lock().unwrap().last().unwrap()).unwrap(), 640);
        session.stop().await.unwrap();
        assert!(!session.is_faulted());
    }
}
