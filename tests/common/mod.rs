#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use zerogrid::charger::{ChargerSession, RegisterBus, RegisterLink};
use zerogrid::config::{ChargerConfig, InverterConfig, MeterConfig};
use zerogrid::error::{Result, ZeroGridError};
use zerogrid::inverter::{InverterSession, PacketLink, PacketSink, decode_packet};
use zerogrid::meter::{LineSource, MeterReader};

/// In-memory register device shared between a link and the test
#[derive(Default)]
pub struct Device {
    pub registers: Mutex<Vec<u16>>,
    pub offline: AtomicBool,
    /// Port opens but nothing answers
    pub mute: AtomicBool,
    pub fail_next_io: AtomicUsize,
    pub opens: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: Mutex<Vec<(u16, u16)>>,
}

impl Device {
    /// RD6006 (id 60062) at 57.00 V out
    pub fn rd6006() -> Arc<Self> {
        let device = Device::default();
        {
            let mut regs = device.registers.lock().unwrap();
            regs.resize(300, 0);
            regs[0] = 60062;
            regs[1] = 0;
            regs[2] = 12345;
            regs[3] = 140;
            regs[8] = 5700;
            regs[10] = 5700;
        }
        Arc::new(device)
    }

    pub fn register(&self, register: u16) -> u16 {
        self.registers.lock().unwrap()[register as usize]
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ZeroGridError::transport("device offline"));
        }
        if self.mute.load(Ordering::SeqCst) {
            return Err(ZeroGridError::timeout("no reply"));
        }
        let pending = self.fail_next_io.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next_io.store(pending - 1, Ordering::SeqCst);
            return Err(ZeroGridError::transport("line dropped"));
        }
        Ok(())
    }
}

pub struct FakeLink(pub Arc<Device>);

struct FakeBus(Arc<Device>);

#[async_trait]
impl RegisterLink for FakeLink {
    async fn open(&self) -> Result<Box<dyn RegisterBus>> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        if self.0.offline.load(Ordering::SeqCst) {
            return Err(ZeroGridError::transport("no such port"));
        }
        Ok(Box::new(FakeBus(self.0.clone())))
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

#[async_trait]
impl RegisterBus for FakeBus {
    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        self.0.check()?;
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        let regs = self.0.registers.lock().unwrap();
        Ok(regs[start as usize..(start + count) as usize].to_vec())
    }

    async fn write_single_register(&mut self, register: u16, value: u16) -> Result<()> {
        self.0.check()?;
        self.0.registers.lock().unwrap()[register as usize] = value;
        self.0.writes.lock().unwrap().push((register, value));
        Ok(())
    }
}

pub fn charger_config() -> ChargerConfig {
    ChargerConfig {
        retries: 3,
        retry_delay_ms: 1,
        reconnect_backoff_ms: 5,
        ..ChargerConfig::default()
    }
}

pub fn charger(device: &Arc<Device>) -> ChargerSession {
    ChargerSession::with_link(Box::new(FakeLink(device.clone())), &charger_config())
}

/// Packet link whose sinks keep everything they were given. Setting
/// `fail` makes every send a transport error.
#[derive(Clone, Default)]
pub struct Recorder {
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
    pub fail: Arc<AtomicBool>,
    pub opens: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn last_watts(&self) -> Option<u16> {
        self.sent
            .lock()
            .unwrap()
            .last()
            .map(|p| decode_packet(p).unwrap())
    }
}

#[async_trait]
impl PacketSink for Recorder {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ZeroGridError::transport("write failed"));
        }
        self.sent.lock().unwrap().push(packet.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "recorder".to_string()
    }
}

#[async_trait]
impl PacketLink for Recorder {
    async fn open(&self) -> Result<Box<dyn PacketSink>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }

    fn describe(&self) -> String {
        "recorder".to_string()
    }
}

pub fn inverter_config() -> InverterConfig {
    InverterConfig {
        send_interval_ms: 20,
        timeout_ms: 200,
        reconnect_backoff_ms: 5,
        ..InverterConfig::default()
    }
}

/// Connected session over `recorder`
pub async fn inverter(recorder: &Recorder) -> InverterSession {
    let mut session = InverterSession::with_link(Box::new(recorder.clone()), &inverter_config());
    session.connect().await.unwrap();
    session
}

/// Line source fed from a queue the test can refill
#[derive(Clone, Default)]
pub struct Lines {
    pub queue: Arc<Mutex<VecDeque<String>>>,
}

impl Lines {
    pub fn push_telegram(&self, import_kw: &str, export_kw: &str) {
        let mut q = self.queue.lock().unwrap();
        q.push_back("/ISK5\\2M550T-1012\r\n".to_string());
        q.push_back("0-0:1.0.0(240501120000S)\r\n".to_string());
        q.push_back(format!("1-0:1.7.0({}*kW)\r\n", import_kw));
        q.push_back(format!("1-0:2.7.0({}*kW)\r\n", export_kw));
        q.push_back("1-0:21.7.0(00.050*kW)\r\n".to_string());
        q.push_back("!1F28\r\n".to_string());
    }
}

#[async_trait]
impl LineSource for Lines {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .map(String::into_bytes))
    }

    fn close(&mut self) {}
}

pub fn meter(lines: &Lines) -> MeterReader {
    let config = MeterConfig {
        timeout_ms: 50,
        ..MeterConfig::default()
    };
    MeterReader::with_source(Box::new(lines.clone()), &config)
}
