//! Remote command server
//!
//! JSON requests over long-lived TCP connections, one response document per
//! request. Connections are served by a bounded pool of workers and closed
//! after an idle timeout. Every command goes through the same session locks
//! as the control loop.

use crate::charger::ChargerSession;
use crate::config::RpcConfig;
use crate::context::DeviceContext;
use crate::error::{Result, ZeroGridError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{MutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

mod client;
mod command;
mod health;

pub use client::{RemoteActuators, RpcClient};
pub use command::{COMMAND_NAMES, Command, Request};
pub use health::{ConnectionHealth, HealthMonitor};

const READ_CHUNK: usize = 4096;
/// A pending request larger than this is rejected and the connection closed
const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Pull every complete JSON document off the front of `buffer`. An
/// incomplete trailing document stays in the buffer; a malformed one
/// yields an error entry and discards the rest.
pub fn split_documents(buffer: &mut Vec<u8>) -> Vec<std::result::Result<Value, String>> {
    let mut documents = Vec::new();
    let consumed = {
        let mut stream = serde_json::Deserializer::from_slice(buffer).into_iter::<Value>();
        loop {
            match stream.next() {
                Some(Ok(value)) => documents.push(Ok(value)),
                Some(Err(e)) if e.is_eof() => break stream.byte_offset(),
                Some(Err(e)) => {
                    documents.push(Err(e.to_string()));
                    break buffer.len();
                }
                None => break stream.byte_offset(),
            }
        }
    };
    buffer.drain(..consumed);
    documents
}

pub struct CommandDispatcher {
    ctx: DeviceContext,
    config: RpcConfig,
    workers: Arc<Semaphore>,
    logger: StructuredLogger,
}

impl CommandDispatcher {
    pub fn new(ctx: DeviceContext, config: &RpcConfig) -> Self {
        Self {
            ctx,
            config: config.clone(),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            logger: get_logger_with_context(
                LogContext::new("rpc").with_field("workers", config.max_workers.to_string()),
            ),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| ZeroGridError::transport(format!("Failed to bind {}: {}", address, e)))?;
        self.logger.info(&format!("Listening on {}", address));
        Ok(listener)
    }

    /// Bind and serve until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Accept loop. A connection waits for a free worker before it is
    /// read; all workers are joined before this returns.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let mut workers = JoinSet::new();
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.workers.clone().acquire_owned() => permit
                    .map_err(|_| ZeroGridError::command("Worker pool closed"))?,
            };
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        self.logger.warn(&format!("Accept failed: {}", e));
                        continue;
                    }
                },
            };
            let dispatcher = self.clone();
            let token = cancel.clone();
            workers.spawn(async move {
                dispatcher.handle_connection(stream, peer, token).await;
                drop(permit);
            });
            while let Some(done) = workers.try_join_next() {
                if let Err(e) = done {
                    self.logger.error(&format!("Connection worker failed: {}", e));
                }
            }
        }
        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                self.logger.error(&format!("Connection worker failed: {}", e));
            }
        }
        self.logger.info("Command server stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        self.logger.info(&format!("Connection from {}", peer));
        let idle = self.config.idle_timeout();
        let mut buffer = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = timeout(idle, stream.read(&mut chunk)) => read,
            };
            let n = match read {
                Err(_) => {
                    self.logger.debug(&format!("{} idle for {:?}, closing", peer, idle));
                    break;
                }
                Ok(Err(e)) => {
                    self.logger.debug(&format!("{} read error: {}", peer, e));
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
            };
            buffer.extend_from_slice(&chunk[..n]);

            for document in split_documents(&mut buffer) {
                let response = match document {
                    Ok(value) => self.handle_value(value).await,
                    Err(e) => json!({ "error": format!("Invalid JSON: {}", e) }),
                };
                if let Err(e) = write_document(&mut stream, &response, idle).await {
                    self.logger.debug(&format!("{} write error: {}", peer, e));
                    return;
                }
            }

            if buffer.len() > MAX_REQUEST_BYTES {
                let response = json!({ "error": "Invalid JSON: request too large" });
                if let Err(e) = write_document(&mut stream, &response, idle).await {
                    self.logger.debug(&format!("{} write error: {}", peer, e));
                }
                break;
            }
        }
        self.logger.info(&format!("Connection closed: {}", peer));
    }

    /// Full request handling for one decoded document
    pub async fn handle_value(&self, value: Value) -> Value {
        let request = match serde_json::from_value::<Request>(value) {
            Ok(request) => request,
            Err(e) => return json!({ "error": format!("Malformed request: {}", e) }),
        };
        self.handle_request(&request).await
    }

    pub async fn handle_request(&self, request: &Request) -> Value {
        let (outcome, on_charger) = match Command::parse(request) {
            Ok(command) => {
                let on_charger = command.targets_charger();
                (self.execute(command).await, on_charger)
            }
            Err(e) => (Err(e), true),
        };
        match outcome {
            Ok(result) => json!({ "result": result }),
            Err(e) => {
                self.logger
                    .debug(&format!("{} failed: {}", request.cmd, e));
                let mut body = json!({ "error": e.to_string() });
                if e.is_connection_error() {
                    let health = if on_charger {
                        &self.ctx.charger_health
                    } else {
                        &self.ctx.inverter_health
                    };
                    body["status"] = json!(*health.read().await);
                }
                body
            }
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Value> {
        match command {
            Command::GetStatus => {
                let charger = self.ctx.charger_health.read().await.clone();
                let inverter_health = self.ctx.inverter_health.read().await.clone();
                let inverter = self.ctx.inverter.lock().await;
                Ok(json!({
                    "charger": charger,
                    "inverter": {
                        "health": inverter_health,
                        "running": inverter.is_running(),
                        "power": inverter.get_power(),
                        "max_power": inverter.max_power(),
                    },
                }))
            }
            Command::GetPower => Ok(json!(self.ctx.inverter.lock().await.get_power())),
            Command::SetPower {
                watts,
                via_inverter,
            } => {
                let mut inverter = self.ctx.inverter.lock().await;
                let power_set = inverter.modify_power(watts);
                if via_inverter {
                    let sent = inverter.transmit().await;
                    drop(inverter);
                    let mut health = self.ctx.inverter_health.write().await;
                    match sent {
                        Ok(()) => health.record_success(),
                        Err(e) => {
                            health.record_failure(e.to_string());
                            return Err(e);
                        }
                    }
                }
                self.logger.info(&format!(
                    "Inverter power set to {} W (requested {})",
                    power_set, watts
                ));
                Ok(json!({ "power_set": power_set, "via_inverter": via_inverter }))
            }
            command if command.targets_charger() => {
                let mut charger = self.charger_ready().await?;
                charger_command(&mut charger, command).await
            }
            command => Err(ZeroGridError::command(format!(
                "No handler for {:?}",
                command
            ))),
        }
    }

    /// Lock the charger, failing fast when it is known dead and a single
    /// reconnect does not bring it back. Health only recovers once the
    /// device has answered an identification read.
    async fn charger_ready(&self) -> Result<MutexGuard<'_, ChargerSession>> {
        let mut charger = self.ctx.charger.lock().await;
        let known_dead = self.ctx.charger_health.read().await.is_known_dead();
        if known_dead || !charger.is_connected() {
            let verified = match charger.reconnect().await {
                Ok(()) => match charger.get_id().await {
                    Some(_) => Ok(()),
                    None => {
                        charger.disconnect();
                        Err(ZeroGridError::transport("no reply to identification read"))
                    }
                },
                Err(e) => Err(e),
            };
            let mut health = self.ctx.charger_health.write().await;
            match verified {
                Ok(()) => health.record_success(),
                Err(e) => {
                    health.record_failure(e.to_string());
                    return Err(ZeroGridError::transport(format!(
                        "Charger not connected: {}",
                        e
                    )));
                }
            }
        }
        Ok(charger)
    }
}

/// Write one response document, bounded by `limit`
async fn write_document(stream: &mut TcpStream, value: &Value, limit: Duration) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    let io = async {
        stream.write_all(&bytes).await?;
        stream.flush().await
    };
    match timeout(limit, io).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ZeroGridError::timeout(format!(
            "Response not written within {:?}",
            limit
        ))),
    }
}

/// Charger accessors answer `null` when the device gave no data
async fn charger_command(charger: &mut ChargerSession, command: Command) -> Result<Value> {
    let value = match command {
        Command::GetState => serde_json::to_value(charger.state())?,
        Command::Update => {
            if charger.update().await {
                serde_json::to_value(charger.state())?
            } else {
                Value::Null
            }
        }
        Command::UpdateBattery => {
            if charger.update_battery().await {
                serde_json::to_value(charger.state().battery)?
            } else {
                Value::Null
            }
        }
        Command::GetId => json!(charger.get_id().await),
        Command::GetSn => json!(charger.get_sn().await),
        Command::GetFw => json!(charger.get_fw().await),
        Command::GetIntTempC => json!(charger.get_int_temp_c().await),
        Command::GetIntTempF => json!(charger.get_int_temp_f().await),
        Command::GetVSet => json!(charger.get_v_set().await),
        Command::SetVSet(volts) => json!(charger.set_v_set(volts).await),
        Command::GetISet => json!(charger.get_i_set().await),
        Command::SetISet(amps) => json!(charger.set_i_set(amps).await),
        Command::GetVOut => json!(charger.get_v_out().await),
        Command::GetIOut => json!(charger.get_i_out().await),
        Command::GetPOut => json!(charger.get_p_out().await),
        Command::GetVIn => json!(charger.get_v_in().await),
        Command::IsKeypadLocked => json!(charger.is_keypad_locked().await),
        Command::GetProtection => match charger.get_protection().await {
            Some(protection) => json!({ "protection": protection }),
            None => Value::Null,
        },
        Command::GetMode => json!(charger.get_mode().await),
        Command::IsOutput => json!(charger.is_output().await),
        Command::SetOutput(on) => json!(charger.set_output(on).await),
        Command::GetPreset => json!(charger.get_preset().await),
        Command::SetPreset(preset) => json!(charger.set_preset(preset).await),
        Command::IsBuzzer => json!(charger.is_buzzer().await),
        Command::SetBuzzer(on) => json!(charger.set_buzzer(on).await),
        Command::IsBootPower => json!(charger.is_boot_power().await),
        Command::SetBootPower(on) => json!(charger.set_boot_power(on).await),
        Command::GetBacklight => json!(charger.get_backlight().await),
        Command::SetBacklight(level) => json!(charger.set_backlight(level).await),
        Command::GetDateTime => json!(charger.get_date_time().await),
        Command::SetDateTime(at) => json!(charger.set_date_time(at).await),
        Command::GetStatus | Command::GetPower | Command::SetPower { .. } => {
            return Err(ZeroGridError::command("Not a charger command"));
        }
    };
    Ok(value)
}
