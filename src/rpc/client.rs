//! Client side of the command protocol.

use super::command::Request;
use super::split_documents;
use crate::controller::Actuators;
use crate::error::{Result, ZeroGridError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// One persistent connection; any failure drops it and the next call
/// reconnects
pub struct RpcClient {
    address: String,
    request_timeout: Duration,
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
    logger: StructuredLogger,
}

impl RpcClient {
    pub fn new(address: impl Into<String>, request_timeout: Duration) -> Self {
        let address = address.into();
        Self {
            logger: get_logger_with_context(LogContext::new("rpc_client").with_device(&address)),
            address,
            request_timeout,
            stream: None,
            buffer: Vec::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = match timeout(self.request_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ZeroGridError::transport(format!(
                    "Failed to connect to {}: {}",
                    self.address, e
                )));
            }
            Err(_) => {
                return Err(ZeroGridError::timeout(format!(
                    "Connecting to {} took longer than {:?}",
                    self.address, self.request_timeout
                )));
            }
        };
        self.logger.info("Connected to command server");
        self.buffer.clear();
        self.stream = Some(stream);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
        self.buffer.clear();
    }

    /// Send a request and return the `result` member; an `error` reply
    /// becomes a command error
    pub async fn call(&mut self, request: &Request) -> Result<Value> {
        let mut response = self.call_raw(request).await?;
        if let Some(error) = response.get("error") {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Err(ZeroGridError::command(format!("{}: {}", request.cmd, message)));
        }
        Ok(response
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Send a request and return the whole response document. A reused
    /// connection that turns out to be dead is replaced once.
    pub async fn call_raw(&mut self, request: &Request) -> Result<Value> {
        let reused = self.stream.is_some();
        match self.exchange(request).await {
            Err(e) if reused && e.is_connection_error() => {
                self.logger
                    .debug(&format!("Stale connection ({}), reconnecting", e));
                self.exchange(request).await
            }
            other => other,
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Value> {
        self.connect().await?;
        let outcome = timeout(self.request_timeout, self.round_trip(request)).await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.disconnect();
                Err(e)
            }
            Err(_) => {
                self.disconnect();
                Err(ZeroGridError::timeout(format!(
                    "{} got no reply within {:?}",
                    request.cmd, self.request_timeout
                )))
            }
        }
    }

    async fn round_trip(&mut self, request: &Request) -> Result<Value> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ZeroGridError::transport("Not connected"))?;
        let bytes = serde_json::to_vec(request)?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| ZeroGridError::transport(format!("Send failed: {}", e)))?;

        let mut chunk = [0u8; 4096];
        loop {
            if let Some(document) = split_documents(&mut self.buffer).into_iter().next() {
                return document
                    .map_err(|e| ZeroGridError::protocol(format!("Invalid response: {}", e)));
            }
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| ZeroGridError::transport(format!("Receive failed: {}", e)))?;
            if n == 0 {
                return Err(ZeroGridError::transport("Connection closed by server"));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Actuators behind a remote command server
pub struct RemoteActuators {
    client: RpcClient,
}

impl RemoteActuators {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

fn confirmed(value: Value, what: &str) -> Result<()> {
    if value == Value::Bool(true) {
        Ok(())
    } else {
        Err(ZeroGridError::transport(format!(
            "Remote charger did not confirm {}",
            what
        )))
    }
}

#[async_trait]
impl Actuators for RemoteActuators {
    async fn prepare(&mut self, charge_voltage: f64) -> Result<()> {
        let reply = self
            .client
            .call(&Request::new("set_v_set").arg(charge_voltage))
            .await?;
        confirmed(reply, "the voltage setpoint")?;
        if self.client.call(&Request::new("is_output")).await? != Value::Bool(true) {
            let reply = self.client.call(&Request::new("set_output").arg(true)).await?;
            confirmed(reply, "output enable")?;
        }
        self.set_inverter_power(0).await?;
        Ok(())
    }

    async fn set_inverter_power(&mut self, watts: u16) -> Result<u16> {
        let reply = self
            .client
            .call(&Request::new("set_power").kwarg("power_watts", watts))
            .await?;
        reply
            .get("power_set")
            .and_then(Value::as_u64)
            .and_then(|w| u16::try_from(w).ok())
            .ok_or_else(|| ZeroGridError::protocol(format!("Unexpected set_power reply: {}", reply)))
    }

    async fn set_charger_current(&mut self, amps: f64) -> Result<()> {
        let reply = self
            .client
            .call(&Request::new("set_i_set").arg(amps))
            .await?;
        confirmed(reply, &format!("{:.3} A", amps))
    }

    async fn charger_voltage(&mut self) -> Result<Option<f64>> {
        Ok(self.client.call(&Request::new("get_v_out")).await?.as_f64())
    }
}
