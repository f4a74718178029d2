//! Serial SCPI transport for RS-232 / USB-serial instruments.
//!
//! Serial I/O is blocking, so every exchange runs on Tokio's blocking pool while holding
//! the port lock. One command/response pair is in flight at a time.

use crate::hardware::scpi::ScpiTransport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// SCPI transport over a serial port.
pub struct SerialScpiTransport {
    port_name: String,
    port: SharedPort,
    terminator: String,
    delimiter: u8,
    timeout: Duration,
}

impl SerialScpiTransport {
    /// Open `port_name` at `baud_rate`.
    ///
    /// Commands are terminated with `"\r\n"` and responses end at `'\n'`.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| {
                format!(
                    "Failed to open serial port '{}' at {} baud",
                    port_name, baud_rate
                )
            })?;
        debug!(port = port_name, baud_rate, "Serial port opened");

        Ok(Self {
            port_name: port_name.to_string(),
            port: Arc::new(Mutex::new(Some(port))),
            terminator: "\r\n".to_string(),
            delimiter: b'\n',
            timeout,
        })
    }

    /// Set the command terminator
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Set the response delimiter byte
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    async fn exchange(&self, command: &str, read_response: bool) -> Result<String> {
        let port = self.port.clone();
        let line = format!("{}{}", command, self.terminator);
        let command = command.to_string();
        let port_name = self.port_name.clone();
        let delimiter = self.delimiter;
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let port = guard
                .as_mut()
                .ok_or_else(|| anyhow!("Serial port '{}' is closed", port_name))?;

            port.write_all(line.as_bytes())
                .with_context(|| format!("Failed to write to '{}'", port_name))?;
            port.flush().context("Failed to flush serial port")?;
            trace!(port = %port_name, command = %command, "Sent");

            if !read_response {
                return Ok(String::new());
            }

            let mut response = Vec::new();
            let mut byte = [0u8; 1];
            let start = Instant::now();
            loop {
                if start.elapsed() > timeout {
                    return Err(anyhow!(
                        "Serial read timeout after {:?} waiting for '{}'",
                        timeout,
                        command
                    ));
                }
                match port.read(&mut byte) {
                    Ok(1) => {
                        response.push(byte[0]);
                        if byte[0] == delimiter {
                            break;
                        }
                    }
                    Ok(_) => return Err(anyhow!("Unexpected EOF on '{}'", port_name)),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                }
            }

            let response = String::from_utf8_lossy(&response).trim().to_string();
            trace!(port = %port_name, response = %response, "Received");
            Ok(response)
        })
        .await
        .context("Serial I/O task panicked")?
    }
}

#[async_trait]
impl ScpiTransport for SerialScpiTransport {
    async fn query(&self, command: &str) -> Result<String> {
        self.exchange(command, true).await
    }

    async fn command(&self, command: &str) -> Result<()> {
        self.exchange(command, false).await.map(|_| ())
    }

    async fn clear_input(&self) -> Result<()> {
        let mut guard = self.port.lock().await;
        if let Some(port) = guard.as_mut() {
            port.clear(ClearBuffer::Input)
                .context("Failed to clear serial input buffer")?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.port.lock().await.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }
}
