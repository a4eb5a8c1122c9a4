use super::Link;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Serial link for the photometer's RS-232/USB port
///
/// Wraps the serialport crate. Writes and reads run on Tokio's blocking
/// executor; reads only ever ask for bytes the driver already reports as
/// buffered, so they return without waiting on the wire.
pub struct SerialLink {
    /// Port name (e.g., "/dev/ttyUSB0", "COM4")
    port_name: String,

    /// Baud rate (e.g., 115200)
    baud_rate: u32,

    /// The actual serial port (behind Arc<Mutex> for blocking-task access)
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialLink {
    /// Create a closed link for the given port.
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM4")
    /// * `baud_rate` - Communication speed (e.g., 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
        }
    }

    /// Names of the serial ports present on this machine.
    pub fn available_ports() -> AppResult<Vec<String>> {
        let ports = serialport::available_ports()
            .map_err(|e| DaqError::connection("*", format!("Failed to enumerate ports: {e}")))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn handle(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| DaqError::connection(&self.port_name, "serial port not open"))
    }

    fn io_error(&self, action: &str, err: impl std::fmt::Display) -> DaqError {
        DaqError::connection(&self.port_name, format!("{action} failed: {err}"))
    }
}

#[async_trait]
impl Link for SerialLink {
    async fn open(&mut self, port: &str, baud_rate: u32) -> AppResult<()> {
        self.close().await;
        self.port_name = port.to_string();
        self.baud_rate = baud_rate;

        let opened = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| {
                DaqError::connection(
                    port,
                    format!("Failed to open serial port at {baud_rate} baud: {e}"),
                )
            })?;

        opened
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| self.io_error("flush", e))?;

        self.port = Some(Arc::new(Mutex::new(opened)));
        debug!(port, baud_rate, "serial port opened");
        Ok(())
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let port = self.handle()?;
        let data = bytes.to_vec();

        // Execute blocking serial I/O on dedicated thread
        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            guard.write_all(&data)?;
            guard.flush()
        })
        .await
        .map_err(|e| self.io_error("write task", e))?
        .map_err(|e| self.io_error("write", e))
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        let port = self.handle()?;
        let guard = port.lock().await;
        let count = guard
            .bytes_to_read()
            .map_err(|e| self.io_error("bytes_to_read", e))?;
        Ok(count as usize)
    }

    async fn read(&mut self, max: usize) -> AppResult<Vec<u8>> {
        let port = self.handle()?;

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let pending = guard.bytes_to_read().map_err(std::io::Error::from)? as usize;
            let mut buffer = vec![0u8; pending.min(max)];
            if buffer.is_empty() {
                return Ok(buffer);
            }
            let n = guard.read(&mut buffer)?;
            buffer.truncate(n);
            Ok::<_, std::io::Error>(buffer)
        })
        .await
        .map_err(|e| self.io_error("read task", e))?
        .map_err(|e| self.io_error("read", e))
    }
}
