//! Byte-stream link implementations
//!
//! A [`Link`] owns the open/closed state of one connection to the instrument.
//! It knows nothing about framing or retries; the protocol engine layers
//! those on top.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;

pub use mock::SimulatedInstrument;
#[cfg(feature = "instrument_serial")]
pub use serial_adapter::SerialLink;

use crate::error::AppResult;
use async_trait::async_trait;

/// A single byte-stream connection to the instrument.
///
/// Every operation except `open` fails with `DaqError::Connection` while the
/// link is closed.
#[async_trait]
pub trait Link: Send {
    /// Open (or reopen) the connection.
    async fn open(&mut self, port: &str, baud_rate: u32) -> AppResult<()>;

    /// Close the connection. Closing a closed link is a no-op.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Port the link was last opened on.
    fn port_name(&self) -> &str;

    fn baud_rate(&self) -> u32;

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Number of bytes that can be read without blocking.
    async fn bytes_available(&mut self) -> AppResult<usize>;

    /// Read at most `max` of the available bytes.
    async fn read(&mut self, max: usize) -> AppResult<Vec<u8>>;
}

#[async_trait]
impl<L: Link + ?Sized> Link for Box<L> {
    async fn open(&mut self, port: &str, baud_rate: u32) -> AppResult<()> {
        (**self).open(port, baud_rate).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn port_name(&self) -> &str {
        (**self).port_name()
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        (**self).write(bytes).await
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        (**self).bytes_available().await
    }

    async fn read(&mut self, max: usize) -> AppResult<Vec<u8>> {
        (**self).read(max).await
    }
}
