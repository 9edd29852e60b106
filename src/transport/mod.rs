//! Transport layer for I/O abstraction
//!
//! The engine drives the sensor link through this trait: byte reads and
//! writes, a baud-rate setter that drains the transmit path first, and a
//! buffer flush for resynchronization. [`SerialTransport`] talks to real
//! hardware; [`MockTransport`] backs the tests.

use crate::error::Result;

mod mock;
mod serial;

pub use mock::MockTransport;
pub use serial::SerialTransport;

/// Transport trait for sensor link communication
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush any pending writes (blocking until transmitted)
    fn flush(&mut self) -> Result<()>;

    /// Check if data is available to read
    fn available(&mut self) -> Result<usize> {
        Ok(0) // Default implementation
    }

    /// Drain pending output, then reconfigure the line speed
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Discard any buffered input and output
    fn clear(&mut self) -> Result<()>;
}
