//! Error types for uartsense
//!
//! # Error Recovery Strategies
//!
//! Different error types require different recovery approaches:
//!
//! ## Link Errors (Handled Internally)
//!
//! Framing, protocol, and checksum failures on the sensor link never surface
//! here. The engine recovers on its own by resynchronizing: it drops back to
//! 2400 baud and waits for the sensor to restart its handshake. The reason
//! for the most recent resync is kept on the session as a diagnostic string.
//!
//! ## Transport Errors (Surfaced to Caller)
//!
//! - **`Serial`**: Serial port communication error. Often caused by cable
//!   disconnection or device reset. A failed write does not by itself
//!   trigger a resync.
//! - **`Io`**: Generic I/O error. Usually retryable after a brief delay.
//!
//! ## Request Errors (Caller Mistakes, No State Change)
//!
//! - **`InvalidMode`**: Mode index beyond what the sensor declared.
//! - **`UnknownMode`**: No mode with the requested name.
//! - **`WriteTooLong`**: Command payload exceeds the 32-byte wire limit.
//! - **`InvalidValueIndex`**: Value index beyond the current mode's data sets.
//! - **`NotReady`**: The session is not in the running phase; no sample is
//!   available yet.
//!
//! ## Configuration Errors (Fix and Restart)
//!
//! - **`Config`**: Configuration file is invalid. Fix the file and restart.
//!
//! ## Lifecycle Errors
//!
//! - **`ThreadPanic`**: A worker thread panicked. The port must be
//!   reattached.

use thiserror::Error;

/// Errors that can occur in uartsense
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid mode {requested} (sensor has {available} modes)")]
    InvalidMode { requested: u8, available: u8 },

    #[error("No mode named {0:?}")]
    UnknownMode(String),

    #[error("Write payload of {0} bytes exceeds the 32 byte limit")]
    WriteTooLong(usize),

    #[error("Value index {index} out of range (mode has {data_sets} data sets)")]
    InvalidValueIndex { index: usize, data_sets: u8 },

    #[error("Sensor is not ready (no completed handshake)")]
    NotReady,

    #[error("Thread panic")]
    ThreadPanic,

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
