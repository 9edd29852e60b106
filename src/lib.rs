//! uartsense - Protocol engine for LEGO Mindstorms EV3 UART sensors
//!
//! EV3 UART sensors identify themselves: a freshly powered sensor announces
//! its type at 2400 baud, describes every measurement mode it supports,
//! then waits for an acknowledgement before switching to its preferred
//! speed and streaming samples. This library sits between a raw serial
//! byte stream and that conversation:
//!
//! - synchronize with the sensor and validate its mode catalog
//! - acknowledge the handshake and drive the baud-rate switch
//! - stream measurement frames and keep the link alive with periodic
//!   NACK probes
//! - detect link failure and resynchronize without caller involvement
//! - expose sensor identity, mode metadata, and the latest samples
//!
//! The engine is built from swappable capabilities: [`Transport`] for the
//! serial line, [`Scheduler`] for delayed and periodic work, and
//! [`Publisher`] for upstream change notifications. The bundled
//! [`MockTransport`] and [`ManualScheduler`] make the whole protocol
//! testable without hardware or wall-clock time.

pub mod config;
pub mod error;
pub mod port;
pub mod protocol;
pub mod publisher;
pub mod scheduler;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use port::SensorPort;
pub use protocol::{DataFormat, ModeInfo, Phase};
pub use publisher::{LogPublisher, Publisher, RecordingPublisher, SensorEvent};
pub use scheduler::{CancelHandle, ManualScheduler, Scheduler, ThreadScheduler, Tick};
pub use transport::{MockTransport, SerialTransport, Transport};
