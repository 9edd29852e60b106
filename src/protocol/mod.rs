//! EV3 UART sensor protocol
//!
//! Message format: a single header byte `TT SSS CCC` (message class,
//! payload-size exponent, command code), followed for non-SYS messages by a
//! payload and an XOR checksum seeded with 0xFF. INFO messages carry one
//! extra sub-command byte between header and payload.
//!
//! The protocol is self-describing: a freshly powered sensor announces its
//! type, mode count, and per-mode metadata at 2400 baud, then the host
//! acknowledges and both ends switch to the sensor's requested baud rate for
//! the measurement stream.

pub mod codec;
pub mod modes;
pub mod session;

pub use codec::DataFormat;
pub use modes::ModeInfo;
pub use session::{Phase, Session};

// Message classes (high 2 bits of the header byte)
pub const MSG_TYPE_MASK: u8 = 0xC0;
pub const MSG_TYPE_SYS: u8 = 0x00;
pub const MSG_TYPE_CMD: u8 = 0x40;
pub const MSG_TYPE_INFO: u8 = 0x80;
pub const MSG_TYPE_DATA: u8 = 0xC0;

// Command code (low 3 bits of the header byte)
pub const MSG_CMD_MASK: u8 = 0x07;

// SYS single-byte messages
pub const SYS_SYNC: u8 = 0x00;
pub const SYS_NACK: u8 = 0x02; // doubles as the keep-alive probe
pub const SYS_ACK: u8 = 0x04;
pub const SYS_ESC: u8 = 0x06;

// CMD command codes
pub const CMD_TYPE: u8 = 0x00;
pub const CMD_MODES: u8 = 0x01;
pub const CMD_SPEED: u8 = 0x02;
pub const CMD_SELECT: u8 = 0x03;
pub const CMD_WRITE: u8 = 0x04;

// INFO sub-commands (second byte of an INFO message)
pub const INFO_NAME: u8 = 0x00;
pub const INFO_RAW: u8 = 0x01;
pub const INFO_PCT: u8 = 0x02;
pub const INFO_SI: u8 = 0x03;
pub const INFO_UNITS: u8 = 0x04;
pub const INFO_FORMAT: u8 = 0x80;

// Sensor type ids
pub const TYPE_MAX: u8 = 101; // highest known sensor type id
pub const TYPE_UNKNOWN: u8 = 125; // reserved "no sensor identified yet"
pub const TYPE_COLOR: u8 = 29; // EV3 color sensor (bad RGB-RAW checksums)
pub const TYPE_IR: u8 = 33; // EV3 IR sensor (sends checksum after SYNC)

// Link parameters
pub const BAUD_MIN: u32 = 2400;
pub const BAUD_MAX: u32 = 460_800;
pub const MAX_DATA_ERRORS: u32 = 6;

// Buffer sizes
pub const BUFFER_SIZE: usize = 256; // in-flight frame buffer
pub const MAX_MSG_SIZE: usize = 131; // INFO with 128-byte payload
pub const SENSOR_DATA_SIZE: usize = 32; // latest sample bytes per mode
pub const MAX_MODES: usize = 8;
pub const NAME_SIZE: usize = 11;
pub const UNITS_SIZE: usize = 4;

// Timing
pub const SEND_ACK_DELAY_MS: u64 = 10;
pub const SET_BAUD_DELAY_MS: u64 = 10;
pub const KEEP_ALIVE_PERIOD_MS: u64 = 100;
