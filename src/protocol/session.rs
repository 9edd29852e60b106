//! Acquisition state machine for one sensor link
//!
//! A [`Session`] consumes the raw byte stream from a sensor, frames it,
//! validates it, and walks the link through its phases: scan for the TYPE
//! announcement, collect the mode catalog, acknowledge, switch baud, then
//! stream measurements under a keep-alive watchdog.
//!
//! The session itself never touches the transport or the clock. Every
//! externally visible side effect is emitted as an [`Action`] and executed
//! by the owning port after the session lock is released. This keeps all
//! state mutation serialized across the three callback contexts
//! (bytes-received, delayed work, watchdog tick) while the protocol logic
//! stays deterministic and directly testable.
//!
//! # Phases
//!
//! ```text
//! Unsynced ──TYPE triplet──▶ Collecting ──SYS_ACK──▶ AckPending
//!     ▲                                                  │ +10ms: send ACK
//!     │                                                  ▼
//!     └───────── any protocol failure ──────── BaudSwitching
//!                (via transient Failing)                 │ +10ms: set baud
//!                                                        ▼
//!                                                     Running ◀─┐
//!                                                        │ DATA │
//!                                                        └──────┘
//! ```
//!
//! A failure from any phase records a diagnostic reason, drops the receive
//! buffer, and schedules a return to 2400 baud so the sensor's own
//! handshake restart can be observed afresh.

use super::codec::{checksum, msg_size, DataFormat};
use super::modes::{InfoFlags, ModeInfo};
use super::{
    BAUD_MAX, BAUD_MIN, BUFFER_SIZE, CMD_MODES, CMD_SPEED, CMD_TYPE, INFO_FORMAT, INFO_NAME,
    INFO_PCT, INFO_RAW, INFO_SI, INFO_UNITS, MAX_DATA_ERRORS, MAX_MODES, MAX_MSG_SIZE,
    MSG_CMD_MASK, MSG_TYPE_CMD, MSG_TYPE_DATA, MSG_TYPE_INFO, MSG_TYPE_MASK, MSG_TYPE_SYS,
    NAME_SIZE, SENSOR_DATA_SIZE, SYS_ACK, SYS_NACK, SYS_SYNC, TYPE_COLOR, TYPE_MAX, TYPE_UNKNOWN,
    UNITS_SIZE,
};
use crate::publisher::SensorEvent;
use crate::scheduler::Tick;

/// Link phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Scanning the byte stream for a valid TYPE announcement
    Unsynced,
    /// Receiving the mode catalog
    Collecting,
    /// Catalog complete, ACK send pending (10 ms)
    AckPending,
    /// ACK sent, baud switch pending (10 ms)
    BaudSwitching,
    /// Measurement streaming with keep-alive watchdog
    Running,
    /// Transient marker while a failure is being recorded; the session
    /// re-enters Unsynced before control returns to the caller
    Failing,
}

/// Side effect requested by the session, executed by the owning port.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Write bytes to the transport from the current context
    Send(Vec<u8>),
    /// Hand bytes to the deferred writer (keep-alive path must not block)
    SendDeferred(Vec<u8>),
    /// Arm the one-shot ACK-send delay
    ScheduleAck,
    /// Arm the one-shot baud-change delay
    ScheduleBaudChange,
    /// Arm the periodic keep-alive watchdog
    StartKeepAlive,
    /// Cancel any pending ACK and baud-change delays
    CancelHandshakeTimers,
    /// Drain the transport, then reconfigure it to the given baud rate
    SetBaud(u32),
    /// Forward a change notification upstream
    Notify(SensorEvent),
}

/// Protocol state for one attached sensor link.
pub struct Session {
    phase: Phase,
    sensor_type: u8,
    num_modes: u8,
    num_view_modes: u8,
    mode: u8,
    info_flags: InfoFlags,
    new_baud_rate: u32,
    buffer: [u8; BUFFER_SIZE],
    write_ptr: usize,
    data_error_count: u32,
    data_seen: bool,
    last_error: Option<&'static str>,
    registered: bool,
    mode_info: [ModeInfo; MAX_MODES],
}

impl Session {
    pub fn new() -> Self {
        Session {
            phase: Phase::Unsynced,
            sensor_type: TYPE_UNKNOWN,
            num_modes: 0,
            num_view_modes: 0,
            mode: 0,
            info_flags: InfoFlags::default(),
            new_baud_rate: BAUD_MIN,
            buffer: [0; BUFFER_SIZE],
            write_ptr: 0,
            data_error_count: 0,
            data_seen: false,
            last_error: None,
            registered: false,
            mode_info: core::array::from_fn(|_| ModeInfo::default()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sensor_type(&self) -> u8 {
        self.sensor_type
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn num_modes(&self) -> u8 {
        self.num_modes
    }

    pub fn num_view_modes(&self) -> u8 {
        self.num_view_modes
    }

    pub fn baud_rate(&self) -> u32 {
        self.new_baud_rate
    }

    pub fn data_error_count(&self) -> u32 {
        self.data_error_count
    }

    /// Reason for the most recent resync, if any. Diagnostic only.
    pub fn last_error(&self) -> Option<&'static str> {
        self.last_error
    }

    /// True once the sensor has been announced upstream. The handle stays
    /// registered across resyncs within one attachment.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn mode_info(&self, mode: u8) -> &ModeInfo {
        &self.mode_info[mode as usize]
    }

    /// Catalog of the modes the sensor declared.
    pub fn modes(&self) -> &[ModeInfo] {
        &self.mode_info[..self.num_modes as usize]
    }

    /// Metadata for the currently selected mode.
    pub fn current_mode_info(&self) -> &ModeInfo {
        &self.mode_info[self.mode as usize]
    }

    /// True once the catalog has been acknowledged; DATA frames are
    /// accepted from this point on.
    fn info_done(&self) -> bool {
        matches!(
            self.phase,
            Phase::AckPending | Phase::BaudSwitching | Phase::Running
        )
    }

    /// Feed bytes received from the transport.
    ///
    /// The whole delivery is appended before any frame is processed; a
    /// delivery that would push `write_ptr` past the buffer bound trips the
    /// failure path instead. Bytes are consumed strictly in arrival order,
    /// and a frame whose declared size exceeds the buffered bytes is left
    /// in place for the next delivery.
    pub fn receive(&mut self, data: &[u8], actions: &mut Vec<Action>) {
        if self.write_ptr + data.len() > BUFFER_SIZE {
            self.fail("Receive buffer overflow.", actions);
            return;
        }
        self.buffer[self.write_ptr..self.write_ptr + data.len()].copy_from_slice(data);
        self.write_ptr += data.len();

        if self.phase == Phase::Unsynced {
            self.scan_for_sync();
        }
        if self.phase != Phase::Unsynced {
            self.process_frames(actions);
        }
    }

    /// The ACK-send delay elapsed: publish the sensor (first time only),
    /// acknowledge on the wire, and arm the baud switch.
    pub fn ack_elapsed(&mut self, actions: &mut Vec<Action>) {
        if self.phase != Phase::AckPending {
            return;
        }
        if !self.registered && self.sensor_type <= TYPE_MAX {
            self.registered = true;
            actions.push(Action::Notify(SensorEvent::Attached {
                type_id: self.sensor_type,
                num_modes: self.num_modes,
            }));
        } else if let Some(reason) = self.last_error.take() {
            log::info!("Sensor reconnected after: {}", reason);
        }
        actions.push(Action::Send(vec![SYS_ACK]));
        self.phase = Phase::BaudSwitching;
        actions.push(Action::ScheduleBaudChange);
    }

    /// The baud-change delay elapsed. On the handshake path this completes
    /// the handoff to Running and arms the watchdog; on the resync path it
    /// only restores the minimum baud rate.
    pub fn baud_elapsed(&mut self, actions: &mut Vec<Action>) {
        actions.push(Action::SetBaud(self.new_baud_rate));
        if self.phase == Phase::BaudSwitching {
            self.phase = Phase::Running;
            actions.push(Action::StartKeepAlive);
        }
    }

    /// Periodic watchdog tick: account a silent window, probe the sensor
    /// with a NACK, and trip the failure path once the error threshold is
    /// reached.
    pub fn keep_alive_tick(&mut self, actions: &mut Vec<Action>) -> Tick {
        if self.phase != Phase::Running {
            return Tick::Stop;
        }
        if !self.data_seen {
            self.last_error = Some("No data since last keep-alive.");
            self.data_error_count += 1;
        }
        self.data_seen = false;
        actions.push(Action::SendDeferred(vec![SYS_NACK]));
        if self.data_error_count >= MAX_DATA_ERRORS {
            let reason = self.last_error.unwrap_or("No data since last keep-alive.");
            self.fail(reason, actions);
            return Tick::Stop;
        }
        Tick::Continue
    }

    /// Scan the buffered bytes for a valid TYPE announcement triplet:
    /// `[CMD|TYPE, type, checksum]`. Non-matching bytes are discarded one
    /// at a time; fewer than 3 trailing bytes are retained for the next
    /// delivery.
    fn scan_for_sync(&mut self) {
        let mut start = 0;
        while self.write_ptr - start >= 3 {
            let header = self.buffer[start];
            if header == (MSG_TYPE_CMD | CMD_TYPE) {
                let sensor_type = self.buffer[start + 1];
                if sensor_type != 0
                    && sensor_type <= TYPE_MAX
                    && self.buffer[start + 2] == checksum(&[header, sensor_type])
                {
                    self.begin_collecting(sensor_type);
                    start += 3;
                    break;
                }
            }
            start += 1;
        }
        self.consume(start);
    }

    /// Reset catalog state for a freshly identified sensor.
    fn begin_collecting(&mut self, sensor_type: u8) {
        log::debug!("Synced with sensor type {}", sensor_type);
        self.sensor_type = sensor_type;
        self.num_modes = 1;
        self.num_view_modes = 1;
        self.mode = 0;
        self.mode_info = core::array::from_fn(|_| ModeInfo::default());
        self.info_flags = InfoFlags::new(InfoFlags::CMD_TYPE);
        self.data_error_count = 0;
        self.data_seen = false;
        self.phase = Phase::Collecting;
    }

    /// Drop `n` bytes from the front of the buffer, keeping order stable.
    fn consume(&mut self, n: usize) {
        let n = n.min(self.write_ptr);
        self.buffer.copy_within(n..self.write_ptr, 0);
        self.write_ptr -= n;
    }

    /// Process every complete frame in the buffer. Returns false when a
    /// failure tripped the resync path.
    fn process_frames(&mut self, actions: &mut Vec<Action>) -> bool {
        loop {
            if self.write_ptr == 0 {
                return true;
            }
            let header = self.buffer[0];

            // A checksum byte split off from a preceding SYNC (IR sensor)
            // can land at the front of the buffer on its own; drop it.
            if header == 0xFF {
                self.consume(1);
                continue;
            }

            let mut size = msg_size(header);
            // The IR sensor sends a checksum right after SYNC; when both
            // bytes are present they are consumed together.
            if header == SYS_SYNC && self.write_ptr >= 2 && self.buffer[1] == 0xFF {
                size = 2;
            }
            if size > self.write_ptr {
                return true; // incomplete frame, wait for more bytes
            }

            let mut scratch = [0u8; MAX_MSG_SIZE];
            scratch[..size].copy_from_slice(&self.buffer[..size]);

            match self.handle_frame(&scratch[..size], actions) {
                Ok(()) => {
                    self.consume(size);
                    if self.info_done() && self.data_error_count >= MAX_DATA_ERRORS {
                        let reason = self.last_error.unwrap_or("Bad checksum.");
                        self.fail(reason, actions);
                        return false;
                    }
                }
                Err(reason) => {
                    self.fail(reason, actions);
                    return false;
                }
            }
        }
    }

    fn handle_frame(
        &mut self,
        frame: &[u8],
        actions: &mut Vec<Action>,
    ) -> Result<(), &'static str> {
        let header = frame[0];
        let size = frame.len();
        let msg_type = header & MSG_TYPE_MASK;
        let cmd = header & MSG_CMD_MASK;

        if size > 1 {
            let expected = checksum(&frame[..size - 1]);
            // The color sensor (type 29) ships bad checksums on RGB-RAW
            // data frames (header 0xDC); those are accepted as-is.
            if expected != frame[size - 1] && !(self.sensor_type == TYPE_COLOR && header == 0xDC) {
                if self.info_done() {
                    self.last_error = Some("Bad checksum.");
                    self.data_error_count += 1;
                    return Ok(()); // counted; the frame itself is dropped
                }
                return Err("Bad checksum.");
            }
        }

        match msg_type {
            MSG_TYPE_SYS => self.handle_sys(cmd, actions),
            MSG_TYPE_CMD => self.handle_cmd(cmd, frame),
            MSG_TYPE_INFO => self.handle_info(cmd, frame),
            MSG_TYPE_DATA => self.handle_data(cmd, frame, actions),
            _ => unreachable!(),
        }
    }

    fn handle_sys(&mut self, cmd: u8, actions: &mut Vec<Action>) -> Result<(), &'static str> {
        if cmd == SYS_ACK && self.phase == Phase::Collecting {
            if self.num_modes == 0 {
                return Err("Received ACK before all mode INFO.");
            }
            if !self.info_flags.has_required() {
                return Err("Did not receive all required INFO.");
            }
            log::debug!(
                "Catalog complete: type {} with {} modes",
                self.sensor_type,
                self.num_modes
            );
            self.phase = Phase::AckPending;
            actions.push(Action::ScheduleAck);
        }
        // SYNC, NACK, ESC, and out-of-phase ACKs carry no state
        Ok(())
    }

    fn handle_cmd(&mut self, cmd: u8, frame: &[u8]) -> Result<(), &'static str> {
        let size = frame.len();
        match cmd {
            CMD_MODES => {
                if self.info_flags.test_and_set(InfoFlags::CMD_MODES) {
                    return Err("Received duplicate modes INFO.");
                }
                let count = frame[1];
                if count == 0 || count as usize > MAX_MODES {
                    return Err("Number of modes is out of range.");
                }
                self.num_modes = count;
                self.num_view_modes =
                    if size > 3 && frame[2] != 0 && frame[2] as usize <= MAX_MODES {
                        frame[2]
                    } else {
                        count
                    };
                log::debug!(
                    "num_modes: {}, num_view_modes: {}",
                    self.num_modes,
                    self.num_view_modes
                );
                Ok(())
            }
            CMD_SPEED => {
                if self.info_flags.test_and_set(InfoFlags::CMD_SPEED) {
                    return Err("Received duplicate speed INFO.");
                }
                if size < 6 {
                    return Err("Invalid speed message size.");
                }
                let speed = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
                if !(BAUD_MIN..=BAUD_MAX).contains(&speed) {
                    return Err("Speed is out of range.");
                }
                self.new_baud_rate = speed;
                log::debug!("Sensor requested {} baud", speed);
                Ok(())
            }
            // TYPE is only valid as the sync triplet; SELECT and WRITE
            // only ever travel host-to-sensor
            _ => Err("Unknown command."),
        }
    }

    fn handle_info(&mut self, mode: u8, frame: &[u8]) -> Result<(), &'static str> {
        let size = frame.len();
        let subcmd = frame[1];
        match subcmd {
            INFO_NAME => {
                // A new name opens the next mode's record burst
                self.info_flags.remove(InfoFlags::ALL_INFO);
                if !(b'A'..=b'z').contains(&frame[2]) {
                    return Err("Invalid name INFO.");
                }
                let bytes = &frame[2..size - 1];
                let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                if len > NAME_SIZE {
                    return Err("Name is too long.");
                }
                self.mode_info[mode as usize].name =
                    String::from_utf8_lossy(&bytes[..len]).into_owned();
                self.mode = mode;
                self.info_flags.insert(InfoFlags::INFO_NAME);
                log::debug!("mode {} name: {}", mode, self.mode_info[mode as usize].name);
                Ok(())
            }
            INFO_RAW | INFO_PCT | INFO_SI => {
                if self.mode != mode {
                    return Err("Received INFO for incorrect mode.");
                }
                let (bit, dup_reason) = match subcmd {
                    INFO_RAW => (InfoFlags::INFO_RAW, "Received duplicate raw scaling INFO."),
                    INFO_PCT => (
                        InfoFlags::INFO_PCT,
                        "Received duplicate percent scaling INFO.",
                    ),
                    _ => (InfoFlags::INFO_SI, "Received duplicate SI scaling INFO."),
                };
                if self.info_flags.test_and_set(bit) {
                    return Err(dup_reason);
                }
                if size < 11 {
                    return Err("Invalid scaling message size.");
                }
                let min = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
                let max = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]);
                let info = &mut self.mode_info[mode as usize];
                match subcmd {
                    INFO_RAW => {
                        info.raw_min = min;
                        info.raw_max = max;
                    }
                    INFO_PCT => {
                        info.pct_min = min;
                        info.pct_max = max;
                    }
                    _ => {
                        info.si_min = min;
                        info.si_max = max;
                    }
                }
                Ok(())
            }
            INFO_UNITS => {
                if self.mode != mode {
                    return Err("Received INFO for incorrect mode.");
                }
                if self.info_flags.test_and_set(InfoFlags::INFO_UNITS) {
                    return Err("Received duplicate SI units INFO.");
                }
                let bytes = &frame[2..size - 1];
                let len = bytes
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(bytes.len())
                    .min(UNITS_SIZE);
                self.mode_info[mode as usize].units =
                    String::from_utf8_lossy(&bytes[..len]).into_owned();
                Ok(())
            }
            INFO_FORMAT => {
                if self.mode != mode {
                    return Err("Received INFO for incorrect mode.");
                }
                if self.info_flags.test_and_set(InfoFlags::INFO_FORMAT) {
                    return Err("Received duplicate format INFO.");
                }
                let data_sets = frame[2];
                if data_sets == 0 || data_sets as usize > SENSOR_DATA_SIZE {
                    return Err("Invalid number of data sets.");
                }
                if size < 5 {
                    return Err("Invalid format message size.");
                }
                if !self.info_flags.has_required() {
                    return Err("Did not receive all required INFO.");
                }
                let format =
                    DataFormat::from_byte(frame[3]).ok_or("Invalid data format.")?;
                let info = &mut self.mode_info[mode as usize];
                info.data_sets = data_sets;
                info.format = format;
                if size >= 7 {
                    info.figures = frame[4];
                    info.decimals = frame[5];
                }
                log::debug!(
                    "mode {} data_sets: {}, format: {}",
                    mode,
                    data_sets,
                    format.label()
                );
                // Records for the next lower mode follow
                if self.mode > 0 {
                    self.mode -= 1;
                }
                Ok(())
            }
            // Unknown INFO records are skipped without complaint
            _ => Ok(()),
        }
    }

    fn handle_data(
        &mut self,
        mode: u8,
        frame: &[u8],
        actions: &mut Vec<Action>,
    ) -> Result<(), &'static str> {
        if !self.info_done() {
            return Err("Received DATA before INFO was complete.");
        }
        if mode >= self.num_modes {
            return Err("Received DATA for unknown mode.");
        }
        if self.mode != mode {
            self.mode = mode;
            actions.push(Action::Notify(SensorEvent::ModeChanged(mode)));
        }
        let payload = &frame[1..frame.len() - 1];
        let n = payload.len().min(SENSOR_DATA_SIZE);
        self.mode_info[mode as usize].raw_data[..n].copy_from_slice(&payload[..n]);
        self.data_seen = true;
        self.data_error_count = self.data_error_count.saturating_sub(1);
        actions.push(Action::Notify(SensorEvent::SampleReady { mode }));
        Ok(())
    }

    /// Record a failure and fall back to Unsynced: drop buffered bytes,
    /// cancel pending handshake delays, and schedule the return to 2400
    /// baud. The published handle, if any, stays registered; the sensor is
    /// expected to restart its handshake.
    fn fail(&mut self, reason: &'static str, actions: &mut Vec<Action>) {
        log::warn!("Sensor link failure: {}", reason);
        self.phase = Phase::Failing;
        self.last_error = Some(reason);
        self.write_ptr = 0;
        self.new_baud_rate = BAUD_MIN;
        self.data_seen = false;
        actions.push(Action::CancelHandshakeTimers);
        actions.push(Action::ScheduleBaudChange);
        self.phase = Phase::Unsynced;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
