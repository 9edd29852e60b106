//! Sensor port engine: one attached UART sensor link
//!
//! [`SensorPort`] wires the protocol [`Session`] to its collaborators and
//! owns the threads around it:
//!
//! 1. **Reader thread** (continuous): polls the transport and feeds raw
//!    bytes into the session.
//! 2. **Writer thread** (deferred TX): drains a channel of outgoing byte
//!    sequences so timer callbacks never block on the serial port. The
//!    keep-alive NACK travels this path.
//! 3. **Scheduler callbacks**: the two handshake delays (ACK send, baud
//!    change) and the periodic keep-alive watchdog.
//!
//! # Synchronization Strategy
//!
//! All session-state mutation happens under one `parking_lot::Mutex`,
//! entered from exactly three contexts: bytes-received, delayed work, and
//! the watchdog tick. The session never performs I/O itself; it returns a
//! list of [`Action`]s that are executed *after* the lock is dropped, so
//! transport writes and baud changes never happen while holding the
//! session lock. Critical sections stay tiny and the framing fast path
//! never blocks.
//!
//! # Timer Discipline
//!
//! At most one ACK delay and one baud-change delay are pending at any
//! instant; arming either one stops its predecessor first. The watchdog
//! stops itself by verdict when the session leaves Running, and teardown
//! cancels everything synchronously before the port is dropped.

use crate::error::{Error, Result};
use crate::protocol::codec::{checksum, encode_header, padded_len};
use crate::protocol::session::{Action, Phase, Session};
use crate::protocol::{
    DataFormat, ModeInfo, CMD_SELECT, CMD_WRITE, KEEP_ALIVE_PERIOD_MS, MSG_TYPE_CMD,
    SENSOR_DATA_SIZE, SEND_ACK_DELAY_MS, SET_BAUD_DELAY_MS,
};
use crate::publisher::{Publisher, SensorEvent};
use crate::scheduler::{CancelHandle, Scheduler, Tick};
use crate::transport::Transport;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Outgoing work for the deferred writer thread.
enum TxRequest {
    Bytes(Vec<u8>),
    Shutdown,
}

/// Which one-shot delay slot to arm.
enum OneShot {
    Ack,
    Baud,
}

#[derive(Default)]
struct Timers {
    ack: Option<CancelHandle>,
    baud: Option<CancelHandle>,
    keep_alive: Option<CancelHandle>,
}

struct PortInner {
    session: Mutex<Session>,
    transport: Mutex<Box<dyn Transport>>,
    scheduler: Arc<dyn Scheduler>,
    publisher: Arc<dyn Publisher>,
    timers: Mutex<Timers>,
    tx: Sender<TxRequest>,
}

/// Engine for one attached sensor link.
///
/// Created with [`SensorPort::attach`]; protocol work starts as soon as
/// bytes arrive (via the reader thread after [`SensorPort::start`], or
/// [`SensorPort::receive`] directly). Dropping the port tears the link
/// down.
pub struct SensorPort {
    inner: Arc<PortInner>,
    shutdown: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl SensorPort {
    /// Attach the engine to a transport.
    ///
    /// Spawns the deferred writer thread; the reader thread is started
    /// separately so tests can push bytes in directly.
    pub fn attach(
        mut transport: Box<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        // discard anything buffered from before the sensor was attached
        if let Err(e) = transport.clear() {
            log::warn!("Failed to discard stale transport buffers: {}", e);
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(PortInner {
            session: Mutex::new(Session::new()),
            transport: Mutex::new(transport),
            scheduler,
            publisher,
            timers: Mutex::new(Timers::default()),
            tx,
        });

        let writer_inner = Arc::clone(&inner);
        let writer_handle = thread::Builder::new()
            .name("uartsense-writer".to_string())
            .spawn(move || writer_loop(writer_inner, rx))?;

        Ok(SensorPort {
            inner,
            shutdown: Arc::new(AtomicBool::new(false)),
            reader_handle: None,
            writer_handle: Some(writer_handle),
        })
    }

    /// Start the reader thread polling the transport every `poll_interval`.
    pub fn start(&mut self, poll_interval: Duration) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let shutdown = Arc::clone(&self.shutdown);
        self.reader_handle = Some(
            thread::Builder::new()
                .name("uartsense-reader".to_string())
                .spawn(move || reader_loop(inner, shutdown, poll_interval))?,
        );
        log::info!("Sensor port started");
        Ok(())
    }

    /// Feed bytes from the transport into the session.
    ///
    /// Called by the reader thread; exposed so tests (or a push-model
    /// transport) can deliver bytes directly.
    pub fn receive(&self, bytes: &[u8]) {
        PortInner::receive(&self.inner, bytes);
    }

    // ========================================================================
    // Published sensor surface
    // ========================================================================

    /// Identifier the sensor declared at handshake (125 while unknown).
    pub fn type_id(&self) -> u8 {
        self.inner.session.lock().sensor_type()
    }

    /// Current link phase.
    pub fn phase(&self) -> Phase {
        self.inner.session.lock().phase()
    }

    /// Index of the currently selected mode.
    pub fn mode(&self) -> u8 {
        self.inner.session.lock().mode()
    }

    pub fn num_modes(&self) -> u8 {
        self.inner.session.lock().num_modes()
    }

    pub fn num_view_modes(&self) -> u8 {
        self.inner.session.lock().num_view_modes()
    }

    /// Snapshot of the declared mode catalog.
    pub fn modes(&self) -> Vec<ModeInfo> {
        self.inner.session.lock().modes().to_vec()
    }

    /// Name of the given mode.
    pub fn mode_name(&self, mode: u8) -> Result<String> {
        let session = self.inner.session.lock();
        if mode >= session.num_modes() {
            return Err(Error::InvalidMode {
                requested: mode,
                available: session.num_modes(),
            });
        }
        Ok(session.mode_info(mode).name.clone())
    }

    /// SI units label of the current mode.
    pub fn units(&self) -> String {
        self.inner.session.lock().current_mode_info().units.clone()
    }

    /// Scalar encoding of the current mode's DATA payloads.
    pub fn format(&self) -> DataFormat {
        self.inner.session.lock().current_mode_info().format
    }

    /// Scalar values per DATA frame in the current mode.
    pub fn data_sets(&self) -> u8 {
        self.inner.session.lock().current_mode_info().data_sets
    }

    /// Fractional-digits display hint of the current mode.
    pub fn decimals(&self) -> u8 {
        self.inner.session.lock().current_mode_info().decimals
    }

    /// Display-width hint of the current mode.
    pub fn figures(&self) -> u8 {
        self.inner.session.lock().current_mode_info().figures
    }

    /// Scaling limits of the current mode as display integers.
    pub fn raw_min(&self) -> i32 {
        self.inner.session.lock().current_mode_info().raw_min_display()
    }

    pub fn raw_max(&self) -> i32 {
        self.inner.session.lock().current_mode_info().raw_max_display()
    }

    pub fn pct_min(&self) -> i32 {
        self.inner.session.lock().current_mode_info().pct_min_display()
    }

    pub fn pct_max(&self) -> i32 {
        self.inner.session.lock().current_mode_info().pct_max_display()
    }

    pub fn si_min(&self) -> i32 {
        self.inner.session.lock().current_mode_info().si_min_display()
    }

    pub fn si_max(&self) -> i32 {
        self.inner.session.lock().current_mode_info().si_max_display()
    }

    /// Reason for the most recent resync, if any. Diagnostic only.
    pub fn last_error(&self) -> Option<&'static str> {
        self.inner.session.lock().last_error()
    }

    /// Ask the sensor to switch modes.
    ///
    /// Fire-and-forget: the engine reports the switch only once the sensor
    /// confirms it with a DATA frame for the new mode.
    pub fn set_mode(&self, mode: u8) -> Result<()> {
        {
            let session = self.inner.session.lock();
            if mode >= session.num_modes() {
                return Err(Error::InvalidMode {
                    requested: mode,
                    available: session.num_modes(),
                });
            }
        }
        let header = encode_header(MSG_TYPE_CMD, 1, CMD_SELECT);
        let frame = [header, mode, checksum(&[header, mode])];
        log::debug!("Selecting mode {}", mode);
        self.send(&frame)
    }

    /// Resolve a mode name and select it.
    pub fn select_mode_by_name(&self, name: &str) -> Result<()> {
        let mode = {
            let session = self.inner.session.lock();
            session.modes().iter().position(|m| m.name == name)
        }
        .ok_or_else(|| Error::UnknownMode(name.to_string()))?;
        self.set_mode(mode as u8)
    }

    /// Send an arbitrary command payload to the sensor.
    ///
    /// The payload is zero-padded up to the next valid wire size and
    /// wrapped in a CMD_WRITE frame. At most 32 bytes.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if payload.len() > SENSOR_DATA_SIZE {
            return Err(Error::WriteTooLong(payload.len()));
        }
        let size = padded_len(payload.len());
        let mut frame = Vec::with_capacity(size + 2);
        frame.push(encode_header(MSG_TYPE_CMD, size, CMD_WRITE));
        frame.extend_from_slice(payload);
        frame.resize(size + 1, 0);
        frame.push(checksum(&frame));
        self.send(&frame)
    }

    /// Read one scalar from the latest sample of the current mode.
    ///
    /// Only serviceable while the link is running; FLOAT values come back
    /// as fixed-point integers scaled by the mode's decimals.
    pub fn read_value(&self, index: usize) -> Result<i32> {
        let session = self.inner.session.lock();
        if session.phase() != Phase::Running {
            return Err(Error::NotReady);
        }
        let info = session.current_mode_info();
        info.value(index).ok_or(Error::InvalidValueIndex {
            index,
            data_sets: info.data_sets,
        })
    }

    /// Copy raw bytes out of the current mode's latest sample.
    pub fn read_raw_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let session = self.inner.session.lock();
        if session.phase() != Phase::Running {
            return Err(Error::NotReady);
        }
        let data = &session.current_mode_info().raw_data;
        if offset >= data.len() {
            return Ok(Vec::new());
        }
        let end = (offset + len).min(data.len());
        Ok(data[offset..end].to_vec())
    }

    /// Tear the link down: stop threads and timers, revoke the published
    /// handle. Timer cancellation is synchronous, so no callback is in
    /// flight once this returns.
    pub fn detach(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        log::info!("Detaching sensor port");

        // stop the byte source first so nothing re-arms the timers
        if let Some(handle) = self.reader_handle.take() {
            handle.join().map_err(|_| Error::ThreadPanic)?;
        }

        let (ack, baud, keep_alive) = {
            let mut timers = self.inner.timers.lock();
            (timers.ack.take(), timers.baud.take(), timers.keep_alive.take())
        };
        for handle in [ack, baud, keep_alive].into_iter().flatten() {
            handle.cancel();
        }

        let _ = self.inner.tx.send(TxRequest::Shutdown);
        if let Some(handle) = self.writer_handle.take() {
            handle.join().map_err(|_| Error::ThreadPanic)?;
        }

        if self.inner.session.lock().is_registered() {
            self.inner.publisher.notify(SensorEvent::Detached);
        }
        log::info!("Sensor port detached");
        Ok(())
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        let mut transport = self.inner.transport.lock();
        transport.write(frame)?;
        transport.flush()?;
        Ok(())
    }
}

impl Drop for SensorPort {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

impl PortInner {
    fn receive(inner: &Arc<Self>, bytes: &[u8]) {
        let actions = {
            let mut session = inner.session.lock();
            let mut actions = Vec::new();
            session.receive(bytes, &mut actions);
            actions
        };
        Self::execute(inner, actions);
    }

    fn ack_elapsed(inner: &Arc<Self>) {
        let actions = {
            let mut session = inner.session.lock();
            let mut actions = Vec::new();
            session.ack_elapsed(&mut actions);
            actions
        };
        Self::execute(inner, actions);
    }

    fn baud_elapsed(inner: &Arc<Self>) {
        let actions = {
            let mut session = inner.session.lock();
            let mut actions = Vec::new();
            session.baud_elapsed(&mut actions);
            actions
        };
        Self::execute(inner, actions);
    }

    fn keep_alive_tick(inner: &Arc<Self>) -> Tick {
        let (tick, actions) = {
            let mut session = inner.session.lock();
            let mut actions = Vec::new();
            let tick = session.keep_alive_tick(&mut actions);
            (tick, actions)
        };
        Self::execute(inner, actions);
        tick
    }

    /// Execute session side effects. Runs with the session lock released;
    /// only the transport or timer lock is taken per action.
    fn execute(inner: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(bytes) => {
                    let mut transport = inner.transport.lock();
                    if let Err(e) = transport.write(&bytes).and_then(|_| transport.flush()) {
                        log::error!("Transport write failed: {}", e);
                    }
                }
                Action::SendDeferred(bytes) => {
                    let _ = inner.tx.send(TxRequest::Bytes(bytes));
                }
                Action::ScheduleAck => {
                    let timer_inner = Arc::clone(inner);
                    Self::arm_once(
                        inner,
                        OneShot::Ack,
                        Duration::from_millis(SEND_ACK_DELAY_MS),
                        Box::new(move || Self::ack_elapsed(&timer_inner)),
                    );
                }
                Action::ScheduleBaudChange => {
                    let timer_inner = Arc::clone(inner);
                    Self::arm_once(
                        inner,
                        OneShot::Baud,
                        Duration::from_millis(SET_BAUD_DELAY_MS),
                        Box::new(move || Self::baud_elapsed(&timer_inner)),
                    );
                }
                Action::StartKeepAlive => {
                    let timer_inner = Arc::clone(inner);
                    let period = Duration::from_millis(KEEP_ALIVE_PERIOD_MS);
                    let mut timers = inner.timers.lock();
                    if let Some(old) = timers.keep_alive.take() {
                        old.request_stop();
                    }
                    match inner.scheduler.schedule_periodic(
                        period / 2,
                        period,
                        Box::new(move || Self::keep_alive_tick(&timer_inner)),
                    ) {
                        Ok(handle) => timers.keep_alive = Some(handle),
                        Err(e) => log::error!("Failed to arm keep-alive watchdog: {}", e),
                    }
                }
                Action::CancelHandshakeTimers => {
                    let mut timers = inner.timers.lock();
                    if let Some(handle) = timers.ack.take() {
                        handle.request_stop();
                    }
                    if let Some(handle) = timers.baud.take() {
                        handle.request_stop();
                    }
                }
                Action::SetBaud(rate) => {
                    let mut transport = inner.transport.lock();
                    if let Err(e) = transport.set_baud_rate(rate) {
                        log::error!("Failed to set baud rate to {}: {}", rate, e);
                    }
                }
                Action::Notify(event) => inner.publisher.notify(event),
            }
        }
    }

    /// Arm a one-shot delay in the given slot, stopping any predecessor so
    /// at most one instance is ever pending.
    fn arm_once(
        inner: &Arc<Self>,
        which: OneShot,
        delay: Duration,
        action: crate::scheduler::OnceAction,
    ) {
        let mut timers = inner.timers.lock();
        let slot = match which {
            OneShot::Ack => &mut timers.ack,
            OneShot::Baud => &mut timers.baud,
        };
        if let Some(old) = slot.take() {
            old.request_stop();
        }
        match inner.scheduler.schedule_once(delay, action) {
            Ok(handle) => *slot = Some(handle),
            Err(e) => log::error!("Failed to schedule delayed work: {}", e),
        }
    }
}

/// Reader loop - polls the transport and feeds the session
fn reader_loop(inner: Arc<PortInner>, shutdown: Arc<AtomicBool>, poll_interval: Duration) {
    let mut buf = [0u8; 64];
    while !shutdown.load(Ordering::Relaxed) {
        let read = {
            let mut transport = inner.transport.lock();
            transport.read(&mut buf)
        };
        match read {
            Ok(0) => thread::sleep(poll_interval),
            Ok(n) => {
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!("RX {} bytes: {:02X?}", n, &buf[..n]);
                }
                PortInner::receive(&inner, &buf[..n]);
            }
            Err(e) => {
                log::error!("Serial read error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    log::info!("Reader thread exiting");
}

/// Writer loop - performs deferred transmissions off the timer contexts
fn writer_loop(inner: Arc<PortInner>, rx: Receiver<TxRequest>) {
    for request in rx.iter() {
        match request {
            TxRequest::Bytes(bytes) => {
                let mut transport = inner.transport.lock();
                if let Err(e) = transport.write(&bytes).and_then(|_| transport.flush()) {
                    log::error!("Deferred write failed: {}", e);
                }
            }
            TxRequest::Shutdown => break,
        }
    }
    log::info!("Writer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SYS_ACK, SYS_NACK};
    use crate::publisher::RecordingPublisher;
    use crate::scheduler::ManualScheduler;
    use crate::transport::MockTransport;

    struct Harness {
        port: SensorPort,
        transport: MockTransport,
        scheduler: ManualScheduler,
        publisher: RecordingPublisher,
    }

    fn harness() -> Harness {
        let transport = MockTransport::new();
        let scheduler = ManualScheduler::new();
        let publisher = RecordingPublisher::new();
        let port = SensorPort::attach(
            Box::new(transport.clone()),
            Arc::new(scheduler.clone()),
            Arc::new(publisher.clone()),
        )
        .unwrap();
        Harness {
            port,
            transport,
            scheduler,
            publisher,
        }
    }

    fn with_checksum(mut bytes: Vec<u8>) -> Vec<u8> {
        bytes.push(checksum(&bytes));
        bytes
    }

    /// Drive the full type-16 single-mode handshake through the engine.
    fn handshake(h: &Harness) {
        h.port.receive(&[0x40, 0x10, 0xAF]);
        h.port.receive(&with_checksum(vec![0x49, 0x01, 0x00]));
        h.port
            .receive(&with_checksum(vec![0x90, 0x00, b'T', 0x00, 0x00, 0x00]));
        h.port
            .receive(&with_checksum(vec![0x90, 0x80, 0x01, 0x00, 0x04, 0x00]));
        h.port.receive(&[SYS_ACK]);
    }

    /// Wait for the deferred writer thread to land `byte` in the mock.
    fn wait_for_written(transport: &MockTransport, byte: u8) -> bool {
        for _ in 0..200 {
            if transport.written().contains(&byte) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_handshake_acks_then_switches_baud() {
        let h = harness();
        handshake(&h);
        assert_eq!(h.port.phase(), Phase::AckPending);
        assert!(h.transport.written().is_empty());

        // 10 ms: ACK goes out and the sensor is announced
        h.scheduler.advance(Duration::from_millis(10));
        assert_eq!(h.transport.written(), vec![SYS_ACK]);
        assert_eq!(h.port.phase(), Phase::BaudSwitching);
        assert!(h.publisher.events().contains(&SensorEvent::Attached {
            type_id: 16,
            num_modes: 1
        }));

        // 20 ms total: no SPEED was observed, so the link stays at 2400
        h.scheduler.advance(Duration::from_millis(10));
        assert_eq!(h.transport.baud_changes(), vec![2400]);
        assert_eq!(h.port.phase(), Phase::Running);
    }

    #[test]
    fn test_handshake_with_speed_switches_to_requested_baud() {
        let h = harness();
        h.port.receive(&[0x40, 0x10, 0xAF]);
        let mut speed = vec![0x52];
        speed.extend_from_slice(&57_600u32.to_le_bytes());
        h.port.receive(&with_checksum(speed));
        h.port.receive(&with_checksum(vec![0x49, 0x01, 0x00]));
        h.port
            .receive(&with_checksum(vec![0x90, 0x00, b'T', 0x00, 0x00, 0x00]));
        h.port
            .receive(&with_checksum(vec![0x90, 0x80, 0x01, 0x00, 0x04, 0x00]));
        h.port.receive(&[SYS_ACK]);
        h.scheduler.advance(Duration::from_millis(20));
        assert_eq!(h.transport.baud_changes(), vec![57_600]);
        assert_eq!(h.port.phase(), Phase::Running);
    }

    #[test]
    fn test_data_frame_read_back() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));

        h.port.receive(&with_checksum(vec![0xC0, 0x2A]));
        assert_eq!(h.port.read_value(0).unwrap(), 42);
        assert_eq!(h.port.mode(), 0);
        assert!(h
            .publisher
            .events()
            .contains(&SensorEvent::SampleReady { mode: 0 }));
        assert_eq!(h.port.read_raw_bytes(0, 1).unwrap(), vec![0x2A]);
    }

    #[test]
    fn test_read_value_before_running_is_not_ready() {
        let h = harness();
        assert!(matches!(h.port.read_value(0), Err(Error::NotReady)));
        handshake(&h);
        // still pending the handshake delays
        assert!(matches!(h.port.read_value(0), Err(Error::NotReady)));
    }

    #[test]
    fn test_read_value_index_out_of_range() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));
        h.port.receive(&with_checksum(vec![0xC0, 0x2A]));
        assert!(matches!(
            h.port.read_value(1),
            Err(Error::InvalidValueIndex {
                index: 1,
                data_sets: 1
            })
        ));
    }

    #[test]
    fn test_set_mode_emits_select_frame() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));
        h.transport.clear_written();

        h.port.set_mode(0).unwrap();
        assert_eq!(h.transport.written(), vec![0x43, 0x00, 0xBC]);

        assert!(matches!(
            h.port.set_mode(3),
            Err(Error::InvalidMode {
                requested: 3,
                available: 1
            })
        ));
    }

    #[test]
    fn test_select_mode_by_name() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));
        h.transport.clear_written();

        h.port.select_mode_by_name("T").unwrap();
        assert_eq!(h.transport.written(), vec![0x43, 0x00, 0xBC]);
        assert!(matches!(
            h.port.select_mode_by_name("missing"),
            Err(Error::UnknownMode(_))
        ));
    }

    #[test]
    fn test_write_pads_to_power_of_two() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));
        h.transport.clear_written();

        h.port.write(&[0x01, 0x02, 0x03]).unwrap();
        // 3 bytes round up to 4: header 0x54, payload, zero pad, checksum
        let expected = with_checksum(vec![0x54, 0x01, 0x02, 0x03, 0x00]);
        assert_eq!(h.transport.written(), expected);

        assert!(matches!(
            h.port.write(&[0u8; 33]),
            Err(Error::WriteTooLong(33))
        ));
    }

    #[test]
    fn test_keep_alive_probe_goes_out() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));
        h.transport.clear_written();

        // first watchdog tick fires half a period after the handoff
        h.scheduler.advance(Duration::from_millis(50));
        assert!(wait_for_written(&h.transport, SYS_NACK));
    }

    #[test]
    fn test_silent_link_resyncs_and_restores_min_baud() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));
        assert_eq!(h.port.phase(), Phase::Running);

        // six silent keep-alive windows trip the failure path; the baud
        // reset is scheduled 10 ms out
        h.scheduler.advance(Duration::from_millis(650));
        assert_eq!(h.port.phase(), Phase::Unsynced);
        assert_eq!(
            h.port.last_error(),
            Some("No data since last keep-alive.")
        );
        assert_eq!(h.transport.baud_changes(), vec![2400, 2400]);
    }

    #[test]
    fn test_data_keeps_watchdog_quiet() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));

        // feed a DATA frame inside every keep-alive window
        for _ in 0..10 {
            h.port.receive(&with_checksum(vec![0xC0, 0x2A]));
            h.scheduler.advance(Duration::from_millis(100));
        }
        assert_eq!(h.port.phase(), Phase::Running);
    }

    #[test]
    fn test_detach_revokes_handle() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));

        h.port.detach().unwrap();
        let events = h.publisher.events();
        assert_eq!(events.last(), Some(&SensorEvent::Detached));
    }

    #[test]
    fn test_detach_before_registration_stays_silent() {
        let h = harness();
        h.port.detach().unwrap();
        assert!(h.publisher.events().is_empty());
    }

    #[test]
    fn test_resync_then_second_handshake_recovers() {
        let h = harness();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));

        // trip a resync with an unknown command record
        h.port.receive(&[0x40, 0x10, 0xAF]);
        assert_eq!(h.port.phase(), Phase::Unsynced);
        h.scheduler.advance(Duration::from_millis(10));
        assert_eq!(h.transport.baud_changes(), vec![2400, 2400]);

        h.publisher.clear();
        handshake(&h);
        h.scheduler.advance(Duration::from_millis(20));
        assert_eq!(h.port.phase(), Phase::Running);
        // the handle survived the resync: no second attach notification
        assert!(!h
            .publisher
            .events()
            .iter()
            .any(|e| matches!(e, SensorEvent::Attached { .. })));
    }
}
