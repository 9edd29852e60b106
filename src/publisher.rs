//! Publisher interface for upstream change notifications
//!
//! The engine announces sensor lifecycle and data availability through a
//! [`Publisher`] so the attribute surface (sysfs, TCP, whatever sits above)
//! stays an adapter. Two implementations ship here: [`LogPublisher`] for
//! the daemon and [`RecordingPublisher`] as a test double.

use parking_lot::Mutex;
use std::sync::Arc;

/// Change notification emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorEvent {
    /// A sensor completed its first handshake on this link
    Attached { type_id: u8, num_modes: u8 },
    /// The link was torn down; the handle is no longer valid
    Detached,
    /// The sensor confirmed a mode switch with a DATA frame
    ModeChanged(u8),
    /// A fresh sample landed for the given mode
    SampleReady { mode: u8 },
}

/// Consumer of engine notifications.
///
/// `notify` is called from the engine's callback contexts and must not
/// block; hand the event off if delivery is slow.
pub trait Publisher: Send + Sync {
    fn notify(&self, event: SensorEvent);
}

/// Publisher that writes every event to the log.
#[derive(Default)]
pub struct LogPublisher;

impl LogPublisher {
    pub fn new() -> Self {
        LogPublisher
    }
}

impl Publisher for LogPublisher {
    fn notify(&self, event: SensorEvent) {
        match event {
            SensorEvent::Attached { type_id, num_modes } => {
                log::info!("Sensor attached: type {} with {} modes", type_id, num_modes);
            }
            SensorEvent::Detached => log::info!("Sensor detached"),
            SensorEvent::ModeChanged(mode) => log::info!("Sensor switched to mode {}", mode),
            SensorEvent::SampleReady { mode } => log::trace!("Sample ready for mode {}", mode),
        }
    }
}

/// Publisher that records events for test assertions.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<SensorEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything notified so far.
    pub fn events(&self) -> Vec<SensorEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Publisher for RecordingPublisher {
    fn notify(&self, event: SensorEvent) {
        self.events.lock().push(event);
    }
}
