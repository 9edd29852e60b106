//! Timer capability for delayed and periodic work
//!
//! The protocol engine needs two one-shot delays (ACK send, baud change)
//! and one periodic tick (keep-alive watchdog). Both are expressed through
//! the [`Scheduler`] trait so the engine never touches the wall clock
//! directly:
//!
//! - [`ThreadScheduler`] backs each timer with a dedicated thread and is
//!   what the daemon uses against real hardware.
//! - [`ManualScheduler`] holds a virtual clock that tests advance
//!   explicitly, making every timing-dependent scenario deterministic.
//!
//! Cancellation contract: [`CancelHandle::cancel`] returns only after any
//! in-flight callback has finished, which is what session teardown relies
//! on. [`CancelHandle::request_stop`] only raises the flag and is safe to
//! call from inside a timer callback.

use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Verdict returned by a periodic action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Keep the schedule running
    Continue,
    /// Terminate the schedule; no further ticks fire
    Stop,
}

/// Boxed one-shot timer action.
pub type OnceAction = Box<dyn FnOnce() + Send>;
/// Boxed periodic timer action.
pub type PeriodicAction = Box<dyn FnMut() -> Tick + Send>;

/// Timer capability consumed by the engine.
pub trait Scheduler: Send + Sync {
    /// Run `action` once, no earlier than `delay` from now.
    fn schedule_once(&self, delay: Duration, action: OnceAction) -> Result<CancelHandle>;

    /// Run `action` every `period`, with a first tick after `initial`.
    /// The schedule ends when the action returns [`Tick::Stop`] or the
    /// handle is cancelled. A late tick reschedules relative to when it
    /// actually ran, not the missed target.
    fn schedule_periodic(
        &self,
        initial: Duration,
        period: Duration,
        action: PeriodicAction,
    ) -> Result<CancelHandle>;
}

/// Shared cancellation flag, with a condvar so sleeping timer threads wake
/// immediately instead of running out their delay.
struct TimerState {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl TimerState {
    fn new() -> Self {
        TimerState {
            cancelled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cond.notify_all();
    }

    /// Sleep up to `timeout`; returns true when cancelled.
    fn wait_cancelled(&self, timeout: Duration) -> bool {
        let mut cancelled = self.cancelled.lock();
        if *cancelled {
            return true;
        }
        self.cond.wait_for(&mut cancelled, timeout);
        *cancelled
    }
}

/// Handle to a scheduled action.
///
/// Dropping the handle leaves the schedule running (the timer owns its own
/// resources); stopping it requires an explicit call.
pub struct CancelHandle {
    state: Arc<TimerState>,
    thread: Option<JoinHandle<()>>,
}

impl CancelHandle {
    fn detached(state: Arc<TimerState>) -> Self {
        CancelHandle {
            state,
            thread: None,
        }
    }

    fn joined(state: Arc<TimerState>, thread: JoinHandle<()>) -> Self {
        CancelHandle {
            state,
            thread: Some(thread),
        }
    }

    /// Raise the cancellation flag without waiting. Safe from any context,
    /// including the timer's own callback.
    pub fn request_stop(&self) {
        self.state.cancel();
    }

    /// Cancel and wait until any in-flight callback has finished.
    pub fn cancel(mut self) {
        self.state.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// Thread-backed scheduler
// ============================================================================

/// Scheduler that backs every timer with its own named thread.
///
/// Timer threads sleep on a condvar so cancellation wakes them immediately.
#[derive(Default)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    pub fn new() -> Self {
        ThreadScheduler
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_once(&self, delay: Duration, action: OnceAction) -> Result<CancelHandle> {
        let state = Arc::new(TimerState::new());
        let timer_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("uartsense-timer".to_string())
            .spawn(move || {
                if !timer_state.wait_cancelled(delay) {
                    action();
                }
            })?;
        Ok(CancelHandle::joined(state, thread))
    }

    fn schedule_periodic(
        &self,
        initial: Duration,
        period: Duration,
        mut action: PeriodicAction,
    ) -> Result<CancelHandle> {
        let state = Arc::new(TimerState::new());
        let timer_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("uartsense-watchdog".to_string())
            .spawn(move || {
                let mut delay = initial;
                loop {
                    if timer_state.wait_cancelled(delay) {
                        break;
                    }
                    if action() == Tick::Stop {
                        break;
                    }
                    delay = period;
                }
            })?;
        Ok(CancelHandle::joined(state, thread))
    }
}

// ============================================================================
// Manually-driven scheduler for deterministic tests
// ============================================================================

enum EntryKind {
    Once(OnceAction),
    Periodic {
        period: Duration,
        action: PeriodicAction,
    },
}

struct ManualEntry {
    due: Duration,
    kind: EntryKind,
    state: Arc<TimerState>,
}

struct ManualInner {
    now: Duration,
    entries: Vec<ManualEntry>,
}

/// Scheduler with a virtual clock driven by [`ManualScheduler::advance`].
///
/// Due actions run on the calling thread, in due-time order; an action
/// scheduled during `advance` runs within the same call if it falls inside
/// the advanced window. Clones share the same clock.
#[derive(Clone)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualInner>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        ManualScheduler {
            inner: Arc::new(Mutex::new(ManualInner {
                now: Duration::ZERO,
                entries: Vec::new(),
            })),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Move the virtual clock forward, running every action that comes due.
    pub fn advance(&self, delta: Duration) {
        let target = self.inner.lock().now + delta;
        loop {
            let next = {
                let mut inner = self.inner.lock();
                inner.entries.retain(|e| !e.state.is_cancelled());
                let idx = inner
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.due <= target)
                    .min_by_key(|(_, e)| e.due)
                    .map(|(i, _)| i);
                match idx {
                    Some(i) => {
                        let entry = inner.entries.remove(i);
                        inner.now = entry.due;
                        Some(entry)
                    }
                    None => {
                        inner.now = target;
                        None
                    }
                }
            };

            let Some(entry) = next else { break };
            // run outside the lock so actions can schedule or cancel
            match entry.kind {
                EntryKind::Once(action) => action(),
                EntryKind::Periodic { period, mut action } => {
                    if action() == Tick::Continue && !entry.state.is_cancelled() {
                        let mut inner = self.inner.lock();
                        let due = inner.now + period;
                        inner.entries.push(ManualEntry {
                            due,
                            kind: EntryKind::Periodic { period, action },
                            state: entry.state,
                        });
                    }
                }
            }
        }
    }

    fn push(&self, due_in: Duration, kind: EntryKind) -> CancelHandle {
        let state = Arc::new(TimerState::new());
        let mut inner = self.inner.lock();
        let due = inner.now + due_in;
        inner.entries.push(ManualEntry {
            due,
            kind,
            state: Arc::clone(&state),
        });
        CancelHandle::detached(state)
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, action: OnceAction) -> Result<CancelHandle> {
        Ok(self.push(delay, EntryKind::Once(action)))
    }

    fn schedule_periodic(
        &self,
        initial: Duration,
        period: Duration,
        action: PeriodicAction,
    ) -> Result<CancelHandle> {
        Ok(self.push(initial, EntryKind::Periodic { period, action }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_manual_once_fires_at_due_time() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        scheduler
            .schedule_once(Duration::from_millis(10), Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        scheduler.advance(Duration::from_millis(9));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        scheduler.advance(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_actions_run_in_due_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(20u64, 'b'), (10, 'a'), (30, 'c')] {
            let order = Arc::clone(&order);
            scheduler
                .schedule_once(Duration::from_millis(delay), Box::new(move || {
                    order.lock().push(tag);
                }))
                .unwrap();
        }
        scheduler.advance(Duration::from_millis(50));
        assert_eq!(*order.lock(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_manual_cancel_prevents_fire() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        let handle = scheduler
            .schedule_once(Duration::from_millis(10), Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        handle.cancel();
        scheduler.advance(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_periodic_with_initial_offset() {
        let scheduler = ManualScheduler::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let t = Arc::clone(&ticks);
        scheduler
            .schedule_periodic(
                Duration::from_millis(50),
                Duration::from_millis(100),
                Box::new(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                    Tick::Continue
                }),
            )
            .unwrap();

        scheduler.advance(Duration::from_millis(49));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        // next ticks at 150, 250
        scheduler.advance(Duration::from_millis(200));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_manual_periodic_stop_verdict_ends_schedule() {
        let scheduler = ManualScheduler::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let t = Arc::clone(&ticks);
        scheduler
            .schedule_periodic(
                Duration::from_millis(10),
                Duration::from_millis(10),
                Box::new(move || {
                    if t.fetch_add(1, Ordering::SeqCst) >= 2 {
                        Tick::Stop
                    } else {
                        Tick::Continue
                    }
                }),
            )
            .unwrap();
        scheduler.advance(Duration::from_millis(100));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_manual_action_scheduled_during_advance_runs_in_window() {
        // mirrors the handshake: the ACK action schedules the baud action
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let inner_sched = scheduler.clone();
        let f = Arc::clone(&fired);
        scheduler
            .schedule_once(Duration::from_millis(10), Box::new(move || {
                let f = Arc::clone(&f);
                inner_sched
                    .schedule_once(Duration::from_millis(10), Box::new(move || {
                        f.fetch_add(1, Ordering::SeqCst);
                    }))
                    .unwrap();
            }))
            .unwrap();
        scheduler.advance(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_thread_once_fires() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler
            .schedule_once(Duration::from_millis(5), Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_thread_cancel_prevents_fire() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        let handle = scheduler
            .schedule_once(Duration::from_secs(10), Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        // cancel returns promptly despite the long delay and joins the
        // timer thread
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_thread_periodic_stops_on_verdict() {
        let scheduler = ThreadScheduler::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let t = Arc::clone(&ticks);
        let (tx, rx) = mpsc::channel();
        scheduler
            .schedule_periodic(
                Duration::from_millis(1),
                Duration::from_millis(1),
                Box::new(move || {
                    if t.fetch_add(1, Ordering::SeqCst) >= 2 {
                        let _ = tx.send(());
                        Tick::Stop
                    } else {
                        Tick::Continue
                    }
                }),
            )
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
