//! Timer Scheduler
//!
//! Cancellable one-shot timers that post back onto the coordinator's
//! serialized queue instead of running callbacks on their own.

use crate::infrastructure::bluetooth::transport::{PeripheralId, TransportEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything processed by the coordinator loop
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Transport(TransportEvent),
    Timer(TimerEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Give up on an automatic reconnect.
    ReconnectDeadline,
    /// Give up on a user-selected connect.
    ConnectTimeout,
    /// Resend an unacknowledged log command.
    CommandTimeout,
    BatteryPoll,
    RssiPoll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub peripheral: PeripheralId,
    pub kind: TimerKind,
    pub id: u64,
}

/// Spawns timers onto the tokio runtime
#[derive(Clone)]
pub struct Scheduler {
    queue: mpsc::UnboundedSender<CoreEvent>,
    next_id: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(queue: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self {
            queue,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Post a `TimerEvent` after `after` unless the returned handle is
    /// cancelled or dropped first.
    pub fn schedule(&self, peripheral: &PeripheralId, kind: TimerKind, after: Duration) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = TimerEvent {
            peripheral: peripheral.clone(),
            kind,
            id,
        };
        let queue = self.queue.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = queue.send(CoreEvent::Timer(event));
        });

        TimerHandle { id, task }
    }
}

/// A pending timer. Aborted on drop.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Holds at most one armed timer of a kind.
///
/// A firing is only honoured when its id matches the armed handle, so a
/// timer that raced its own cancellation is ignored.
#[derive(Debug, Default)]
pub struct TimerSlot(Option<TimerHandle>);

impl TimerSlot {
    pub fn new() -> Self {
        Self(None)
    }

    /// Replace (and abort) any previously armed timer.
    pub fn arm(&mut self, handle: TimerHandle) {
        self.0 = Some(handle);
    }

    /// Safe to call when nothing is armed.
    pub fn cancel(&mut self) {
        self.0 = None;
    }

    pub fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    /// Consume a firing. Returns `false` for stale timers.
    pub fn fire(&mut self, id: u64) -> bool {
        match &self.0 {
            Some(handle) if handle.id == id => {
                self.0 = None;
                true
            }
            _ => false,
        }
    }
}
