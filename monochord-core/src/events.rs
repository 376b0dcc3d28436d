//! Bus events and the notification bridge
//!
//! Drivers and the pairing engine report what happened on the bus as
//! [`BusEvent`]s. The protocol core queues them; the host application
//! either polls the queue or drains it into a [`NotificationSink`] - the
//! local message-bus boundary from which button-and-LED style UI code is
//! wired up.

use heapless::Deque;

use crate::driver::LogicalId;

/// Maximum undelivered events held by one protocol instance
pub const MAX_EVENTS: usize = 16;

// Notification codes for the (event_id, value) collaborator interface
pub const EVT_PAIRED: u16 = 0x01;
pub const EVT_UNPAIRED: u16 = 0x02;
pub const EVT_PAIRING_FAILED: u16 = 0x03;
pub const EVT_VALUE_CHANGED: u16 = 0x04;
pub const EVT_TEST_COMPLETED: u16 = 0x05;

/// Something a driver or the pairing engine wants the application to know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// A driver established a pairing with a remote peer
    Paired { driver: LogicalId },
    /// A pairing was torn down (explicitly or by liveness timeout)
    Unpaired { driver: LogicalId },
    /// A pairing attempt exhausted its retry budget
    PairingFailed { driver: LogicalId },
    /// A replicated pin value changed
    ValueChanged { driver: LogicalId, value: bool },
    /// A reliability burst finished with the given success percentage
    TestCompleted { driver: LogicalId, percent: u8 },
    /// A remote application event arrived over the message-bus bridge
    Message { id: u16, value: u16 },
}

impl BusEvent {
    /// Flatten into the `(event_id, value)` shape of the application's
    /// `notify` collaborator.
    ///
    /// Remote application events pass through verbatim; everything else
    /// maps to an `EVT_*` code with the most useful scalar as the value.
    pub fn as_notification(&self) -> (u16, u16) {
        match *self {
            BusEvent::Paired { driver } => (EVT_PAIRED, driver as u16),
            BusEvent::Unpaired { driver } => (EVT_UNPAIRED, driver as u16),
            BusEvent::PairingFailed { driver } => (EVT_PAIRING_FAILED, driver as u16),
            BusEvent::ValueChanged { value, .. } => (EVT_VALUE_CHANGED, value as u16),
            BusEvent::TestCompleted { percent, .. } => (EVT_TEST_COMPLETED, percent as u16),
            BusEvent::Message { id, value } => (id, value),
        }
    }
}

/// Local notification sink supplied by the host application
pub trait NotificationSink {
    /// Deliver one event to the application
    fn notify(&mut self, event: BusEvent);
}

/// Bounded FIFO of undelivered events
///
/// Overflow drops the oldest event: a stalled application loses history,
/// never fresh state.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: Deque<BusEvent, MAX_EVENTS>,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            queue: Deque::new(),
        }
    }

    /// Append an event, evicting the oldest when full
    pub fn push(&mut self, event: BusEvent) {
        if self.queue.is_full() {
            self.queue.pop_front();
        }
        // Cannot fail: a slot was just freed if necessary
        let _ = self.queue.push_back(event);
    }

    /// Take the oldest undelivered event
    pub fn pop(&mut self) -> Option<BusEvent> {
        self.queue.pop_front()
    }

    /// Number of undelivered events
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when no events are pending
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
