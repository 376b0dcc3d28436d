//! Message-bus bridge driver
//!
//! Forwards local application events onto the wire and re-raises remote
//! ones locally, so two boards can share one logical event bus. The driver
//! is broadcast-class: it never pairs, and every bridged event reaches
//! every listening node on the segment.
//!
//! Only events whose id has been registered with [`listen`] are forwarded
//! outward; inbound bridged events are always surfaced, and the
//! application filters by id as it would any local event.
//!
//! [`listen`]: MessageBusDriver::listen

use heapless::Vec;
use monochord_core::events::{BusEvent, EventQueue};
use monochord_core::{BusDriver, DriverCore, LogicalId};
use monochord_protocol::frame::BROADCAST_INSTANCE;
use monochord_protocol::Frame;

use crate::CLASS_MESSAGE_BUS;

/// Maximum event ids one bridge forwards
pub const MAX_LISTENERS: usize = 8;

/// Driver bridging `(id, value)` application events across the bus
pub struct MessageBusDriver {
    core: DriverCore,
    listeners: Vec<u16, MAX_LISTENERS>,
}

impl MessageBusDriver {
    /// Create a bridge; it forwards nothing until ids are listened
    pub fn new(logical_id: LogicalId) -> Self {
        Self {
            core: DriverCore::broadcast(logical_id, CLASS_MESSAGE_BUS),
            listeners: Vec::new(),
        }
    }

    /// Forward local events with this id onto the wire.
    ///
    /// Returns false when the listener table is full.
    pub fn listen(&mut self, id: u16) -> bool {
        if self.listeners.contains(&id) {
            return true;
        }
        self.listeners.push(id).is_ok()
    }

    /// True when events with this id are forwarded
    pub fn is_listening(&self, id: u16) -> bool {
        self.listeners.contains(&id)
    }

    /// Bridge one local event onto the wire.
    ///
    /// Returns true when a frame was queued; false for unlistened ids or
    /// a momentarily full transmit queue.
    pub fn raise(&mut self, id: u16, value: u16) -> bool {
        if !self.is_listening(id) {
            return false;
        }

        let id_bytes = id.to_le_bytes();
        let value_bytes = value.to_le_bytes();
        let payload = [id_bytes[0], id_bytes[1], value_bytes[0], value_bytes[1]];
        let Ok(frame) = Frame::data(CLASS_MESSAGE_BUS, BROADCAST_INSTANCE, &payload) else {
            return false;
        };
        self.core.queue_frame(frame)
    }
}

impl BusDriver for MessageBusDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn on_data_frame(&mut self, frame: &Frame, events: &mut EventQueue) {
        let &[id_lo, id_hi, value_lo, value_hi, ..] = frame.payload.as_slice() else {
            return;
        };
        events.push(BusEvent::Message {
            id: u16::from_le_bytes([id_lo, id_hi]),
            value: u16::from_le_bytes([value_lo, value_hi]),
        });
    }
}
