//! Replicated digital pin driver
//!
//! One side calls [`PinDriver::set_digital_value`]; the paired peer applies
//! the value to its physical output and raises a change notification.
//! Transmission is edge-triggered: a frame goes out only when the value
//! differs from the last one sent, so a chatty caller costs nothing on the
//! wire.

use embedded_hal::digital::OutputPin;
use monochord_core::events::{BusEvent, EventQueue};
use monochord_core::{BusDriver, DriverCore, LogicalId};
use monochord_protocol::{Frame, Micros};

use crate::CLASS_PIN;

/// Driver replicating a single boolean value across the bus
pub struct PinDriver<O> {
    core: DriverCore,
    /// Physical output on the applying side; `None` on the controlling side
    output: Option<O>,
    /// Last value actually transmitted (edge-trigger reference)
    last_sent: Option<bool>,
    /// Current value, local or replicated
    value: bool,
    /// Failed writes to the physical output
    output_faults: u32,
}

impl<O: OutputPin> PinDriver<O> {
    /// Controlling side: sends value changes, applies nothing locally
    pub fn new(logical_id: LogicalId, instance_id: u8) -> Self {
        Self {
            core: DriverCore::with_instance(logical_id, CLASS_PIN, instance_id),
            output: None,
            last_sent: None,
            value: false,
            output_faults: 0,
        }
    }

    /// Applying side: received values drive `output`
    pub fn with_output(logical_id: LogicalId, instance_id: u8, output: O) -> Self {
        Self {
            output: Some(output),
            ..Self::new(logical_id, instance_id)
        }
    }

    /// Set the local value, replicating it to the paired peer.
    ///
    /// Returns true when a frame was queued; false while unpaired, when
    /// the value is unchanged since the last transmission, or when the
    /// transmit queue is momentarily full.
    pub fn set_digital_value(&mut self, value: bool) -> bool {
        self.value = value;

        if self.last_sent == Some(value) {
            return false;
        }
        let Some(peer) = self.core.peer_instance() else {
            return false;
        };

        // Payload is the bare value; pin frames are unsequenced
        let Ok(frame) = Frame::data(CLASS_PIN, peer, &[value as u8]) else {
            return false;
        };
        if !self.core.queue_frame(frame) {
            return false;
        }
        self.last_sent = Some(value);
        true
    }

    /// Current value (locally set or last replicated)
    pub fn value(&self) -> bool {
        self.value
    }

    /// Physical output, when this side has one
    pub fn output(&self) -> Option<&O> {
        self.output.as_ref()
    }

    /// Failed writes to the physical output
    pub fn output_faults(&self) -> u32 {
        self.output_faults
    }
}

impl<O: OutputPin> BusDriver for PinDriver<O> {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn on_data_frame(&mut self, frame: &Frame, events: &mut EventQueue) {
        let Some(&raw) = frame.payload.first() else {
            return;
        };
        let value = raw != 0;
        self.value = value;

        if let Some(output) = self.output.as_mut() {
            if output.set_state(value.into()).is_err() {
                self.output_faults += 1;
            }
        }

        events.push(BusEvent::ValueChanged {
            driver: self.core.logical_id(),
            value,
        });
    }

    fn periodic_service(&mut self, _now: Micros, _events: &mut EventQueue) {
        // A new pairing starts from a clean edge-trigger reference, so the
        // first value after re-pairing is always transmitted.
        if !self.core.is_paired() {
            self.last_sent = None;
        }
    }
}
