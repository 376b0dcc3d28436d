//! Capability contracts between the core and its collaborators
//!
//! [`BusDriver`] is the one flat interface every driver kind implements;
//! the service loop knows nothing else about them. [`Monotonic`] is the
//! clock the surrounding application supplies.

use monochord_protocol::{ControlMessage, Frame, Micros};

use crate::driver::DriverCore;
use crate::events::EventQueue;

/// Capability contract implemented by every concrete driver
///
/// The protocol core drives these hooks from its service tick; none of
/// them may block or run long - defer real work to later ticks.
pub trait BusDriver {
    /// Shared identity/pairing/queue state
    fn core(&self) -> &DriverCore;

    /// Mutable access to the shared state
    fn core_mut(&mut self) -> &mut DriverCore;

    /// A control frame addressed to (or broadcast at) this driver, after
    /// the pairing engine has processed it
    fn on_control_frame(
        &mut self,
        message: &ControlMessage,
        frame: &Frame,
        events: &mut EventQueue,
    ) {
        let _ = (message, frame, events);
    }

    /// A data frame addressed to (or broadcast at) this driver
    fn on_data_frame(&mut self, frame: &Frame, events: &mut EventQueue);

    /// Invoked once per service tick regardless of traffic; timeouts and
    /// scheduled transmissions live here
    fn periodic_service(&mut self, now: Micros, events: &mut EventQueue) {
        let _ = (now, events);
    }
}

/// Monotonic clock supplied by the application
pub trait Monotonic {
    /// Microseconds since an arbitrary fixed origin
    fn now_us(&self) -> Micros;
}
