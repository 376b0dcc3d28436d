//! Concrete driver implementations for the Monochord bus
//!
//! - [`PinDriver`]: replicates a single digital value to its paired peer
//! - [`ReliabilityTester`]: measures acknowledgement rate over a probe burst
//! - [`MessageBusDriver`]: bridges local application events across the wire
//!
//! [`DriverKind`] is the closed set of driver variants a protocol instance
//! hosts; it dispatches through the one flat `BusDriver` interface, so
//! adding a driver type means adding a variant, nothing more.

#![no_std]
#![deny(unsafe_code)]

pub mod message_bus;
pub mod pin;
pub mod reliability;

use embedded_hal::digital::OutputPin;
use monochord_core::events::EventQueue;
use monochord_core::{BusDriver, DriverCore};
use monochord_protocol::{ControlMessage, Frame, Micros};

pub use message_bus::MessageBusDriver;
pub use pin::PinDriver;
pub use reliability::{run_reliability_test, ReliabilityConfig, ReliabilityTester, TestError};

// Driver class identifiers
pub const CLASS_PIN: u8 = 0x01;
pub const CLASS_RELIABILITY: u8 = 0x02;
pub const CLASS_MESSAGE_BUS: u8 = 0x03;

/// Placeholder output for nodes that host no physical pin
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOutput;

impl embedded_hal::digital::ErrorType for NoOutput {
    type Error = core::convert::Infallible;
}

impl OutputPin for NoOutput {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The closed set of drivers a protocol instance can host
///
/// Generic over the physical output type used by pin drivers; nodes
/// without one use [`NoOutput`].
pub enum DriverKind<O> {
    Pin(PinDriver<O>),
    Reliability(ReliabilityTester),
    MessageBus(MessageBusDriver),
}

impl<O: OutputPin> BusDriver for DriverKind<O> {
    fn core(&self) -> &DriverCore {
        match self {
            DriverKind::Pin(driver) => driver.core(),
            DriverKind::Reliability(driver) => driver.core(),
            DriverKind::MessageBus(driver) => driver.core(),
        }
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        match self {
            DriverKind::Pin(driver) => driver.core_mut(),
            DriverKind::Reliability(driver) => driver.core_mut(),
            DriverKind::MessageBus(driver) => driver.core_mut(),
        }
    }

    fn on_control_frame(
        &mut self,
        message: &ControlMessage,
        frame: &Frame,
        events: &mut EventQueue,
    ) {
        match self {
            DriverKind::Pin(driver) => driver.on_control_frame(message, frame, events),
            DriverKind::Reliability(driver) => driver.on_control_frame(message, frame, events),
            DriverKind::MessageBus(driver) => driver.on_control_frame(message, frame, events),
        }
    }

    fn on_data_frame(&mut self, frame: &Frame, events: &mut EventQueue) {
        match self {
            DriverKind::Pin(driver) => driver.on_data_frame(frame, events),
            DriverKind::Reliability(driver) => driver.on_data_frame(frame, events),
            DriverKind::MessageBus(driver) => driver.on_data_frame(frame, events),
        }
    }

    fn periodic_service(&mut self, now: Micros, events: &mut EventQueue) {
        match self {
            DriverKind::Pin(driver) => driver.periodic_service(now, events),
            DriverKind::Reliability(driver) => driver.periodic_service(now, events),
            DriverKind::MessageBus(driver) => driver.periodic_service(now, events),
        }
    }
}

impl<O> From<PinDriver<O>> for DriverKind<O> {
    fn from(driver: PinDriver<O>) -> Self {
        DriverKind::Pin(driver)
    }
}

impl<O> From<ReliabilityTester> for DriverKind<O> {
    fn from(driver: ReliabilityTester) -> Self {
        DriverKind::Reliability(driver)
    }
}

impl<O> From<MessageBusDriver> for DriverKind<O> {
    fn from(driver: MessageBusDriver) -> Self {
        DriverKind::MessageBus(driver)
    }
}
