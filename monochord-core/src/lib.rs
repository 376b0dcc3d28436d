//! Board-agnostic core of the Monochord bus stack
//!
//! This crate contains everything between the wire protocol and the
//! concrete drivers:
//!
//! - The driver capability contract and common per-driver state
//!   ([`traits`], [`driver`])
//! - The local driver registry ([`registry`])
//! - The pairing state machine ([`pairing`])
//! - The bus service loop: fair transmit scheduling, inbound dispatch,
//!   periodic driver service ([`protocol`])
//! - Bus events and the notification bridge to the host application
//!   ([`events`])
//! - Timing and retry configuration ([`config`])
//!
//! Everything is poll-driven and single-context: the application calls
//! [`protocol::Protocol::tick`] with the current time, and no state is
//! touched from anywhere else.

#![no_std]
#![deny(unsafe_code)]

pub mod config;
pub mod driver;
pub mod events;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod traits;

pub use config::ProtocolConfig;
pub use driver::{DriverCore, LogicalId};
pub use events::{BusEvent, EventQueue, NotificationSink};
pub use pairing::PairingState;
pub use protocol::Protocol;
pub use registry::RegistryError;
pub use traits::{BusDriver, Monotonic};
