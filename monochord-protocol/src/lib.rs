//! Wire protocol for the Monochord single-wire bus
//!
//! This crate defines everything that travels on (or touches) the shared
//! wire:
//!
//! - Frame layout, CRC validation, encode/decode ([`frame`])
//! - Control-frame vocabulary used by pairing and acknowledgement ([`messages`])
//! - Half-duplex line discipline: idle sensing, collision detection via
//!   transmit read-back, seeded backoff ([`transport`])
//! - A slot-stepped shared-bus simulator for host testing ([`sim`],
//!   `std` feature only)
//!
//! Nothing in this crate owns drivers or policy; that lives in
//! `monochord-core`.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![deny(unsafe_code)]

pub mod frame;
pub mod messages;
pub mod transport;

#[cfg(any(feature = "std", test))]
pub mod sim;

pub use frame::{DecodeError, EncodeError, Frame, MAX_FRAME_LEN, MAX_PAYLOAD};
pub use messages::{ControlMessage, MessageError};
pub use transport::{LineStats, Transport, TransportError, Wire};

/// Microsecond timestamps, as supplied by the application's monotonic clock.
pub type Micros = u64;
