//! Protocol timing and retry configuration
//!
//! These are configuration defaults, not wire constants: two nodes with
//! different settings still interoperate, they just advertise, retry and
//! give up on their own schedules.

use monochord_protocol::Micros;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Timing and retry parameters for one protocol instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtocolConfig {
    /// Interval between presence advertisements while unpaired
    pub advert_interval_us: Micros,
    /// Quiet window an address candidate must survive before pairing
    pub claim_window_us: Micros,
    /// Deadline for a pairing acknowledgement (doubles per retry)
    pub pair_ack_timeout_us: Micros,
    /// Pairing requests sent before giving up
    pub pair_retries: u8,
    /// Interval between heartbeats while paired
    pub heartbeat_interval_us: Micros,
    /// Peer silence after which a pairing is considered dead
    pub liveness_timeout_us: Micros,
    /// Transmit attempts per frame before it is dropped
    pub max_tx_attempts: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            advert_interval_us: 100_000,
            claim_window_us: 200_000,
            pair_ack_timeout_us: 100_000,
            pair_retries: 3,
            heartbeat_interval_us: 250_000,
            liveness_timeout_us: 1_000_000,
            max_tx_attempts: 4,
        }
    }
}
