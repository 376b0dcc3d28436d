//! Pairing state machine
//!
//! Pairing establishes a logical link between two compatible drivers on a
//! bus with no central arbiter: both sides advertise while unpaired, one
//! side claims an address and requests, the other acknowledges.
//!
//! States: `Unpaired -> AwaitingClaim -> AwaitingAck -> Paired`, with every
//! failure path reverting to `Unpaired`. Exactly one side initiates: on
//! hearing a matching-class advertisement, only the driver with the
//! numerically higher instance id starts a session.

use monochord_protocol::frame::BROADCAST_INSTANCE;
use monochord_protocol::{ControlMessage, Micros};

use crate::config::ProtocolConfig;
use crate::driver::DriverCore;
use crate::events::{BusEvent, EventQueue};

/// Pairing lifecycle of one driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PairingState {
    /// No peer; advertising periodically
    #[default]
    Unpaired,
    /// Session open; candidate address must survive the claim window
    AwaitingClaim,
    /// Pairing request sent; waiting for the peer's acknowledgement
    AwaitingAck,
    /// Logical link established
    Paired,
}

/// Per-driver pairing bookkeeping
#[derive(Debug, Clone)]
pub(crate) struct PairingSm {
    pub state: PairingState,
    /// Peer instance address (meaningful outside `Unpaired`)
    pub peer: u8,
    /// Pairing requests left before the session fails
    pub retries_remaining: u8,
    /// Requests already sent, drives the exponential ack deadline
    pub attempt: u8,
    /// Claim-window end or ack deadline, depending on state
    pub deadline: Micros,
    /// Next advertisement slot; jittered so lockstep neighbours drift apart
    pub next_advert_at: Micros,
    pub last_heartbeat_at: Option<Micros>,
    pub last_heard_at: Micros,
}

impl PairingSm {
    pub fn new() -> Self {
        Self {
            state: PairingState::Unpaired,
            peer: 0,
            retries_remaining: 0,
            attempt: 0,
            deadline: 0,
            next_advert_at: 0,
            last_heartbeat_at: None,
            last_heard_at: 0,
        }
    }
}

impl DriverCore {
    /// Advance the pairing machine by one service tick
    pub(crate) fn service_pairing(
        &mut self,
        now: Micros,
        config: &ProtocolConfig,
        events: &mut EventQueue,
    ) {
        if self.broadcast {
            return;
        }

        match self.pairing.state {
            PairingState::Unpaired => {
                self.advertise_if_due(now, config);
            }
            PairingState::AwaitingClaim => {
                self.advertise_if_due(now, config);
                if now >= self.pairing.deadline {
                    // Candidate survived the claim window undisputed
                    self.pairing.state = PairingState::AwaitingAck;
                    self.pairing.attempt = 0;
                    self.pairing.retries_remaining = config.pair_retries.saturating_sub(1);
                    self.pairing.deadline = now + config.pair_ack_timeout_us;
                    self.send_pair_request();
                }
            }
            PairingState::AwaitingAck => {
                if now >= self.pairing.deadline {
                    if self.pairing.retries_remaining == 0 {
                        self.pairing.state = PairingState::Unpaired;
                        events.push(BusEvent::PairingFailed {
                            driver: self.logical_id(),
                        });
                    } else {
                        self.pairing.retries_remaining -= 1;
                        self.pairing.attempt += 1;
                        self.pairing.deadline =
                            now + (config.pair_ack_timeout_us << self.pairing.attempt);
                        self.send_pair_request();
                    }
                }
            }
            PairingState::Paired => {
                let heartbeat_due = match self.pairing.last_heartbeat_at {
                    None => true,
                    Some(at) => now.saturating_sub(at) >= config.heartbeat_interval_us,
                };
                if heartbeat_due {
                    self.pairing.last_heartbeat_at = Some(now);
                    let peer = self.pairing.peer;
                    self.queue_control(
                        ControlMessage::Heartbeat {
                            instance: self.instance_id,
                        },
                        peer,
                    );
                }
                if now.saturating_sub(self.pairing.last_heard_at) > config.liveness_timeout_us {
                    self.pairing.state = PairingState::Unpaired;
                    events.push(BusEvent::Unpaired {
                        driver: self.logical_id(),
                    });
                }
            }
        }
    }

    /// React to a matching-class advertisement heard on the bus
    pub(crate) fn handle_advertisement(
        &mut self,
        remote_instance: u8,
        now: Micros,
        config: &ProtocolConfig,
    ) {
        if self.broadcast {
            return;
        }

        if remote_instance == self.instance_id {
            // Address conflict: another node claims our candidate
            match self.pairing.state {
                PairingState::Unpaired => self.regenerate_instance(),
                PairingState::AwaitingClaim => {
                    self.regenerate_instance();
                    self.pairing.deadline = now + config.claim_window_us;
                }
                _ => {}
            }
            return;
        }

        if self.pairing.state == PairingState::Unpaired && self.instance_id > remote_instance {
            self.pairing.state = PairingState::AwaitingClaim;
            self.pairing.peer = remote_instance;
            self.pairing.deadline = now + config.claim_window_us;
        }
    }

    /// React to a pairing request addressed to this driver
    pub(crate) fn handle_pair_request(&mut self, from: u8, now: Micros, events: &mut EventQueue) {
        if self.broadcast {
            return;
        }

        match self.pairing.state {
            PairingState::Paired if from == self.pairing.peer => {
                // Our ack was lost; repeat it
                self.send_pair_ack(from, now);
            }
            PairingState::Paired => {
                // Already bound to another peer
            }
            _ => {
                self.pairing.peer = from;
                self.pairing.state = PairingState::Paired;
                self.pairing.last_heartbeat_at = Some(now);
                self.send_pair_ack(from, now);
                events.push(BusEvent::Paired {
                    driver: self.logical_id(),
                });
            }
        }
    }

    /// React to a pairing acknowledgement addressed to this driver
    pub(crate) fn handle_pair_ack(&mut self, from: u8, now: Micros, events: &mut EventQueue) {
        if self.pairing.state == PairingState::AwaitingAck && from == self.pairing.peer {
            self.pairing.state = PairingState::Paired;
            self.pairing.last_heard_at = now;
            self.pairing.last_heartbeat_at = Some(now);
            events.push(BusEvent::Paired {
                driver: self.logical_id(),
            });
        }
    }

    /// React to an explicit unpair from the peer
    pub(crate) fn handle_unpair(&mut self, from: u8, events: &mut EventQueue) {
        if self.pairing.state == PairingState::Paired && from == self.pairing.peer {
            self.pairing.state = PairingState::Unpaired;
            events.push(BusEvent::Unpaired {
                driver: self.logical_id(),
            });
        }
    }

    /// React to a heartbeat from the peer
    pub(crate) fn handle_heartbeat(&mut self, from: u8, now: Micros) {
        if self.pairing.state == PairingState::Paired && from == self.pairing.peer {
            self.note_heard(now);
        }
    }

    /// Tear down an established pairing from this side
    pub fn unpair(&mut self, events: &mut EventQueue) {
        if self.pairing.state != PairingState::Paired {
            return;
        }
        let peer = self.pairing.peer;
        self.queue_control(
            ControlMessage::Unpair {
                instance: self.instance_id,
            },
            peer,
        );
        self.pairing.state = PairingState::Unpaired;
        events.push(BusEvent::Unpaired {
            driver: self.logical_id(),
        });
    }

    fn advertise_if_due(&mut self, now: Micros, config: &ProtocolConfig) {
        if now < self.pairing.next_advert_at {
            return;
        }
        // Fresh jitter every cycle; two nodes advertising in lockstep
        // would otherwise collide on every advertisement.
        let jitter = Micros::from(self.rng.next_u32()) % (config.advert_interval_us / 4 + 1);
        self.pairing.next_advert_at = now + config.advert_interval_us + jitter;
        self.queue_control(
            ControlMessage::Advertise {
                instance: self.instance_id,
            },
            BROADCAST_INSTANCE,
        );
    }

    fn send_pair_request(&mut self) {
        let peer = self.pairing.peer;
        self.queue_control(
            ControlMessage::PairRequest {
                instance: self.instance_id,
            },
            peer,
        );
    }

    fn send_pair_ack(&mut self, to: u8, now: Micros) {
        self.pairing.last_heard_at = now;
        self.queue_control(
            ControlMessage::PairAck {
                instance: self.instance_id,
            },
            to,
        );
    }
}
