//! Slot-stepped shared-bus simulator for host tests
//!
//! Models the one resource every node contends for: the wire. Time advances
//! in fixed slots; within a slot every attached node may tick once. A slot
//! with a single transmitter delivers that transmission to every other
//! node; a slot with several transmitters garbles the line (open-drain
//! byte mixing), so later transmitters observe a read-back mismatch and
//! receivers count a CRC error.
//!
//! Idle sensing is deliberately one slot stale: a node that transmits does
//! not make the line busy for nodes ticked later in the *same* slot. That
//! is the propagation-delay window in which real collisions happen.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use crate::transport::{Lcg32, Wire};
use crate::Micros;

/// Simulated duration of one bus time slot
pub const SLOT_US: Micros = 1_000;

struct Slot {
    /// Node index of every sender so far this slot
    senders: Vec<usize>,
    /// Open-drain mix of every transmission this slot
    line: Vec<u8>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            senders: Vec::new(),
            line: Vec::new(),
        }
    }

    fn mix(&mut self, bytes: &[u8]) {
        if self.line.len() < bytes.len() {
            self.line.resize(bytes.len(), 0xff);
        }
        for (mixed, &byte) in self.line.iter_mut().zip(bytes) {
            *mixed &= byte;
        }
    }
}

struct Shared {
    now: Micros,
    slot: Slot,
    /// Whether the *previous* slot carried traffic
    line_busy: bool,
    inboxes: Vec<VecDeque<Vec<u8>>>,
    /// Per-mille probability that a delivery is lost
    drop_per_mille: u32,
    /// Per-node overrides for deliveries *to* that node
    node_drop_per_mille: Vec<u32>,
    rng: Lcg32,
}

/// Handle to the shared simulated bus
pub struct SimBus {
    shared: Rc<RefCell<Shared>>,
}

impl SimBus {
    /// Create a bus; `seed` drives the deterministic loss lottery
    pub fn new(seed: u32) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                now: 0,
                slot: Slot::empty(),
                line_busy: false,
                inboxes: Vec::new(),
                drop_per_mille: 0,
                node_drop_per_mille: Vec::new(),
                rng: Lcg32::new(seed),
            })),
        }
    }

    /// Attach a new node and return its wire endpoint
    pub fn attach(&self) -> SimWire {
        let mut shared = self.shared.borrow_mut();
        let node = shared.inboxes.len();
        shared.inboxes.push(VecDeque::new());
        shared.node_drop_per_mille.push(0);
        SimWire {
            shared: Rc::clone(&self.shared),
            node,
        }
    }

    /// Probability, in per-mille, that any single delivery is lost
    pub fn set_drop_per_mille(&self, per_mille: u32) {
        self.shared.borrow_mut().drop_per_mille = per_mille.min(1000);
    }

    /// Loss probability for deliveries *to* one node only; models a
    /// directionally bad link without touching the rest of the bus
    pub fn set_drop_to_node(&self, node: usize, per_mille: u32) {
        self.shared.borrow_mut().node_drop_per_mille[node] = per_mille.min(1000);
    }

    /// Current simulated time
    pub fn now(&self) -> Micros {
        self.shared.borrow().now
    }

    /// Close the current slot: resolve deliveries and advance time.
    ///
    /// Call after ticking every node once per slot.
    pub fn end_slot(&self) {
        let mut shared = self.shared.borrow_mut();
        let slot = core::mem::replace(&mut shared.slot, Slot::empty());

        shared.line_busy = !slot.senders.is_empty();
        if !slot.senders.is_empty() {
            // A garbled multi-sender slot is still delivered; receivers
            // count the CRC failure, mirroring noise on a real wire.
            let line = slot.line;
            for node in 0..shared.inboxes.len() {
                if slot.senders.contains(&node) {
                    continue;
                }
                let roll = shared.rng.next_u32() % 1000;
                let drop = shared.drop_per_mille.max(shared.node_drop_per_mille[node]);
                if roll < drop {
                    continue;
                }
                shared.inboxes[node].push_back(line.clone());
            }
        }

        shared.now += SLOT_US;
    }

    /// Run `slots` full slots, ticking each attached node via `tick`.
    ///
    /// `tick(node_index, now)` is called once per node per slot in
    /// attachment order.
    pub fn run<F: FnMut(usize, Micros)>(&self, slots: usize, mut tick: F) {
        for _ in 0..slots {
            let (now, nodes) = {
                let shared = self.shared.borrow();
                (shared.now, shared.inboxes.len())
            };
            for node in 0..nodes {
                tick(node, now);
            }
            self.end_slot();
        }
    }
}

/// One node's endpoint on the simulated bus
pub struct SimWire {
    shared: Rc<RefCell<Shared>>,
    node: usize,
}

impl Wire for SimWire {
    fn is_idle(&self) -> bool {
        // One slot stale: same-slot transmissions are invisible, which is
        // exactly the window where collisions occur.
        !self.shared.borrow().line_busy
    }

    fn send(&mut self, bytes: &[u8], readback: &mut [u8]) -> usize {
        let mut shared = self.shared.borrow_mut();
        shared.slot.mix(bytes);
        shared.slot.senders.push(self.node);

        // The read-back reflects the line as of our transmission: earlier
        // same-slot senders corrupt it, later ones corrupt the receivers'
        // copy instead.
        let len = bytes.len().min(readback.len());
        readback[..len].copy_from_slice(&shared.slot.line[..len]);
        len
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let mut shared = self.shared.borrow_mut();
        match shared.inboxes[self.node].pop_front() {
            Some(bytes) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                len
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::transport::{Transport, TransportError};

    #[test]
    fn test_single_sender_reaches_all_receivers() {
        let bus = SimBus::new(1);
        let mut a = bus.attach();
        let mut b = bus.attach();
        let mut c = bus.attach();

        let frame = Frame::data(1, 2, &[42]).unwrap();
        let bytes = frame.encode_to_vec().unwrap();
        let mut readback = [0u8; 64];
        a.send(&bytes, &mut readback);
        assert_eq!(&readback[..bytes.len()], &bytes[..]);
        bus.end_slot();

        for wire in [&mut b, &mut c] {
            let mut buf = [0u8; 64];
            let len = wire.recv(&mut buf);
            assert_eq!(Frame::decode(&buf[..len]), Ok(frame.clone()));
        }

        // The sender does not hear its own frame back as a reception
        let mut buf = [0u8; 64];
        assert_eq!(a.recv(&mut buf), 0);
    }

    #[test]
    fn test_second_sender_sees_collision() {
        let bus = SimBus::new(1);
        let a = bus.attach();
        let b = bus.attach();
        let receiver = bus.attach();

        let mut ta = Transport::new(a, 1);
        let mut tb = Transport::new(b, 2);
        let frame_a = Frame::data(1, 2, &[0xaa; 8]).unwrap();
        let frame_b = Frame::data(1, 3, &[0x55; 8]).unwrap();

        assert_eq!(ta.try_transmit(&frame_a, 0), Ok(()));
        assert_eq!(tb.try_transmit(&frame_b, 0), Err(TransportError::Collision));
        bus.end_slot();

        // The garbled slot fails CRC at the receiver
        let mut tr = Transport::new(receiver, 3);
        assert_eq!(tr.poll_receive(), None);
        assert_eq!(tr.stats().rx_errors, 1);
    }

    #[test]
    fn test_line_busy_next_slot() {
        let bus = SimBus::new(1);
        let mut a = bus.attach();
        let b = bus.attach();

        let mut readback = [0u8; 8];
        a.send(&[1, 2, 3], &mut readback);
        bus.end_slot();

        assert!(!b.is_idle());
        bus.end_slot();
        assert!(b.is_idle());
    }

    #[test]
    fn test_drop_rate_loses_deliveries() {
        let bus = SimBus::new(99);
        let mut a = bus.attach();
        let mut b = bus.attach();
        bus.set_drop_per_mille(1000);

        let mut readback = [0u8; 8];
        a.send(&[1, 2, 3], &mut readback);
        bus.end_slot();

        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf), 0);
    }

    #[test]
    fn test_time_advances_per_slot() {
        let bus = SimBus::new(1);
        assert_eq!(bus.now(), 0);
        bus.end_slot();
        bus.end_slot();
        assert_eq!(bus.now(), 2 * SLOT_US);
    }
}
