//! Bus service loop
//!
//! One [`Protocol`] instance owns one transport and every locally-hosted
//! driver. Its [`tick`](Protocol::tick) is the bus time-slot: transmit one
//! queued frame (round-robin across drivers, so none starves the others),
//! dispatch at most one inbound frame, then give every driver its periodic
//! service. All work is bounded; anything long-running belongs in a driver's
//! own bookkeeping across ticks.

use monochord_protocol::transport::TransportError;
use monochord_protocol::{ControlMessage, Frame, LineStats, Micros, Transport, Wire};

use crate::config::ProtocolConfig;
use crate::driver::LogicalId;
use crate::events::{BusEvent, EventQueue, NotificationSink};
use crate::registry::{Registry, RegistryError};
use crate::traits::BusDriver;

/// Protocol core: transport, registry and service loop
#[derive(Debug)]
pub struct Protocol<W, D> {
    transport: Transport<W>,
    registry: Registry<D>,
    config: ProtocolConfig,
    events: EventQueue,
    rr_cursor: usize,
    running: bool,
}

impl<W: Wire, D: BusDriver> Protocol<W, D> {
    /// Create a protocol core bound to `wire`.
    ///
    /// `seed` desynchronizes this node's collision backoff from its bus
    /// neighbours; any per-node value (serial number, first driver id)
    /// works.
    pub fn new(wire: W, seed: u32, config: ProtocolConfig) -> Self {
        Self {
            transport: Transport::new(wire, seed),
            registry: Registry::new(),
            config,
            events: EventQueue::new(),
            rr_cursor: 0,
            running: false,
        }
    }

    /// Register a driver; returns its logical id for later lookups
    pub fn add(&mut self, driver: D) -> Result<LogicalId, RegistryError> {
        let id = driver.core().logical_id();
        self.registry.add(driver)?;
        Ok(id)
    }

    /// Begin bus service; ticks are no-ops until this is called
    pub fn start(&mut self) {
        self.running = true;
    }

    /// Halt bus service
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// True while the service loop is active
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// One bus time-slot: transmit, receive, service
    pub fn tick(&mut self, now: Micros) {
        if !self.running {
            return;
        }

        self.service_transmit(now);

        if let Some(frame) = self.transport.poll_receive() {
            self.handle_frame(frame, now);
        }

        for driver in self.registry.iter_mut() {
            driver
                .core_mut()
                .service_pairing(now, &self.config, &mut self.events);
            driver.periodic_service(now, &mut self.events);
        }
    }

    /// Dispatch one inbound frame to the matching local driver(s).
    ///
    /// Frames that match no local driver were meant for someone else on
    /// the bus and are silently ignored.
    pub fn handle_frame(&mut self, frame: Frame, now: Micros) {
        if frame.is_control() {
            if let Ok(message) = ControlMessage::from_frame(&frame) {
                self.dispatch_control(&message, &frame, now);
            }
            // Unknown or malformed control traffic is ignored
        } else {
            self.dispatch_data(&frame, now);
        }
    }

    /// Take the oldest undelivered bus event
    pub fn poll_event(&mut self) -> Option<BusEvent> {
        self.events.pop()
    }

    /// Deliver every pending event to the application's sink
    pub fn drain_events(&mut self, sink: &mut impl NotificationSink) {
        while let Some(event) = self.events.pop() {
            sink.notify(event);
        }
    }

    /// Look up a driver by logical id
    pub fn driver(&self, id: LogicalId) -> Option<&D> {
        self.registry.by_id(id)
    }

    /// Look up a driver by logical id, mutably
    pub fn driver_mut(&mut self, id: LogicalId) -> Option<&mut D> {
        self.registry.by_id_mut(id)
    }

    /// Tear down a driver's pairing from this side
    pub fn unpair(&mut self, id: LogicalId) -> bool {
        match self.registry.by_id_mut(id) {
            Some(driver) => {
                driver.core_mut().unpair(&mut self.events);
                true
            }
            None => false,
        }
    }

    /// Line health counters
    pub fn stats(&self) -> &LineStats {
        self.transport.stats()
    }

    /// Active configuration
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Transmit at most one queued frame, rotating fairly across drivers
    fn service_transmit(&mut self, now: Micros) {
        let count = self.registry.len();
        for offset in 0..count {
            let index = (self.rr_cursor + offset) % count;
            let Some(driver) = self.registry.get_mut(index) else {
                continue;
            };
            let core = driver.core_mut();
            let Some(queued) = core.tx_front_mut() else {
                continue;
            };

            match self.transport.try_transmit(&queued.frame, now) {
                Ok(()) => {
                    core.tx_pop();
                    self.rr_cursor = (index + 1) % count;
                }
                Err(TransportError::Collision) => {
                    queued.attempts += 1;
                    if queued.attempts >= self.config.max_tx_attempts {
                        core.tx_pop();
                        self.transport.note_dropped();
                    }
                    self.rr_cursor = (index + 1) % count;
                }
                Err(TransportError::Backoff) | Err(TransportError::BusBusy) => {
                    // Line-level condition; no driver can transmit this tick
                }
                Err(TransportError::Encode) => {
                    core.tx_pop();
                    self.transport.note_dropped();
                }
            }
            return;
        }
    }

    fn dispatch_control(&mut self, message: &ControlMessage, frame: &Frame, now: Micros) {
        for driver in self.registry.iter_mut() {
            let core = driver.core_mut();
            if core.class_id() != frame.class_id {
                continue;
            }
            if !frame.is_broadcast() && frame.instance_id != core.instance_id() {
                continue;
            }

            match *message {
                ControlMessage::Advertise { instance } => {
                    core.handle_advertisement(instance, now, &self.config);
                }
                ControlMessage::PairRequest { instance } => {
                    core.handle_pair_request(instance, now, &mut self.events);
                }
                ControlMessage::PairAck { instance } => {
                    core.handle_pair_ack(instance, now, &mut self.events);
                }
                ControlMessage::Unpair { instance } => {
                    core.handle_unpair(instance, &mut self.events);
                }
                ControlMessage::Heartbeat { instance } => {
                    core.handle_heartbeat(instance, now);
                }
                ControlMessage::Ack { .. } => {
                    if core.is_paired() {
                        core.note_heard(now);
                    }
                }
            }

            driver.on_control_frame(message, frame, &mut self.events);

            if !frame.is_broadcast() {
                return;
            }
        }
    }

    fn dispatch_data(&mut self, frame: &Frame, now: Micros) {
        for driver in self.registry.iter_mut() {
            let core = driver.core_mut();
            if core.class_id() != frame.class_id {
                continue;
            }
            if !frame.is_broadcast() && frame.instance_id != core.instance_id() {
                continue;
            }

            if core.is_paired() {
                core.note_heard(now);
            }

            let mut deliver = true;
            if frame.ack_requested() {
                if let Some(seq) = data_sequence(frame) {
                    if core.last_seen_seq == Some(seq) {
                        // Retransmission of something already delivered
                        deliver = false;
                    } else {
                        core.last_seen_seq = Some(seq);
                    }
                    // Always (re-)acknowledge; the previous ack may be lost
                    if let Some(peer) = core.peer_instance() {
                        core.queue_control(ControlMessage::Ack { seq }, peer);
                    }
                }
            }

            if deliver {
                driver.on_data_frame(frame, &mut self.events);
            }

            if !frame.is_broadcast() {
                return;
            }
        }
    }
}

/// Sequence number of an ack-requested data frame (payload bytes 0-1)
fn data_sequence(frame: &Frame) -> Option<u16> {
    match frame.payload.as_slice() {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}
