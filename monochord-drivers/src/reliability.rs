//! Link reliability measurement
//!
//! Sends a burst of sequence-numbered probe frames to the paired peer and
//! measures how many come back acknowledged. Loss is the measurement:
//! there is no retry, and a timed-out probe simply counts against the
//! percentage. Acks arriving after their probe already timed out are
//! rejected by sequence number rather than double-counted.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use monochord_core::events::{BusEvent, EventQueue};
use monochord_core::{BusDriver, DriverCore, LogicalId, Monotonic, Protocol};
use monochord_protocol::{ControlMessage, Frame, Micros, Wire};

use crate::{DriverKind, CLASS_RELIABILITY};

/// Interval between service ticks while blocking on a burst
const RUN_TICK_US: u32 = 500;

/// Burst parameters
///
/// Defaults follow the convention of a 100-frame burst so the result reads
/// directly as a percentage; all of it is configuration, none of it is
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReliabilityConfig {
    /// Probes per burst
    pub burst_size: u16,
    /// Minimum spacing between consecutive probes
    pub probe_gap_us: Micros,
    /// How long each probe waits for its acknowledgement
    pub per_frame_timeout_us: Micros,
    /// Hard ceiling on one burst; expiry returns the partial percentage
    pub overall_timeout_us: Micros,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            burst_size: 100,
            probe_gap_us: 2_000,
            per_frame_timeout_us: 10_000,
            overall_timeout_us: 10_000_000,
        }
    }
}

/// Errors from starting a burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TestError {
    /// No peer; a burst needs an established pairing
    NotPaired,
    /// A burst is already running
    Busy,
}

/// Bookkeeping for one running burst
#[derive(Debug, Clone, Copy)]
struct Session {
    sent: u16,
    acked: u16,
    next_seq: u16,
    /// Outstanding probe: (sequence, ack deadline)
    in_flight: Option<(u16, Micros)>,
    next_send_at: Micros,
    started_at: Micros,
}

/// Driver measuring acknowledgement rate to its paired peer
pub struct ReliabilityTester {
    core: DriverCore,
    config: ReliabilityConfig,
    session: Option<Session>,
    result: Option<u8>,
}

impl ReliabilityTester {
    /// Tester with default burst parameters
    pub fn new(logical_id: LogicalId, instance_id: u8) -> Self {
        Self::with_config(logical_id, instance_id, ReliabilityConfig::default())
    }

    /// Tester with explicit burst parameters
    pub fn with_config(logical_id: LogicalId, instance_id: u8, config: ReliabilityConfig) -> Self {
        Self {
            core: DriverCore::with_instance(logical_id, CLASS_RELIABILITY, instance_id),
            config,
            session: None,
            result: None,
        }
    }

    /// Burst parameters
    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Start a burst; probes flow from subsequent service ticks
    pub fn begin(&mut self, now: Micros) -> Result<(), TestError> {
        if self.session.is_some() {
            return Err(TestError::Busy);
        }
        if !self.core.is_paired() {
            return Err(TestError::NotPaired);
        }
        self.result = None;
        self.session = Some(Session {
            sent: 0,
            acked: 0,
            next_seq: 1,
            in_flight: None,
            next_send_at: now,
            started_at: now,
        });
        Ok(())
    }

    /// True while a burst is in progress
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Consume the finished burst's success percentage, if one is ready
    pub fn take_result(&mut self) -> Option<u8> {
        self.result.take()
    }

    /// Most recent percentage without consuming it
    pub fn last_result(&self) -> Option<u8> {
        self.result
    }

    /// Close the session and publish the percentage
    fn finish(&mut self, events: &mut EventQueue) {
        let Some(session) = self.session.take() else {
            return;
        };
        let burst = u32::from(self.config.burst_size.max(1));
        let percent = ((u32::from(session.acked) * 100 + burst / 2) / burst).min(100) as u8;
        self.result = Some(percent);
        events.push(BusEvent::TestCompleted {
            driver: self.core.logical_id(),
            percent,
        });
    }
}

impl BusDriver for ReliabilityTester {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn on_control_frame(
        &mut self,
        message: &ControlMessage,
        _frame: &Frame,
        _events: &mut EventQueue,
    ) {
        let ControlMessage::Ack { seq } = *message else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.in_flight {
            Some((expected, _)) if expected == seq => {
                session.acked += 1;
                session.in_flight = None;
            }
            // Stale ack for a probe that already timed out
            _ => {}
        }
    }

    fn on_data_frame(&mut self, _frame: &Frame, _events: &mut EventQueue) {
        // Inbound probes need nothing from the driver; the protocol core
        // acknowledges them on delivery.
    }

    fn periodic_service(&mut self, now: Micros, events: &mut EventQueue) {
        let config = self.config;
        let peer = self.core.peer_instance();

        let Some(session) = self.session.as_mut() else {
            return;
        };

        if now.saturating_sub(session.started_at) >= config.overall_timeout_us {
            self.finish(events);
            return;
        }

        if let Some((_, deadline)) = session.in_flight {
            if now >= deadline {
                session.in_flight = None;
            }
        }
        if session.in_flight.is_some() {
            return;
        }

        if session.sent >= config.burst_size {
            self.finish(events);
            return;
        }
        if now < session.next_send_at {
            return;
        }

        let Some(peer) = peer else {
            // Pairing lost mid-burst; report what was measured
            self.finish(events);
            return;
        };

        let seq = session.next_seq;
        let Ok(mut frame) = Frame::data(CLASS_RELIABILITY, peer, &seq.to_le_bytes()) else {
            return;
        };
        frame.set_ack_requested(true);
        if !self.core.queue_frame(frame) {
            // Transmit queue momentarily full; try again next tick
            return;
        }

        session.next_seq = session.next_seq.wrapping_add(1);
        session.sent += 1;
        session.in_flight = Some((seq, now + config.per_frame_timeout_us));
        session.next_send_at = now + config.probe_gap_us;
    }
}

/// Run a full burst to completion, blocking the calling task.
///
/// Drives the protocol's service tick between delays until the burst
/// finishes or its overall timeout expires; returns the success
/// percentage, the partial percentage on timeout, or 0 when the tester
/// is missing, unpaired or already busy.
pub fn run_reliability_test<W, O, C, DL>(
    protocol: &mut Protocol<W, DriverKind<O>>,
    id: LogicalId,
    clock: &C,
    delay: &mut DL,
) -> u8
where
    W: Wire,
    O: OutputPin,
    C: Monotonic,
    DL: DelayNs,
{
    if !protocol.is_running() {
        return 0;
    }

    let started = clock.now_us();
    let overall = match protocol.driver_mut(id) {
        Some(DriverKind::Reliability(tester)) => match tester.begin(started) {
            Ok(()) => tester.config().overall_timeout_us,
            Err(_) => return 0,
        },
        _ => return 0,
    };

    // The session itself finishes at its overall timeout; the hard bound
    // below only guards against a stalled clock source.
    let hard_deadline = started.saturating_add(overall.saturating_mul(2));
    loop {
        let now = clock.now_us();
        protocol.tick(now);

        let Some(DriverKind::Reliability(tester)) = protocol.driver_mut(id) else {
            return 0;
        };
        if let Some(percent) = tester.take_result() {
            return percent;
        }
        if now > hard_deadline {
            return tester.last_result().unwrap_or(0);
        }

        delay.delay_us(RUN_TICK_US);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use monochord_core::ProtocolConfig;

    fn ack_frame(seq: u16, target: u8) -> (ControlMessage, Frame) {
        let message = ControlMessage::Ack { seq };
        let frame = message.to_frame(CLASS_RELIABILITY, target).unwrap();
        (message, frame)
    }

    fn probe_seq(frame: &Frame) -> u16 {
        u16::from_le_bytes([frame.payload[0], frame.payload[1]])
    }

    #[test]
    fn test_begin_requires_pairing() {
        let mut tester = ReliabilityTester::new(1, 10);
        assert_eq!(tester.begin(0), Err(TestError::NotPaired));
        assert!(!tester.is_running());
    }

    #[test]
    fn test_begin_rejects_concurrent_burst() {
        let mut tester = ReliabilityTester::new(1, 10);
        tester.core_mut().pair_with(20, 0);
        assert_eq!(tester.begin(0), Ok(()));
        assert_eq!(tester.begin(1), Err(TestError::Busy));
    }

    #[test]
    fn test_lossless_burst_scores_100() {
        let mut tester = ReliabilityTester::with_config(
            1,
            10,
            ReliabilityConfig {
                burst_size: 10,
                ..ReliabilityConfig::default()
            },
        );
        tester.core_mut().pair_with(20, 0);
        tester.begin(0).unwrap();

        let mut events = EventQueue::new();
        let mut now = 0;
        while tester.is_running() {
            tester.periodic_service(now, &mut events);
            while let Some(frame) = tester.core_mut().dequeue_frame() {
                assert!(frame.ack_requested());
                assert_eq!(frame.instance_id, 20);
                let (message, frame) = ack_frame(probe_seq(&frame), 10);
                tester.on_control_frame(&message, &frame, &mut events);
            }
            now += 1_000;
            assert!(now < 1_000_000, "burst failed to converge");
        }

        assert_eq!(tester.take_result(), Some(100));
        assert_eq!(
            events.pop(),
            Some(BusEvent::TestCompleted {
                driver: 1,
                percent: 100
            })
        );
    }

    #[test]
    fn test_half_loss_scores_50() {
        let mut tester = ReliabilityTester::with_config(
            1,
            10,
            ReliabilityConfig {
                burst_size: 10,
                ..ReliabilityConfig::default()
            },
        );
        tester.core_mut().pair_with(20, 0);
        tester.begin(0).unwrap();

        let mut events = EventQueue::new();
        let mut now = 0;
        while tester.is_running() {
            tester.periodic_service(now, &mut events);
            while let Some(frame) = tester.core_mut().dequeue_frame() {
                let seq = probe_seq(&frame);
                // Every odd probe is lost; its timeout counts against the score
                if seq % 2 == 0 {
                    let (message, frame) = ack_frame(seq, 10);
                    tester.on_control_frame(&message, &frame, &mut events);
                }
            }
            now += 1_000;
            assert!(now < 1_000_000, "burst failed to converge");
        }

        assert_eq!(tester.take_result(), Some(50));
    }

    #[test]
    fn test_stale_ack_rejected() {
        let mut tester = ReliabilityTester::with_config(
            1,
            10,
            ReliabilityConfig {
                burst_size: 2,
                ..ReliabilityConfig::default()
            },
        );
        tester.core_mut().pair_with(20, 0);
        tester.begin(0).unwrap();

        let mut events = EventQueue::new();

        // Probe 1 goes out and times out unanswered
        tester.periodic_service(0, &mut events);
        let first = tester.core_mut().dequeue_frame().unwrap();
        assert_eq!(probe_seq(&first), 1);
        tester.periodic_service(20_000, &mut events);

        // Probe 2 goes out; the ack for probe 1 is now stale
        let second = tester.core_mut().dequeue_frame().unwrap();
        assert_eq!(probe_seq(&second), 2);
        let (message, frame) = ack_frame(1, 10);
        tester.on_control_frame(&message, &frame, &mut events);

        // Only probe 2's ack counts
        let (message, frame) = ack_frame(2, 10);
        tester.on_control_frame(&message, &frame, &mut events);

        let mut now = 30_000;
        while tester.is_running() {
            tester.periodic_service(now, &mut events);
            now += 1_000;
            assert!(now < 1_000_000, "burst failed to converge");
        }
        assert_eq!(tester.take_result(), Some(50));
    }

    #[test]
    fn test_overall_timeout_reports_partial() {
        let mut tester = ReliabilityTester::with_config(
            1,
            10,
            ReliabilityConfig {
                burst_size: 100,
                overall_timeout_us: 5_000,
                ..ReliabilityConfig::default()
            },
        );
        tester.core_mut().pair_with(20, 0);
        tester.begin(0).unwrap();

        let mut events = EventQueue::new();
        tester.periodic_service(0, &mut events);
        let probe = tester.core_mut().dequeue_frame().unwrap();
        let (message, frame) = ack_frame(probe_seq(&probe), 10);
        tester.on_control_frame(&message, &frame, &mut events);

        // Expiry with 1 of 100 acked rounds to 1 percent
        tester.periodic_service(5_000, &mut events);
        assert!(!tester.is_running());
        assert_eq!(tester.take_result(), Some(1));
    }

    // Host-test doubles for the blocking runner

    struct NullWire;

    impl Wire for NullWire {
        fn is_idle(&self) -> bool {
            true
        }

        fn send(&mut self, bytes: &[u8], readback: &mut [u8]) -> usize {
            readback[..bytes.len()].copy_from_slice(bytes);
            bytes.len()
        }

        fn recv(&mut self, _buf: &mut [u8]) -> usize {
            0
        }
    }

    struct TestClock(Cell<Micros>);

    impl Monotonic for TestClock {
        fn now_us(&self) -> Micros {
            let now = self.0.get();
            self.0.set(now + 1_000);
            now
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn test_runner_returns_zero_when_unpaired() {
        let mut protocol: Protocol<NullWire, DriverKind<crate::NoOutput>> =
            Protocol::new(NullWire, 1, ProtocolConfig::default());
        protocol.start();
        protocol
            .add(DriverKind::Reliability(ReliabilityTester::new(1, 10)))
            .unwrap();

        let clock = TestClock(Cell::new(0));
        assert_eq!(
            run_reliability_test(&mut protocol, 1, &clock, &mut NoDelay),
            0
        );
    }

    #[test]
    fn test_runner_scores_zero_on_dead_wire() {
        let mut protocol: Protocol<NullWire, DriverKind<crate::NoOutput>> =
            Protocol::new(NullWire, 1, ProtocolConfig::default());
        protocol.start();

        let mut tester = ReliabilityTester::with_config(
            1,
            10,
            ReliabilityConfig {
                burst_size: 5,
                ..ReliabilityConfig::default()
            },
        );
        tester.core_mut().pair_with(20, 0);
        protocol.add(DriverKind::Reliability(tester)).unwrap();

        let clock = TestClock(Cell::new(0));
        assert_eq!(
            run_reliability_test(&mut protocol, 1, &clock, &mut NoDelay),
            0
        );
    }
}
