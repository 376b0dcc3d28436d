//! Control-frame vocabulary for the Monochord bus
//!
//! Control frames carry handshake and acknowledgement traffic. The first
//! payload byte is an opcode; the remainder is opcode-specific. The frame
//! header addresses the *target*; advertisements are class broadcasts, so
//! the sender's own instance id always travels in the payload.

use crate::frame::{EncodeError, Frame, FLAG_CONTROL, FLAG_PAIRING};

// Control opcodes
pub const OP_ADVERTISE: u8 = 0x01;
pub const OP_PAIR_REQUEST: u8 = 0x02;
pub const OP_PAIR_ACK: u8 = 0x03;
pub const OP_UNPAIR: u8 = 0x04;
pub const OP_HEARTBEAT: u8 = 0x05;
pub const OP_ACK: u8 = 0x06;

/// Errors from control-message parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageError {
    /// Frame does not carry the control flag
    NotControl,
    /// First payload byte is not a known opcode
    UnknownOpcode,
    /// Payload too short for the opcode's arguments
    Malformed,
}

/// Parsed control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMessage {
    /// Periodic presence broadcast while unpaired; `instance` is the
    /// sender's current candidate address
    Advertise { instance: u8 },
    /// Request to pair, addressed to a specific instance
    PairRequest { instance: u8 },
    /// Acceptance of a pairing request
    PairAck { instance: u8 },
    /// Explicit teardown of an established pairing
    Unpair { instance: u8 },
    /// Liveness signal between paired drivers
    Heartbeat { instance: u8 },
    /// Acknowledgement of an ack-requested data frame
    Ack { seq: u16 },
}

impl ControlMessage {
    /// Encode this message into a control frame addressed to
    /// `(class_id, target)`
    pub fn to_frame(&self, class_id: u8, target: u8) -> Result<Frame, EncodeError> {
        match *self {
            ControlMessage::Advertise { instance } => {
                Frame::control(class_id, target, &[OP_ADVERTISE, instance])
            }
            ControlMessage::PairRequest { instance } => Frame::with_control(
                class_id,
                target,
                FLAG_CONTROL | FLAG_PAIRING,
                &[OP_PAIR_REQUEST, instance],
            ),
            ControlMessage::PairAck { instance } => Frame::with_control(
                class_id,
                target,
                FLAG_CONTROL | FLAG_PAIRING,
                &[OP_PAIR_ACK, instance],
            ),
            ControlMessage::Unpair { instance } => {
                Frame::control(class_id, target, &[OP_UNPAIR, instance])
            }
            ControlMessage::Heartbeat { instance } => {
                Frame::control(class_id, target, &[OP_HEARTBEAT, instance])
            }
            ControlMessage::Ack { seq } => {
                let bytes = seq.to_le_bytes();
                Frame::control(class_id, target, &[OP_ACK, bytes[0], bytes[1]])
            }
        }
    }

    /// Parse a control message from a frame
    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        if !frame.is_control() {
            return Err(MessageError::NotControl);
        }
        let payload = &frame.payload;
        let opcode = *payload.first().ok_or(MessageError::Malformed)?;

        let instance_arg = || payload.get(1).copied().ok_or(MessageError::Malformed);

        match opcode {
            OP_ADVERTISE => Ok(ControlMessage::Advertise {
                instance: instance_arg()?,
            }),
            OP_PAIR_REQUEST => Ok(ControlMessage::PairRequest {
                instance: instance_arg()?,
            }),
            OP_PAIR_ACK => Ok(ControlMessage::PairAck {
                instance: instance_arg()?,
            }),
            OP_UNPAIR => Ok(ControlMessage::Unpair {
                instance: instance_arg()?,
            }),
            OP_HEARTBEAT => Ok(ControlMessage::Heartbeat {
                instance: instance_arg()?,
            }),
            OP_ACK => {
                if payload.len() < 3 {
                    return Err(MessageError::Malformed);
                }
                Ok(ControlMessage::Ack {
                    seq: u16::from_le_bytes([payload[1], payload[2]]),
                })
            }
            _ => Err(MessageError::UnknownOpcode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BROADCAST_INSTANCE;

    #[test]
    fn test_advertise_is_broadcast_control() {
        let msg = ControlMessage::Advertise { instance: 0x2a };
        let frame = msg.to_frame(0x02, BROADCAST_INSTANCE).unwrap();
        assert!(frame.is_control());
        assert!(frame.is_broadcast());
        assert!(!frame.is_pairing());
        assert_eq!(frame.payload[0], OP_ADVERTISE);
        assert_eq!(frame.payload[1], 0x2a);
    }

    #[test]
    fn test_pairing_frames_carry_pairing_flag() {
        let request = ControlMessage::PairRequest { instance: 7 }
            .to_frame(0x02, 0x2a)
            .unwrap();
        assert!(request.is_pairing());

        let ack = ControlMessage::PairAck { instance: 0x2a }
            .to_frame(0x02, 7)
            .unwrap();
        assert!(ack.is_pairing());
    }

    #[test]
    fn test_roundtrip() {
        let messages = [
            ControlMessage::Advertise { instance: 1 },
            ControlMessage::PairRequest { instance: 200 },
            ControlMessage::PairAck { instance: 31 },
            ControlMessage::Unpair { instance: 9 },
            ControlMessage::Heartbeat { instance: 55 },
            ControlMessage::Ack { seq: 0xbeef },
        ];

        for msg in messages {
            let frame = msg.to_frame(0x02, 0x2a).unwrap();
            assert_eq!(ControlMessage::from_frame(&frame).unwrap(), msg);
        }
    }

    #[test]
    fn test_rejects_data_frame() {
        let frame = Frame::data(0x02, 0x2a, &[OP_ADVERTISE, 1]).unwrap();
        assert_eq!(
            ControlMessage::from_frame(&frame),
            Err(MessageError::NotControl)
        );
    }

    #[test]
    fn test_rejects_unknown_opcode() {
        let frame = Frame::control(0x02, 0x2a, &[0x7f]).unwrap();
        assert_eq!(
            ControlMessage::from_frame(&frame),
            Err(MessageError::UnknownOpcode)
        );
    }

    #[test]
    fn test_rejects_short_payload() {
        let frame = Frame::control(0x02, 0x2a, &[OP_ACK, 0x01]).unwrap();
        assert_eq!(
            ControlMessage::from_frame(&frame),
            Err(MessageError::Malformed)
        );
        let frame = Frame::control(0x02, 0x2a, &[]).unwrap();
        assert_eq!(
            ControlMessage::from_frame(&frame),
            Err(MessageError::Malformed)
        );
    }
}
