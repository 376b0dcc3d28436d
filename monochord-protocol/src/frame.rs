//! Frame encoding and decoding for the Monochord bus.
//!
//! Frame format (little-endian):
//! - CLASS (1 byte): driver type identifier
//! - INSTANCE (1 byte): target driver instance, 0 = class broadcast
//! - CONTROL (1 byte): bit0 = control frame, bit1 = ack requested, bit2 = pairing
//! - SIZE (1 byte): payload length (0-28)
//! - PAYLOAD (0-28 bytes): driver-specific data
//! - CRC (2 bytes): CRC16-CCITT over all preceding fields

use heapless::Vec;

/// Maximum payload size in bytes
pub const MAX_PAYLOAD: usize = 28;

/// Header size (CLASS + INSTANCE + CONTROL + SIZE)
pub const HEADER_LEN: usize = 4;

/// Trailing CRC size
pub const CRC_LEN: usize = 2;

/// Maximum complete frame size
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD + CRC_LEN;

/// Instance id addressing every driver of the frame's class
pub const BROADCAST_INSTANCE: u8 = 0;

/// Control byte flag: frame carries handshake/meta information
pub const FLAG_CONTROL: u8 = 1 << 0;
/// Control byte flag: receiver should acknowledge the frame
pub const FLAG_ACK_REQUESTED: u8 = 1 << 1;
/// Control byte flag: frame belongs to the pairing handshake
pub const FLAG_PAIRING: u8 = 1 << 2;

/// Errors from frame encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    /// Destination buffer too small for the encoded frame
    BufferTooSmall,
    /// Payload exceeds [`MAX_PAYLOAD`]
    PayloadTooLarge,
}

/// Errors from frame decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Fewer bytes than the minimum header + CRC
    Truncated,
    /// Declared size exceeds the maximum payload or disagrees with the
    /// received byte count
    Malformed,
    /// Computed CRC disagrees with the trailing CRC field
    ChecksumMismatch,
}

/// Incremental CRC16-CCITT (poly 0x1021, init 0xFFFF)
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Default for Crc16 {
    fn default() -> Self {
        Self(Self::INIT)
    }
}

impl Crc16 {
    const INIT: u16 = 0xffff;
    const POLYNOMIAL: u16 = 0x1021;

    /// Create a fresh digest
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one byte into the digest
    pub fn add(&mut self, byte: u8) {
        self.0 ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if (self.0 & 0x8000) != 0 {
                self.0 = (self.0 << 1) ^ Self::POLYNOMIAL;
            } else {
                self.0 <<= 1;
            }
        }
    }

    /// Fold a byte slice into the digest
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.add(byte);
        }
    }

    /// Current digest value
    pub fn get(&self) -> u16 {
        self.0
    }

    /// One-shot digest over a slice
    pub fn over(bytes: &[u8]) -> u16 {
        let mut crc = Self::new();
        crc.add_bytes(bytes);
        crc.get()
    }
}

/// A parsed or constructed frame
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    /// Driver type identifier
    pub class_id: u8,
    /// Target driver instance (0 = broadcast within the class)
    pub instance_id: u8,
    /// Control byte (see `FLAG_*`)
    pub control: u8,
    /// Payload data
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

impl Frame {
    /// Create a data frame
    pub fn data(class_id: u8, instance_id: u8, payload: &[u8]) -> Result<Self, EncodeError> {
        Self::with_control(class_id, instance_id, 0, payload)
    }

    /// Create a control frame
    pub fn control(class_id: u8, instance_id: u8, payload: &[u8]) -> Result<Self, EncodeError> {
        Self::with_control(class_id, instance_id, FLAG_CONTROL, payload)
    }

    /// Create a frame with an explicit control byte
    pub fn with_control(
        class_id: u8,
        instance_id: u8,
        control: u8,
        payload: &[u8],
    ) -> Result<Self, EncodeError> {
        let mut payload_vec = Vec::new();
        payload_vec
            .extend_from_slice(payload)
            .map_err(|_| EncodeError::PayloadTooLarge)?;

        Ok(Self {
            class_id,
            instance_id,
            control,
            payload: payload_vec,
        })
    }

    /// True for handshake/meta frames
    pub fn is_control(&self) -> bool {
        self.control & FLAG_CONTROL != 0
    }

    /// True when the sender expects an acknowledgement
    pub fn ack_requested(&self) -> bool {
        self.control & FLAG_ACK_REQUESTED != 0
    }

    /// True for frames belonging to the pairing handshake
    pub fn is_pairing(&self) -> bool {
        self.control & FLAG_PAIRING != 0
    }

    /// True when addressed to every driver of the class
    pub fn is_broadcast(&self) -> bool {
        self.instance_id == BROADCAST_INSTANCE
    }

    /// Set or clear the ack-requested flag
    pub fn set_ack_requested(&mut self, requested: bool) {
        if requested {
            self.control |= FLAG_ACK_REQUESTED;
        } else {
            self.control &= !FLAG_ACK_REQUESTED;
        }
    }

    /// Number of bytes `encode` will produce
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + CRC_LEN
    }

    /// Encode this frame into a byte buffer
    ///
    /// Returns the number of bytes written.
    pub fn encode(&self, buffer: &mut [u8]) -> Result<usize, EncodeError> {
        let frame_len = self.encoded_len();
        if buffer.len() < frame_len {
            return Err(EncodeError::BufferTooSmall);
        }

        buffer[0] = self.class_id;
        buffer[1] = self.instance_id;
        buffer[2] = self.control;
        buffer[3] = self.payload.len() as u8;
        buffer[HEADER_LEN..HEADER_LEN + self.payload.len()].copy_from_slice(&self.payload);

        let crc = Crc16::over(&buffer[..HEADER_LEN + self.payload.len()]);
        buffer[HEADER_LEN + self.payload.len()..frame_len].copy_from_slice(&crc.to_le_bytes());

        Ok(frame_len)
    }

    /// Encode this frame into a heapless Vec
    pub fn encode_to_vec(&self) -> Result<Vec<u8, MAX_FRAME_LEN>, EncodeError> {
        let mut buffer = [0u8; MAX_FRAME_LEN];
        let len = self.encode(&mut buffer)?;
        let mut vec = Vec::new();
        vec.extend_from_slice(&buffer[..len])
            .map_err(|_| EncodeError::BufferTooSmall)?;
        Ok(vec)
    }

    /// Decode and validate one complete frame
    ///
    /// Pure function over the byte buffer; no partial consumption. The
    /// transport hands this exactly one line reception at a time.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN + CRC_LEN {
            return Err(DecodeError::Truncated);
        }

        let size = bytes[3] as usize;
        if size > MAX_PAYLOAD || bytes.len() != HEADER_LEN + size + CRC_LEN {
            return Err(DecodeError::Malformed);
        }

        let crc_offset = HEADER_LEN + size;
        let received = u16::from_le_bytes([bytes[crc_offset], bytes[crc_offset + 1]]);
        if Crc16::over(&bytes[..crc_offset]) != received {
            return Err(DecodeError::ChecksumMismatch);
        }

        let mut payload = Vec::new();
        // Cannot fail: size was checked against MAX_PAYLOAD above
        let _ = payload.extend_from_slice(&bytes[HEADER_LEN..crc_offset]);

        Ok(Self {
            class_id: bytes[0],
            instance_id: bytes[1],
            control: bytes[2],
            payload,
        })
    }
}
