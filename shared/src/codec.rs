//! Packet builder and parser
//!
//! Every datagram is a 4-byte [`PacketHeader`] followed by exactly
//! `payload_size` bytes of payload. The builder reserves the header, appends
//! payload structs, and patches the length in [`PacketBuilder::finalize`]. The
//! parser validates sizes up front and never decodes a struct without checking
//! that enough bytes are present.

use crate::protocol::WireStruct;
use log::debug;
use thiserror::Error;

/// Size of the packed header preceding every payload.
pub const HEADER_SIZE: usize = 4;
/// Largest datagram either side will build or accept.
pub const MAX_PACKET_SIZE: usize = 1400;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet of {0} bytes is shorter than the header")]
    TruncatedHeader(usize),
    #[error("payload declares {declared} bytes but {available} are present")]
    PayloadSizeMismatch { declared: usize, available: usize },
    #[error("payload has {available} bytes, {required} needed")]
    PayloadTooShort { required: usize, available: usize },
    #[error("packet of {0} bytes exceeds the maximum packet size")]
    TooLarge(usize),
    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::Error),
}

/// Fixed header: message type, flags, little-endian payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub message_type: u8,
    pub flags: u8,
    pub payload_size: u16,
}

impl PacketHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let size = self.payload_size.to_le_bytes();
        [self.message_type, self.flags, size[0], size[1]]
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            message_type: data[0],
            flags: data[1],
            payload_size: u16::from_le_bytes([data[2], data[3]]),
        })
    }
}

/// Accumulates one outgoing packet.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    buffer: Vec<u8>,
}

impl PacketBuilder {
    /// Starts a packet, reserving space for the header.
    pub fn begin(message_type: impl Into<u8>, flags: u8) -> Self {
        let header = PacketHeader {
            message_type: message_type.into(),
            flags,
            payload_size: 0,
        };
        let mut buffer = Vec::with_capacity(64);
        buffer.extend_from_slice(&header.to_bytes());
        Self { buffer }
    }

    /// Appends the packed encoding of `value`.
    pub fn add_struct<T: WireStruct>(&mut self, value: &T) -> Result<&mut Self, ProtocolError> {
        bincode::serialize_into(&mut self.buffer, value)?;
        Ok(self)
    }

    /// Appends raw payload bytes.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// Writes the payload length into the header and returns the datagram.
    pub fn finalize(mut self) -> Result<Vec<u8>, ProtocolError> {
        let total = self.buffer.len();
        if total > MAX_PACKET_SIZE {
            return Err(ProtocolError::TooLarge(total));
        }
        let payload_size = (total - HEADER_SIZE) as u16;
        self.buffer[2..4].copy_from_slice(&payload_size.to_le_bytes());
        Ok(self.buffer)
    }
}

/// Builds a packet carrying a single payload struct.
pub fn encode<T: WireStruct>(
    message_type: impl Into<u8>,
    flags: u8,
    value: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let mut builder = PacketBuilder::begin(message_type, flags);
    builder.add_struct(value)?;
    builder.finalize()
}

/// Builds a header-only packet.
pub fn encode_empty(message_type: impl Into<u8>, flags: u8) -> Vec<u8> {
    PacketHeader {
        message_type: message_type.into(),
        flags,
        payload_size: 0,
    }
    .to_bytes()
    .to_vec()
}

/// Decodes `T` from the front of `bytes` after checking the length.
pub fn read_struct<T: WireStruct>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() < T::SIZE {
        return Err(ProtocolError::PayloadTooShort {
            required: T::SIZE,
            available: bytes.len(),
        });
    }
    Ok(bincode::deserialize(&bytes[..T::SIZE])?)
}

/// Read-only view over one received datagram.
#[derive(Debug)]
pub struct PacketParser<'a> {
    data: &'a [u8],
    result: Result<PacketHeader, ProtocolError>,
}

impl<'a> PacketParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let result = Self::validate(data);
        if let Err(e) = &result {
            debug!("Rejected packet: {}", e);
        }
        Self { data, result }
    }

    fn validate(data: &[u8]) -> Result<PacketHeader, ProtocolError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        let header = PacketHeader::from_bytes(data)
            .ok_or(ProtocolError::TruncatedHeader(data.len()))?;
        let available = data.len() - HEADER_SIZE;
        if header.payload_size as usize != available {
            return Err(ProtocolError::PayloadSizeMismatch {
                declared: header.payload_size as usize,
                available,
            });
        }
        Ok(header)
    }

    pub fn is_valid(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&ProtocolError> {
        self.result.as_ref().err()
    }

    pub fn header(&self) -> Option<PacketHeader> {
        self.result.as_ref().ok().copied()
    }

    pub fn message_type(&self) -> Option<u8> {
        self.header().map(|h| h.message_type)
    }

    /// Payload bytes, empty when the packet is invalid.
    pub fn payload(&self) -> &'a [u8] {
        if self.is_valid() {
            &self.data[HEADER_SIZE..]
        } else {
            &[]
        }
    }

    /// Decodes the payload as `T`, or `None` if the packet is invalid or the
    /// payload is too short.
    pub fn get_struct<T: WireStruct>(&self) -> Option<T> {
        if !self.is_valid() {
            return None;
        }
        read_struct(self.payload()).ok()
    }
}
