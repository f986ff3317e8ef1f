// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-channel packets.
//!
//! On the wire a packet is a 4-byte header (`type`, `sequence`, and a
//! little-endian `u16` payload length), the payload, then a CRC-8 over
//! everything before it.
//!
//! Parameter packets pair up as request and response. Every other control
//! packet is acknowledged by an `Ack` echoing its sequence number.

use crc::{Crc, CRC_8_SMBUS};
use heapless::Vec;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::caps::{CapabilitySet, CAPS_WIRE_LEN};
use crate::ErrorKind;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Largest payload a control packet may carry.
pub const SIDEBAND_PAYLOAD_MAX: usize = 64;

const HEADER_SIZE: usize = core::mem::size_of::<Header>();
const CRC_SIZE: usize = 1;

/// Size of the largest encoded packet.
pub const SIDEBAND_PACKET_MAX: usize =
    HEADER_SIZE + SIDEBAND_PAYLOAD_MAX + CRC_SIZE;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    ParamRequest = 1,
    ParamResponse,
    TrainingStart,
    TrainingStop,
    ErrorReport,
    ResetRequest,
    RetrainRequest,
    Ack,
}

impl PacketType {
    /// Whether the receiver answers this packet with an `Ack`.
    pub fn needs_ack(self) -> bool {
        matches!(
            self,
            PacketType::TrainingStart
                | PacketType::TrainingStop
                | PacketType::ErrorReport
                | PacketType::ResetRequest
                | PacketType::RetrainRequest
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SidebandError {
    /// Fewer bytes than a header and CRC.
    Truncated,
    /// The header length disagrees with the number of bytes present.
    LengthMismatch,
    BadCrc,
    UnknownType(u8),
    PayloadTooLong,
    BufferTooSmall,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
struct Header {
    ty: u8,
    sequence: u8,
    len: [u8; 2],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidebandPacket {
    pub ty: PacketType,
    pub sequence: u8,
    pub payload: Vec<u8, SIDEBAND_PAYLOAD_MAX>,
}

impl SidebandPacket {
    pub fn new(
        ty: PacketType,
        sequence: u8,
        payload: &[u8],
    ) -> Result<Self, SidebandError> {
        let payload = Vec::from_slice(payload)
            .map_err(|_| SidebandError::PayloadTooLong)?;
        Ok(Self {
            ty,
            sequence,
            payload,
        })
    }

    /// A packet with no payload.
    pub fn bare(ty: PacketType, sequence: u8) -> Self {
        Self {
            ty,
            sequence,
            payload: Vec::new(),
        }
    }

    /// A parameter request or response carrying `caps`.
    pub fn capabilities(
        ty: PacketType,
        sequence: u8,
        caps: &CapabilitySet,
    ) -> Self {
        let mut payload = Vec::new();
        // CAPS_WIRE_LEN is well under SIDEBAND_PAYLOAD_MAX.
        let _ = payload.extend_from_slice(&caps.to_wire());
        Self {
            ty,
            sequence,
            payload,
        }
    }

    /// An error report naming `kind`.
    pub fn error_report(sequence: u8, kind: ErrorKind) -> Self {
        let mut p = Self::bare(PacketType::ErrorReport, sequence);
        let _ = p.payload.push(kind as u8);
        p
    }

    /// Decodes the payload of a parameter packet.
    pub fn as_capabilities(&self) -> Option<CapabilitySet> {
        match self.ty {
            PacketType::ParamRequest | PacketType::ParamResponse => {
                CapabilitySet::from_wire(self.payload.get(..CAPS_WIRE_LEN)?)
            }
            _ => None,
        }
    }

    /// Decodes the payload of an error report.
    pub fn as_error_report(&self) -> Option<ErrorKind> {
        match self.ty {
            PacketType::ErrorReport => {
                ErrorKind::from_u8(*self.payload.first()?)
            }
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CRC_SIZE
    }

    /// Writes the packet into `buf`, returning the number of bytes used.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, SidebandError> {
        let total = self.encoded_len();
        let out = buf
            .get_mut(..total)
            .ok_or(SidebandError::BufferTooSmall)?;
        let header = Header {
            ty: self.ty as u8,
            sequence: self.sequence,
            len: (self.payload.len() as u16).to_le_bytes(),
        };
        let (head, rest) = out.split_at_mut(HEADER_SIZE);
        head.copy_from_slice(header.as_bytes());
        rest[..self.payload.len()].copy_from_slice(&self.payload);
        let crc_start = total - CRC_SIZE;
        let crc = CRC8.checksum(&out[..crc_start]);
        out[crc_start] = crc;
        Ok(total)
    }

    /// Parses exactly one packet from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, SidebandError> {
        if bytes.len() < HEADER_SIZE + CRC_SIZE {
            return Err(SidebandError::Truncated);
        }
        let (header, rest) = Header::read_from_prefix(bytes)
            .map_err(|_| SidebandError::Truncated)?;
        let len = usize::from(u16::from_le_bytes(header.len));
        if rest.len() != len + CRC_SIZE {
            return Err(SidebandError::LengthMismatch);
        }
        let crc_start = bytes.len() - CRC_SIZE;
        if CRC8.checksum(&bytes[..crc_start]) != bytes[crc_start] {
            return Err(SidebandError::BadCrc);
        }
        let ty = PacketType::from_u8(header.ty)
            .ok_or(SidebandError::UnknownType(header.ty))?;
        Self::new(ty, header.sequence, &rest[..len])
    }
}
