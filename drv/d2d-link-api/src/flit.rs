// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flits and their envelopes.
//!
//! A `Flit` is what the consumer of the link hands in and gets out. On the
//! link it travels inside a `FlitEnvelope` that adds a sequence number and a
//! CRC-16. Encoded, an envelope is a 4-byte header (`sequence`,
//! `virtual_channel`, `protocol`, payload length), the payload, then the CRC
//! in little-endian order.

use crc::{Crc, CRC_16_XMODEM};
use heapless::Vec;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::caps::Protocols;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Largest flit payload.
pub const FLIT_PAYLOAD_MAX: usize = 64;

/// Deepest retry window a link may be configured with.
pub const MAX_RETRY_DEPTH: usize = 64;

const HEADER_SIZE: usize = core::mem::size_of::<FlitHeader>();
const CRC_SIZE: usize = 2;

pub const FLIT_ENVELOPE_MAX: usize = HEADER_SIZE + FLIT_PAYLOAD_MAX + CRC_SIZE;

/// Flit sequence number. Wraps modulo 256.
pub type Seq = u8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ProtocolId {
    Pcie = 0,
    CxlIo,
    CxlCacheMem,
    Streaming,
    Raw,
}

impl ProtocolId {
    pub fn flag(self) -> Protocols {
        match self {
            ProtocolId::Pcie => Protocols::PCIE,
            ProtocolId::CxlIo => Protocols::CXL_IO,
            ProtocolId::CxlCacheMem => Protocols::CXL_CACHEMEM,
            ProtocolId::Streaming => Protocols::STREAMING,
            ProtocolId::Raw => Protocols::RAW,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlitMeta {
    pub virtual_channel: u8,
    pub protocol: ProtocolId,
}

/// A payload as seen by the producer and consumer of the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flit {
    pub meta: FlitMeta,
    pub payload: Vec<u8, FLIT_PAYLOAD_MAX>,
}

impl Flit {
    /// Returns `None` if `payload` exceeds `FLIT_PAYLOAD_MAX`.
    pub fn new(meta: FlitMeta, payload: &[u8]) -> Option<Self> {
        Some(Self {
            meta,
            payload: Vec::from_slice(payload).ok()?,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckNak {
    Ack(Seq),
    Nak(Seq),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlitError {
    Truncated,
    LengthMismatch,
    PayloadTooLong,
    UnknownProtocol(u8),
    BufferTooSmall,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
struct FlitHeader {
    sequence: u8,
    virtual_channel: u8,
    protocol: u8,
    len: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlitEnvelope {
    pub sequence: Seq,
    pub meta: FlitMeta,
    pub payload: Vec<u8, FLIT_PAYLOAD_MAX>,
    pub crc: u16,
}

impl FlitEnvelope {
    /// Wraps `flit` with `sequence` and a freshly computed CRC.
    pub fn seal(sequence: Seq, flit: &Flit) -> Self {
        let mut env = Self {
            sequence,
            meta: flit.meta,
            payload: flit.payload.clone(),
            crc: 0,
        };
        env.crc = env.compute_crc();
        env
    }

    fn header(&self) -> FlitHeader {
        FlitHeader {
            sequence: self.sequence,
            virtual_channel: self.meta.virtual_channel,
            protocol: self.meta.protocol as u8,
            len: self.payload.len() as u8,
        }
    }

    /// CRC over the header and payload.
    pub fn compute_crc(&self) -> u16 {
        let mut digest = CRC16.digest();
        digest.update(self.header().as_bytes());
        digest.update(&self.payload);
        digest.finalize()
    }

    pub fn verify(&self) -> bool {
        self.compute_crc() == self.crc
    }

    pub fn flit(&self) -> Flit {
        Flit {
            meta: self.meta,
            payload: self.payload.clone(),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, FlitError> {
        let total = HEADER_SIZE + self.payload.len() + CRC_SIZE;
        let out = buf.get_mut(..total).ok_or(FlitError::BufferTooSmall)?;
        let (head, rest) = out.split_at_mut(HEADER_SIZE);
        head.copy_from_slice(self.header().as_bytes());
        let (body, crc) = rest.split_at_mut(self.payload.len());
        body.copy_from_slice(&self.payload);
        crc.copy_from_slice(&self.crc.to_le_bytes());
        Ok(total)
    }

    /// Parses an envelope. The CRC is carried through unchecked; the
    /// receiver decides what to do about a mismatch.
    pub fn decode(bytes: &[u8]) -> Result<Self, FlitError> {
        let (header, rest) = FlitHeader::read_from_prefix(bytes)
            .map_err(|_| FlitError::Truncated)?;
        let len = usize::from(header.len);
        if len > FLIT_PAYLOAD_MAX {
            return Err(FlitError::PayloadTooLong);
        }
        if rest.len() != len + CRC_SIZE {
            return Err(FlitError::LengthMismatch);
        }
        let protocol = ProtocolId::from_u8(header.protocol)
            .ok_or(FlitError::UnknownProtocol(header.protocol))?;
        let (body, crc) = rest.split_at(len);
        Ok(Self {
            sequence: header.sequence,
            meta: FlitMeta {
                virtual_channel: header.virtual_channel,
                protocol,
            },
            payload: Vec::from_slice(body)
                .map_err(|_| FlitError::PayloadTooLong)?,
            crc: u16::from_le_bytes([crc[0], crc[1]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flit(bytes: &[u8]) -> Flit {
        Flit::new(
            FlitMeta {
                virtual_channel: 2,
                protocol: ProtocolId::CxlIo,
            },
            bytes,
        )
        .unwrap()
    }

    #[test]
    fn sealed_envelope_verifies() {
        let env = FlitEnvelope::seal(5, &flit(b"hello"));
        assert!(env.verify());
        assert_eq!(env.flit(), flit(b"hello"));
    }

    #[test]
    fn crc_covers_sequence_and_payload() {
        let env = FlitEnvelope::seal(5, &flit(b"hello"));
        let mut bad = env.clone();
        bad.sequence = 6;
        assert!(!bad.verify());
        let mut bad = env.clone();
        bad.payload[0] ^= 0x20;
        assert!(!bad.verify());
        let mut bad = env;
        bad.meta.virtual_channel = 0;
        assert!(!bad.verify());
    }

    #[test]
    fn encoded_envelope_decodes() {
        let env = FlitEnvelope::seal(255, &flit(&[7; FLIT_PAYLOAD_MAX]));
        let mut buf = [0; FLIT_ENVELOPE_MAX];
        let n = env.encode(&mut buf).unwrap();
        assert_eq!(n, FLIT_ENVELOPE_MAX);
        assert_eq!(FlitEnvelope::decode(&buf[..n]), Ok(env));
    }

    #[test]
    fn decode_rejects_malformed() {
        let env = FlitEnvelope::seal(1, &flit(b"abc"));
        let mut buf = [0; FLIT_ENVELOPE_MAX];
        let n = env.encode(&mut buf).unwrap();
        assert_eq!(
            FlitEnvelope::decode(&buf[..n - 1]),
            Err(FlitError::LengthMismatch)
        );
        assert_eq!(FlitEnvelope::decode(&buf[..2]), Err(FlitError::Truncated));
        buf[2] = 9;
        assert_eq!(
            FlitEnvelope::decode(&buf[..n]),
            Err(FlitError::UnknownProtocol(9))
        );
    }

    #[test]
    fn oversized_flit_is_refused() {
        let meta = FlitMeta {
            virtual_channel: 0,
            protocol: ProtocolId::Raw,
        };
        assert_eq!(Flit::new(meta, &[0; FLIT_PAYLOAD_MAX + 1]), None);
    }
}
