// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link capabilities and their reconciliation.

use bitflags::bitflags;
use num_derive::FromPrimitive;
use serde::Deserialize;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Mainband data rates, in GT/s.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive,
)]
#[repr(u8)]
pub enum Speed {
    Gt4 = 4,
    Gt8 = 8,
    Gt12 = 12,
    Gt16 = 16,
    Gt24 = 24,
    Gt32 = 32,
    Gt48 = 48,
    Gt64 = 64,
}

impl Speed {
    /// Every speed, slowest first.
    pub const ALL: [Speed; 8] = [
        Speed::Gt4,
        Speed::Gt8,
        Speed::Gt12,
        Speed::Gt16,
        Speed::Gt24,
        Speed::Gt32,
        Speed::Gt48,
        Speed::Gt64,
    ];

    pub fn gts(self) -> u8 {
        self as u8
    }

    pub fn flag(self) -> Speeds {
        match self {
            Speed::Gt4 => Speeds::GT4,
            Speed::Gt8 => Speeds::GT8,
            Speed::Gt12 => Speeds::GT12,
            Speed::Gt16 => Speeds::GT16,
            Speed::Gt24 => Speeds::GT24,
            Speed::Gt32 => Speeds::GT32,
            Speed::Gt48 => Speeds::GT48,
            Speed::Gt64 => Speeds::GT64,
        }
    }
}

bitflags! {
    /// A set of supported data rates.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
    #[serde(transparent)]
    pub struct Speeds: u8 {
        const GT4 = 1 << 0;
        const GT8 = 1 << 1;
        const GT12 = 1 << 2;
        const GT16 = 1 << 3;
        const GT24 = 1 << 4;
        const GT32 = 1 << 5;
        const GT48 = 1 << 6;
        const GT64 = 1 << 7;
    }
}

impl Speeds {
    /// The fastest speed in the set.
    pub fn highest(self) -> Option<Speed> {
        Speed::ALL
            .iter()
            .rev()
            .copied()
            .find(|s| self.contains(s.flag()))
    }

    /// The fastest speed in the set that is strictly slower than `speed`.
    pub fn highest_below(self, speed: Speed) -> Option<Speed> {
        Speed::ALL
            .iter()
            .rev()
            .copied()
            .find(|&s| s < speed && self.contains(s.flag()))
    }
}

bitflags! {
    /// Payload protocols that may ride over the link.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
    #[serde(transparent)]
    pub struct Protocols: u8 {
        const PCIE = 1 << 0;
        const CXL_IO = 1 << 1;
        const CXL_CACHEMEM = 1 << 2;
        const STREAMING = 1 << 3;
        const RAW = 1 << 4;
    }
}

bitflags! {
    /// Optional link features.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
    #[serde(transparent)]
    pub struct Features: u16 {
        const RETRY = 1 << 0;
        const LANE_REVERSAL = 1 << 1;
        const SPARE_LANES = 1 << 2;
        const STANDBY = 1 << 3;
        const SLEEP = 1 << 4;
        const FLIT_68B = 1 << 5;
        const FLIT_256B = 1 << 6;
        const RETIMER = 1 << 7;
    }
}

/// What one side of the link can do.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CapabilitySet {
    pub speeds: Speeds,
    pub max_width: u8,
    pub protocols: Protocols,
    pub features: Features,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NegotiationError {
    NoCommonSpeed,
    NoCommonWidth,
    NoCommonProtocol,
    /// The partner never answered, even after retries.
    Timeout,
}

impl NegotiationError {
    pub fn is_mismatch(self) -> bool {
        !matches!(self, NegotiationError::Timeout)
    }
}

/// Size of an encoded capability set on the control channel.
pub const CAPS_WIRE_LEN: usize = 5;

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
struct CapabilityWire {
    speeds: u8,
    max_width: u8,
    protocols: u8,
    features: [u8; 2],
}

impl CapabilitySet {
    pub fn max_speed(&self) -> Option<Speed> {
        self.speeds.highest()
    }

    /// Reconciles `self` with the partner's set: speeds, protocols and
    /// features are intersected; width is the smaller of the two, rounded
    /// down to a power of two.
    ///
    /// The negotiated set advertises every common speed, so its
    /// `max_speed()` is the fastest rate both sides support.
    pub fn negotiate(
        &self,
        remote: &CapabilitySet,
    ) -> Result<CapabilitySet, NegotiationError> {
        let speeds = self.speeds & remote.speeds;
        if speeds.is_empty() {
            return Err(NegotiationError::NoCommonSpeed);
        }
        let width = self.max_width.min(remote.max_width);
        if width == 0 {
            return Err(NegotiationError::NoCommonWidth);
        }
        let protocols = self.protocols & remote.protocols;
        if protocols.is_empty() {
            return Err(NegotiationError::NoCommonProtocol);
        }
        Ok(CapabilitySet {
            speeds,
            max_width: prev_power_of_two(width),
            protocols,
            features: self.features & remote.features,
        })
    }

    pub fn to_wire(&self) -> [u8; CAPS_WIRE_LEN] {
        let wire = CapabilityWire {
            speeds: self.speeds.bits(),
            max_width: self.max_width,
            protocols: self.protocols.bits(),
            features: self.features.bits().to_le_bytes(),
        };
        let mut out = [0; CAPS_WIRE_LEN];
        out.copy_from_slice(wire.as_bytes());
        out
    }

    /// Decodes a capability set. Bits this side does not know about are
    /// dropped, which makes them unsupported for negotiation purposes.
    pub fn from_wire(bytes: &[u8]) -> Option<CapabilitySet> {
        let wire = CapabilityWire::read_from_bytes(bytes).ok()?;
        Some(CapabilitySet {
            speeds: Speeds::from_bits_truncate(wire.speeds),
            max_width: wire.max_width,
            protocols: Protocols::from_bits_truncate(wire.protocols),
            features: Features::from_bits_truncate(u16::from_le_bytes(
                wire.features,
            )),
        })
    }
}

fn prev_power_of_two(n: u8) -> u8 {
    match n {
        0 => 0,
        n => 1 << (7 - n.leading_zeros()),
    }
}
