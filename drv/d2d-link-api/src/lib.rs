// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared definitions for the die-to-die link control plane.
//!
//! Everything that more than one state machine needs to agree on lives here:
//! the training phase and power state enumerations, the error taxonomy, the
//! capability set, the messages exchanged with the physical layer, and the
//! wire formats of the control channel and of flits.

#![cfg_attr(not(any(test, feature = "toml")), no_std)]

pub mod caps;
pub mod config;
pub mod flit;
pub mod phy;
pub mod sideband;

pub use caps::{
    CapabilitySet, Features, NegotiationError, Protocols, Speed, Speeds,
};
pub use config::{
    ConfigError, Ladder, LinkConfig, PhaseTimeouts, PowerTimeouts,
    RecoveryConfig,
};
pub use flit::{
    AckNak, Flit, FlitEnvelope, FlitError, FlitMeta, ProtocolId, Seq,
    FLIT_PAYLOAD_MAX, MAX_RETRY_DEPTH,
};
pub use phy::{CalibrationCommand, LaneSignal, PhyRequest, PhyResponse};
pub use sideband::{
    PacketType, SidebandError, SidebandPacket, SIDEBAND_PACKET_MAX,
};

use counters::Count;
use enum_map::Enum;
use num_derive::FromPrimitive;

/// Largest number of physical lanes (active plus spare) a link may have.
pub const MAX_LANES: usize = 64;

/// Link training phases.
///
/// Bring-up walks these in declaration order from `Reset` to `Active`,
/// skipping the three phases that are only reachable on a detour:
/// `MbTrainRepair` (lane errors during speed finalization), `PhyRetrain`
/// (retrain requested from `Active`) and `TrainError`.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive,
)]
#[repr(u8)]
pub enum TrainingPhase {
    Reset = 0,
    SbInit,
    ParamExchange,
    MbInitCal,
    MbInitRepairClk,
    MbInitRepairVal,
    MbInitReversalMb,
    MbInitRepairMb,
    MbTrainValVref,
    MbTrainDataVref,
    MbTrainSpeedIdle,
    MbTrainTxSelfCal,
    MbTrainRxClkCal,
    MbTrainValTrainCenter,
    MbTrainValTrainVref,
    MbTrainDataTrainCenter1,
    MbTrainDataTrainVref,
    MbTrainRxDeskew,
    MbTrainDataTrainCenter2,
    MbTrainLinkSpeed,
    MbTrainRepair,
    LinkInit,
    Active,
    PhyRetrain,
    TrainError,
}

/// The phases a clean bring-up visits, in order.
pub const BRINGUP_ORDER: [TrainingPhase; 22] = [
    TrainingPhase::Reset,
    TrainingPhase::SbInit,
    TrainingPhase::ParamExchange,
    TrainingPhase::MbInitCal,
    TrainingPhase::MbInitRepairClk,
    TrainingPhase::MbInitRepairVal,
    TrainingPhase::MbInitReversalMb,
    TrainingPhase::MbInitRepairMb,
    TrainingPhase::MbTrainValVref,
    TrainingPhase::MbTrainDataVref,
    TrainingPhase::MbTrainSpeedIdle,
    TrainingPhase::MbTrainTxSelfCal,
    TrainingPhase::MbTrainRxClkCal,
    TrainingPhase::MbTrainValTrainCenter,
    TrainingPhase::MbTrainValTrainVref,
    TrainingPhase::MbTrainDataTrainCenter1,
    TrainingPhase::MbTrainDataTrainVref,
    TrainingPhase::MbTrainRxDeskew,
    TrainingPhase::MbTrainDataTrainCenter2,
    TrainingPhase::MbTrainLinkSpeed,
    TrainingPhase::LinkInit,
    TrainingPhase::Active,
];

/// Coarse grouping of training phases; timeouts are configured per group.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhaseGroup {
    Reset,
    SidebandInit,
    ParameterExchange,
    MainbandInit,
    MainbandTrain,
    LinkInit,
    Active,
    Retrain,
    Error,
}

impl TrainingPhase {
    pub fn group(self) -> PhaseGroup {
        use TrainingPhase::*;
        match self {
            Reset => PhaseGroup::Reset,
            SbInit => PhaseGroup::SidebandInit,
            ParamExchange => PhaseGroup::ParameterExchange,
            MbInitCal | MbInitRepairClk | MbInitRepairVal
            | MbInitReversalMb | MbInitRepairMb => PhaseGroup::MainbandInit,
            MbTrainValVref
            | MbTrainDataVref
            | MbTrainSpeedIdle
            | MbTrainTxSelfCal
            | MbTrainRxClkCal
            | MbTrainValTrainCenter
            | MbTrainValTrainVref
            | MbTrainDataTrainCenter1
            | MbTrainDataTrainVref
            | MbTrainRxDeskew
            | MbTrainDataTrainCenter2
            | MbTrainLinkSpeed
            | MbTrainRepair => PhaseGroup::MainbandTrain,
            LinkInit => PhaseGroup::LinkInit,
            Active => PhaseGroup::Active,
            PhyRetrain => PhaseGroup::Retrain,
            TrainError => PhaseGroup::Error,
        }
    }

    /// The phase that follows `self` when `self` completes successfully.
    /// Terminal phases have no successor.
    pub fn next(self) -> Option<TrainingPhase> {
        match self {
            TrainingPhase::Active | TrainingPhase::TrainError => None,
            // Retrain skips sideband and parameter exchange, but redoes
            // reversal and lane repair.
            TrainingPhase::PhyRetrain => {
                Some(TrainingPhase::MbInitReversalMb)
            }
            // After repairing lanes the link is re-centered at the new width.
            TrainingPhase::MbTrainRepair => {
                Some(TrainingPhase::MbTrainTxSelfCal)
            }
            phase => BRINGUP_ORDER
                .iter()
                .position(|&p| p == phase)
                .and_then(|i| BRINGUP_ORDER.get(i + 1))
                .copied(),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TrainingPhase::Active | TrainingPhase::TrainError)
    }
}

/// Link power states.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum PowerState {
    Active = 0,
    StandbyEntering,
    Standby,
    StandbyExiting,
    SleepEntering,
    Sleep,
    SleepExiting,
}

/// Per-lane health as tracked by the lane manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum LaneStatus {
    Good = 0,
    Marginal,
    Failed,
    /// Not carrying data: repaired out, degraded out, or an unused spare.
    Disabled,
}

impl LaneStatus {
    pub fn is_healthy(self) -> bool {
        matches!(self, LaneStatus::Good | LaneStatus::Marginal)
    }
}

/// Everything that can go wrong on a link.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, Enum)]
#[repr(u8)]
pub enum ErrorKind {
    CrcMismatch = 1,
    SequenceTimeout,
    RetryExhausted,
    LaneThresholdExceeded,
    NoSpareLane,
    WidthFloorReached,
    SpeedFloorReached,
    PhaseTimeout,
    CapabilityMismatch,
    SidebandTimeout,
    PowerTransitionTimeout,
    Unrecoverable,
}

const ERROR_KINDS: usize = <ErrorKind as Enum>::LENGTH;

/// How many times each [`ErrorKind`] has been seen.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ErrorCounts([u32; ERROR_KINDS]);

impl ErrorCounts {
    pub fn get(&self, kind: ErrorKind) -> u32 {
        self.0[kind.into_usize()]
    }

    pub fn values(&self) -> impl Iterator<Item = &u32> {
        self.0.iter()
    }

    pub fn total(&self) -> u32 {
        self.0.iter().fold(0, |sum, &n| sum.saturating_add(n))
    }
}

impl Default for ErrorCounts {
    fn default() -> Self {
        ErrorKind::NEW_COUNTERS
    }
}

impl Count for ErrorKind {
    type Counters = ErrorCounts;
    const NEW_COUNTERS: ErrorCounts = ErrorCounts([0; ERROR_KINDS]);

    fn count(&self, counters: &mut ErrorCounts) {
        let n = &mut counters.0[(*self).into_usize()];
        *n = n.saturating_add(1);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// A one-off that is likely to clear by itself.
    Transient,
    /// Has exceeded a local retry or threshold budget.
    Persistent,
    /// The link cannot carry traffic until something is rebuilt.
    Fatal,
}

/// The state machines that make up a link, used to tag errors and grants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum Component {
    Training,
    Negotiator,
    Lanes,
    Reliability,
    Power,
    Recovery,
    /// Acknowledged delivery on the control channel.
    Control,
    /// The link partner, via an error report on the control channel.
    Remote,
}

/// An error raised by one component for Error Recovery to act on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub source: Component,
    pub severity: Severity,
    pub timestamp: u64,
    /// Physical lane, for lane-scoped errors.
    pub lane: Option<u8>,
}

impl ErrorEvent {
    pub fn new(
        kind: ErrorKind,
        source: Component,
        severity: Severity,
        timestamp: u64,
    ) -> Self {
        Self {
            kind,
            source,
            severity,
            timestamp,
            lane: None,
        }
    }

    pub fn on_lane(mut self, lane: u8) -> Self {
        self.lane = Some(lane);
        self
    }
}

/// Remediations Error Recovery can choose from, from least to most
/// disruptive under the default ladder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum Rung {
    Retry,
    LaneRepair,
    SpeedDegrade,
    WidthDegrade,
    Retrain,
    Reset,
}

/// Commands to the physical layer asserted on behalf of power management.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerDirective {
    EnterStandby,
    ExitStandby,
    EnterSleep,
    ExitSleep,
}

/// Commands to the physical layer asserted on behalf of Error Recovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryDirective {
    /// Replay the retry window.
    Replay,
    /// Load the lane manager's current logical-to-physical map.
    ApplyLaneMap,
    /// Narrow the link to the given width.
    ApplyWidth(u8),
    /// Hold the physical layer in reset.
    ResetPhy,
}

/// The one command the physical layer should act on this tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    Train(PhyRequest),
    Power(PowerDirective),
    Recovery(RecoveryDirective),
}
