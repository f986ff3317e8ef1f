// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract between the training sequencer and the physical layer.
//!
//! The physical layer is an external agent: each training phase asserts a
//! `PhyRequest` and waits for a matching `PhyResponse`.

use heapless::Vec;

use crate::{Speed, TrainingPhase, MAX_LANES};

/// Per-lane result of a calibration or training step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LaneSignal {
    Pass,
    Marginal,
    Fail,
}

/// What the physical layer is asked to do in a training phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CalibrationCommand {
    /// Hold the analog front end in reset.
    Hold,
    SidebandDetect,
    /// No mainband activity; the control channel is exchanging parameters.
    Idle,
    Calibrate,
    RepairClock,
    RepairValid,
    /// Send the reversal detection pattern and report what arrived.
    ReversalPattern,
    RepairData,
    ValidVref,
    DataVref,
    /// Switch to the requested speed.
    SpeedChange,
    TxSelfCal,
    RxClockCal,
    ValidCenter,
    ValidVrefTrain,
    DataCenter,
    DataVrefTrain,
    RxDeskew,
    /// Check the link at the requested speed and width and report lanes.
    LinkCheck,
    RepairLanes,
    LinkInit,
    /// Normal operation.
    Mission,
    Retrain,
}

impl CalibrationCommand {
    /// The command asserted while in `phase`. `TrainError` holds the PHY in
    /// reset, the same as `Reset`.
    pub fn for_phase(phase: TrainingPhase) -> Self {
        use CalibrationCommand as C;
        use TrainingPhase as P;
        match phase {
            P::Reset | P::TrainError => C::Hold,
            P::SbInit => C::SidebandDetect,
            P::ParamExchange => C::Idle,
            P::MbInitCal => C::Calibrate,
            P::MbInitRepairClk => C::RepairClock,
            P::MbInitRepairVal => C::RepairValid,
            P::MbInitReversalMb => C::ReversalPattern,
            P::MbInitRepairMb => C::RepairData,
            P::MbTrainValVref => C::ValidVref,
            P::MbTrainDataVref => C::DataVref,
            P::MbTrainSpeedIdle => C::SpeedChange,
            P::MbTrainTxSelfCal => C::TxSelfCal,
            P::MbTrainRxClkCal => C::RxClockCal,
            P::MbTrainValTrainCenter => C::ValidCenter,
            P::MbTrainValTrainVref => C::ValidVrefTrain,
            P::MbTrainDataTrainCenter1 | P::MbTrainDataTrainCenter2 => {
                C::DataCenter
            }
            P::MbTrainDataTrainVref => C::DataVrefTrain,
            P::MbTrainRxDeskew => C::RxDeskew,
            P::MbTrainLinkSpeed => C::LinkCheck,
            P::MbTrainRepair => C::RepairLanes,
            P::LinkInit => C::LinkInit,
            P::Active => C::Mission,
            P::PhyRetrain => C::Retrain,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PhyRequest {
    pub target_speed: Speed,
    pub target_width: u8,
    pub calibration: CalibrationCommand,
}

/// The physical layer's answer to the current `PhyRequest`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhyResponse {
    pub ready: bool,
    pub achieved_speed: Speed,
    pub achieved_width: u8,
    /// Indexed by physical lane. Lanes past the end are taken to have passed.
    pub per_lane_status: Vec<LaneSignal, MAX_LANES>,
    /// Received reversal detection pattern, for `MbInitReversalMb`.
    pub pattern: Option<u64>,
}

impl PhyResponse {
    /// A successful response with every lane passing.
    pub fn ready(speed: Speed, width: u8) -> Self {
        Self {
            ready: true,
            achieved_speed: speed,
            achieved_width: width,
            per_lane_status: Vec::new(),
            pattern: None,
        }
    }

    pub fn not_ready(speed: Speed, width: u8) -> Self {
        Self {
            ready: false,
            ..Self::ready(speed, width)
        }
    }

    /// Sets the signal of physical lane `lane`, padding earlier lanes with
    /// `Pass`. Lanes beyond `MAX_LANES` are ignored.
    pub fn with_lane(mut self, lane: u8, signal: LaneSignal) -> Self {
        let lane = usize::from(lane);
        if lane < MAX_LANES {
            while self.per_lane_status.len() <= lane {
                // Cannot fail: the length is below MAX_LANES.
                let _ = self.per_lane_status.push(LaneSignal::Pass);
            }
            self.per_lane_status[lane] = signal;
        }
        self
    }

    pub fn with_pattern(mut self, pattern: u64) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn lane(&self, lane: u8) -> LaneSignal {
        self.per_lane_status
            .get(usize::from(lane))
            .copied()
            .unwrap_or(LaneSignal::Pass)
    }

    /// Physical lanes that reported `Fail`.
    pub fn failed_lanes(&self) -> impl Iterator<Item = u8> + '_ {
        self.per_lane_status
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s == LaneSignal::Fail)
            .map(|(i, _)| i as u8)
    }
}
