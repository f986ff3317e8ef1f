// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session configuration.
//!
//! A `LinkConfig` is consumed when a session is created and never changes
//! afterwards; picking up new values takes a cold reset. All times are in
//! microsecond ticks.

use serde::Deserialize;

use crate::caps::{CapabilitySet, Features, Protocols, Speeds};
use crate::flit::MAX_RETRY_DEPTH;
use crate::{PhaseGroup, Rung, TrainingPhase, MAX_LANES};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How many times one flit may be retransmitted before the reliability
    /// engine gives up on it.
    pub max_retries: u8,
    /// How long a transmitted flit may go unacknowledged.
    pub retry_timeout: u64,
    /// Retry window depth; a power of two no larger than `MAX_RETRY_DEPTH`.
    pub retry_window_depth: u16,
    /// Back-to-back CRC failures tolerated before escalating.
    pub crc_burst_threshold: u8,

    pub phase_timeouts: PhaseTimeouts,
    /// Attempts each training phase gets before training fails.
    pub phase_attempts: u8,

    pub sideband_timeout: u64,
    /// Automatic control-channel resends before giving up.
    pub sideband_retries: u8,

    pub max_width: u8,
    pub min_width: u8,
    pub spare_lanes: u8,
    /// Runtime errors after which a lane is considered failed.
    pub lane_error_threshold: u32,
    /// Runtime errors after which a lane is considered marginal.
    pub lane_marginal_threshold: u32,

    pub power: PowerTimeouts,
    pub recovery: RecoveryConfig,

    pub local: CapabilitySet,
}

/// Training timeouts, one per phase group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PhaseTimeouts {
    pub reset: u64,
    pub sideband_init: u64,
    pub parameter_exchange: u64,
    pub mainband_init: u64,
    pub mainband_train: u64,
    pub link_init: u64,
    pub retrain: u64,
}

/// UCIe bounds every training state by an 8 ms residency timeout.
const STATE_TIMEOUT: u64 = 8_000;

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            reset: STATE_TIMEOUT,
            sideband_init: STATE_TIMEOUT,
            parameter_exchange: STATE_TIMEOUT,
            mainband_init: STATE_TIMEOUT,
            mainband_train: STATE_TIMEOUT,
            link_init: STATE_TIMEOUT,
            retrain: STATE_TIMEOUT,
        }
    }
}

impl PhaseTimeouts {
    /// Residency limit for `phase`, or `None` for phases that may be held
    /// indefinitely.
    pub fn for_phase(&self, phase: TrainingPhase) -> Option<u64> {
        match phase.group() {
            PhaseGroup::Reset => Some(self.reset),
            PhaseGroup::SidebandInit => Some(self.sideband_init),
            PhaseGroup::ParameterExchange => Some(self.parameter_exchange),
            PhaseGroup::MainbandInit => Some(self.mainband_init),
            PhaseGroup::MainbandTrain => Some(self.mainband_train),
            PhaseGroup::LinkInit => Some(self.link_init),
            PhaseGroup::Retrain => Some(self.retrain),
            PhaseGroup::Active | PhaseGroup::Error => None,
        }
    }
}

/// Budgets for power-state handshakes with the physical layer. Sleep is a
/// deeper power-down than standby and must be given strictly more time in
/// both directions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PowerTimeouts {
    pub standby_entry: u64,
    pub standby_exit: u64,
    pub sleep_entry: u64,
    pub sleep_exit: u64,
}

impl Default for PowerTimeouts {
    fn default() -> Self {
        Self {
            standby_entry: 100,
            standby_exit: 200,
            sleep_entry: 1_000,
            sleep_exit: 4_000,
        }
    }
}

/// The order in which Error Recovery tries remediations.
///
/// Whether lane repair comes before or after speed degrade is a policy
/// choice; both orders keep retry first and retrain/reset last.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum Ladder {
    #[default]
    RepairFirst,
    SpeedFirst,
}

impl Ladder {
    pub fn rungs(self) -> [Rung; 6] {
        match self {
            Ladder::RepairFirst => [
                Rung::Retry,
                Rung::LaneRepair,
                Rung::SpeedDegrade,
                Rung::WidthDegrade,
                Rung::Retrain,
                Rung::Reset,
            ],
            Ladder::SpeedFirst => [
                Rung::Retry,
                Rung::SpeedDegrade,
                Rung::LaneRepair,
                Rung::WidthDegrade,
                Rung::Retrain,
                Rung::Reset,
            ],
        }
    }

    /// Height of `rung` on this ladder; escalation never lowers it.
    pub fn position(self, rung: Rung) -> usize {
        self.rungs()
            .iter()
            .position(|&r| r == rung)
            .unwrap_or(usize::MAX)
    }

    /// The rung directly above `rung`, if any.
    pub fn above(self, rung: Rung) -> Option<Rung> {
        self.rungs().get(self.position(rung).wrapping_add(1)).copied()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub ladder: Ladder,
    pub retry_timeout: u64,
    pub lane_repair_timeout: u64,
    pub speed_degrade_timeout: u64,
    pub width_degrade_timeout: u64,
    pub retrain_timeout: u64,
    pub reset_timeout: u64,
    /// Cold resets attempted within one error episode before the link is
    /// declared unrecoverable.
    pub max_resets: u8,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ladder: Ladder::default(),
            retry_timeout: 2_000,
            lane_repair_timeout: 1_000,
            speed_degrade_timeout: 500_000,
            width_degrade_timeout: 1_000,
            retrain_timeout: 500_000,
            reset_timeout: 1_000_000,
            max_resets: 1,
        }
    }
}

impl RecoveryConfig {
    pub fn timeout(&self, rung: Rung) -> u64 {
        match rung {
            Rung::Retry => self.retry_timeout,
            Rung::LaneRepair => self.lane_repair_timeout,
            Rung::SpeedDegrade => self.speed_degrade_timeout,
            Rung::WidthDegrade => self.width_degrade_timeout,
            Rung::Retrain => self.retrain_timeout,
            Rung::Reset => self.reset_timeout,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            retry_timeout: 200,
            retry_window_depth: 32,
            crc_burst_threshold: 8,
            phase_timeouts: PhaseTimeouts::default(),
            phase_attempts: 3,
            sideband_timeout: 1_000,
            sideband_retries: 3,
            max_width: 16,
            min_width: 8,
            spare_lanes: 2,
            lane_error_threshold: 16,
            lane_marginal_threshold: 4,
            power: PowerTimeouts::default(),
            recovery: RecoveryConfig::default(),
            local: CapabilitySet {
                speeds: Speeds::GT4
                    | Speeds::GT8
                    | Speeds::GT12
                    | Speeds::GT16
                    | Speeds::GT24
                    | Speeds::GT32,
                max_width: 16,
                protocols: Protocols::PCIE
                    | Protocols::CXL_IO
                    | Protocols::CXL_CACHEMEM
                    | Protocols::STREAMING,
                features: Features::RETRY
                    | Features::LANE_REVERSAL
                    | Features::SPARE_LANES
                    | Features::STANDBY
                    | Features::SLEEP
                    | Features::FLIT_68B,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_width`/`min_width` not a power of two, or `min_width` above
    /// `max_width`.
    BadWidth,
    /// More physical lanes than `MAX_LANES`.
    TooManyLanes,
    BadRetryWindow,
    ZeroBudget,
    BadLaneThresholds,
    /// Sleep must take strictly longer than standby, in both directions.
    PowerBudgetOrder,
    /// The local capability set advertises nothing usable, or more width than
    /// the link has.
    BadLocalCapabilities,
    #[cfg(feature = "toml")]
    Parse,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let width_ok = |w: u8| w != 0 && w.is_power_of_two();
        if !width_ok(self.max_width)
            || !width_ok(self.min_width)
            || self.min_width > self.max_width
        {
            return Err(ConfigError::BadWidth);
        }
        if usize::from(self.max_width) + usize::from(self.spare_lanes)
            > MAX_LANES
        {
            return Err(ConfigError::TooManyLanes);
        }
        let depth = self.retry_window_depth;
        if depth == 0
            || !depth.is_power_of_two()
            || usize::from(depth) > MAX_RETRY_DEPTH
        {
            return Err(ConfigError::BadRetryWindow);
        }
        if self.max_retries == 0
            || self.phase_attempts == 0
            || self.crc_burst_threshold == 0
        {
            return Err(ConfigError::ZeroBudget);
        }
        if self.lane_error_threshold == 0
            || self.lane_marginal_threshold > self.lane_error_threshold
        {
            return Err(ConfigError::BadLaneThresholds);
        }
        let p = &self.power;
        if p.sleep_entry <= p.standby_entry || p.sleep_exit <= p.standby_exit {
            return Err(ConfigError::PowerBudgetOrder);
        }
        let local = &self.local;
        if local.speeds.is_empty()
            || local.protocols.is_empty()
            || local.max_width == 0
            || local.max_width > self.max_width
        {
            return Err(ConfigError::BadLocalCapabilities);
        }
        Ok(())
    }

    /// Parses and validates a TOML configuration. Keys that are absent take
    /// their default values.
    #[cfg(feature = "toml")]
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig =
            toml::from_str(text).map_err(|_| ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(LinkConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_min_above_max() {
        let c = LinkConfig {
            min_width: 32,
            ..LinkConfig::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::BadWidth));
    }

    #[test]
    fn rejects_odd_window() {
        let c = LinkConfig {
            retry_window_depth: 24,
            ..LinkConfig::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::BadRetryWindow));
    }

    #[test]
    fn sleep_must_be_slower_than_standby() {
        let mut c = LinkConfig::default();
        c.power.sleep_exit = c.power.standby_exit;
        assert_eq!(c.validate(), Err(ConfigError::PowerBudgetOrder));
    }

    #[test]
    fn ladders_keep_the_ends_fixed() {
        for ladder in [Ladder::RepairFirst, Ladder::SpeedFirst] {
            let rungs = ladder.rungs();
            assert_eq!(rungs[0], Rung::Retry);
            assert_eq!(rungs[4], Rung::Retrain);
            assert_eq!(rungs[5], Rung::Reset);
            assert_eq!(ladder.above(Rung::Reset), None);
        }
        assert!(
            Ladder::SpeedFirst.position(Rung::SpeedDegrade)
                < Ladder::SpeedFirst.position(Rung::LaneRepair)
        );
        assert_eq!(
            Ladder::RepairFirst.above(Rung::LaneRepair),
            Some(Rung::SpeedDegrade)
        );
    }

    #[test]
    fn timeouts_cover_training_phases_only() {
        let t = PhaseTimeouts::default();
        assert_eq!(t.for_phase(TrainingPhase::MbTrainRxDeskew), Some(8_000));
        assert_eq!(t.for_phase(TrainingPhase::Active), None);
        assert_eq!(t.for_phase(TrainingPhase::TrainError), None);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn parses_partial_toml() {
        let c = LinkConfig::from_toml(
            r#"
            max_width = 32
            min_width = 4
            spare_lanes = 0

            [recovery]
            ladder = "SpeedFirst"
            "#,
        )
        .unwrap();
        assert_eq!(c.max_width, 32);
        assert_eq!(c.spare_lanes, 0);
        assert_eq!(c.recovery.ladder, Ladder::SpeedFirst);
        assert_eq!(c.max_retries, LinkConfig::default().max_retries);
    }
}
