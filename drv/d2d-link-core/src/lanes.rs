// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lane Health Manager.
//!
//! Owns the lane table: one record per physical lane, the logical-to-physical
//! map for the lanes currently carrying data, the spare pool, and whether the
//! link was found to be wired in reverse.
//!
//! A link has `max_width + spare_lanes` physical lanes. At reset, logical
//! lane `n` is physical lane `n` and the lanes above `max_width` are spares.
//! A failed lane is repaired by moving its logical lane onto a spare; with no
//! spare left, the link is narrowed to the lowest aligned block of lanes that
//! is entirely healthy. Width only grows back when the table is rebuilt on a
//! cold reset.

use drv_d2d_link_api::{
    Component, ErrorEvent, ErrorKind, LaneSignal, LaneStatus, LinkConfig,
    Rung, Severity, MAX_LANES,
};
use heapless::Vec;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::mailbox::{Ctx, Message};
use crate::recovery::RecoveryInput;
use crate::training::TrainingInput;

/// Per-lane signals as reported by the physical layer, by physical lane.
pub type LaneSignals = Vec<LaneSignal, MAX_LANES>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaneCommand {
    /// Narrow to the negotiated width.
    Configure { width: u8 },
    /// Match the received reversal pattern.
    DetectReversal(u64),
    /// Take in calibration results and repair or narrow around failures.
    Evaluate(LaneSignals),
    /// Take in calibration results without acting on failures yet.
    Check(LaneSignals),
    /// Repair or narrow around any failed active lane.
    Rebuild,
    /// Runtime error count for one physical lane.
    Errors { lane: u8, count: u32 },
    /// Repair `lane`, or every failed active lane.
    Repair(Option<u8>),
    /// Narrow by one step.
    Degrade,
    /// Rebuild the table at full width.
    Reset,
}

/// What the lane manager tells the training sequencer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LaneOutcome {
    Ready { width: u8 },
    /// Active lanes failed; the caller should schedule a repair step.
    NeedsRepair,
    /// The reversal pattern matched neither orientation.
    PatternMismatch,
    Failed(ErrorKind),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaneRecord {
    pub physical_id: u8,
    /// `None` when the lane carries no data.
    pub logical_id: Option<u8>,
    pub status: LaneStatus,
    pub error_count: u32,
    pub last_transition: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LaneError {
    NoSpareLane,
    WidthFloorReached,
    /// Named lane is not an active lane.
    NotActive,
    /// A reversal pattern that matched neither orientation.
    PatternMismatch,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Reset { width: u8, spares: u8 },
    Configured { width: u8 },
    Reversal { pattern: u64, reversed: bool },
    ReversalMismatch { pattern: u64 },
    Status { lane: u8, status: LaneStatus },
    Repaired { logical: u8, from: u8, to: u8 },
    NoSpare { lane: u8 },
    Narrowed { width: u8, base: u8 },
    WidthFloor { width: u8 },
    InactiveFailure { lane: u8 },
}

pub struct LaneTable {
    max_width: u8,
    spare_lanes: u8,
    min_width: u8,
    error_threshold: u32,
    marginal_threshold: u32,
    records: Vec<LaneRecord, MAX_LANES>,
    /// Physical lane for each logical lane, `width` long.
    map: Vec<u8, MAX_LANES>,
    /// Free spares, highest first so that `pop` hands out the lowest.
    spares: Vec<u8, MAX_LANES>,
    reversed: bool,
    trace: Ringbuf<Trace, 32>,
}

impl LaneTable {
    pub fn new(config: &LinkConfig) -> Self {
        let mut table = Self {
            max_width: config.max_width,
            spare_lanes: config.spare_lanes,
            min_width: config.min_width,
            error_threshold: config.lane_error_threshold,
            marginal_threshold: config.lane_marginal_threshold,
            records: Vec::new(),
            map: Vec::new(),
            spares: Vec::new(),
            reversed: false,
            trace: Ringbuf::new(Trace::None),
        };
        table.rebuild(config.max_width, config.spare_lanes, 0);
        table
    }

    fn rebuild(&mut self, width: u8, spares: u8, now: u64) {
        self.records.clear();
        self.map.clear();
        self.spares.clear();
        self.reversed = false;

        // `LinkConfig::validate` bounds width + spares by MAX_LANES, so the
        // pushes below cannot fail.
        let total = width.saturating_add(spares);
        for p in 0..total {
            let active = p < width;
            let _ = self.records.push(LaneRecord {
                physical_id: p,
                logical_id: active.then_some(p),
                status: if active {
                    LaneStatus::Good
                } else {
                    LaneStatus::Disabled
                },
                error_count: 0,
                last_transition: now,
            });
            if active {
                let _ = self.map.push(p);
            }
        }
        for p in (width..total).rev() {
            let _ = self.spares.push(p);
        }
        ringbuf_entry!(self.trace, Trace::Reset { width, spares });
    }

    pub fn width(&self) -> u8 {
        self.map.len() as u8
    }

    pub fn records(&self) -> &[LaneRecord] {
        &self.records
    }

    pub fn record(&self, physical: u8) -> Option<&LaneRecord> {
        self.records.get(usize::from(physical))
    }

    pub fn spares_remaining(&self) -> usize {
        self.spares.len()
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    /// Physical lane carrying `logical`, with any reversal applied.
    pub fn physical_lane(&self, logical: u8) -> Option<u8> {
        let logical = usize::from(logical);
        let width = self.map.len();
        if logical >= width {
            return None;
        }
        let slot = if self.reversed {
            width - 1 - logical
        } else {
            logical
        };
        self.map.get(slot).copied()
    }

    /// Lanes that are healthy, whether active or not.
    pub fn healthy_lanes(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status.is_healthy())
            .count()
    }

    fn is_active(&self, physical: u8) -> bool {
        self.map.contains(&physical)
    }

    fn set_status(&mut self, physical: u8, status: LaneStatus, now: u64) {
        if let Some(rec) = self.records.get_mut(usize::from(physical)) {
            if rec.status != status {
                rec.status = status;
                rec.last_transition = now;
                ringbuf_entry!(
                    self.trace,
                    Trace::Status {
                        lane: physical,
                        status
                    }
                );
            }
        }
    }

    fn status(&self, physical: u8) -> LaneStatus {
        self.record(physical)
            .map(|r| r.status)
            .unwrap_or(LaneStatus::Disabled)
    }

    /// Folds calibration results into lane status. Active and spare lanes
    /// that report `Fail` are marked failed; failed spares leave the pool.
    /// Returns `true` if any active lane failed.
    pub fn evaluate(&mut self, signals: &[LaneSignal], now: u64) -> bool {
        let mut active_failed = false;
        for (p, &sig) in signals.iter().enumerate() {
            let Some(rec) = self.records.get(p) else {
                break;
            };
            let p = p as u8;
            let current = rec.status;
            if current == LaneStatus::Disabled && !self.spares.contains(&p) {
                // Repaired or degraded out; nothing to learn.
                continue;
            }
            match sig {
                LaneSignal::Fail => {
                    if self.spares.contains(&p) {
                        self.spares = self
                            .spares
                            .iter()
                            .copied()
                            .filter(|&s| s != p)
                            .collect();
                    }
                    self.set_status(p, LaneStatus::Failed, now);
                    if self.is_active(p) {
                        active_failed = true;
                    }
                }
                LaneSignal::Marginal if current == LaneStatus::Good => {
                    self.set_status(p, LaneStatus::Marginal, now);
                }
                _ => (),
            }
        }
        active_failed
    }

    /// Moves the logical lane carried by physical lane `failed` onto a spare.
    /// The failed lane is disabled; width does not change.
    pub fn repair(&mut self, failed: u8, now: u64) -> Result<(), LaneError> {
        let logical = self
            .map
            .iter()
            .position(|&p| p == failed)
            .ok_or(LaneError::NotActive)?;
        let Some(spare) = self.spares.pop() else {
            ringbuf_entry!(self.trace, Trace::NoSpare { lane: failed });
            return Err(LaneError::NoSpareLane);
        };
        self.map[logical] = spare;
        if let Some(rec) = self.records.get_mut(usize::from(failed)) {
            rec.logical_id = None;
        }
        if let Some(rec) = self.records.get_mut(usize::from(spare)) {
            rec.logical_id = Some(logical as u8);
        }
        self.set_status(failed, LaneStatus::Disabled, now);
        self.set_status(spare, LaneStatus::Good, now);
        ringbuf_entry!(
            self.trace,
            Trace::Repaired {
                logical: logical as u8,
                from: failed,
                to: spare,
            }
        );
        Ok(())
    }

    fn failed_active(&self) -> Option<u8> {
        self.map
            .iter()
            .copied()
            .find(|&p| self.status(p) == LaneStatus::Failed)
    }

    /// Repairs every failed active lane, stopping at the first one that
    /// cannot be repaired.
    pub fn repair_all(&mut self, now: u64) -> Result<usize, LaneError> {
        let mut repaired = 0;
        while let Some(p) = self.failed_active() {
            self.repair(p, now)?;
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Narrows the link to `new_width` lanes, keeping the lowest aligned
    /// block of active lanes in which every lane is healthy. Lanes outside
    /// the block are disabled.
    pub fn degrade_width(
        &mut self,
        new_width: u8,
        now: u64,
    ) -> Result<(), LaneError> {
        let width = self.width();
        if new_width < self.min_width
            || new_width == 0
            || !new_width.is_power_of_two()
            || new_width >= width
        {
            ringbuf_entry!(self.trace, Trace::WidthFloor { width });
            return Err(LaneError::WidthFloorReached);
        }
        let n = usize::from(new_width);
        let healthy = |block: &[u8]| {
            block.iter().all(|&p| self.status(p).is_healthy())
        };
        let base = (0..self.map.len())
            .step_by(n)
            .find(|&base| self.map.get(base..base + n).is_some_and(healthy))
            .ok_or(LaneError::WidthFloorReached)?;

        let old: Vec<u8, MAX_LANES> = self.map.clone();
        self.map.clear();
        for (i, &p) in old.iter().enumerate() {
            if (base..base + n).contains(&i) {
                let logical = (i - base) as u8;
                let _ = self.map.push(p);
                if let Some(rec) = self.records.get_mut(usize::from(p)) {
                    rec.logical_id = Some(logical);
                }
            } else {
                if let Some(rec) = self.records.get_mut(usize::from(p)) {
                    rec.logical_id = None;
                }
                self.set_status(p, LaneStatus::Disabled, now);
            }
        }
        ringbuf_entry!(
            self.trace,
            Trace::Narrowed {
                width: new_width,
                base: base as u8,
            }
        );
        Ok(())
    }

    /// Steps the width down, trying each power of two from half the current
    /// width down to the minimum. Returns the new width.
    pub fn degrade(&mut self, now: u64) -> Result<u8, LaneError> {
        let mut w = self.width() / 2;
        while w >= self.min_width && w > 0 {
            if self.degrade_width(w, now).is_ok() {
                return Ok(w);
            }
            w /= 2;
        }
        ringbuf_entry!(
            self.trace,
            Trace::WidthFloor {
                width: self.width()
            }
        );
        Err(LaneError::WidthFloorReached)
    }

    /// Repairs what can be repaired and narrows around the rest.
    pub fn rebuild_around_failures(
        &mut self,
        now: u64,
    ) -> Result<u8, LaneError> {
        match self.repair_all(now) {
            Ok(_) => Ok(self.width()),
            Err(LaneError::NoSpareLane) => self.degrade(now),
            Err(e) => Err(e),
        }
    }

    /// Compares a received lane-ID pattern against the expected one and its
    /// bit-reversed form. The expected pattern has ones on the lower half of
    /// the active lanes. A match on the reversed form only marks the link
    /// reversed, which `physical_lane` then accounts for.
    pub fn detect_reversal(&mut self, pattern: u64) -> Result<bool, LaneError> {
        let width = u32::from(self.width());
        let expected = expected_pattern(width);
        let mirrored = mirror(expected, width);
        let reversed = if pattern == expected {
            false
        } else if pattern == mirrored {
            true
        } else {
            ringbuf_entry!(self.trace, Trace::ReversalMismatch { pattern });
            return Err(LaneError::PatternMismatch);
        };
        self.reversed = reversed;
        ringbuf_entry!(self.trace, Trace::Reversal { pattern, reversed });
        Ok(reversed)
    }

    /// Adds runtime errors to a lane and moves it through Marginal to Failed
    /// as its count crosses the configured thresholds. Returns the lane's
    /// new status if it changed.
    pub fn record_errors(
        &mut self,
        physical: u8,
        count: u32,
        now: u64,
    ) -> Option<LaneStatus> {
        let (error_threshold, marginal_threshold) =
            (self.error_threshold, self.marginal_threshold);
        let rec = self.records.get_mut(usize::from(physical))?;
        rec.error_count = rec.error_count.saturating_add(count);
        let total = rec.error_count;
        let old = rec.status;
        let new = match old {
            LaneStatus::Disabled | LaneStatus::Failed => old,
            _ if total >= error_threshold => LaneStatus::Failed,
            LaneStatus::Good if total >= marginal_threshold => {
                LaneStatus::Marginal
            }
            _ => old,
        };
        if new != old {
            self.set_status(physical, new, now);
            Some(new)
        } else {
            None
        }
    }

    pub fn handle(&mut self, cmd: LaneCommand, ctx: &mut Ctx<'_>) {
        let now = ctx.now;
        match cmd {
            LaneCommand::Configure { width } => {
                if width < self.width() {
                    // A negotiated width is always a power of two, and the
                    // table is full-width here, so a block always exists
                    // unless lanes already failed.
                    if self.degrade_width(width, now).is_err() {
                        let kind = ErrorKind::WidthFloorReached;
                        reply(ctx, LaneOutcome::Failed(kind));
                        return;
                    }
                }
                ringbuf_entry!(
                    self.trace,
                    Trace::Configured {
                        width: self.width()
                    }
                );
                reply(
                    ctx,
                    LaneOutcome::Ready {
                        width: self.width(),
                    },
                );
            }
            LaneCommand::DetectReversal(pattern) => {
                let outcome = match self.detect_reversal(pattern) {
                    Ok(_) => LaneOutcome::Ready {
                        width: self.width(),
                    },
                    Err(_) => LaneOutcome::PatternMismatch,
                };
                reply(ctx, outcome);
            }
            LaneCommand::Evaluate(signals) => {
                self.evaluate(&signals, now);
                let outcome = match self.rebuild_around_failures(now) {
                    Ok(width) => LaneOutcome::Ready { width },
                    Err(_) => {
                        LaneOutcome::Failed(ErrorKind::WidthFloorReached)
                    }
                };
                reply(ctx, outcome);
            }
            LaneCommand::Check(signals) => {
                let outcome = if self.evaluate(&signals, now) {
                    LaneOutcome::NeedsRepair
                } else {
                    LaneOutcome::Ready {
                        width: self.width(),
                    }
                };
                reply(ctx, outcome);
            }
            LaneCommand::Rebuild => {
                let outcome = match self.rebuild_around_failures(now) {
                    Ok(width) => LaneOutcome::Ready { width },
                    Err(_) => {
                        LaneOutcome::Failed(ErrorKind::WidthFloorReached)
                    }
                };
                reply(ctx, outcome);
            }
            LaneCommand::Errors { lane, count } => {
                if self.record_errors(lane, count, now)
                    == Some(LaneStatus::Failed)
                {
                    if self.is_active(lane) {
                        ctx.raise_event(
                            ErrorEvent::new(
                                ErrorKind::LaneThresholdExceeded,
                                Component::Lanes,
                                Severity::Persistent,
                                now,
                            )
                            .on_lane(lane),
                        );
                    } else {
                        ringbuf_entry!(
                            self.trace,
                            Trace::InactiveFailure { lane }
                        );
                    }
                }
            }
            LaneCommand::Repair(lane) => {
                let result = match lane {
                    Some(lane) if self.status(lane) == LaneStatus::Failed => {
                        self.repair(lane, now).map(|()| 1)
                    }
                    // Already dealt with, or never failed.
                    Some(_) => Ok(0),
                    None => self.repair_all(now),
                };
                match result {
                    Ok(0) if lane.is_none() => {
                        // Nothing to repair; this rung cannot help.
                        ctx.post(Message::Recovery(RecoveryInput::Failed(
                            Rung::LaneRepair,
                        )));
                    }
                    Ok(_) => ctx.post(Message::Recovery(
                        RecoveryInput::Remediated(Rung::LaneRepair),
                    )),
                    Err(LaneError::NoSpareLane) => {
                        let mut event = ErrorEvent::new(
                            ErrorKind::NoSpareLane,
                            Component::Lanes,
                            Severity::Persistent,
                            now,
                        );
                        event.lane = lane;
                        ctx.raise_event(event);
                    }
                    Err(_) => ctx.post(Message::Recovery(
                        RecoveryInput::Failed(Rung::LaneRepair),
                    )),
                }
            }
            LaneCommand::Degrade => match self.degrade(now) {
                Ok(width) => {
                    ctx.post(Message::Training(TrainingInput::WidthChanged(
                        width,
                    )));
                    ctx.post(Message::Recovery(RecoveryInput::Narrowed(
                        width,
                    )));
                }
                Err(_) => ctx.raise(
                    ErrorKind::WidthFloorReached,
                    Component::Lanes,
                    Severity::Persistent,
                ),
            },
            LaneCommand::Reset => {
                self.rebuild(self.max_width, self.spare_lanes, now);
            }
        }
    }
}

fn reply(ctx: &mut Ctx<'_>, outcome: LaneOutcome) {
    ctx.post(Message::Training(TrainingInput::Lanes(outcome)));
}

/// Ones on the lower half of `width` lanes.
fn expected_pattern(width: u32) -> u64 {
    let half = width / 2;
    1u64.checked_shl(half).map_or(u64::MAX, |b| b - 1)
}

/// Reverses the low `width` bits of `pattern`.
fn mirror(pattern: u64, width: u32) -> u64 {
    match width {
        0 => 0,
        w => pattern.reverse_bits() >> (64 - w),
    }
}
