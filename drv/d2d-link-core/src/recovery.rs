// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error Recovery Sequencer.
//!
//! Takes in the error events every other component escalates, picks a
//! remediation rung for each, and delegates the remediation to the component
//! that owns it. Rungs are ordered by the configured [`Ladder`]; within one
//! error episode the sequencer only ever climbs it.
//!
//! An episode starts with the first error seen while idle and ends when a
//! remediation succeeds and the session settles. A rung that times out, or
//! whose owner reports it cannot help, gives way to the rung above it.
//!
//! Errors arriving while a rung is under way usually belong to the same
//! episode, and are folded into it: a burst of exhausted retries asks for one
//! speed degrade, not one rung per flit. Such an error only moves the ladder
//! when it calls for a higher rung, or when it comes from the component
//! carrying out the current rung, which means the remediation itself is
//! failing. Past `Reset` there is only `Unrecoverable`, which holds until the
//! session is rebuilt.

use drv_d2d_link_api::{
    Component, ErrorEvent, ErrorKind, Ladder, RecoveryConfig,
    RecoveryDirective, Rung, SidebandPacket, Severity, TrainingPhase,
};
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::lanes::LaneCommand;
use crate::mailbox::{Ctx, Message, TimerId};
use crate::reliability::ReliabilityCommand;
use crate::training::TrainingInput;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryInput {
    Error(ErrorEvent),
    /// The rung's owner finished it.
    Remediated(Rung),
    /// The lane manager narrowed the link.
    Narrowed(u8),
    /// The rung's owner could not carry it out.
    Failed(Rung),
    Timeout,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    Remediating(Rung),
    /// Remediated; back to `Idle` on the next tick.
    Done { applied: Option<RecoveryDirective> },
    Unrecoverable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Analysis { kind: ErrorKind, severity: Severity, rung: Rung },
    Rung(Rung),
    Done(Rung),
    Failed(Rung),
    Timeout(Rung),
    Unrecoverable,
    Settled,
    Ignored(ErrorKind),
    Folded(ErrorKind),
    StaleTimeout,
}

pub struct Recovery {
    config: RecoveryConfig,
    state: RecoveryState,
    phase: TrainingPhase,
    /// Lane of the error that put us on `LaneRepair`.
    lane: Option<u8>,
    /// The retry is for flits we received, not flits we sent.
    inbound: bool,
    /// Resets so far this episode.
    resets: u8,
    episodes: u32,
    trace: Ringbuf<Trace, 32>,
}

impl Recovery {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            state: RecoveryState::Idle,
            phase: TrainingPhase::Reset,
            lane: None,
            inbound: false,
            resets: 0,
            episodes: 0,
            trace: Ringbuf::new(Trace::None),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// The rung being worked on, if any.
    pub fn rung(&self) -> Option<Rung> {
        match self.state {
            RecoveryState::Remediating(rung) => Some(rung),
            _ => None,
        }
    }

    pub fn ladder(&self) -> Ladder {
        self.config.ladder
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.state == RecoveryState::Unrecoverable
    }

    /// Error episodes started since the session was built.
    pub fn episodes(&self) -> u32 {
        self.episodes
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    /// What the physical layer should be doing on our behalf, if anything.
    pub fn directive(&self) -> Option<RecoveryDirective> {
        match self.state {
            RecoveryState::Remediating(Rung::Retry) => {
                Some(RecoveryDirective::Replay)
            }
            RecoveryState::Remediating(Rung::Reset)
                if self.phase == TrainingPhase::Reset =>
            {
                Some(RecoveryDirective::ResetPhy)
            }
            RecoveryState::Done { applied } => applied,
            _ => None,
        }
    }

    /// Closes a finished episode. Called once per tick.
    pub fn settle(&mut self) {
        if let RecoveryState::Done { .. } = self.state {
            ringbuf_entry!(self.trace, Trace::Settled);
            self.state = RecoveryState::Idle;
            self.resets = 0;
            self.lane = None;
        }
    }

    /// The rung an error calls for, ignoring what is already under way.
    pub fn classify(event: &ErrorEvent) -> Rung {
        if event.severity == Severity::Fatal {
            return Rung::Reset;
        }
        match event.kind {
            ErrorKind::CrcMismatch | ErrorKind::SequenceTimeout => Rung::Retry,
            ErrorKind::LaneThresholdExceeded => Rung::LaneRepair,
            ErrorKind::NoSpareLane => Rung::WidthDegrade,
            ErrorKind::RetryExhausted => Rung::SpeedDegrade,
            ErrorKind::PowerTransitionTimeout
                if event.severity == Severity::Transient =>
            {
                Rung::Retry
            }
            ErrorKind::Unrecoverable => Rung::Reset,
            ErrorKind::PowerTransitionTimeout
            | ErrorKind::WidthFloorReached
            | ErrorKind::SpeedFloorReached
            | ErrorKind::PhaseTimeout
            | ErrorKind::CapabilityMismatch
            | ErrorKind::SidebandTimeout => Rung::Retrain,
        }
    }

    pub fn handle(&mut self, input: RecoveryInput, ctx: &mut Ctx<'_>) {
        if self.is_unrecoverable() {
            if let RecoveryInput::Error(ev) = input {
                ringbuf_entry!(self.trace, Trace::Ignored(ev.kind));
            }
            return;
        }
        match input {
            RecoveryInput::Error(event) => self.on_error(event, ctx),
            RecoveryInput::Remediated(rung) => {
                if self.rung() == Some(rung) {
                    let applied = match rung {
                        Rung::Retry => Some(RecoveryDirective::Replay),
                        Rung::LaneRepair => {
                            Some(RecoveryDirective::ApplyLaneMap)
                        }
                        _ => None,
                    };
                    self.done(rung, applied, ctx);
                }
            }
            RecoveryInput::Narrowed(width) => {
                if let Some(rung) = self.rung() {
                    let applied = Some(RecoveryDirective::ApplyWidth(width));
                    self.done(rung, applied, ctx);
                }
            }
            RecoveryInput::Failed(rung) => {
                if self.rung() == Some(rung) {
                    ringbuf_entry!(self.trace, Trace::Failed(rung));
                    self.climb(rung, ctx);
                }
            }
            RecoveryInput::Timeout => {
                if ctx.is_armed(TimerId::Recovery) {
                    ringbuf_entry!(self.trace, Trace::StaleTimeout);
                    return;
                }
                if let Some(rung) = self.rung() {
                    ringbuf_entry!(self.trace, Trace::Timeout(rung));
                    self.climb(rung, ctx);
                }
            }
        }
    }

    /// The component that carries out `rung`.
    pub fn owner(rung: Rung) -> Component {
        match rung {
            Rung::Retry => Component::Reliability,
            Rung::LaneRepair | Rung::WidthDegrade => Component::Lanes,
            Rung::SpeedDegrade | Rung::Retrain | Rung::Reset => {
                Component::Training
            }
        }
    }

    pub fn on_phase(&mut self, phase: TrainingPhase, ctx: &mut Ctx<'_>) {
        self.phase = phase;
        if phase != TrainingPhase::Active {
            return;
        }
        if let Some(
            rung @ (Rung::SpeedDegrade | Rung::Retrain | Rung::Reset),
        ) = self.rung()
        {
            self.done(rung, None, ctx);
        }
    }

    fn on_error(&mut self, event: ErrorEvent, ctx: &mut Ctx<'_>) {
        // A remediated episode is closed before the next one opens.
        self.settle();

        let wanted = Self::classify(&event);
        let ladder = self.config.ladder;
        ringbuf_entry!(
            self.trace,
            Trace::Analysis {
                kind: event.kind,
                severity: event.severity,
                rung: wanted,
            }
        );
        let rung = match self.state {
            RecoveryState::Remediating(current) => {
                if ladder.position(wanted) > ladder.position(current) {
                    wanted
                } else if event.source == Self::owner(current) {
                    ringbuf_entry!(self.trace, Trace::Failed(current));
                    self.climb(current, ctx);
                    return;
                } else {
                    ringbuf_entry!(self.trace, Trace::Folded(event.kind));
                    return;
                }
            }
            _ => {
                self.episodes = self.episodes.saturating_add(1);
                wanted
            }
        };
        match rung {
            Rung::LaneRepair => self.lane = event.lane,
            Rung::Retry => {
                self.inbound = event.kind == ErrorKind::CrcMismatch
                    && event.source == Component::Reliability;
            }
            _ => (),
        }
        self.remediate(rung, ctx);
    }

    fn climb(&mut self, from: Rung, ctx: &mut Ctx<'_>) {
        // Nothing sits above `Reset` but another reset, if the episode has
        // one left.
        let next = self.config.ladder.above(from).unwrap_or(Rung::Reset);
        self.remediate(next, ctx);
    }

    fn remediate(&mut self, rung: Rung, ctx: &mut Ctx<'_>) {
        let training_failed = self.phase == TrainingPhase::TrainError;
        let rung = match rung {
            Rung::SpeedDegrade | Rung::Retrain if training_failed => {
                Rung::Reset
            }
            rung => rung,
        };
        if rung == Rung::Reset {
            if self.resets >= self.config.max_resets {
                self.give_up(ctx);
                return;
            }
            self.resets += 1;
        }

        ringbuf_entry!(self.trace, Trace::Rung(rung));
        self.state = RecoveryState::Remediating(rung);
        ctx.cancel(TimerId::Recovery);
        ctx.arm(TimerId::Recovery, self.config.timeout(rung));

        let link_up = self.phase == TrainingPhase::Active;
        match rung {
            Rung::Retry => {
                let command = if self.inbound {
                    ReliabilityCommand::Resync
                } else {
                    ReliabilityCommand::Replay
                };
                ctx.post(Message::Reliability(command))
            }
            Rung::LaneRepair => {
                ctx.post(Message::Lanes(LaneCommand::Repair(self.lane)))
            }
            Rung::SpeedDegrade => {
                if link_up {
                    ctx.post(Message::Training(TrainingInput::DegradeSpeed));
                }
            }
            Rung::WidthDegrade => {
                ctx.post(Message::Lanes(LaneCommand::Degrade))
            }
            Rung::Retrain => {
                // Mid-training, training is already retrying on its own;
                // the rung waits for it to come up or time out.
                if link_up {
                    ctx.post(Message::Training(TrainingInput::Retrain {
                        remote: false,
                    }));
                }
            }
            Rung::Reset => {
                ctx.post(Message::Training(TrainingInput::ColdReset {
                    remote: false,
                }));
            }
        }
    }

    fn done(
        &mut self,
        rung: Rung,
        applied: Option<RecoveryDirective>,
        ctx: &mut Ctx<'_>,
    ) {
        ringbuf_entry!(self.trace, Trace::Done(rung));
        ctx.cancel(TimerId::Recovery);
        self.state = RecoveryState::Done { applied };
    }

    fn give_up(&mut self, ctx: &mut Ctx<'_>) {
        ringbuf_entry!(self.trace, Trace::Unrecoverable);
        ctx.cancel(TimerId::Recovery);
        self.state = RecoveryState::Unrecoverable;
        ctx.post(Message::Reliability(ReliabilityCommand::Flush));
        ctx.post(Message::SidebandOut(SidebandPacket::error_report(
            0,
            ErrorKind::Unrecoverable,
        )));
        ctx.post(Message::Absorbed(ErrorEvent::new(
            ErrorKind::Unrecoverable,
            Component::Recovery,
            Severity::Fatal,
            ctx.now,
        )));
    }
}
