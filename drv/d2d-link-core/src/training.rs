// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link Training Sequencer.
//!
//! Walks the training phases from `Reset` to `Active`. In every phase but
//! `ParamExchange` the sequencer asserts a `PhyRequest` and waits for the
//! physical layer to answer; `ParamExchange` waits on the negotiator, and
//! the lane-repair and reversal steps wait on the lane manager.
//!
//! Each phase gets `phase_attempts` tries. A try fails when the physical
//! layer answers not-ready, when the phase-group timeout fires, or when the
//! reversal pattern matches neither orientation. When the tries run out the
//! sequencer enters `TrainError`, tells the partner to stop, and hands a
//! `PhaseTimeout` to Error Recovery. `TrainError` is left only by a cold
//! reset.
//!
//! From `Active`, a retrain (ours or the partner's) goes through
//! `PhyRetrain` and rejoins bring-up at the reversal check, so that lane
//! reversal and lane repair are redone before mainband training. Sideband
//! bring-up and parameter exchange are skipped.
//!
//! A `TrainingStart` from the partner starts us too if we have not started,
//! and restarts us if we sit in a terminal phase, since the partner has
//! evidently lost the link. Mid-training it is ignored.

use drv_d2d_link_api::{
    CalibrationCommand, CapabilitySet, Component, ErrorKind, LinkConfig,
    NegotiationError, PacketType, PhaseTimeouts, PhyRequest, PhyResponse,
    Severity, SidebandPacket, Speed, TrainingPhase,
};
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::lanes::{LaneCommand, LaneOutcome};
use crate::mailbox::{Ctx, Message, TimerId};
use crate::negotiate::NegotiatorInput;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrainingInput {
    /// Begin bring-up from `Reset`.
    Start,
    /// The partner began bring-up.
    PartnerStart,
    Phy(PhyResponse),
    Timeout,
    Negotiated(Result<CapabilitySet, NegotiationError>),
    Lanes(LaneOutcome),
    Retrain { remote: bool },
    /// The partner gave up on training.
    Stop,
    ColdReset { remote: bool },
    /// Lower the target speed by one step and retrain.
    DegradeSpeed,
    /// The lane manager narrowed the link outside of training.
    WidthChanged(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Awaiting {
    Nothing,
    Phy,
    Negotiator,
    Lanes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Enter { phase: TrainingPhase, attempt: u8 },
    NotReady(TrainingPhase),
    Timeout(TrainingPhase),
    Negotiated { speed: Speed, width: u8 },
    Lanes(LaneOutcome),
    SpeedDegrade { from: Speed, to: Speed },
    SpeedFloor(Speed),
    Retrain { remote: bool },
    ColdReset { remote: bool },
    PartnerStart(TrainingPhase),
    Failed { phase: TrainingPhase, kind: ErrorKind },
    Ignored(TrainingPhase),
    StaleTimeout,
}

pub struct Training {
    local: CapabilitySet,
    timeouts: PhaseTimeouts,
    max_attempts: u8,
    full_width: u8,

    started: bool,
    phase: TrainingPhase,
    /// Failed tries of the current phase.
    attempts: u8,
    awaiting: Awaiting,
    negotiated: Option<CapabilitySet>,
    target_speed: Speed,
    target_width: u8,
    retrains: u32,
    trace: Ringbuf<Trace, 64>,
}

impl Training {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            local: config.local,
            timeouts: config.phase_timeouts,
            max_attempts: config.phase_attempts,
            full_width: config.max_width,
            started: false,
            phase: TrainingPhase::Reset,
            attempts: 0,
            awaiting: Awaiting::Nothing,
            negotiated: None,
            target_speed: initial_speed(&config.local),
            target_width: config.max_width,
            retrains: 0,
            trace: Ringbuf::new(Trace::None),
        }
    }

    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn negotiated(&self) -> Option<&CapabilitySet> {
        self.negotiated.as_ref()
    }

    pub fn target_speed(&self) -> Speed {
        self.target_speed
    }

    pub fn target_width(&self) -> u8 {
        self.target_width
    }

    /// Retrains entered from `Active` since the last cold reset.
    pub fn retrains(&self) -> u32 {
        self.retrains
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 64> {
        &self.trace
    }

    /// The request this sequencer wants the physical layer to act on, if
    /// any. Nothing is asserted before start or once the link is up.
    pub fn request(&self) -> Option<PhyRequest> {
        if !self.started || self.phase == TrainingPhase::Active {
            return None;
        }
        Some(PhyRequest {
            target_speed: self.target_speed,
            target_width: self.target_width,
            calibration: CalibrationCommand::for_phase(self.phase),
        })
    }

    pub fn handle(&mut self, input: TrainingInput, ctx: &mut Ctx<'_>) {
        match input {
            TrainingInput::Start => self.restart(ctx),
            TrainingInput::PartnerStart => {
                if self.started && !self.phase.is_terminal() {
                    ringbuf_entry!(self.trace, Trace::Ignored(self.phase));
                    return;
                }
                ringbuf_entry!(self.trace, Trace::PartnerStart(self.phase));
                self.restart(ctx);
            }
            TrainingInput::Phy(resp) => {
                if !self.started || self.awaiting != Awaiting::Phy {
                    ringbuf_entry!(self.trace, Trace::Ignored(self.phase));
                } else if !resp.ready {
                    ringbuf_entry!(self.trace, Trace::NotReady(self.phase));
                    self.retry_or_fail(ctx);
                } else {
                    self.on_ready(resp, ctx);
                }
            }
            TrainingInput::Timeout => {
                if ctx.is_armed(TimerId::Training)
                    || !self.started
                    || self.phase.is_terminal()
                {
                    ringbuf_entry!(self.trace, Trace::StaleTimeout);
                    return;
                }
                ringbuf_entry!(self.trace, Trace::Timeout(self.phase));
                self.retry_or_fail(ctx);
            }
            TrainingInput::Negotiated(result) => {
                if self.awaiting != Awaiting::Negotiator {
                    ringbuf_entry!(self.trace, Trace::Ignored(self.phase));
                    return;
                }
                self.on_negotiated(result, ctx);
            }
            TrainingInput::Lanes(outcome) => {
                if self.awaiting != Awaiting::Lanes {
                    ringbuf_entry!(self.trace, Trace::Ignored(self.phase));
                    return;
                }
                ringbuf_entry!(self.trace, Trace::Lanes(outcome));
                match outcome {
                    LaneOutcome::Ready { width } => {
                        self.target_width = width;
                        self.advance(ctx);
                    }
                    LaneOutcome::NeedsRepair => {
                        self.enter(TrainingPhase::MbTrainRepair, ctx);
                    }
                    LaneOutcome::PatternMismatch => self.retry_or_fail(ctx),
                    LaneOutcome::Failed(kind) => {
                        self.fail(kind, Component::Lanes, ctx)
                    }
                }
            }
            TrainingInput::Retrain { remote } => {
                if self.phase != TrainingPhase::Active {
                    ringbuf_entry!(self.trace, Trace::Ignored(self.phase));
                    return;
                }
                ringbuf_entry!(self.trace, Trace::Retrain { remote });
                if !remote {
                    send(ctx, PacketType::RetrainRequest);
                }
                self.retrains = self.retrains.saturating_add(1);
                self.enter(TrainingPhase::PhyRetrain, ctx);
            }
            TrainingInput::Stop => {
                if self.started && !self.phase.is_terminal() {
                    self.fail(ErrorKind::PhaseTimeout, Component::Remote, ctx);
                } else {
                    ringbuf_entry!(self.trace, Trace::Ignored(self.phase));
                }
            }
            TrainingInput::ColdReset { remote } => {
                ringbuf_entry!(self.trace, Trace::ColdReset { remote });
                if !remote {
                    send(ctx, PacketType::ResetRequest);
                }
                self.restart(ctx);
            }
            TrainingInput::DegradeSpeed => {
                if self.phase != TrainingPhase::Active {
                    ringbuf_entry!(self.trace, Trace::Ignored(self.phase));
                    return;
                }
                match self.lower_speed() {
                    Some(to) => {
                        ringbuf_entry!(
                            self.trace,
                            Trace::SpeedDegrade {
                                from: self.target_speed,
                                to,
                            }
                        );
                        self.target_speed = to;
                        send(ctx, PacketType::RetrainRequest);
                        self.retrains = self.retrains.saturating_add(1);
                        self.enter(TrainingPhase::PhyRetrain, ctx);
                    }
                    None => {
                        ringbuf_entry!(
                            self.trace,
                            Trace::SpeedFloor(self.target_speed)
                        );
                        ctx.raise(
                            ErrorKind::SpeedFloorReached,
                            Component::Training,
                            Severity::Persistent,
                        );
                    }
                }
            }
            TrainingInput::WidthChanged(width) => self.target_width = width,
        }
    }

    fn restart(&mut self, ctx: &mut Ctx<'_>) {
        self.started = true;
        self.negotiated = None;
        self.target_speed = initial_speed(&self.local);
        self.target_width = self.full_width;
        self.retrains = 0;
        ctx.post(Message::Lanes(LaneCommand::Reset));
        ctx.post(Message::Negotiator(NegotiatorInput::Reset));
        self.enter(TrainingPhase::Reset, ctx);
    }

    fn on_ready(&mut self, resp: PhyResponse, ctx: &mut Ctx<'_>) {
        match self.phase {
            TrainingPhase::MbInitReversalMb => match resp.pattern {
                Some(pattern) => {
                    self.awaiting = Awaiting::Lanes;
                    ctx.post(Message::Lanes(LaneCommand::DetectReversal(
                        pattern,
                    )));
                }
                // No pattern captured; the lanes are taken as wired straight.
                None => self.advance(ctx),
            },
            TrainingPhase::MbInitRepairMb => {
                self.awaiting = Awaiting::Lanes;
                ctx.post(Message::Lanes(LaneCommand::Evaluate(
                    resp.per_lane_status,
                )));
            }
            TrainingPhase::MbTrainLinkSpeed => {
                if resp.achieved_speed < self.target_speed {
                    self.degrade_in_training(ctx);
                } else {
                    self.awaiting = Awaiting::Lanes;
                    ctx.post(Message::Lanes(LaneCommand::Check(
                        resp.per_lane_status,
                    )));
                }
            }
            _ => self.advance(ctx),
        }
    }

    fn on_negotiated(
        &mut self,
        result: Result<CapabilitySet, NegotiationError>,
        ctx: &mut Ctx<'_>,
    ) {
        match result {
            Ok(caps) => {
                let Some(speed) = caps.max_speed() else {
                    self.fail(
                        ErrorKind::CapabilityMismatch,
                        Component::Negotiator,
                        ctx,
                    );
                    return;
                };
                ringbuf_entry!(
                    self.trace,
                    Trace::Negotiated {
                        speed,
                        width: caps.max_width,
                    }
                );
                self.negotiated = Some(caps);
                self.target_speed = speed;
                self.awaiting = Awaiting::Lanes;
                ctx.post(Message::Lanes(LaneCommand::Configure {
                    width: caps.max_width,
                }));
            }
            Err(e) => {
                let kind = if e.is_mismatch() {
                    ErrorKind::CapabilityMismatch
                } else {
                    ErrorKind::SidebandTimeout
                };
                self.fail(kind, Component::Negotiator, ctx);
            }
        }
    }

    /// The link came up slower than asked; try again one speed lower.
    fn degrade_in_training(&mut self, ctx: &mut Ctx<'_>) {
        match self.lower_speed() {
            Some(to) => {
                ringbuf_entry!(
                    self.trace,
                    Trace::SpeedDegrade {
                        from: self.target_speed,
                        to,
                    }
                );
                self.target_speed = to;
                self.enter(TrainingPhase::MbTrainSpeedIdle, ctx);
            }
            None => {
                ringbuf_entry!(
                    self.trace,
                    Trace::SpeedFloor(self.target_speed)
                );
                self.fail(
                    ErrorKind::SpeedFloorReached,
                    Component::Training,
                    ctx,
                );
            }
        }
    }

    fn lower_speed(&self) -> Option<Speed> {
        self.negotiated
            .map_or(self.local.speeds, |caps| caps.speeds)
            .highest_below(self.target_speed)
    }

    fn advance(&mut self, ctx: &mut Ctx<'_>) {
        if let Some(next) = self.phase.next() {
            self.enter(next, ctx);
        }
    }

    fn retry_or_fail(&mut self, ctx: &mut Ctx<'_>) {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.max_attempts {
            self.fail(ErrorKind::PhaseTimeout, Component::Training, ctx);
        } else {
            self.begin(self.phase, ctx);
        }
    }

    fn fail(&mut self, kind: ErrorKind, source: Component, ctx: &mut Ctx<'_>) {
        ringbuf_entry!(
            self.trace,
            Trace::Failed {
                phase: self.phase,
                kind,
            }
        );
        if source != Component::Remote {
            send(ctx, PacketType::TrainingStop);
        }
        self.enter(TrainingPhase::TrainError, ctx);
        ctx.raise(kind, source, Severity::Persistent);
    }

    fn enter(&mut self, phase: TrainingPhase, ctx: &mut Ctx<'_>) {
        self.attempts = 0;
        self.begin(phase, ctx);
    }

    /// Starts a try of `phase`.
    fn begin(&mut self, phase: TrainingPhase, ctx: &mut Ctx<'_>) {
        self.phase = phase;
        ringbuf_entry!(
            self.trace,
            Trace::Enter {
                phase,
                attempt: self.attempts,
            }
        );
        ctx.cancel(TimerId::Training);
        if let Some(timeout) = self.timeouts.for_phase(phase) {
            ctx.arm(TimerId::Training, timeout);
        }
        ctx.post(Message::PhaseChanged(phase));

        self.awaiting = match phase {
            TrainingPhase::ParamExchange => {
                ctx.post(Message::Negotiator(NegotiatorInput::Exchange));
                Awaiting::Negotiator
            }
            TrainingPhase::MbTrainRepair => {
                ctx.post(Message::Lanes(LaneCommand::Rebuild));
                Awaiting::Lanes
            }
            TrainingPhase::Active | TrainingPhase::TrainError => {
                Awaiting::Nothing
            }
            _ => Awaiting::Phy,
        };
        if phase == TrainingPhase::SbInit {
            send(ctx, PacketType::TrainingStart);
        }
    }
}

/// Sideband bring-up runs at the slowest speed we support.
fn initial_speed(local: &CapabilitySet) -> Speed {
    Speed::ALL
        .iter()
        .copied()
        .find(|s| local.speeds.contains(s.flag()))
        .unwrap_or(Speed::Gt4)
}

fn send(ctx: &mut Ctx<'_>, ty: PacketType) {
    ctx.post(Message::SidebandOut(SidebandPacket::bare(ty, 0)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_d2d_link_api::{LaneSignal, Speeds};
    use multitimer::Multitimer;

    use crate::mailbox::Mailbox;
    use crate::recovery::RecoveryInput;

    struct Bench {
        timers: Multitimer<TimerId>,
        mailbox: Mailbox,
        now: u64,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                timers: Multitimer::new(),
                mailbox: Mailbox::new(),
                now: 0,
            }
        }

        fn run(&mut self, t: &mut Training, input: TrainingInput) {
            let mut ctx = Ctx {
                now: self.now,
                timers: &mut self.timers,
                mailbox: &mut self.mailbox,
            };
            t.handle(input, &mut ctx);
        }

        fn drain(&mut self) -> std::vec::Vec<Message> {
            core::iter::from_fn(|| self.mailbox.pop()).collect()
        }
    }

    fn ready() -> TrainingInput {
        TrainingInput::Phy(PhyResponse::ready(Speed::Gt32, 16))
    }

    fn sent(msgs: &[Message], ty: PacketType) -> bool {
        msgs.iter()
            .any(|m| matches!(m, Message::SidebandOut(p) if p.ty == ty))
    }

    #[test]
    fn start_enters_reset_and_arms_timeout() {
        let mut b = Bench::new();
        let mut t = Training::new(&LinkConfig::default());
        assert_eq!(t.request(), None);
        b.run(&mut t, TrainingInput::Start);
        assert_eq!(t.phase(), TrainingPhase::Reset);
        assert_eq!(b.timers.get_timer(TimerId::Training), Some(8_000));
        let req = t.request().unwrap();
        assert_eq!(req.calibration, CalibrationCommand::Hold);
        assert_eq!(req.target_speed, Speed::Gt4);
        assert!(b
            .drain()
            .contains(&Message::PhaseChanged(TrainingPhase::Reset)));

        b.run(&mut t, ready());
        assert_eq!(t.phase(), TrainingPhase::SbInit);
        assert!(sent(&b.drain(), PacketType::TrainingStart));
    }

    #[test]
    fn exhausted_attempts_end_in_train_error() {
        let mut b = Bench::new();
        let mut t = Training::new(&LinkConfig::default());
        b.run(&mut t, TrainingInput::Start);
        b.drain();
        let not_ready = PhyResponse::not_ready(Speed::Gt4, 16);
        for _ in 0..2 {
            b.run(&mut t, TrainingInput::Phy(not_ready.clone()));
            assert_eq!(t.phase(), TrainingPhase::Reset);
        }
        b.run(&mut t, TrainingInput::Phy(not_ready));
        assert_eq!(t.phase(), TrainingPhase::TrainError);
        assert_eq!(b.timers.get_timer(TimerId::Training), None);
        let msgs = b.drain();
        assert!(sent(&msgs, PacketType::TrainingStop));
        assert!(msgs.iter().any(|m| matches!(
            m,
            Message::Recovery(RecoveryInput::Error(ev))
                if ev.kind == ErrorKind::PhaseTimeout
        )));

        // Only a cold reset leaves TrainError.
        b.run(&mut t, ready());
        b.run(&mut t, TrainingInput::Retrain { remote: true });
        assert_eq!(t.phase(), TrainingPhase::TrainError);
        b.run(&mut t, TrainingInput::ColdReset { remote: true });
        assert_eq!(t.phase(), TrainingPhase::Reset);
    }

    #[test]
    fn timeout_counts_as_failed_try_unless_stale() {
        let mut b = Bench::new();
        let mut t = Training::new(&LinkConfig::default());
        b.run(&mut t, TrainingInput::Start);

        // Re-armed since: stale.
        b.run(&mut t, TrainingInput::Timeout);
        assert_eq!(t.attempts, 0);

        b.now = 8_000;
        b.timers.poll(b.now);
        b.run(&mut t, TrainingInput::Timeout);
        assert_eq!(t.attempts, 1);
        assert_eq!(t.phase(), TrainingPhase::Reset);
        assert_eq!(b.timers.get_timer(TimerId::Training), Some(16_000));
    }

    #[test]
    fn slow_link_speed_loops_back_one_speed_lower() {
        let mut b = Bench::new();
        let mut t = Training::new(&LinkConfig::default());
        b.run(&mut t, TrainingInput::Start);
        t.negotiated = Some(CapabilitySet {
            speeds: Speeds::GT8 | Speeds::GT16,
            ..LinkConfig::default().local
        });
        t.target_speed = Speed::Gt16;
        t.enter(TrainingPhase::MbTrainLinkSpeed, &mut ctx(&mut b));

        b.run(&mut t, TrainingInput::Phy(PhyResponse::ready(Speed::Gt8, 16)));
        assert_eq!(t.phase(), TrainingPhase::MbTrainSpeedIdle);
        assert_eq!(t.target_speed(), Speed::Gt8);

        // Nothing lower than 8 GT/s in common.
        t.enter(TrainingPhase::MbTrainLinkSpeed, &mut ctx(&mut b));
        b.run(&mut t, TrainingInput::Phy(PhyResponse::ready(Speed::Gt4, 16)));
        assert_eq!(t.phase(), TrainingPhase::TrainError);
    }

    #[test]
    fn failed_lanes_at_link_speed_detour_through_repair() {
        let mut b = Bench::new();
        let mut t = Training::new(&LinkConfig::default());
        b.run(&mut t, TrainingInput::Start);
        t.target_speed = Speed::Gt16;
        t.enter(TrainingPhase::MbTrainLinkSpeed, &mut ctx(&mut b));
        b.drain();

        let resp = PhyResponse::ready(Speed::Gt16, 16)
            .with_lane(3, LaneSignal::Fail);
        b.run(&mut t, TrainingInput::Phy(resp));
        assert!(matches!(
            &b.drain()[..],
            [Message::Lanes(LaneCommand::Check(_))]
        ));
        b.run(&mut t, TrainingInput::Lanes(LaneOutcome::NeedsRepair));
        assert_eq!(t.phase(), TrainingPhase::MbTrainRepair);
        assert!(b.drain().contains(&Message::Lanes(LaneCommand::Rebuild)));
        b.run(&mut t, TrainingInput::Lanes(LaneOutcome::Ready { width: 16 }));
        assert_eq!(t.phase(), TrainingPhase::MbTrainTxSelfCal);
    }

    #[test]
    fn local_retrain_tells_partner_and_skips_parameter_exchange() {
        let mut b = Bench::new();
        let mut t = Training::new(&LinkConfig::default());
        b.run(&mut t, TrainingInput::Start);
        t.enter(TrainingPhase::Active, &mut ctx(&mut b));
        assert_eq!(t.request(), None);
        b.drain();

        b.run(&mut t, TrainingInput::Retrain { remote: false });
        assert_eq!(t.phase(), TrainingPhase::PhyRetrain);
        assert!(sent(&b.drain(), PacketType::RetrainRequest));
        b.run(&mut t, ready());
        assert_eq!(t.phase(), TrainingPhase::MbInitReversalMb);
        assert_eq!(t.retrains(), 1);

        // Reversal and lane repair are redone on every retrain.
        b.run(&mut t, ready());
        assert_eq!(t.phase(), TrainingPhase::MbInitRepairMb);
        b.run(&mut t, ready());
        assert!(b.drain().iter().any(|m| matches!(
            m,
            Message::Lanes(LaneCommand::Evaluate(_))
        )));
        let width = LaneOutcome::Ready { width: 16 };
        b.run(&mut t, TrainingInput::Lanes(width));
        assert_eq!(t.phase(), TrainingPhase::MbTrainValVref);
    }

    #[test]
    fn partner_start_only_interrupts_a_settled_link() {
        let mut b = Bench::new();
        let mut t = Training::new(&LinkConfig::default());
        b.run(&mut t, TrainingInput::PartnerStart);
        assert!(t.is_started());
        assert_eq!(t.phase(), TrainingPhase::Reset);

        // Mid bring-up: already on it.
        b.run(&mut t, ready());
        assert_eq!(t.phase(), TrainingPhase::SbInit);
        b.run(&mut t, TrainingInput::PartnerStart);
        assert_eq!(t.phase(), TrainingPhase::SbInit);

        t.enter(TrainingPhase::Active, &mut ctx(&mut b));
        b.drain();
        b.run(&mut t, TrainingInput::PartnerStart);
        assert_eq!(t.phase(), TrainingPhase::Reset);
        // The partner asked; nothing to tell it.
        assert!(!sent(&b.drain(), PacketType::ResetRequest));
    }

    fn ctx(b: &mut Bench) -> Ctx<'_> {
        Ctx {
            now: b.now,
            timers: &mut b.timers,
            mailbox: &mut b.mailbox,
        }
    }
}
