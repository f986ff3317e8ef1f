// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One link instance.
//!
//! `LinkSession` owns every state machine, the timers and the mailbox, and
//! is the only thing the outside world talks to. Every input, whether from
//! the physical layer, the partner, the flit producer or the clock, posts
//! its messages and then drains the mailbox until nothing is left, so that
//! every accessor observes a stable point. After draining, the coordinator
//! picks the directive the physical layer should act on.

use counters::{count, Count};
use drv_d2d_link_api::{
    AckNak, CapabilitySet, Component, ConfigError, ErrorCounts, ErrorEvent,
    ErrorKind, Flit, FlitEnvelope, LinkConfig, PacketType, PhyResponse,
    PowerState, Seq, Severity, SidebandError, SidebandPacket, TrainingPhase,
};
use multitimer::Multitimer;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::control::{ControlChannel, ControlInput};
use crate::coordinator::{Coordinator, Grant, Requests};
use crate::lanes::{LaneCommand, LaneTable};
use crate::mailbox::{Ctx, Mailbox, Message, TimerId};
use crate::negotiate::{Negotiator, NegotiatorInput};
use crate::power::{Power, PowerInput, Rejected};
use crate::recovery::{Recovery, RecoveryInput, RecoveryState};
use crate::reliability::{ReceiveError, Reliability, WindowFull};
use crate::training::{Training, TrainingInput};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendError {
    /// Try again once something is acknowledged.
    WindowFull,
    /// The flit's protocol was not agreed with the partner.
    ProtocolNotNegotiated,
    Unrecoverable,
}

impl From<WindowFull> for SendError {
    fn from(_: WindowFull) -> Self {
        SendError::WindowFull
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Start,
    ColdReset,
    Phase(TrainingPhase),
    Rx(PacketType),
    BadErrorReport,
    IgnoredWhileUnrecoverable(PacketType),
    Grant(Option<Grant>),
}

pub struct LinkSession {
    config: LinkConfig,
    now: u64,
    timers: Multitimer<TimerId>,
    mailbox: Mailbox,

    training: Training,
    negotiator: Negotiator,
    lanes: LaneTable,
    reliability: Reliability,
    power: Power,
    recovery: Recovery,
    coordinator: Coordinator,
    control: ControlChannel,

    counters: ErrorCounts,
    trace: Ringbuf<Trace, 64>,
}

impl LinkSession {
    pub fn new(config: LinkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: LinkConfig) -> Self {
        Self {
            config,
            now: 0,
            timers: Multitimer::new(),
            mailbox: Mailbox::new(),
            training: Training::new(&config),
            negotiator: Negotiator::new(
                config.local,
                config.sideband_timeout,
                config.sideband_retries,
            ),
            lanes: LaneTable::new(&config),
            reliability: Reliability::new(&config),
            power: Power::new(config.power),
            recovery: Recovery::new(config.recovery),
            coordinator: Coordinator::default(),
            control: ControlChannel::new(
                config.sideband_timeout,
                config.sideband_retries,
            ),
            counters: ErrorKind::NEW_COUNTERS,
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Rebuilds every component from the stored configuration, as if the
    /// session had just been created. Training stays idle until `start`.
    pub fn cold_reset(&mut self) {
        let now = self.now;
        *self = Self::build(self.config);
        self.now = now;
        ringbuf_entry!(self.trace, Trace::ColdReset);
    }

    /// Begins bring-up from `Reset`.
    pub fn start(&mut self, now: u64) -> Option<Grant> {
        self.advance_clock(now);
        ringbuf_entry!(self.trace, Trace::Start);
        self.mailbox.post(Message::Training(TrainingInput::Start));
        self.run()
    }

    /// Advances the clock to `now` and fires whatever timed out.
    pub fn tick(&mut self, now: u64) -> Option<Grant> {
        self.advance_clock(now);
        self.recovery.settle();
        self.timers.poll(self.now);
        for which in self.timers.iter_fired() {
            let msg = match which {
                TimerId::Training => Message::Training(TrainingInput::Timeout),
                TimerId::Negotiator => {
                    Message::Negotiator(NegotiatorInput::Timeout)
                }
                TimerId::Power => Message::Power(PowerInput::Timeout),
                TimerId::Recovery => Message::Recovery(RecoveryInput::Timeout),
                TimerId::Control => Message::Control(ControlInput::Timeout),
            };
            self.mailbox.post(msg);
        }
        let mut ctx = Ctx {
            now: self.now,
            timers: &mut self.timers,
            mailbox: &mut self.mailbox,
        };
        self.reliability.poll(&mut ctx);
        self.run()
    }

    pub fn on_phy_response(&mut self, resp: PhyResponse) -> Option<Grant> {
        self.mailbox.post(Message::Training(TrainingInput::Phy(resp)));
        self.run()
    }

    /// The physical layer finished the power transition it was asked for.
    pub fn on_power_confirm(&mut self) -> Option<Grant> {
        let mut ctx = Ctx {
            now: self.now,
            timers: &mut self.timers,
            mailbox: &mut self.mailbox,
        };
        self.power.confirm(&mut ctx);
        self.run()
    }

    /// Takes in one control-channel packet from the partner.
    pub fn on_sideband(&mut self, bytes: &[u8]) -> Result<(), SidebandError> {
        let pkt = SidebandPacket::decode(bytes)?;
        ringbuf_entry!(self.trace, Trace::Rx(pkt.ty));
        if pkt.ty.needs_ack() {
            self.mailbox.post(Message::SidebandOut(SidebandPacket::bare(
                PacketType::Ack,
                pkt.sequence,
            )));
        }
        let unrecoverable = self.recovery.is_unrecoverable();
        let msg = match pkt.ty {
            PacketType::ParamRequest | PacketType::ParamResponse => {
                Some(Message::Negotiator(NegotiatorInput::Packet(pkt)))
            }
            PacketType::Ack => {
                Some(Message::Control(ControlInput::Acked(pkt.sequence)))
            }
            PacketType::TrainingStop => {
                Some(Message::Training(TrainingInput::Stop))
            }
            PacketType::ErrorReport => match pkt.as_error_report() {
                Some(kind) => {
                    let event = ErrorEvent::new(
                        kind,
                        Component::Remote,
                        Severity::Persistent,
                        self.now,
                    );
                    Some(Message::Recovery(RecoveryInput::Error(event)))
                }
                None => {
                    ringbuf_entry!(self.trace, Trace::BadErrorReport);
                    None
                }
            },
            PacketType::TrainingStart
            | PacketType::ResetRequest
            | PacketType::RetrainRequest
                if unrecoverable =>
            {
                ringbuf_entry!(
                    self.trace,
                    Trace::IgnoredWhileUnrecoverable(pkt.ty)
                );
                None
            }
            PacketType::TrainingStart => {
                Some(Message::Training(TrainingInput::PartnerStart))
            }
            PacketType::ResetRequest => {
                Some(Message::Training(TrainingInput::ColdReset {
                    remote: true,
                }))
            }
            PacketType::RetrainRequest => {
                Some(Message::Training(TrainingInput::Retrain { remote: true }))
            }
        };
        if let Some(msg) = msg {
            self.mailbox.post(msg);
        }
        self.run();
        Ok(())
    }

    /// Hands a flit to the reliability engine. Outbound data wakes the link
    /// from a low-power state.
    pub fn send(&mut self, flit: &Flit) -> Result<Seq, SendError> {
        if self.recovery.is_unrecoverable() {
            return Err(SendError::Unrecoverable);
        }
        if let Some(caps) = self.training.negotiated() {
            if !caps.protocols.contains(flit.meta.protocol.flag()) {
                return Err(SendError::ProtocolNotNegotiated);
            }
        }
        if self.power.current() != PowerState::Active {
            let mut ctx = Ctx {
                now: self.now,
                timers: &mut self.timers,
                mailbox: &mut self.mailbox,
            };
            self.power.wake(&mut ctx);
            self.run();
        }
        let seq = self.reliability.send(flit, self.now)?;
        Ok(seq)
    }

    /// Returns `false` if `seq` was not outstanding.
    pub fn on_ack(&mut self, seq: Seq) -> bool {
        let mut ctx = Ctx {
            now: self.now,
            timers: &mut self.timers,
            mailbox: &mut self.mailbox,
        };
        let known = self.reliability.on_ack(seq, &mut ctx);
        self.run();
        known
    }

    pub fn on_nak(&mut self, seq: Seq) {
        let mut ctx = Ctx {
            now: self.now,
            timers: &mut self.timers,
            mailbox: &mut self.mailbox,
        };
        self.reliability.on_nak(seq, &mut ctx);
        self.run();
    }

    /// Takes in one envelope from the partner; see [`Reliability::receive`].
    pub fn receive(
        &mut self,
        envelope: FlitEnvelope,
    ) -> Result<(), ReceiveError> {
        let mut ctx = Ctx {
            now: self.now,
            timers: &mut self.timers,
            mailbox: &mut self.mailbox,
        };
        let result = self.reliability.receive(envelope, &mut ctx);
        self.run();
        result
    }

    /// Next in-order flit for the consumer.
    pub fn recv(&mut self) -> Option<Flit> {
        self.reliability.recv()
    }

    pub fn take_flit(&mut self) -> Option<FlitEnvelope> {
        self.reliability.take_flit()
    }

    pub fn take_ack(&mut self) -> Option<AckNak> {
        self.reliability.take_ack()
    }

    pub fn take_sideband(&mut self) -> Option<SidebandPacket> {
        self.control.take()
    }

    pub fn request_power(
        &mut self,
        target: PowerState,
    ) -> Result<(), Rejected> {
        let mut ctx = Ctx {
            now: self.now,
            timers: &mut self.timers,
            mailbox: &mut self.mailbox,
        };
        let result = self.power.request(target, &mut ctx);
        self.run();
        result
    }

    pub fn wake(&mut self) -> Option<Grant> {
        self.mailbox.post(Message::Power(PowerInput::Wake));
        self.run()
    }

    /// Runtime error count for one physical lane, from the physical layer.
    pub fn report_lane_errors(&mut self, lane: u8, count: u32) {
        self.mailbox
            .post(Message::Lanes(LaneCommand::Errors { lane, count }));
        self.run();
    }

    /// Retrains from `Active`; ignored anywhere else.
    pub fn force_retrain(&mut self) -> Option<Grant> {
        self.mailbox
            .post(Message::Training(TrainingInput::Retrain { remote: false }));
        self.run()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn phase(&self) -> TrainingPhase {
        self.training.phase()
    }

    pub fn power_state(&self) -> PowerState {
        self.power.current()
    }

    pub fn negotiated(&self) -> Option<&CapabilitySet> {
        self.training.negotiated()
    }

    pub fn training(&self) -> &Training {
        &self.training
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn lanes(&self) -> &LaneTable {
        &self.lanes
    }

    pub fn reliability(&self) -> &Reliability {
        &self.reliability
    }

    pub fn power(&self) -> &Power {
        &self.power
    }

    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    /// The directive granted after the last input.
    pub fn directive(&self) -> Option<Grant> {
        self.coordinator.last()
    }

    pub fn counters(&self) -> &ErrorCounts {
        &self.counters
    }

    pub fn error_count(&self, kind: ErrorKind) -> u32 {
        self.counters.get(kind)
    }

    /// Internal messages dropped on a full mailbox; nonzero is a bug.
    pub fn lost_messages(&self) -> u32 {
        self.mailbox.lost()
    }

    /// Earliest time anything is waiting for.
    pub fn next_deadline(&self) -> Option<u64> {
        match (self.timers.next_deadline(), self.reliability.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 64> {
        &self.trace
    }

    fn advance_clock(&mut self, now: u64) {
        self.now = self.now.max(now);
    }

    /// Drains the mailbox, then re-arbitrates.
    fn run(&mut self) -> Option<Grant> {
        while let Some(msg) = self.mailbox.pop() {
            self.dispatch(msg);
        }
        let requests = Requests {
            recovery: self.recovery.directive(),
            training: self.training.request(),
            power: self.power.directive(),
        };
        let previous = self.coordinator.last();
        let grant = self.coordinator.update(&requests);
        if grant != previous {
            ringbuf_entry!(self.trace, Trace::Grant(grant));
        }
        grant
    }

    fn dispatch(&mut self, msg: Message) {
        if let Message::Recovery(RecoveryInput::Error(ev))
        | Message::Absorbed(ev) = &msg
        {
            count!(self.counters, ev.kind);
        }

        let mut ctx = Ctx {
            now: self.now,
            timers: &mut self.timers,
            mailbox: &mut self.mailbox,
        };
        match msg {
            Message::Training(input) => self.training.handle(input, &mut ctx),
            Message::Negotiator(input) => {
                self.negotiator.handle(input, &mut ctx)
            }
            Message::Lanes(cmd) => self.lanes.handle(cmd, &mut ctx),
            Message::Reliability(cmd) => {
                self.reliability.handle(cmd, &mut ctx)
            }
            Message::Power(input) => self.power.handle(input, &mut ctx),
            Message::Recovery(input) => self.recovery.handle(input, &mut ctx),
            Message::Control(input) => self.control.handle(input, &mut ctx),
            Message::SidebandOut(pkt) => self.control.send(pkt, &mut ctx),
            Message::PhaseChanged(phase) => {
                ringbuf_entry!(self.trace, Trace::Phase(phase));
                self.reliability.on_phase(phase, &mut ctx);
                self.power.on_phase(phase, &mut ctx);
                self.recovery.on_phase(phase, &mut ctx);
            }
            Message::Absorbed(_) => (),
        }
    }
}
