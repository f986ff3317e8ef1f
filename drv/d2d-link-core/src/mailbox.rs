// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The message fabric between state machines.
//!
//! Components never call into each other. Whatever one component needs
//! another to do is posted as a `Message` to a single FIFO mailbox, which the
//! session drains to quiescence after each external input. Because there is
//! one FIFO, messages from any one source to any one sink are delivered in
//! the order they were posted.

use drv_d2d_link_api::{
    Component, ErrorEvent, ErrorKind, Severity, SidebandPacket, TrainingPhase,
    MAX_RETRY_DEPTH,
};
use enum_map::Enum;
use heapless::Deque;
use multitimer::Multitimer;

use crate::control::ControlInput;
use crate::lanes::LaneCommand;
use crate::negotiate::NegotiatorInput;
use crate::power::PowerInput;
use crate::recovery::RecoveryInput;
use crate::reliability::ReliabilityCommand;
use crate::training::TrainingInput;

/// Deepest the mailbox may get between drains. The worst single input is a
/// tick on which every flit in a full retry window times out: one absorbed
/// timeout each, plus the exhaustion report and whatever follows it.
pub const MAILBOX_DEPTH: usize = 2 * MAX_RETRY_DEPTH;

/// The timers multiplexed over the session clock, one per component that
/// needs one. The reliability engine keeps per-flit deadlines of its own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum TimerId {
    Training,
    Negotiator,
    Power,
    Recovery,
    Control,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Training(TrainingInput),
    Negotiator(NegotiatorInput),
    Lanes(LaneCommand),
    Reliability(ReliabilityCommand),
    Power(PowerInput),
    Recovery(RecoveryInput),
    Control(ControlInput),
    /// The training phase changed; delivered to every component that gates
    /// on it.
    PhaseChanged(TrainingPhase),
    /// A packet for the link partner.
    SidebandOut(SidebandPacket),
    /// An error that its owner handled locally. Only counted.
    Absorbed(ErrorEvent),
}

pub struct Mailbox {
    queue: Deque<Message, MAILBOX_DEPTH>,
    lost: u32,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            queue: Deque::new(),
            lost: 0,
        }
    }

    pub fn post(&mut self, msg: Message) {
        if self.queue.push_back(msg).is_err() {
            self.lost = self.lost.saturating_add(1);
        }
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Messages dropped because the mailbox was full.
    pub fn lost(&self) -> u32 {
        self.lost
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// What a component is handed along with each message.
pub struct Ctx<'a> {
    pub now: u64,
    pub timers: &'a mut Multitimer<TimerId>,
    pub mailbox: &'a mut Mailbox,
}

impl Ctx<'_> {
    pub fn post(&mut self, msg: Message) {
        self.mailbox.post(msg);
    }

    /// Arms `which` to fire `after` ticks from now.
    pub fn arm(&mut self, which: TimerId, after: u64) {
        self.timers.set_timer(which, self.now.saturating_add(after));
    }

    pub fn cancel(&mut self, which: TimerId) {
        self.timers.clear_timer(which);
    }

    /// A timeout message is stale if its timer has been re-armed since it
    /// fired.
    pub fn is_armed(&self, which: TimerId) -> bool {
        self.timers.get_timer(which).is_some()
    }

    /// Hands an error to Error Recovery.
    pub fn raise(
        &mut self,
        kind: ErrorKind,
        source: Component,
        severity: Severity,
    ) {
        self.raise_event(ErrorEvent::new(kind, source, severity, self.now));
    }

    pub fn raise_event(&mut self, event: ErrorEvent) {
        self.post(Message::Recovery(RecoveryInput::Error(event)));
    }

    /// Records an error that was dealt with locally.
    pub fn absorb(&mut self, kind: ErrorKind, source: Component) {
        let event =
            ErrorEvent::new(kind, source, Severity::Transient, self.now);
        self.post(Message::Absorbed(event));
    }
}
