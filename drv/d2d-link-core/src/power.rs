// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power State Controller.
//!
//! The only edges are
//!
//! ```text
//! Active -> StandbyEntering -> Standby -> StandbyExiting -> Active
//! Active -> SleepEntering   -> Sleep   -> SleepExiting   -> Active
//! ```
//!
//! plus the abort edge from either `*Entering` state back to `Active` when a
//! wake arrives before the physical layer confirms entry. Low-power states
//! can only be requested while the link is `Active`, and training leaving
//! `Active` forces the controller back to `Active`.

use drv_d2d_link_api::{
    Component, ErrorKind, PowerDirective, PowerState, PowerTimeouts,
    Severity, TrainingPhase,
};
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::mailbox::{Ctx, Message, TimerId};
use crate::reliability::ReliabilityCommand;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerInput {
    Wake,
    Timeout,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rejected {
    /// Training has not reached `Active`.
    LinkNotActive,
    IllegalTransition,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Request { from: PowerState, to: PowerState },
    Rejected { from: PowerState, to: PowerState },
    Confirmed(PowerState),
    Aborted(PowerState),
    Wake(PowerState),
    EntryTimeout(PowerState),
    ExitTimeout(PowerState),
    Forced(PowerState),
    StaleTimeout,
}

pub struct Power {
    timeouts: PowerTimeouts,
    state: PowerState,
    link_active: bool,
    trace: Ringbuf<Trace, 32>,
}

impl Power {
    pub fn new(timeouts: PowerTimeouts) -> Self {
        Self {
            timeouts,
            state: PowerState::Active,
            link_active: false,
            trace: Ringbuf::new(Trace::None),
        }
    }

    pub fn current(&self) -> PowerState {
        self.state
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    /// What the physical layer should be doing for us, if anything.
    pub fn directive(&self) -> Option<PowerDirective> {
        match self.state {
            PowerState::StandbyEntering => Some(PowerDirective::EnterStandby),
            PowerState::StandbyExiting => Some(PowerDirective::ExitStandby),
            PowerState::SleepEntering => Some(PowerDirective::EnterSleep),
            PowerState::SleepExiting => Some(PowerDirective::ExitSleep),
            PowerState::Active | PowerState::Standby | PowerState::Sleep => {
                None
            }
        }
    }

    pub fn request(
        &mut self,
        target: PowerState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), Rejected> {
        let from = self.state;
        let next = match (from, target) {
            (a, b) if a == b => return Ok(()),
            (PowerState::Active, PowerState::Standby) => {
                PowerState::StandbyEntering
            }
            (PowerState::Active, PowerState::Sleep) => {
                PowerState::SleepEntering
            }
            (PowerState::Standby, PowerState::Active) => {
                PowerState::StandbyExiting
            }
            (PowerState::Sleep, PowerState::Active) => {
                PowerState::SleepExiting
            }
            _ => {
                ringbuf_entry!(
                    self.trace,
                    Trace::Rejected { from, to: target }
                );
                return Err(Rejected::IllegalTransition);
            }
        };
        if from == PowerState::Active && !self.link_active {
            ringbuf_entry!(self.trace, Trace::Rejected { from, to: target });
            return Err(Rejected::LinkNotActive);
        }
        ringbuf_entry!(self.trace, Trace::Request { from, to: target });
        self.enter(next, ctx);
        Ok(())
    }

    /// A wake signal, or outbound data that needs the link.
    pub fn wake(&mut self, ctx: &mut Ctx<'_>) {
        ringbuf_entry!(self.trace, Trace::Wake(self.state));
        match self.state {
            PowerState::StandbyEntering | PowerState::SleepEntering => {
                ringbuf_entry!(self.trace, Trace::Aborted(self.state));
                self.enter(PowerState::Active, ctx);
            }
            PowerState::Standby => self.enter(PowerState::StandbyExiting, ctx),
            PowerState::Sleep => self.enter(PowerState::SleepExiting, ctx),
            PowerState::Active
            | PowerState::StandbyExiting
            | PowerState::SleepExiting => (),
        }
    }

    /// The physical layer finished the transition we asked for.
    pub fn confirm(&mut self, ctx: &mut Ctx<'_>) {
        let next = match self.state {
            PowerState::StandbyEntering => PowerState::Standby,
            PowerState::SleepEntering => PowerState::Sleep,
            PowerState::StandbyExiting | PowerState::SleepExiting => {
                PowerState::Active
            }
            PowerState::Active | PowerState::Standby | PowerState::Sleep => {
                return;
            }
        };
        ringbuf_entry!(self.trace, Trace::Confirmed(next));
        self.enter(next, ctx);
    }

    pub fn handle(&mut self, input: PowerInput, ctx: &mut Ctx<'_>) {
        match input {
            PowerInput::Wake => self.wake(ctx),
            PowerInput::Timeout => {
                if ctx.is_armed(TimerId::Power) {
                    ringbuf_entry!(self.trace, Trace::StaleTimeout);
                    return;
                }
                match self.state {
                    PowerState::StandbyEntering | PowerState::SleepEntering => {
                        ringbuf_entry!(
                            self.trace,
                            Trace::EntryTimeout(self.state)
                        );
                        ctx.absorb(
                            ErrorKind::PowerTransitionTimeout,
                            Component::Power,
                        );
                        self.enter(PowerState::Active, ctx);
                    }
                    PowerState::StandbyExiting | PowerState::SleepExiting => {
                        ringbuf_entry!(
                            self.trace,
                            Trace::ExitTimeout(self.state)
                        );
                        ctx.raise(
                            ErrorKind::PowerTransitionTimeout,
                            Component::Power,
                            Severity::Persistent,
                        );
                    }
                    PowerState::Active
                    | PowerState::Standby
                    | PowerState::Sleep => {
                        ringbuf_entry!(self.trace, Trace::StaleTimeout);
                    }
                }
            }
        }
    }

    pub fn on_phase(&mut self, phase: TrainingPhase, ctx: &mut Ctx<'_>) {
        self.link_active = phase == TrainingPhase::Active;
        if !self.link_active && self.state != PowerState::Active {
            ringbuf_entry!(self.trace, Trace::Forced(self.state));
            self.enter(PowerState::Active, ctx);
        }
    }

    fn enter(&mut self, next: PowerState, ctx: &mut Ctx<'_>) {
        let was_active = self.state == PowerState::Active;
        self.state = next;
        ctx.cancel(TimerId::Power);
        let budget = match next {
            PowerState::StandbyEntering => Some(self.timeouts.standby_entry),
            PowerState::StandbyExiting => Some(self.timeouts.standby_exit),
            PowerState::SleepEntering => Some(self.timeouts.sleep_entry),
            PowerState::SleepExiting => Some(self.timeouts.sleep_exit),
            PowerState::Active | PowerState::Standby | PowerState::Sleep => {
                None
            }
        };
        if let Some(budget) = budget {
            ctx.arm(TimerId::Power, budget);
        }
        let active = next == PowerState::Active;
        if was_active != active {
            ctx.post(Message::Reliability(ReliabilityCommand::Quiesce(
                !active,
            )));
        }
    }
}
