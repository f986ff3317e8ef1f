// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability Negotiator.
//!
//! Exchanges capability sets with the link partner over the control channel.
//! Either side may ask first: a `ParamRequest` from the partner is always
//! answered with our set, and it also carries the partner's set, so it can
//! complete an exchange of our own.

use drv_d2d_link_api::{
    CapabilitySet, NegotiationError, PacketType, SidebandPacket,
};
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::mailbox::{Ctx, Message, TimerId};
use crate::training::TrainingInput;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NegotiatorInput {
    /// Start an exchange on behalf of training.
    Exchange,
    /// A parameter packet from the partner.
    Packet(SidebandPacket),
    Timeout,
    Reset,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Waiting { resends: u8 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Request { resends: u8 },
    Answered,
    EarlyRemote,
    Complete(Result<CapabilitySet, NegotiationError>),
    Malformed,
    Stale,
}

pub struct Negotiator {
    local: CapabilitySet,
    timeout: u64,
    retries: u8,
    state: State,
    /// The partner's set, if it asked before we did.
    remote: Option<CapabilitySet>,
    result: Option<Result<CapabilitySet, NegotiationError>>,
    trace: Ringbuf<Trace, 16>,
}

impl Negotiator {
    pub fn new(local: CapabilitySet, timeout: u64, retries: u8) -> Self {
        Self {
            local,
            timeout,
            retries,
            state: State::Idle,
            remote: None,
            result: None,
            trace: Ringbuf::new(Trace::None),
        }
    }

    pub fn local(&self) -> &CapabilitySet {
        &self.local
    }

    /// Result of the most recent exchange.
    pub fn result(&self) -> Option<Result<CapabilitySet, NegotiationError>> {
        self.result
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 16> {
        &self.trace
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, State::Waiting { .. })
    }

    pub fn handle(&mut self, input: NegotiatorInput, ctx: &mut Ctx<'_>) {
        match input {
            NegotiatorInput::Exchange => {
                if let Some(remote) = self.remote.take() {
                    ringbuf_entry!(self.trace, Trace::EarlyRemote);
                    self.complete(Ok(remote), ctx);
                } else {
                    self.state = State::Waiting { resends: 0 };
                    self.send_request(0, ctx);
                }
            }
            NegotiatorInput::Packet(pkt) => {
                let Some(remote) = pkt.as_capabilities() else {
                    ringbuf_entry!(self.trace, Trace::Malformed);
                    return;
                };
                if pkt.ty == PacketType::ParamRequest {
                    ctx.post(Message::SidebandOut(
                        SidebandPacket::capabilities(
                            PacketType::ParamResponse,
                            0,
                            &self.local,
                        ),
                    ));
                    ringbuf_entry!(self.trace, Trace::Answered);
                }
                if self.is_waiting() {
                    self.complete(Ok(remote), ctx);
                } else if pkt.ty == PacketType::ParamRequest {
                    self.remote = Some(remote);
                }
            }
            NegotiatorInput::Timeout => {
                let State::Waiting { resends } = self.state else {
                    ringbuf_entry!(self.trace, Trace::Stale);
                    return;
                };
                if ctx.is_armed(TimerId::Negotiator) {
                    ringbuf_entry!(self.trace, Trace::Stale);
                    return;
                }
                if resends < self.retries {
                    self.state = State::Waiting {
                        resends: resends + 1,
                    };
                    self.send_request(resends + 1, ctx);
                } else {
                    self.complete(Err(NegotiationError::Timeout), ctx);
                }
            }
            NegotiatorInput::Reset => {
                ctx.cancel(TimerId::Negotiator);
                self.state = State::Idle;
                self.remote = None;
                self.result = None;
            }
        }
    }

    fn send_request(&mut self, resends: u8, ctx: &mut Ctx<'_>) {
        ringbuf_entry!(self.trace, Trace::Request { resends });
        ctx.post(Message::SidebandOut(SidebandPacket::capabilities(
            PacketType::ParamRequest,
            0,
            &self.local,
        )));
        ctx.arm(TimerId::Negotiator, self.timeout);
    }

    fn complete(
        &mut self,
        remote: Result<CapabilitySet, NegotiationError>,
        ctx: &mut Ctx<'_>,
    ) {
        ctx.cancel(TimerId::Negotiator);
        self.state = State::Idle;
        let result = remote.and_then(|r| self.local.negotiate(&r));
        ringbuf_entry!(self.trace, Trace::Complete(result));
        self.result = Some(result);
        ctx.post(Message::Training(TrainingInput::Negotiated(result)));
    }
}
