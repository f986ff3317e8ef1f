// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control Channel.
//!
//! Every packet a component sends the partner passes through here on its way
//! to the physical layer, where it is stamped with the next sequence number.
//! Packets that call for an `Ack` are also kept until one echoing their
//! sequence number comes back. A single timer covers all of them: when it
//! fires, each overdue packet goes out again unchanged, up to
//! `sideband_retries` times, after which it is dropped and reported as a
//! `SidebandTimeout`.
//!
//! An `Ack` we send keeps the sequence number of the packet it answers.

use drv_d2d_link_api::{
    Component, ErrorKind, PacketType, Severity, SidebandPacket,
};
use heapless::{Deque, Vec};
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::mailbox::{Ctx, TimerId};

/// Packets waiting for the physical layer.
pub const SIDEBAND_QUEUE: usize = 16;

/// Packets waiting for an acknowledgement.
pub const MAX_PENDING: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlInput {
    /// The partner acknowledged our packet with this sequence number.
    Acked(u8),
    Timeout,
}

#[derive(Clone, Debug)]
struct Pending {
    packet: SidebandPacket,
    deadline: u64,
    resends: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Tx { ty: PacketType, seq: u8 },
    Resend { ty: PacketType, seq: u8, resends: u8 },
    Acked { ty: PacketType, seq: u8 },
    UnknownAck(u8),
    GaveUp { ty: PacketType, seq: u8 },
    QueueFull(PacketType),
    Untracked(PacketType),
    StaleTimeout,
}

pub struct ControlChannel {
    timeout: u64,
    retries: u8,
    next_seq: u8,
    out: Deque<SidebandPacket, SIDEBAND_QUEUE>,
    pending: Vec<Pending, MAX_PENDING>,
    trace: Ringbuf<Trace, 32>,
}

impl ControlChannel {
    pub fn new(timeout: u64, retries: u8) -> Self {
        Self {
            timeout,
            retries,
            next_seq: 0,
            out: Deque::new(),
            pending: Vec::new(),
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Packets sent but not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, ty: PacketType) -> bool {
        self.pending.iter().any(|p| p.packet.ty == ty)
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    /// Next packet for the physical layer.
    pub fn take(&mut self) -> Option<SidebandPacket> {
        self.out.pop_front()
    }

    pub fn send(&mut self, mut packet: SidebandPacket, ctx: &mut Ctx<'_>) {
        if packet.ty != PacketType::Ack {
            packet.sequence = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
        }
        if packet.ty.needs_ack() {
            let pending = Pending {
                packet: packet.clone(),
                deadline: ctx.now.saturating_add(self.timeout),
                resends: 0,
            };
            if self.pending.push(pending).is_err() {
                // Sent once, but nobody will notice if it is lost.
                ringbuf_entry!(self.trace, Trace::Untracked(packet.ty));
            }
            self.rearm(ctx);
        }
        self.transmit(packet);
    }

    pub fn handle(&mut self, input: ControlInput, ctx: &mut Ctx<'_>) {
        match input {
            ControlInput::Acked(seq) => {
                let Some(i) =
                    self.pending.iter().position(|p| p.packet.sequence == seq)
                else {
                    ringbuf_entry!(self.trace, Trace::UnknownAck(seq));
                    return;
                };
                let done = self.pending.swap_remove(i);
                let ty = done.packet.ty;
                ringbuf_entry!(self.trace, Trace::Acked { ty, seq });
                self.rearm(ctx);
            }
            ControlInput::Timeout => {
                if ctx.is_armed(TimerId::Control) {
                    ringbuf_entry!(self.trace, Trace::StaleTimeout);
                    return;
                }
                self.expire(ctx);
            }
        }
    }

    fn expire(&mut self, ctx: &mut Ctx<'_>) {
        let now = ctx.now;
        let mut i = 0;
        while i < self.pending.len() {
            let p = &mut self.pending[i];
            if p.deadline > now {
                i += 1;
                continue;
            }
            if p.resends < self.retries {
                p.resends += 1;
                p.deadline = now.saturating_add(self.timeout);
                let packet = p.packet.clone();
                let resends = p.resends;
                ringbuf_entry!(
                    self.trace,
                    Trace::Resend {
                        ty: packet.ty,
                        seq: packet.sequence,
                        resends,
                    }
                );
                self.transmit(packet);
                i += 1;
            } else {
                let lost = self.pending.swap_remove(i);
                ringbuf_entry!(
                    self.trace,
                    Trace::GaveUp {
                        ty: lost.packet.ty,
                        seq: lost.packet.sequence,
                    }
                );
                ctx.raise(
                    ErrorKind::SidebandTimeout,
                    Component::Control,
                    Severity::Persistent,
                );
            }
        }
        self.rearm(ctx);
    }

    /// Points the timer at the earliest outstanding deadline.
    fn rearm(&mut self, ctx: &mut Ctx<'_>) {
        ctx.cancel(TimerId::Control);
        if let Some(next) = self.pending.iter().map(|p| p.deadline).min() {
            ctx.arm(TimerId::Control, next.saturating_sub(ctx.now));
        }
    }

    fn transmit(&mut self, packet: SidebandPacket) {
        let (ty, seq) = (packet.ty, packet.sequence);
        if self.out.push_back(packet).is_err() {
            // The resend timer covers tracked packets.
            ringbuf_entry!(self.trace, Trace::QueueFull(ty));
        } else {
            ringbuf_entry!(self.trace, Trace::Tx { ty, seq });
        }
    }
}
