// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reliability Engine.
//!
//! Selective-repeat ARQ over the flit channel. Every outbound flit is sealed
//! with the next sequence number and a CRC and parked in the retry window
//! until the partner acknowledges that exact sequence number. The window is
//! indexed by sequence number modulo its depth; `send` refuses a flit whose
//! slot is still occupied, so the window can never hold more than `depth`
//! entries.
//!
//! Flits only go out while the link is `Active` and not quiesced by power
//! management. Whatever was outstanding when the link went down is replayed
//! when it comes back up, each entry with a fresh retry budget. Any other
//! replay of a flit that has already been on the wire is a retransmission
//! and is charged against that flit's budget like one.
//!
//! The receiving half checks the CRC of every envelope, NAKs the bad ones,
//! and releases good ones to the consumer strictly in sequence order.

use drv_d2d_link_api::{
    AckNak, Component, ErrorKind, Flit, FlitEnvelope, LinkConfig, Rung, Seq,
    Severity, TrainingPhase, MAX_RETRY_DEPTH,
};
use heapless::Deque;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::mailbox::{Ctx, Message};
use crate::recovery::RecoveryInput;

/// Envelopes and acknowledgements waiting for the physical layer, and flits
/// waiting for the consumer, are each bounded by this.
pub const QUEUE_DEPTH: usize = MAX_RETRY_DEPTH;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReliabilityCommand {
    /// Retransmit everything outstanding; remediated once all of it has
    /// been acknowledged.
    Replay,
    /// Ask the partner to resend what we failed to receive; remediated on
    /// the next in-order delivery.
    Resync,
    /// Drop everything outstanding.
    Flush,
    /// Hold or release transmission for a low-power state.
    Quiesce(bool),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WindowFull;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReceiveError {
    /// Failed CRC check; a NAK was queued.
    Crc,
    /// Neither a new flit nor a recent duplicate.
    OutsideWindow,
    /// The consumer has not kept up; nothing was acknowledged.
    ReceiverFull,
}

#[derive(Clone, Debug)]
struct RetryEntry {
    envelope: FlitEnvelope,
    retries: u8,
    /// `None` while the entry is not on the wire.
    deadline: Option<u64>,
    /// Has gone out since it was sealed or since the last link-up.
    transmitted: bool,
    /// Out of retries and reported; only an ack, a link-up replay or a
    /// flush clears it.
    exhausted: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Resend {
    Sent,
    /// Ran out of retries just now.
    Exhausted,
    Skipped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Sent(Seq),
    Acked(Seq),
    DuplicateAck(Seq),
    Nak(Seq),
    Timeout(Seq),
    Retransmit { seq: Seq, retries: u8 },
    Exhausted(Seq),
    Replay { count: u8 },
    Replayed,
    Resync(Seq),
    Resynced(Seq),
    LinkUp,
    LinkDown,
    Quiesced(bool),
    Flushed,
    TxFull(Seq),
    BadCrc { seq: Seq, burst: u8 },
    CrcBurst,
    Delivered(Seq),
    Buffered(Seq),
    Duplicate(Seq),
    OutsideWindow(Seq),
    ReceiverFull(Seq),
}

pub struct Reliability {
    depth: usize,
    max_retries: u8,
    retry_timeout: u64,
    crc_burst_threshold: u8,

    up: bool,
    quiesced: bool,

    window: [Option<RetryEntry>; MAX_RETRY_DEPTH],
    next_seq: Seq,
    tx: Deque<FlitEnvelope, QUEUE_DEPTH>,
    acks: Deque<AckNak, QUEUE_DEPTH>,

    expected: Seq,
    reorder: [Option<FlitEnvelope>; MAX_RETRY_DEPTH],
    buffered: usize,
    ready: Deque<Flit, QUEUE_DEPTH>,
    crc_burst: u8,

    /// `next_seq` when a recovery replay was ordered; cleared once every
    /// flit older than it is acknowledged.
    replaying: Option<Seq>,
    resyncing: bool,

    retransmits: u32,
    delivered: u32,
    trace: Ringbuf<Trace, 64>,
}

impl Reliability {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            depth: usize::from(config.retry_window_depth),
            max_retries: config.max_retries,
            retry_timeout: config.retry_timeout,
            crc_burst_threshold: config.crc_burst_threshold,
            up: false,
            quiesced: false,
            window: core::array::from_fn(|_| None),
            next_seq: 0,
            tx: Deque::new(),
            acks: Deque::new(),
            expected: 0,
            reorder: core::array::from_fn(|_| None),
            buffered: 0,
            ready: Deque::new(),
            crc_burst: 0,
            replaying: None,
            resyncing: false,
            retransmits: 0,
            delivered: 0,
            trace: Ringbuf::new(Trace::None),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Unacknowledged flits in the retry window.
    pub fn outstanding(&self) -> usize {
        self.window.iter().filter(|e| e.is_some()).count()
    }

    /// Retry count of the outstanding flit `seq`.
    pub fn retries(&self, seq: Seq) -> Option<u8> {
        self.entry(seq).map(|e| e.retries)
    }

    pub fn retransmits(&self) -> u32 {
        self.retransmits
    }

    pub fn delivered(&self) -> u32 {
        self.delivered
    }

    pub fn is_transmitting(&self) -> bool {
        self.up && !self.quiesced
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 64> {
        &self.trace
    }

    fn slot(&self, seq: Seq) -> usize {
        usize::from(seq) % self.depth
    }

    fn entry(&self, seq: Seq) -> Option<&RetryEntry> {
        self.window[self.slot(seq)]
            .as_ref()
            .filter(|e| e.envelope.sequence == seq)
    }

    /// Sequence numbers that may be outstanding, oldest first.
    fn span(&self) -> impl Iterator<Item = Seq> {
        let base = self.next_seq.wrapping_sub(self.depth as u8);
        (0..self.depth as u8).map(move |i| base.wrapping_add(i))
    }

    /// Seals `flit` into the retry window and queues it for transmission.
    pub fn send(&mut self, flit: &Flit, now: u64) -> Result<Seq, WindowFull> {
        let seq = self.next_seq;
        let slot = self.slot(seq);
        if self.window[slot].is_some() {
            return Err(WindowFull);
        }
        let envelope = FlitEnvelope::seal(seq, flit);
        let on_wire = self.is_transmitting();
        if on_wire {
            self.transmit(envelope.clone());
        }
        self.window[slot] = Some(RetryEntry {
            envelope,
            retries: 0,
            deadline: on_wire.then(|| now.saturating_add(self.retry_timeout)),
            transmitted: on_wire,
            exhausted: false,
        });
        self.next_seq = seq.wrapping_add(1);
        ringbuf_entry!(self.trace, Trace::Sent(seq));
        Ok(seq)
    }

    /// Removes `seq` from the window. Returns `false` for an ack of
    /// something not outstanding, which is otherwise ignored.
    pub fn on_ack(&mut self, seq: Seq, ctx: &mut Ctx<'_>) -> bool {
        if self.entry(seq).is_none() {
            ringbuf_entry!(self.trace, Trace::DuplicateAck(seq));
            return false;
        }
        let slot = self.slot(seq);
        self.window[slot] = None;
        ringbuf_entry!(self.trace, Trace::Acked(seq));
        self.check_replayed(ctx);
        true
    }

    pub fn on_nak(&mut self, seq: Seq, ctx: &mut Ctx<'_>) {
        if self.entry(seq).is_none() {
            return;
        }
        ringbuf_entry!(self.trace, Trace::Nak(seq));
        if self.retransmit(seq, ctx.now) == Resend::Exhausted {
            self.report_exhausted(ctx);
        }
    }

    /// Retransmits `seq` as if its acknowledgement timed out.
    pub fn on_timeout(&mut self, seq: Seq, ctx: &mut Ctx<'_>) {
        if self.expire(seq, ctx) {
            self.report_exhausted(ctx);
        }
    }

    /// Fires every expired retransmission deadline. However many entries
    /// run out of retries at once, that is one error for recovery.
    pub fn poll(&mut self, ctx: &mut Ctx<'_>) {
        let now = ctx.now;
        let expired = self
            .span()
            .filter(|&seq| {
                self.entry(seq)
                    .and_then(|e| e.deadline)
                    .is_some_and(|d| d <= now)
            })
            .collect::<heapless::Vec<Seq, MAX_RETRY_DEPTH>>();
        let mut exhausted = false;
        for seq in expired {
            exhausted |= self.expire(seq, ctx);
        }
        if exhausted {
            self.report_exhausted(ctx);
        }
    }

    /// Returns whether `seq` just ran out of retries.
    fn expire(&mut self, seq: Seq, ctx: &mut Ctx<'_>) -> bool {
        if self.entry(seq).is_none() {
            return false;
        }
        ringbuf_entry!(self.trace, Trace::Timeout(seq));
        ctx.absorb(ErrorKind::SequenceTimeout, Component::Reliability);
        self.retransmit(seq, ctx.now) == Resend::Exhausted
    }

    fn report_exhausted(&mut self, ctx: &mut Ctx<'_>) {
        ctx.raise(
            ErrorKind::RetryExhausted,
            Component::Reliability,
            Severity::Persistent,
        );
    }

    /// The next deadline the caller should tick us at, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.window
            .iter()
            .flatten()
            .filter_map(|e| e.deadline)
            .min()
    }

    fn retransmit(&mut self, seq: Seq, now: u64) -> Resend {
        let on_wire = self.is_transmitting();
        let max_retries = self.max_retries;
        let deadline = now.saturating_add(self.retry_timeout);
        let slot = self.slot(seq);
        let Some(entry) = self.window[slot].as_mut() else {
            return Resend::Skipped;
        };
        if entry.exhausted || !on_wire {
            // Replayed wholesale once the link can carry it again.
            return Resend::Skipped;
        }
        if entry.retries >= max_retries {
            entry.exhausted = true;
            entry.deadline = None;
            ringbuf_entry!(self.trace, Trace::Exhausted(seq));
            return Resend::Exhausted;
        }
        entry.retries += 1;
        entry.deadline = Some(deadline);
        entry.transmitted = true;
        let retries = entry.retries;
        let envelope = entry.envelope.clone();
        self.retransmits = self.retransmits.saturating_add(1);
        ringbuf_entry!(self.trace, Trace::Retransmit { seq, retries });
        self.transmit(envelope);
        Resend::Sent
    }

    /// Puts every outstanding entry back on the wire, oldest first.
    ///
    /// With `fresh`, every entry starts over with a full budget. Otherwise
    /// entries already on the wire once are charged a retry, and exhausted
    /// ones stay put. Returns whether any entry just ran out of retries.
    fn replay(&mut self, now: u64, fresh: bool) -> bool {
        if !self.is_transmitting() {
            return false;
        }
        let deadline = now.saturating_add(self.retry_timeout);
        let mut count = 0u8;
        let mut exhausted = false;
        for seq in self.span().collect::<heapless::Vec<Seq, MAX_RETRY_DEPTH>>()
        {
            let slot = self.slot(seq);
            let Some(entry) = self.window[slot].as_mut() else {
                continue;
            };
            if entry.envelope.sequence != seq {
                continue;
            }
            if fresh {
                entry.retries = 0;
                entry.exhausted = false;
                entry.transmitted = false;
            }
            if entry.transmitted {
                match self.retransmit(seq, now) {
                    Resend::Sent => count = count.saturating_add(1),
                    Resend::Exhausted => exhausted = true,
                    Resend::Skipped => (),
                }
                continue;
            }
            entry.transmitted = true;
            entry.deadline = Some(deadline);
            let envelope = entry.envelope.clone();
            self.transmit(envelope);
            count = count.saturating_add(1);
        }
        ringbuf_entry!(self.trace, Trace::Replay { count });
        exhausted
    }

    /// Reports a recovery replay done once everything it covered is acked.
    fn check_replayed(&mut self, ctx: &mut Ctx<'_>) {
        let Some(mark) = self.replaying else {
            return;
        };
        // Flits sealed after the replay do not hold it up.
        let pending = self.window.iter().flatten().any(|e| {
            let age = usize::from(mark.wrapping_sub(e.envelope.sequence));
            (1..=self.depth).contains(&age)
        });
        if !pending {
            self.replaying = None;
            ringbuf_entry!(self.trace, Trace::Replayed);
            ctx.post(Message::Recovery(RecoveryInput::Remediated(
                Rung::Retry,
            )));
        }
    }

    fn transmit(&mut self, envelope: FlitEnvelope) {
        let seq = envelope.sequence;
        if self.tx.push_back(envelope).is_err() {
            // The retransmission deadline covers it.
            ringbuf_entry!(self.trace, Trace::TxFull(seq));
        }
    }

    /// Stops transmitting; nothing is on the wire any more.
    fn hold(&mut self) {
        self.tx.clear();
        for entry in self.window.iter_mut().flatten() {
            entry.deadline = None;
        }
    }

    pub fn handle(&mut self, cmd: ReliabilityCommand, ctx: &mut Ctx<'_>) {
        match cmd {
            ReliabilityCommand::Replay => {
                if self.replay(ctx.now, false) {
                    self.report_exhausted(ctx);
                }
                self.replaying = Some(self.next_seq);
                self.check_replayed(ctx);
            }
            ReliabilityCommand::Resync => {
                ringbuf_entry!(self.trace, Trace::Resync(self.expected));
                self.reply(AckNak::Nak(self.expected));
                self.resyncing = true;
            }
            ReliabilityCommand::Flush => {
                self.window.iter_mut().for_each(|e| *e = None);
                self.tx.clear();
                self.replaying = None;
                self.resyncing = false;
                ringbuf_entry!(self.trace, Trace::Flushed);
            }
            ReliabilityCommand::Quiesce(quiesced) => {
                if quiesced == self.quiesced {
                    return;
                }
                ringbuf_entry!(self.trace, Trace::Quiesced(quiesced));
                self.quiesced = quiesced;
                if quiesced {
                    self.hold();
                } else if self.replay(ctx.now, false) {
                    self.report_exhausted(ctx);
                }
            }
        }
    }

    pub fn on_phase(&mut self, phase: TrainingPhase, ctx: &mut Ctx<'_>) {
        let up = phase == TrainingPhase::Active;
        if up == self.up {
            return;
        }
        self.up = up;
        if up {
            ringbuf_entry!(self.trace, Trace::LinkUp);
            self.replay(ctx.now, true);
        } else {
            ringbuf_entry!(self.trace, Trace::LinkDown);
            self.hold();
        }
    }

    /// Next envelope for the physical layer.
    pub fn take_flit(&mut self) -> Option<FlitEnvelope> {
        self.tx.pop_front()
    }

    /// Next acknowledgement for the physical layer.
    pub fn take_ack(&mut self) -> Option<AckNak> {
        self.acks.pop_front()
    }

    fn reply(&mut self, ack: AckNak) {
        // A lost acknowledgement is recovered by the sender's timeout.
        let _ = self.acks.push_back(ack);
    }

    /// Takes in one envelope from the partner.
    pub fn receive(
        &mut self,
        envelope: FlitEnvelope,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), ReceiveError> {
        let seq = envelope.sequence;
        if !envelope.verify() {
            self.reply(AckNak::Nak(seq));
            self.crc_burst = self.crc_burst.saturating_add(1);
            ringbuf_entry!(
                self.trace,
                Trace::BadCrc {
                    seq,
                    burst: self.crc_burst,
                }
            );
            if self.crc_burst >= self.crc_burst_threshold {
                ringbuf_entry!(self.trace, Trace::CrcBurst);
                self.crc_burst = 0;
                ctx.raise(
                    ErrorKind::CrcMismatch,
                    Component::Reliability,
                    Severity::Persistent,
                );
            } else {
                ctx.absorb(ErrorKind::CrcMismatch, Component::Reliability);
            }
            return Err(ReceiveError::Crc);
        }
        self.crc_burst = 0;

        let ahead = usize::from(seq.wrapping_sub(self.expected));
        if ahead >= self.depth {
            let behind = usize::from(self.expected.wrapping_sub(seq));
            if behind <= self.depth {
                // Our ack was lost; say it again.
                ringbuf_entry!(self.trace, Trace::Duplicate(seq));
                self.reply(AckNak::Ack(seq));
                return Ok(());
            }
            ringbuf_entry!(self.trace, Trace::OutsideWindow(seq));
            return Err(ReceiveError::OutsideWindow);
        }

        let slot = self.slot(seq);
        if self.reorder[slot].is_some() {
            ringbuf_entry!(self.trace, Trace::Duplicate(seq));
            self.reply(AckNak::Ack(seq));
            return Ok(());
        }
        if self.ready.len() + self.buffered >= QUEUE_DEPTH {
            ringbuf_entry!(self.trace, Trace::ReceiverFull(seq));
            return Err(ReceiveError::ReceiverFull);
        }
        self.reorder[slot] = Some(envelope);
        self.buffered += 1;
        self.reply(AckNak::Ack(seq));
        ringbuf_entry!(self.trace, Trace::Buffered(seq));

        if self.release() && self.resyncing {
            self.resyncing = false;
            ringbuf_entry!(self.trace, Trace::Resynced(self.expected));
            ctx.post(Message::Recovery(RecoveryInput::Remediated(
                Rung::Retry,
            )));
        }
        Ok(())
    }

    /// Moves the in-order prefix of the reorder buffer to the consumer.
    /// Returns whether anything moved.
    fn release(&mut self) -> bool {
        let before = self.expected;
        loop {
            let slot = self.slot(self.expected);
            let Some(envelope) = self.reorder[slot].take() else {
                break;
            };
            self.buffered -= 1;
            // Capacity was reserved when the envelope was buffered.
            let _ = self.ready.push_back(envelope.flit());
            ringbuf_entry!(self.trace, Trace::Delivered(self.expected));
            self.delivered = self.delivered.saturating_add(1);
            self.expected = self.expected.wrapping_add(1);
        }
        self.expected != before
    }

    /// Next in-order flit for the consumer.
    pub fn recv(&mut self) -> Option<Flit> {
        self.ready.pop_front()
    }
}
