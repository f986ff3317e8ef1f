// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_d2d_link_api::{
    AckNak, Component, ErrorEvent, ErrorKind, Flit, FlitMeta, LinkConfig,
    ProtocolId, RecoveryConfig, Severity, TrainingPhase,
};
use drv_d2d_link_core::recovery::{Recovery, RecoveryInput};
use drv_d2d_link_core::reliability::{Reliability, ReliabilityCommand};
use drv_d2d_link_core::{Ctx, Mailbox, RecoveryState, TimerId};
use multitimer::Multitimer;
use proptest::prelude::*;

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

    fn ctx(&mut self) -> Ctx<'_> {
        Ctx {
            now: self.now,
            timers: &mut self.timers,
            mailbox: &mut self.mailbox,
        }
    }

    fn drain(&mut self) {
        while self.mailbox.pop().is_some() {}
    }
}

fn up(config: &LinkConfig, b: &mut Bench) -> Reliability {
    let mut r = Reliability::new(config);
    r.on_phase(TrainingPhase::Active, &mut b.ctx());
    r
}

fn flit(byte: u8) -> Flit {
    let meta = FlitMeta {
        virtual_channel: 2,
        protocol: ProtocolId::Streaming,
    };
    Flit::new(meta, &[byte; 12]).unwrap()
}

#[derive(Copy, Clone, Debug)]
enum Op {
    Send,
    Ack(u8),
    Nak(u8),
    Tick(u16),
    Replay,
    Quiesce(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Send),
        2 => any::<u8>().prop_map(Op::Ack),
        1 => any::<u8>().prop_map(Op::Nak),
        1 => any::<u16>().prop_map(Op::Tick),
        1 => Just(Op::Replay),
        1 => any::<bool>().prop_map(Op::Quiesce),
    ]
}

#[derive(Copy, Clone, Debug)]
enum Step {
    Error(ErrorKind, Component),
    /// The current rung's budget ran out.
    Timeout,
    /// The current rung's owner reports success.
    Remediated,
    Tick,
}

fn source() -> impl Strategy<Value = Component> {
    prop::sample::select(vec![
        Component::Training,
        Component::Lanes,
        Component::Reliability,
        Component::Power,
        Component::Remote,
    ])
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (error_kind(), source()).prop_map(|(k, c)| Step::Error(k, c)),
        1 => Just(Step::Timeout),
        2 => Just(Step::Remediated),
        1 => Just(Step::Tick),
    ]
}

fn error_kind() -> impl Strategy<Value = ErrorKind> {
    prop::sample::select(vec![
        ErrorKind::CrcMismatch,
        ErrorKind::SequenceTimeout,
        ErrorKind::RetryExhausted,
        ErrorKind::LaneThresholdExceeded,
        ErrorKind::NoSpareLane,
        ErrorKind::WidthFloorReached,
        ErrorKind::SpeedFloorReached,
        ErrorKind::PhaseTimeout,
        ErrorKind::PowerTransitionTimeout,
    ])
}

proptest! {
    /// Whatever the channel corrupts, the receiver only ever hands up an
    /// in-order prefix of what was sent, byte for byte.
    #[test]
    fn corrupted_flits_are_never_delivered(
        count in 1u8..32,
        corrupt in prop::collection::vec(any::<u8>(), 0..120),
    ) {
        let config = LinkConfig::default();
        let mut txb = Bench::new();
        let mut rxb = Bench::new();
        let mut tx = up(&config, &mut txb);
        let mut rx = up(&config, &mut rxb);

        for i in 0..count {
            prop_assert!(tx.send(&flit(i), 0).is_ok());
        }
        let mut corrupt = corrupt.into_iter();
        let mut delivered = Vec::new();
        while let Some(mut env) = tx.take_flit() {
            if let Some(mask) = corrupt.next().filter(|&m| m != 0) {
                env.payload[0] ^= mask;
            }
            let _ = rx.receive(env, &mut rxb.ctx());
            while let Some(ack) = rx.take_ack() {
                match ack {
                    AckNak::Ack(seq) => {
                        tx.on_ack(seq, &mut txb.ctx());
                    }
                    AckNak::Nak(seq) => tx.on_nak(seq, &mut txb.ctx()),
                }
            }
            while let Some(f) = rx.recv() {
                delivered.push(f);
            }
            txb.drain();
            rxb.drain();
        }

        for (i, f) in delivered.iter().enumerate() {
            prop_assert_eq!(&f.payload[..], &[i as u8; 12][..]);
        }
        prop_assert!(delivered.len() <= usize::from(count));
    }

    /// Whatever mix of NAKs, timeouts, recovery replays and power
    /// transitions a flit goes through, it is sent at most once plus its
    /// retry budget, and the window never holds more than its depth.
    #[test]
    fn retry_window_never_overfills(
        ops in prop::collection::vec(op(), 1..300),
    ) {
        let config = LinkConfig {
            retry_window_depth: 8,
            max_retries: 2,
            ..LinkConfig::default()
        };
        let mut b = Bench::new();
        let mut r = up(&config, &mut b);
        let mut next = 0u8;
        let mut copies = [0u32; 256];
        let budget = 1 + u32::from(config.max_retries);

        for op in ops {
            match op {
                Op::Send => {
                    if let Ok(seq) = r.send(&flit(next), b.now) {
                        copies[usize::from(seq)] = 0;
                        next = next.wrapping_add(1);
                    } else {
                        prop_assert!(r.outstanding() > 0);
                    }
                }
                Op::Ack(seq) => {
                    r.on_ack(seq, &mut b.ctx());
                }
                Op::Nak(seq) => r.on_nak(seq, &mut b.ctx()),
                Op::Tick(dt) => {
                    b.now += u64::from(dt);
                    r.poll(&mut b.ctx());
                }
                Op::Replay => {
                    r.handle(ReliabilityCommand::Replay, &mut b.ctx())
                }
                Op::Quiesce(on) => {
                    r.handle(ReliabilityCommand::Quiesce(on), &mut b.ctx())
                }
            }
            while let Some(env) = r.take_flit() {
                let n = &mut copies[usize::from(env.sequence)];
                *n += 1;
                prop_assert!(
                    *n <= budget,
                    "seq {} sent {} times",
                    env.sequence,
                    n
                );
            }
            b.drain();
            prop_assert!(r.outstanding() <= r.depth());
        }
    }

    /// Within one episode, escalation only ever climbs the ladder, and an
    /// episode only ends by being remediated.
    #[test]
    fn recovery_never_steps_down(
        steps in prop::collection::vec(step(), 1..60),
    ) {
        let config = RecoveryConfig::default();
        let ladder = config.ladder;
        let mut b = Bench::new();
        let mut r = Recovery::new(config);
        r.on_phase(TrainingPhase::Active, &mut b.ctx());

        let mut height = None;
        let mut episode = 0;
        let mut remediated = 0;
        for step in steps {
            match step {
                Step::Error(kind, source) => {
                    let ev = ErrorEvent::new(
                        kind,
                        source,
                        Severity::Persistent,
                        b.now,
                    );
                    r.handle(RecoveryInput::Error(ev), &mut b.ctx());
                }
                Step::Timeout => {
                    b.timers.clear_timer(TimerId::Recovery);
                    r.handle(RecoveryInput::Timeout, &mut b.ctx());
                }
                Step::Remediated => {
                    if let Some(rung) = r.rung() {
                        r.handle(
                            RecoveryInput::Remediated(rung),
                            &mut b.ctx(),
                        );
                        remediated += 1;
                    }
                }
                Step::Tick => r.settle(),
            }
            b.drain();

            if r.episodes() != episode {
                // A new episode may only follow a finished one.
                prop_assert_eq!(r.episodes(), remediated + 1);
                episode = r.episodes();
                height = None;
            }
            match r.state() {
                RecoveryState::Remediating(rung) => {
                    let h = ladder.position(rung);
                    if let Some(prev) = height {
                        prop_assert!(h >= prev);
                    }
                    height = Some(h);
                }
                RecoveryState::Unrecoverable => break,
                _ => (),
            }
        }
    }
}
