// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod common;

use common::{active_session, entered, flit, Phy};
use drv_d2d_link_api::{
    AckNak, CapabilitySet, Component, Directive, ErrorKind, Features,
    LaneStatus, LinkConfig, PacketType, PowerDirective, PowerState,
    Protocols, RecoveryDirective, Rung, Speed, Speeds, TrainingPhase,
    BRINGUP_ORDER,
};
use drv_d2d_link_core::{LinkSession, RecoveryState, Rejected, SendError};

#[test]
fn clean_bringup_visits_every_phase_once() {
    let mut phy = Phy::new();
    let s = active_session(LinkConfig::default(), &mut phy);

    let visited = entered(&s);
    let phases = visited.iter().map(|&(p, _, _)| p).collect::<Vec<_>>();
    assert_eq!(phases, BRINGUP_ORDER);
    assert!(visited.iter().all(|&(_, attempt, n)| attempt == 0 && n == 1));

    assert_eq!(s.power_state(), PowerState::Active);
    assert_eq!(s.recovery_state(), RecoveryState::Idle);
    assert_eq!(s.directive(), None);
    assert_eq!(s.lanes().width(), 16);
    assert!(!s.lanes().is_reversed());
    assert!(s.counters().values().all(|&n| n == 0));
    assert_eq!(s.lost_messages(), 0);
    assert_eq!(
        &phy.sent[..2],
        [PacketType::TrainingStart, PacketType::ParamRequest]
    );
}

#[test]
fn scenario_a_negotiates_highest_common_speed() {
    let mut phy = Phy::new();
    phy.remote = CapabilitySet {
        speeds: Speeds::GT8 | Speeds::GT16 | Speeds::GT64,
        max_width: 16,
        protocols: Protocols::PCIE | Protocols::RAW,
        features: Features::RETRY,
    };
    let mut s = active_session(LinkConfig::default(), &mut phy);

    let caps = *s.negotiated().unwrap();
    assert_eq!(caps.max_speed(), Some(Speed::Gt16));
    assert_eq!(caps.protocols, Protocols::PCIE);
    assert_eq!(s.training().target_speed(), Speed::Gt16);

    let mut streaming = flit(0);
    streaming.meta.protocol = drv_d2d_link_api::ProtocolId::Streaming;
    assert_eq!(s.send(&streaming), Err(SendError::ProtocolNotNegotiated));
    assert_eq!(s.send(&flit(0)), Ok(0));
}

#[test]
fn no_common_protocol_fails_training() {
    let mut phy = Phy::new();
    phy.remote.protocols = Protocols::RAW;
    let mut s = LinkSession::new(LinkConfig::default()).unwrap();
    s.start(0);
    phy.run_until(&mut s, |s| {
        s.error_count(ErrorKind::CapabilityMismatch) == 1
    });

    // Training failed, told the partner, and recovery cold-reset it.
    let mut sent = phy.sent.clone();
    sent.extend(core::iter::from_fn(|| s.take_sideband()).map(|p| p.ty));
    let stop = sent.iter().position(|&t| t == PacketType::TrainingStop);
    let reset = sent.iter().position(|&t| t == PacketType::ResetRequest);
    assert!(stop.is_some() && stop < reset);
    assert_eq!(s.phase(), TrainingPhase::Reset);
    assert_eq!(s.recovery().rung(), Some(Rung::Reset));
}

#[test]
fn scenario_b_two_crc_failures_then_success() {
    let mut tx_phy = Phy::new();
    let mut rx_phy = Phy::new();
    let mut tx = active_session(LinkConfig::default(), &mut tx_phy);
    let mut rx = active_session(LinkConfig::default(), &mut rx_phy);

    for i in 0..6 {
        assert_eq!(tx.send(&flit(i)), Ok(i));
    }
    let mut corruptions = 2;
    let mut delivered = Vec::new();
    while let Some(mut env) = tx.take_flit() {
        if env.sequence == 5 && corruptions > 0 {
            corruptions -= 1;
            env.payload[0] ^= 0x40;
        }
        let _ = rx.receive(env);
        while let Some(ack) = rx.take_ack() {
            match ack {
                AckNak::Ack(seq) => assert!(tx.on_ack(seq)),
                AckNak::Nak(seq) => tx.on_nak(seq),
            }
        }
        while let Some(f) = rx.recv() {
            delivered.push(f.payload[0]);
        }
    }

    assert_eq!(tx.reliability().retransmits(), 2);
    assert_eq!(delivered, [0, 1, 2, 3, 4, 5]);
    assert_eq!(tx.reliability().outstanding(), 0);
    assert_eq!(rx.error_count(ErrorKind::CrcMismatch), 2);
    // Below the burst threshold: absorbed, never escalated.
    assert_eq!(rx.recovery_state(), RecoveryState::Idle);
}

#[test]
fn scenario_c_lane_repaired_onto_spare() {
    let mut phy = Phy::new();
    let config = LinkConfig::default();
    let mut s = active_session(config, &mut phy);

    s.report_lane_errors(3, config.lane_error_threshold);

    assert_eq!(s.lanes().width(), 16);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert_eq!(s.lanes().spares_remaining(), 1);
    assert_eq!(s.lanes().record(3).unwrap().status, LaneStatus::Disabled);
    assert_eq!(s.lanes().physical_lane(3), Some(16));
    assert_eq!(
        s.directive().map(|g| g.directive),
        Some(Directive::Recovery(RecoveryDirective::ApplyLaneMap))
    );
    assert_eq!(s.error_count(ErrorKind::LaneThresholdExceeded), 1);

    s.tick(1);
    assert_eq!(s.recovery_state(), RecoveryState::Idle);
    assert_eq!(s.directive(), None);
}

#[test]
fn scenario_d_width_degrades_then_retrains_at_floor() {
    let mut phy = Phy::new();
    let config = LinkConfig {
        spare_lanes: 0,
        ..LinkConfig::default()
    };
    let mut s = active_session(config, &mut phy);
    let threshold = config.lane_error_threshold;

    s.report_lane_errors(3, threshold);
    s.report_lane_errors(7, threshold);
    assert_eq!(s.lanes().width(), 8);
    assert_eq!(s.training().target_width(), 8);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert_eq!(
        s.directive().map(|g| g.directive),
        Some(Directive::Recovery(RecoveryDirective::ApplyWidth(8)))
    );
    s.tick(1);

    // Width only goes down.
    let active = s.lanes().physical_lane(2).unwrap();
    s.report_lane_errors(active, threshold);
    assert_eq!(s.lanes().width(), 8);
    assert_eq!(s.recovery().rung(), Some(Rung::Retrain));
    assert_eq!(s.phase(), TrainingPhase::PhyRetrain);
    assert_eq!(s.error_count(ErrorKind::WidthFloorReached), 1);
}

#[test]
fn scenario_e_standby_only_from_active() {
    let mut phy = Phy::new();
    let mut s = LinkSession::new(LinkConfig::default()).unwrap();
    s.start(0);
    phy.run_until(&mut s, |s| s.phase() == TrainingPhase::MbTrainValVref);

    assert_eq!(
        s.request_power(PowerState::Standby),
        Err(Rejected::LinkNotActive)
    );
    assert_eq!(s.power_state(), PowerState::Active);

    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert_eq!(s.request_power(PowerState::Standby), Ok(()));
    assert_eq!(s.power_state(), PowerState::StandbyEntering);
    let grant = s.directive().unwrap();
    assert_eq!(grant.to, Component::Power);
    assert_eq!(grant.directive, Directive::Power(PowerDirective::EnterStandby));
}

#[test]
fn outbound_data_wakes_the_link() {
    let mut phy = Phy::new();
    let mut s = active_session(LinkConfig::default(), &mut phy);
    s.request_power(PowerState::Standby).unwrap();
    s.on_power_confirm();
    assert_eq!(s.power_state(), PowerState::Standby);

    assert_eq!(s.send(&flit(9)), Ok(0));
    assert_eq!(s.power_state(), PowerState::StandbyExiting);
    assert!(s.take_flit().is_none());

    s.on_power_confirm();
    assert_eq!(s.power_state(), PowerState::Active);
    assert_eq!(s.take_flit().map(|e| e.sequence), Some(0));
}

#[test]
fn forced_retrain_skips_sideband_and_parameters() {
    let mut phy = Phy::new();
    let mut s = active_session(LinkConfig::default(), &mut phy);
    let before = entered(&s).len();

    s.force_retrain();
    assert_eq!(s.phase(), TrainingPhase::PhyRetrain);
    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert_eq!(s.training().retrains(), 1);
    assert!(phy.sent.contains(&PacketType::RetrainRequest));

    let retrain = entered(&s)[before..]
        .iter()
        .map(|&(p, _, _)| p)
        .collect::<Vec<_>>();
    assert_eq!(retrain.first(), Some(&TrainingPhase::PhyRetrain));
    assert_eq!(retrain.last(), Some(&TrainingPhase::Active));
    assert!(!retrain.contains(&TrainingPhase::SbInit));
    assert!(!retrain.contains(&TrainingPhase::ParamExchange));
    // Reversal and lane repair are redone every time.
    assert!(retrain.contains(&TrainingPhase::MbInitReversalMb));
    assert!(retrain.contains(&TrainingPhase::MbInitRepairMb));
    assert_eq!(s.control().unacknowledged(), 0);
}

#[test]
fn retrain_keeps_a_repaired_and_reversed_lane_map() {
    let mut phy = Phy::new();
    phy.reversed = true;
    let config = LinkConfig::default();
    let mut s = active_session(config, &mut phy);
    s.report_lane_errors(3, config.lane_error_threshold);
    s.tick(1);
    let spare = s.lanes().physical_lane(3);

    s.force_retrain();
    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert!(s.lanes().is_reversed());
    assert_eq!(s.lanes().physical_lane(3), spare);
    assert_eq!(s.lanes().width(), 16);
}

#[test]
fn slow_channel_trains_at_a_lower_speed() {
    let mut phy = Phy::new();
    phy.max_speed = Speed::Gt16;
    let s = active_session(LinkConfig::default(), &mut phy);
    assert_eq!(s.training().target_speed(), Speed::Gt16);

    let phases = entered(&s);
    let idles = phases
        .iter()
        .filter(|&&(p, _, _)| p == TrainingPhase::MbTrainSpeedIdle)
        .count();
    // Once on the way up, then again at 24 and at 16 GT/s.
    assert_eq!(idles, 3);
}

#[test]
fn lane_failure_at_link_check_is_repaired_during_training() {
    let mut phy = Phy::new();
    phy.fail_at_link_check = vec![5];
    let s = active_session(LinkConfig::default(), &mut phy);

    let phases = entered(&s);
    assert!(phases
        .iter()
        .any(|&(p, _, _)| p == TrainingPhase::MbTrainRepair));
    assert_eq!(s.lanes().width(), 16);
    assert_eq!(s.lanes().record(5).unwrap().status, LaneStatus::Disabled);
}

#[test]
fn reversed_lanes_are_detected() {
    let mut phy = Phy::new();
    phy.reversed = true;
    let s = active_session(LinkConfig::default(), &mut phy);
    assert!(s.lanes().is_reversed());
    assert_eq!(s.lanes().physical_lane(0), Some(15));
}

#[test]
fn stuck_training_resets_then_gives_up() {
    let mut phy = Phy::new();
    phy.responsive = false;
    let mut s = LinkSession::new(LinkConfig::default()).unwrap();
    s.start(0);

    for t in 1..=3 {
        s.tick(t * 8_000);
    }
    // Three tries at Reset, then a cold reset.
    assert_eq!(s.phase(), TrainingPhase::Reset);
    assert_eq!(s.recovery().rung(), Some(Rung::Reset));
    assert_eq!(
        s.directive().map(|g| g.directive),
        Some(Directive::Recovery(RecoveryDirective::ResetPhy))
    );
    phy.run(&mut s);
    assert!(phy.sent.contains(&PacketType::TrainingStop));
    assert!(phy.sent.contains(&PacketType::ResetRequest));

    for t in 4..=6 {
        s.tick(t * 8_000);
    }
    assert_eq!(s.recovery_state(), RecoveryState::Unrecoverable);
    assert_eq!(s.error_count(ErrorKind::Unrecoverable), 1);
    assert_eq!(s.send(&flit(0)), Err(SendError::Unrecoverable));

    s.cold_reset();
    assert_eq!(s.recovery_state(), RecoveryState::Idle);
    phy.responsive = true;
    s.start(s.now());
    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
}

#[test]
fn cold_reset_recovers_a_failed_bringup() {
    let mut phy = Phy::new();
    phy.responsive = false;
    let mut s = LinkSession::new(LinkConfig::default()).unwrap();
    s.start(0);
    for t in 1..=3 {
        s.tick(t * 8_000);
    }
    assert_eq!(s.recovery().rung(), Some(Rung::Reset));

    phy.responsive = true;
    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert_eq!(s.recovery_state(), RecoveryState::Done { applied: None });
    s.tick(30_000);
    assert_eq!(s.recovery_state(), RecoveryState::Idle);
    assert_eq!(s.error_count(ErrorKind::PhaseTimeout), 1);
}

#[test]
fn partner_error_report_drives_recovery() {
    let mut phy = Phy::new();
    let mut s = active_session(LinkConfig::default(), &mut phy);
    let report = drv_d2d_link_api::SidebandPacket::error_report(
        7,
        ErrorKind::PhaseTimeout,
    );
    s.on_sideband(&common::encode(&report)).unwrap();
    assert_eq!(s.recovery().rung(), Some(Rung::Retrain));
    assert_eq!(s.phase(), TrainingPhase::PhyRetrain);

    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert!(matches!(s.recovery_state(), RecoveryState::Done { .. }));
}

#[test]
fn corrupt_control_packets_are_rejected() {
    let mut phy = Phy::new();
    let mut s = active_session(LinkConfig::default(), &mut phy);
    let mut bytes = common::encode(&drv_d2d_link_api::SidebandPacket::bare(
        PacketType::RetrainRequest,
        0,
    ));
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    assert_eq!(
        s.on_sideband(&bytes),
        Err(drv_d2d_link_api::SidebandError::BadCrc)
    );
    assert_eq!(s.phase(), TrainingPhase::Active);
}

#[test]
fn retries_exhausted_across_the_window_degrade_speed_once() {
    let mut phy = Phy::new();
    let mut s = active_session(LinkConfig::default(), &mut phy);
    let speed = s.training().target_speed();
    let depth = s.reliability().depth();
    for i in 0..depth {
        s.send(&flit(i as u8)).unwrap();
    }

    // Nothing is ever acknowledged.
    for t in 1..=6 {
        while s.take_flit().is_some() {}
        s.tick(t * 200);
    }
    assert_eq!(s.lost_messages(), 0);
    assert_eq!(s.error_count(ErrorKind::RetryExhausted), 1);
    assert_eq!(
        s.error_count(ErrorKind::SequenceTimeout),
        5 * depth as u32
    );
    assert_eq!(s.recovery().rung(), Some(Rung::SpeedDegrade));
    assert_eq!(s.recovery().episodes(), 1);
    assert_eq!(s.phase(), TrainingPhase::PhyRetrain);

    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert!(s.training().target_speed() < speed);
    assert_eq!(s.recovery_state(), RecoveryState::Done { applied: None });
    // Back on the wire with a fresh budget.
    let replayed = core::iter::from_fn(|| s.take_flit()).count();
    assert_eq!(replayed, depth);
    assert_eq!(s.reliability().retries(0), Some(0));
}

#[test]
fn unanswered_retrain_request_is_resent_then_escalated() {
    let mut phy = Phy::new();
    let mut s = active_session(LinkConfig::default(), &mut phy);
    phy.acks = false;
    s.force_retrain();
    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    assert!(s.control().is_pending(PacketType::RetrainRequest));

    let timeout = s.config().sideband_timeout;
    let retries = u64::from(s.config().sideband_retries);
    for n in 1..=retries {
        s.tick(n * timeout);
        let resent = core::iter::from_fn(|| s.take_sideband())
            .map(|p| p.ty)
            .collect::<Vec<_>>();
        assert_eq!(resent, [PacketType::RetrainRequest]);
    }
    assert_eq!(s.error_count(ErrorKind::SidebandTimeout), 0);

    s.tick((retries + 1) * timeout);
    assert_eq!(s.error_count(ErrorKind::SidebandTimeout), 1);
    assert_eq!(s.recovery().rung(), Some(Rung::Retrain));
    assert_eq!(s.phase(), TrainingPhase::PhyRetrain);
}

#[test]
fn partner_restart_takes_the_link_down_with_it() {
    let mut phy = Phy::new();
    let mut s = active_session(LinkConfig::default(), &mut phy);
    let start = drv_d2d_link_api::SidebandPacket::bare(
        PacketType::TrainingStart,
        3,
    );
    s.on_sideband(&common::encode(&start)).unwrap();

    let ack = s.take_sideband().unwrap();
    assert_eq!((ack.ty, ack.sequence), (PacketType::Ack, 3));
    assert_eq!(s.phase(), TrainingPhase::Reset);

    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    // Already on its way up; nothing to restart.
    s.force_retrain();
    s.on_sideband(&common::encode(&start)).unwrap();
    assert_eq!(s.phase(), TrainingPhase::PhyRetrain);
}

#[test]
fn inbound_crc_burst_asks_the_partner_to_resend() {
    let mut phy = Phy::new();
    let config = LinkConfig::default();
    let mut rx = active_session(config, &mut phy);
    let good = drv_d2d_link_api::FlitEnvelope::seal(0, &flit(0));
    let mut bad = good.clone();
    bad.crc ^= 1;

    for _ in 0..config.crc_burst_threshold {
        let _ = rx.receive(bad.clone());
    }
    assert_eq!(rx.recovery().rung(), Some(Rung::Retry));
    let acks = core::iter::from_fn(|| rx.take_ack()).collect::<Vec<_>>();
    assert_eq!(acks.last(), Some(&AckNak::Nak(0)));
    assert_eq!(acks.len(), usize::from(config.crc_burst_threshold) + 1);
    // Our own window has nothing to do with it.
    assert!(rx.take_flit().is_none());

    rx.receive(good).unwrap();
    assert_eq!(
        rx.recovery_state(),
        RecoveryState::Done {
            applied: Some(RecoveryDirective::Replay)
        }
    );
    assert_eq!(rx.recv(), Some(flit(0)));
}
