// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A scripted physical layer and link partner.

#![allow(dead_code)]

use drv_d2d_link_api::{
    CalibrationCommand, CapabilitySet, Directive, Flit, FlitMeta, LaneSignal,
    LinkConfig, PacketType, PhyRequest, PhyResponse, ProtocolId,
    RecoveryDirective, SidebandPacket, Speed, TrainingPhase,
    SIDEBAND_PACKET_MAX,
};
use drv_d2d_link_core::training::Trace;
use drv_d2d_link_core::LinkSession;

pub struct Phy {
    /// What the partner advertises.
    pub remote: CapabilitySet,
    /// Fastest speed the channel actually trains to.
    pub max_speed: Speed,
    /// Lanes reported failed at the next link-speed check.
    pub fail_at_link_check: Vec<u8>,
    pub reversed: bool,
    /// When false, nothing answers training requests.
    pub responsive: bool,
    /// When false, the partner never acknowledges control packets.
    pub acks: bool,
    /// Every control packet the session sent.
    pub sent: Vec<PacketType>,
}

impl Phy {
    pub fn new() -> Self {
        Self {
            remote: LinkConfig::default().local,
            max_speed: Speed::Gt64,
            fail_at_link_check: Vec::new(),
            reversed: false,
            responsive: true,
            acks: true,
            sent: Vec::new(),
        }
    }

    pub fn respond(&mut self, req: PhyRequest) -> PhyResponse {
        let speed = req.target_speed.min(self.max_speed);
        let mut resp = PhyResponse::ready(speed, req.target_width);
        match req.calibration {
            CalibrationCommand::ReversalPattern => {
                let half = u32::from(req.target_width) / 2;
                let straight = (1u64 << half) - 1;
                let pattern = if self.reversed {
                    straight << half
                } else {
                    straight
                };
                resp = resp.with_pattern(pattern);
            }
            CalibrationCommand::LinkCheck => {
                for lane in self.fail_at_link_check.drain(..) {
                    resp = resp.with_lane(lane, LaneSignal::Fail);
                }
            }
            _ => (),
        }
        resp
    }

    /// Plays partner and physical layer until the session stops asking
    /// for anything, or `until` holds.
    pub fn run_until(
        &mut self,
        s: &mut LinkSession,
        until: impl Fn(&LinkSession) -> bool,
    ) {
        for _ in 0..500 {
            if until(s) {
                return;
            }
            let mut progressed = false;
            while let Some(pkt) = s.take_sideband() {
                self.sent.push(pkt.ty);
                if pkt.ty == PacketType::ParamRequest {
                    let reply = SidebandPacket::capabilities(
                        PacketType::ParamResponse,
                        pkt.sequence,
                        &self.remote,
                    );
                    s.on_sideband(&encode(&reply)).unwrap();
                    progressed = true;
                } else if pkt.ty.needs_ack() && self.acks {
                    let ack =
                        SidebandPacket::bare(PacketType::Ack, pkt.sequence);
                    s.on_sideband(&encode(&ack)).unwrap();
                }
            }
            if until(s) {
                return;
            }
            if !self.responsive {
                return;
            }
            let req = match s.directive().map(|g| g.directive) {
                Some(Directive::Train(req)) => req,
                Some(Directive::Recovery(RecoveryDirective::ResetPhy)) => {
                    s.training().request().unwrap()
                }
                _ if progressed => continue,
                _ => return,
            };
            let resp = self.respond(req);
            s.on_phy_response(resp);
        }
        panic!("session never settled; phase {:?}", s.phase());
    }

    pub fn run(&mut self, s: &mut LinkSession) {
        self.run_until(s, |_| false);
    }
}

pub fn encode(pkt: &SidebandPacket) -> Vec<u8> {
    let mut buf = [0u8; SIDEBAND_PACKET_MAX];
    let n = pkt.encode(&mut buf).unwrap();
    buf[..n].to_vec()
}

/// A session brought up to `Active` against `phy`.
pub fn active_session(config: LinkConfig, phy: &mut Phy) -> LinkSession {
    let mut s = LinkSession::new(config).unwrap();
    s.start(0);
    phy.run(&mut s);
    assert_eq!(s.phase(), TrainingPhase::Active);
    s
}

/// Phases entered, in order, as recorded by the training sequencer, with
/// the attempt number and how many times in a row each was recorded.
pub fn entered(s: &LinkSession) -> Vec<(TrainingPhase, u8, u32)> {
    s.training()
        .trace()
        .iter()
        .filter_map(|e| match e.payload {
            Trace::Enter { phase, attempt } => Some((phase, attempt, e.count)),
            _ => None,
        })
        .collect()
}

pub fn flit(byte: u8) -> Flit {
    let meta = FlitMeta {
        virtual_channel: 1,
        protocol: ProtocolId::Pcie,
    };
    Flit::new(meta, &[byte; 16]).unwrap()
}
