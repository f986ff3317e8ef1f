// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control Coordinator: picks the one directive the physical layer acts on.
//!
//! Error Recovery outranks Training, which outranks Power, so a power
//! transition never pre-empts a retrain or a repair in progress.

use drv_d2d_link_api::{
    Component, Directive, PhyRequest, PowerDirective, RecoveryDirective,
};

/// Everything asking for the physical layer this tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Requests {
    pub recovery: Option<RecoveryDirective>,
    pub training: Option<PhyRequest>,
    pub power: Option<PowerDirective>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub to: Component,
    pub directive: Directive,
}

pub fn arbitrate(requests: &Requests) -> Option<Grant> {
    if let Some(d) = requests.recovery {
        return Some(Grant {
            to: Component::Recovery,
            directive: Directive::Recovery(d),
        });
    }
    if let Some(req) = requests.training {
        return Some(Grant {
            to: Component::Training,
            directive: Directive::Train(req),
        });
    }
    requests.power.map(|d| Grant {
        to: Component::Power,
        directive: Directive::Power(d),
    })
}

#[derive(Default)]
pub struct Coordinator {
    last: Option<Grant>,
}

impl Coordinator {
    pub fn update(&mut self, requests: &Requests) -> Option<Grant> {
        self.last = arbitrate(requests);
        self.last
    }

    pub fn last(&self) -> Option<Grant> {
        self.last
    }
}
