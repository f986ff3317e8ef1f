// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control plane for one die-to-die link.
//!
//! The link is run by six state machines, each owning its own state:
//!
//! - [`training::Training`] walks the bring-up phases and retrains.
//! - [`negotiate::Negotiator`] exchanges capabilities with the partner.
//! - [`lanes::LaneTable`] tracks lane health, repairs and narrows.
//! - [`reliability::Reliability`] runs ARQ over the flit channel.
//! - [`power::Power`] moves between active, standby and sleep.
//! - [`recovery::Recovery`] escalates errors up a remediation ladder.
//!
//! Whatever they say to the partner goes out through the
//! [`control::ControlChannel`], which numbers it and makes sure one-way
//! commands are acknowledged.
//!
//! They never call one another; they talk through the [`mailbox`]. A
//! [`session::LinkSession`] owns them all, feeds them external inputs and
//! asks the [`coordinator`] which of their directives the physical layer
//! should act on.

#![cfg_attr(not(test), no_std)]

pub mod control;
pub mod coordinator;
pub mod lanes;
pub mod mailbox;
pub mod negotiate;
pub mod power;
pub mod recovery;
pub mod reliability;
pub mod session;
pub mod training;

pub use coordinator::{arbitrate, Coordinator, Grant, Requests};
pub use mailbox::{Ctx, Mailbox, Message, TimerId};
pub use power::Rejected;
pub use recovery::RecoveryState;
pub use reliability::{ReceiveError, WindowFull};
pub use session::{LinkSession, SendError};
