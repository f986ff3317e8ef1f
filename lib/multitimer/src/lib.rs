// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A timer multiplexer driven by an explicit clock.
//!
//! `Multitimer` lets a single owner treat one monotonic clock as several
//! independent single-shot deadlines. The deadlines are named by the variants
//! of an enum type, to make it easy to tell them apart.
//!
//! The expected usage model is:
//!
//! - Create an `enum` type naming your timers, and derive the `Enum` trait
//!   (from the `enum_map` crate) for it.
//!
//! - Create a `Multitimer<YourEnumType>`.
//!
//! - Arm and cancel timers with `set_timer` and `clear_timer`.
//!
//! - Whenever time advances, feed the new time into `Multitimer::poll`.
//!
//! - When you're ready to process timer events (which may or may not be
//!   immediately after polling), call `Multitimer::iter_fired`.
//!
//! Cancellation is final: a timer cleared after its deadline passed, but
//! before the firing was observed through `iter_fired`, will not be reported.
//! Owners that complete an operation before its deadline can therefore clear
//! the timer and be certain they will never see a stale expiry for it.

#![cfg_attr(not(test), no_std)]

use enum_map::{EnumArray, EnumMap};

pub struct Multitimer<E: EnumArray<Timer>> {
    timers: EnumMap<E, Timer>,
}

impl<E: EnumArray<Timer> + Copy> Default for Multitimer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EnumArray<Timer> + Copy> Multitimer<E> {
    pub fn new() -> Self {
        Self {
            timers: EnumMap::default(),
        }
    }

    /// Sets the timer chosen by `which` to go off at time `deadline`. This
    /// replaces any prior setting for the timer and enables it.
    ///
    /// Re-arming a timer discards a firing that was never observed; the new
    /// deadline is the only one that counts.
    pub fn set_timer(&mut self, which: E, deadline: u64) {
        self.timers[which] = Timer {
            deadline: Some(deadline),
            fired_but_not_observed: false,
        };
    }

    pub fn get_timer(&self, which: E) -> Option<u64> {
        self.timers[which].deadline
    }

    /// Disarms the timer chosen by `which`, including any firing that has not
    /// yet been observed. Returns `true` if the timer was armed or pending.
    pub fn clear_timer(&mut self, which: E) -> bool {
        let timer = core::mem::take(&mut self.timers[which]);
        timer.deadline.is_some() || timer.fired_but_not_observed
    }

    /// Returns the earliest deadline across all armed timers, if any. A
    /// caller sleeping on an external clock can use this to decide how long
    /// to wait.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.values().filter_map(|timer| timer.deadline).min()
    }

    /// Marks every timer whose deadline is at or before `now` as fired. Fired
    /// timers are disarmed; read them out (destructively) with
    /// `iter_fired()`.
    pub fn poll(&mut self, now: u64) {
        for timer in self.timers.values_mut() {
            if let Some(d) = timer.deadline {
                if d <= now {
                    timer.deadline = None;
                    timer.fired_but_not_observed = true;
                }
            }
        }
    }

    /// Returns an iterator over all timers that have fired since the last time
    /// they were observed through this function.
    ///
    /// Timers that have fired will appear in the order given by their `Enum`
    /// implementation, which in practice means declaration order.
    ///
    /// If you drop the iterator before it's exhausted, any timers you didn't
    /// observe will appear next time you call this.
    pub fn iter_fired(&mut self) -> impl Iterator<Item = E> + '_ {
        self.timers.iter_mut().filter_map(move |(e, timer)| {
            if core::mem::replace(&mut timer.fired_but_not_observed, false) {
                Some(e)
            } else {
                None
            }
        })
    }
}

#[derive(Copy, Clone, Default)]
pub struct Timer {
    deadline: Option<u64>,
    fired_but_not_observed: bool,
}
