// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Event Counters
//!
//! This crate provides the [`Count`] trait, which defines a countable event,
//! and the [`count!`] macro, which counts one.
//!
//! Counters here belong to whoever owns the state machine that records
//! them, next to its ringbuf, rather than living in a static; a link session
//! holds its own set and is free to be rebuilt or run alongside others.
//! Counting therefore takes the counters by `&mut`.

#![cfg_attr(not(test), no_std)]

/// A countable event.
pub trait Count {
    /// A type that counts occurrences of each event.
    type Counters;

    /// Initializer for a new set of counters.
    ///
    /// The value of each counter in this constant should be 0.
    const NEW_COUNTERS: Self::Counters;

    /// Increment the counter for this event.
    fn count(&self, counters: &mut Self::Counters);
}

/// Count an event.
///
/// This is a very small wrapper around the [`Count::count`] method.
#[macro_export]
macro_rules! count {
    ($counters:expr, $event:expr) => {
        // Evaluate both counters and event, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (e, ctrs) = ($event, &mut $counters);
        // Invoke these functions using slightly weird syntax to avoid
        // accidentally calling a _different_ routine called count.
        $crate::Count::count(&e, ctrs);
    };
}
