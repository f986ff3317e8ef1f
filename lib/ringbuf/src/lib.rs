// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for instrumenting link state machines.
//!
//! Each state machine owns a [`Ringbuf`] of its own trace type and records
//! what it does with [`ringbuf_entry!`]. Unlike a `static` ring buffer, an
//! owned ring lives and dies with the object it instruments, so any number of
//! link sessions (or tests running in parallel) can trace without contending
//! for a shared buffer.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! ## Recording entries
//!
//! ```
//! # use ringbuf::{Ringbuf, ringbuf_entry};
//! #[derive(Copy, Clone, Debug, PartialEq)]
//! enum Trace {
//!     None,
//!     Tick(u64),
//! }
//!
//! struct Machine {
//!     trace: Ringbuf<Trace, 16>,
//! }
//!
//! let mut m = Machine { trace: Ringbuf::new(Trace::None) };
//! ringbuf_entry!(m.trace, Trace::Tick(1));
//! assert_eq!(m.trace.last(), Some(&Trace::Tick(1)));
//! ```
//!
//! When an entry is recorded with an identical payload from the same source
//! line as the most recent entry, the most recent entry's `count` is bumped
//! instead of consuming a new slot. Payloads that carry timestamps will
//! therefore never de-duplicate, which is usually what you want.

#![cfg_attr(not(test), no_std)]

/// Inserts data into a ring buffer owned by some value.
///
/// `ringbuf_entry!(place, expr)` records `expr`, tagged with the current
/// source line, into the [`Ringbuf`] at `place`. `place` must be a mutable
/// place expression such as `self.trace`.
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload first so that it may borrow from the same
        // owner as the buffer.
        let p = $payload;
        $crate::Ringbuf::entry(&mut $buf, line!() as u16, p);
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type. When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.
///
#[derive(Debug, Clone)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    /// Creates an empty ring whose unused slots hold `init`.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // On first use, last is None; treating it as an out-of-range index
        // both skips the reuse check and lands the first entry in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let Some(ent) = self.buffer.get_mut(ndx) else {
            // Zero-sized ring: nothing to record into.
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Returns the payload of the most recent entry.
    pub fn last(&self) -> Option<&T> {
        self.last
            .and_then(|i| self.buffer.get(i))
            .map(|ent| &ent.payload)
    }

    /// Iterates over recorded entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        // The slot after the newest entry holds the oldest one (or is still
        // unused, which the count filter skips).
        let start = self.last.map_or(0, |last| last + 1);
        (0..N)
            .map(move |i| &self.buffer[(start + i) % N])
            .filter(|ent| ent.count != 0)
    }

    /// Iterates over recorded payloads from oldest to newest, expanding
    /// de-duplicated entries.
    pub fn payloads(&self) -> impl Iterator<Item = T> + '_ {
        self.iter().flat_map(|ent| {
            core::iter::repeat(ent.payload).take(ent.count as usize)
        })
    }
}
