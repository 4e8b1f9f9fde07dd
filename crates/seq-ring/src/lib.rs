//! A fixed-capacity ring of sequence-numbered entries.
//!
//! Built for per-subscription event queues: entries are retained until the
//! consumer acknowledges them, a full ring evicts from the head (oldest
//! first) while counting what was lost, and a cursor-based iterator supports
//! replaying everything after a given sequence number.
//!
//! The backing `Vec` is allocated once to `capacity` and never reallocated.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

/// A bounded ring of `(seq, T)` entries ordered by strictly increasing `seq`.
pub struct SeqRing<T> {
    /// Backing storage, allocated once during construction.
    buf: Vec<(u64, T)>,
    /// Index into `buf` of the oldest live entry.
    head: usize,
    /// Number of live entries.
    len: usize,
    /// Evictions since the last [`take_dropped`](Self::take_dropped).
    dropped: u64,
}

impl<T> SeqRing<T> {
    /// Create a ring with the given capacity.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SeqRing capacity must be > 0");
        Self {
            buf: Vec::with_capacity(capacity),
            head: 0,
            len: 0,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.capacity()
    }

    /// Evictions recorded since the last `take_dropped`.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Take and reset the eviction counter.
    pub fn take_dropped(&mut self) -> u64 {
        core::mem::take(&mut self.dropped)
    }

    /// Sequence number of the oldest retained entry.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.entry(0).map(|(seq, _)| seq)
    }

    /// Sequence number of the newest retained entry.
    pub fn newest_seq(&self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        self.entry(self.len - 1).map(|(seq, _)| seq)
    }

    /// Append an entry, evicting the oldest if full.
    ///
    /// `seq` must be strictly greater than the newest retained sequence;
    /// the producer owns sequence assignment.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is not strictly increasing.
    pub fn push(&mut self, seq: u64, item: T) {
        if let Some(newest) = self.newest_seq() {
            assert!(seq > newest, "SeqRing sequence must be strictly increasing");
        }
        let cap = self.buf.capacity();
        let tail = (self.head + self.len) % cap;
        if self.len == cap {
            // Full: overwrite the oldest slot.
            self.buf[self.head] = (seq, item);
            self.head = (self.head + 1) % cap;
            self.dropped += 1;
        } else if tail < self.buf.len() {
            // Reuse a previously released slot.
            self.buf[tail] = (seq, item);
            self.len += 1;
        } else {
            // Still filling the initial allocation.
            self.buf.push((seq, item));
            self.len += 1;
        }
    }

    /// Access an entry by logical index, `0` being the oldest.
    fn entry(&self, index: usize) -> Option<(u64, &T)> {
        if index >= self.len {
            return None;
        }
        let cap = self.buf.capacity().max(1);
        let actual = (self.head + index) % cap;
        let (seq, ref item) = self.buf[actual];
        Some((seq, item))
    }

    /// Iterate over retained entries with `seq > after`, oldest first.
    pub fn iter_after(&self, after: u64) -> impl Iterator<Item = (u64, &T)> {
        (0..self.len)
            .filter_map(move |i| self.entry(i))
            .filter(move |(seq, _)| *seq > after)
    }

    /// Release (drop) every entry with `seq <= through`.
    ///
    /// Returns the number of entries released. Sequence ordering means only
    /// a prefix is ever released, so this is a head advance.
    pub fn release_through(&mut self, through: u64) -> usize {
        let cap = self.buf.capacity();
        let mut released = 0;
        while self.len > 0 {
            let (seq, _) = self.entry(0).unwrap();
            if seq > through {
                break;
            }
            self.head = (self.head + 1) % cap;
            self.len -= 1;
            released += 1;
        }
        released
    }
}
