//! Ordered lookup from stream id (or push id) to stream.
//!
//! Iteration is ascending by key so the send scheduler's lowest-id-first
//! fairness is deterministic. A reverse search by opaque user handle serves
//! the public API, which addresses streams by handle rather than id.

use std::collections::BTreeMap;

use crate::stream::Stream;

/// Whether a stream id is bidirectional (the two low bits select the four
/// QUIC stream types; types 0 and 1 are bidirectional).
pub fn is_bidi(id: u64) -> bool {
    id & 0x2 == 0
}

#[derive(Debug, Default)]
pub struct StreamMap {
    entries: BTreeMap<u64, Stream>,
    num_requests: usize,
    num_pushes: usize,
}

impl StreamMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            num_requests: 0,
            num_pushes: 0,
        }
    }

    /// Insert under `key`. Replacing a live entry is a caller bug; the old
    /// entry is returned so the caller can notice.
    pub fn add(&mut self, key: u64, stream: Stream) -> Option<Stream> {
        let old = self.entries.insert(key, stream);
        if old.is_none() {
            if is_bidi(key) {
                self.num_requests += 1;
            } else {
                self.num_pushes += 1;
            }
        }
        old
    }

    pub fn find(&self, key: u64) -> Option<&Stream> {
        self.entries.get(&key)
    }

    pub fn find_mut(&mut self, key: u64) -> Option<&mut Stream> {
        self.entries.get_mut(&key)
    }

    pub fn remove(&mut self, key: u64) -> Option<Stream> {
        let removed = self.entries.remove(&key);
        if removed.is_some() {
            if is_bidi(key) {
                self.num_requests -= 1;
            } else {
                self.num_pushes -= 1;
            }
        }
        removed
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    /// The next live key after `prev`, or the first key when `prev` is
    /// `None`. Ascending order.
    pub fn next_after(&self, prev: Option<u64>) -> Option<u64> {
        match prev {
            None => self.entries.keys().next().copied(),
            Some(p) => self.entries.range(p + 1..).next().map(|(k, _)| *k),
        }
    }

    /// Reverse search by opaque user handle.
    pub fn find_by_user(&self, user: u64) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, s)| s.user() == user)
            .map(|(k, _)| *k)
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u64, &mut Stream)> {
        self.entries.iter_mut()
    }

    /// Bidirectional (request) keys currently occupied.
    pub fn num_requests(&self) -> usize {
        self.num_requests
    }

    /// Unidirectional (push) keys currently occupied.
    pub fn num_pushes(&self) -> usize {
        self.num_pushes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
