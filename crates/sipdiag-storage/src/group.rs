//! User-composed call groups.
//!
//! A group aggregates a handful of calls (typically a dialog and its
//! X-Call-ID relatives) for flow rendering. Calls in a group are locked
//! so rotation eviction cannot pull them out from under the view.

use crate::call::Call;
use crate::message::Message;
use crate::stream::Stream;

/// An ordered, de-duplicated set of call indexes.
#[derive(Debug, Default)]
pub struct CallGroup {
    indexes: Vec<u64>,
}

impl CallGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call indexes in insertion order.
    #[must_use]
    pub fn indexes(&self) -> &[u64] {
        &self.indexes
    }

    /// Number of calls in the group.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.indexes.len()
    }

    /// Whether a call belongs to the group.
    #[must_use]
    pub fn contains(&self, index: u64) -> bool {
        self.indexes.contains(&index)
    }

    /// Adds a call, locking it against rotation.
    pub fn add(&mut self, call: &mut Call) {
        if !self.contains(call.index()) {
            call.set_locked(true);
            self.indexes.push(call.index());
        }
    }

    /// Removes a call, unlocking it again.
    pub fn remove(&mut self, call: &mut Call) {
        if let Some(at) = self.indexes.iter().position(|&i| i == call.index()) {
            self.indexes.remove(at);
            call.set_locked(false);
        }
    }

    fn member_calls<'a>(&'a self, calls: &'a [Call]) -> impl Iterator<Item = &'a Call> + 'a {
        calls.iter().filter(move |c| self.contains(c.index()))
    }

    /// All messages of the group's calls, ordered by arrival time.
    #[must_use]
    pub fn messages<'a>(&'a self, calls: &'a [Call]) -> Vec<&'a Message> {
        let mut messages: Vec<&Message> = self
            .member_calls(calls)
            .flat_map(|c| c.messages().iter())
            .collect();
        messages.sort_by_key(|m| m.timestamp());
        messages
    }

    /// All streams of the group's calls.
    #[must_use]
    pub fn streams<'a>(&'a self, calls: &'a [Call]) -> Vec<&'a Stream> {
        self.member_calls(calls)
            .flat_map(|c| c.streams().iter())
            .collect()
    }
}
