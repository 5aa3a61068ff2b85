//! Work items for the dispatch control loop.
//!
//! Lifecycle events do not call into each other; they push the sessions
//! that may have become dispatchable here and the store drains the queue
//! in one loop while holding its lock.
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
pub(crate) struct DispatchQueue {
    pending: VecDeque<String>,
    queued: HashSet<String>,
}

impl DispatchQueue {
    /// Schedule a dispatch pass for one session. Already pending ids are not duplicated.
    pub(crate) fn push(&mut self, session_id: &str) {
        if self.queued.insert(session_id.to_string()) {
            self.pending.push_back(session_id.to_string());
        }
    }

    /// Schedule every session, in the given order.
    pub(crate) fn push_all<'a>(&mut self, session_ids: impl IntoIterator<Item = &'a str>) {
        for id in session_ids {
            self.push(id);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<String> {
        let id = self.pending.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.queued.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
