//! Admission control: one counter per session, one for the whole process.

/// Counts running tasks against the two ceilings.
///
/// The per-session counters live on the session entries and are passed in;
/// the limiter owns the global counter. Both are only touched under the
/// store lock, by [`ConcurrencyLimiter::try_acquire`] at dispatch and
/// [`ConcurrencyLimiter::release`] at completion.
#[derive(Debug)]
pub(crate) struct ConcurrencyLimiter {
    per_session: usize,
    global: usize,
    global_active: usize,
}

impl ConcurrencyLimiter {
    pub(crate) fn new(per_session: usize, global: usize) -> Self {
        Self { per_session, global, global_active: 0 }
    }

    /// Take one slot for a session if both counters are below their ceilings.
    pub(crate) fn try_acquire(&mut self, session_active: &mut usize) -> bool {
        if *session_active < self.per_session && self.global_active < self.global {
            *session_active += 1;
            self.global_active += 1;
            true
        } else {
            false
        }
    }

    /// Give a slot back. `session_active` is `None` when the session was
    /// removed while the task was running; the global slot is freed anyway.
    pub(crate) fn release(&mut self, session_active: Option<&mut usize>) {
        debug_assert!(self.global_active > 0, "release without acquire");
        self.global_active = self.global_active.saturating_sub(1);
        if let Some(active) = session_active {
            debug_assert!(*active > 0, "session release without acquire");
            *active = active.saturating_sub(1);
        }
    }

    pub(crate) fn global_active(&self) -> usize {
        self.global_active
    }

    pub(crate) fn has_global_headroom(&self) -> bool {
        self.global_active < self.global
    }
}
