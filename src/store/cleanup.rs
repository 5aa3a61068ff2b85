//! The single outstanding eviction timer.
use tokio::task::JoinHandle;

/// Holds at most one armed sweep timer. Re-arming aborts the previous one,
/// so sweeps never overlap.
#[derive(Debug, Default)]
pub(crate) struct CleanupTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl CleanupTimer {
    /// Reserve the generation for the timer about to be armed.
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Install a freshly spawned timer, aborting the one it replaces.
    pub(crate) fn arm(&mut self, generation: u64, handle: JoinHandle<()>) {
        debug_assert_eq!(generation, self.generation);
        if let Some(previous) = self.handle.replace(handle) {
            previous.abort();
        }
    }

    /// Called by a timer that fired. Returns false if it was superseded.
    /// The handle is released without aborting: the caller is that task.
    pub(crate) fn take_fired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }

    pub(crate) fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for CleanupTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
