//! Test hooks consulted inside the sync loops
//!
//! Compiled in only under the `test-hooks` feature so release builds carry
//! no hook plumbing.

/// Points in the sync loops the test suite can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncHook {
    /// Trigger cancellation while processing the second delta page.
    CancelDeltaLoop2,
    /// Make every note upload fail as if the target rejected it.
    NotesRejectedByTarget,
    /// Skip revision items during upload.
    SkipRevisions,
}

#[cfg(feature = "test-hooks")]
#[derive(Default)]
pub struct HookRegistry {
    enabled: std::sync::Mutex<std::collections::HashSet<SyncHook>>,
}

#[cfg(feature = "test-hooks")]
impl HookRegistry {
    pub fn enable(&self, hook: SyncHook) {
        self.enabled.lock().unwrap().insert(hook);
    }

    pub fn disable(&self, hook: SyncHook) {
        self.enabled.lock().unwrap().remove(&hook);
    }

    pub fn is_enabled(&self, hook: SyncHook) -> bool {
        self.enabled.lock().unwrap().contains(&hook)
    }
}
