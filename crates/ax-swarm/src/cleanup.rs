//! Process-exit cleanup: every PTY, temp dir, and worktree the swarm
//! creates is registered here, and the daemon drains the registry on
//! `SIGINT`/`SIGTERM` or normal shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Idempotent, reentrancy-guarded cleanup registry.
///
/// `cleanup_all` runs each registered action exactly once; a second call
/// (or a re-entrant call from a signal handler racing normal shutdown) is a
/// no-op.
pub struct CleanupRegistry {
    items: Mutex<Vec<(String, CleanupFn)>>,
    draining: AtomicBool,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Register a cleanup action under a label (used only for logging).
    pub fn register(&self, label: impl Into<String>, action: impl FnOnce() + Send + 'static) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((label.into(), Box::new(action)));
    }

    /// Convenience: remove a directory tree at cleanup time.
    pub fn register_dir(&self, path: std::path::PathBuf) {
        let label = format!("dir:{}", path.display());
        self.register(label, move || {
            let _ = std::fs::remove_dir_all(&path);
        });
    }

    pub fn pending(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run every registered action once. Safe to call repeatedly and from
    /// multiple threads; only the first caller drains.
    pub fn cleanup_all(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("cleanup already ran, skipping");
            return;
        }
        let items: Vec<(String, CleanupFn)> = {
            let mut guard = self.items.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for (label, action) in items {
            debug!(item = %label, "cleaning up");
            // A panicking cleanup action must not stop the rest.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)).is_err() {
                warn!(item = %label, "cleanup action panicked");
            }
        }
        self.draining.store(false, Ordering::SeqCst);
    }
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
