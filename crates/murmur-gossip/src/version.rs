//! Generation and version source.
//!
//! The generation identifies a process incarnation (wall-clock seconds at
//! start); the version is a single monotonic counter shared by the heartbeat
//! and every application-state entry, so `(generation, max_version)` totally
//! orders observations of this node.

use murmur_protocol::state::{Generation, Version};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock seconds as a generation value.
pub fn now_generation() -> Generation {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .min(i32::MAX as u64) as Generation
}

/// Monotonic version counter for self-originated state.
pub struct VersionGenerator {
    current: AtomicI32,
}

impl VersionGenerator {
    pub fn new() -> Self {
        Self {
            current: AtomicI32::new(0),
        }
    }

    /// Next version. Saturates at `i32::MAX` once the counter has been
    /// forced to the top (shutdown announcements must keep winning).
    pub fn next(&self) -> Version {
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_add(1))
            })
            .map(|v| v.saturating_add(1))
            .unwrap_or(i32::MAX)
    }

    pub fn current(&self) -> Version {
        self.current.load(Ordering::SeqCst)
    }

    /// Jump straight to `i32::MAX` so the next published value outranks
    /// anything this node has ever gossiped. Only used for the shutdown
    /// notice; there is no way back.
    pub fn force_highest_possible_version_unsafe(&self) {
        self.current.store(i32::MAX, Ordering::SeqCst);
    }
}

impl Default for VersionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Generation bookkeeping for this node.
pub struct GenerationSource {
    current: AtomicI32,
}

impl GenerationSource {
    pub fn new(generation: Generation) -> Self {
        Self {
            current: AtomicI32::new(generation),
        }
    }

    pub fn current(&self) -> Generation {
        self.current.load(Ordering::SeqCst)
    }

    /// Install the generation chosen at startup.
    pub fn force_to(&self, generation: Generation) {
        self.current.store(generation, Ordering::SeqCst);
    }

    /// Bump to `max(now, current + 1)` for administrative state pushes.
    pub fn force_newer(&self) -> Generation {
        let now = now_generation();
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                Some(now.max(cur.saturating_add(1)))
            })
            .map(|cur| now.max(cur.saturating_add(1)))
            .unwrap_or(now)
    }
}
