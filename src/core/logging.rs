//! Logging initialization and utilities

use std::collections::HashSet;
use std::hash::Hash;

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable.
///
/// # Example
/// ```
/// thicket::core::logging::init();
/// log::info!("Instancing started");
/// ```
pub fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).try_init();
}

/// Remembers which keys have already been reported.
///
/// Validation runs every time the asset set may have changed, which can be
/// every frame in a live session. The guard keeps one log line per distinct
/// problem until the problem is cleared.
#[derive(Debug)]
pub struct LogOnce<K> {
    seen: HashSet<K>,
}

impl<K: Eq + Hash> LogOnce<K> {
    pub fn new() -> Self {
        Self { seen: HashSet::new() }
    }

    /// Returns true the first time `key` is seen since it was last cleared.
    pub fn first(&mut self, key: K) -> bool {
        self.seen.insert(key)
    }

    /// Forget `key` so the next occurrence is reported again.
    pub fn clear(&mut self, key: &K) {
        self.seen.remove(key);
    }

    /// Forget every key matching the predicate.
    pub fn clear_where(&mut self, mut pred: impl FnMut(&K) -> bool) {
        self.seen.retain(|k| !pred(k));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl<K: Eq + Hash> Default for LogOnce<K> {
    fn default() -> Self {
        Self::new()
    }
}
