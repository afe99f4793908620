//! Key-value state behind the dedup cache and the session manager.
//!
//! The in-memory implementation serializes every operation on one mutex, so
//! [`StateStore::update`] is an atomic read-modify-write even when turns run
//! on different runtime threads.

use std::{collections::HashMap, sync::Mutex};

/// Milliseconds since the Unix epoch.
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Storage capability used by [`crate::dedup::DedupCache`] and
/// [`crate::session::SessionManager`].
pub trait StateStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V);

    fn delete(&self, key: &str) -> Option<V>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry for which `keep` returns false. Returns how many
    /// entries were removed.
    fn sweep(&self, keep: &dyn Fn(&V) -> bool) -> usize;

    /// Replace the entry for `key` with `f(current)` and return the new value.
    fn update(&self, key: &str, f: &mut dyn FnMut(Option<&V>) -> V) -> V;
}

/// Single-process store backed by a `HashMap`.
pub struct MemoryStore<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> StateStore<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key)
    }

    fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    fn sweep(&self, keep: &dyn Fn(&V) -> bool) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, value| keep(value));
        before - entries.len()
    }

    fn update(&self, key: &str, f: &mut dyn FnMut(Option<&V>) -> V) -> V {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let next = f(entries.get(key));
        entries.insert(key.to_string(), next.clone());
        next
    }
}
