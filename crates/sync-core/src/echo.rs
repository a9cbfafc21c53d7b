//! Echo suppression for the transfer engine's own writes.
//!
//! Every file the engine writes on one side will shortly be reported by
//! that side's watcher as a fresh change. Re-propagating it would bounce
//! the file back and forth forever. The registry holds a counter per
//! path and direction: the engine increments before a write becomes
//! observable, the watcher decrements and swallows the matching event.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Which watcher a suppression entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The watcher on the developer's machine.
    Local,
    /// The agent-backed watcher inside the container.
    Remote,
}

#[derive(Debug)]
struct Entry {
    count: u32,
    /// Last time the counter was incremented; drives the stale sweep.
    touched: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    local: HashMap<String, Entry>,
    remote: HashMap<String, Entry>,
}

impl Counters {
    fn side(&mut self, direction: Direction) -> &mut HashMap<String, Entry> {
        match direction {
            Direction::Local => &mut self.local,
            Direction::Remote => &mut self.remote,
        }
    }
}

/// Per-direction counters guarded by a single mutex.
///
/// Only O(1) map work happens under the lock, so it is safe to call
/// from both async tasks and blocking extraction code.
#[derive(Debug, Default)]
pub struct EchoRegistry {
    counters: Mutex<Counters>,
}

impl EchoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mask the next watcher event for `path` in `direction`.
    ///
    /// Must be called before the corresponding write is observable by
    /// that watcher.
    pub fn block(&self, direction: Direction, path: &str) {
        let mut counters = self.counters.lock().expect("echo registry mutex poisoned");
        let entry = counters
            .side(direction)
            .entry(path.to_string())
            .or_insert(Entry {
                count: 0,
                touched: Instant::now(),
            });
        entry.count += 1;
        entry.touched = Instant::now();
    }

    /// Consume one suppression for `path`, if any.
    ///
    /// Returns true when the caller should swallow the event.
    pub fn take(&self, direction: Direction, path: &str) -> bool {
        let mut counters = self.counters.lock().expect("echo registry mutex poisoned");
        let side = counters.side(direction);
        match side.get_mut(path) {
            Some(entry) if entry.count > 0 => {
                entry.count -= 1;
                if entry.count == 0 {
                    side.remove(path);
                }
                true
            }
            _ => false,
        }
    }

    /// Whether any suppression is outstanding in either direction.
    pub fn is_empty(&self) -> bool {
        let counters = self.counters.lock().expect("echo registry mutex poisoned");
        counters.local.is_empty() && counters.remote.is_empty()
    }

    /// Drop entries not touched within `max_age`.
    ///
    /// Filesystems coalesce events, so a blocked write sometimes never
    /// produces the matching watcher event and the counter would pin a
    /// future real edit. The orchestrator calls this on idle ticks.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let mut counters = self.counters.lock().expect("echo registry mutex poisoned");
        let counters = &mut *counters;
        let now = Instant::now();
        let mut cleared = 0;
        for side in [&mut counters.local, &mut counters.remote] {
            side.retain(|path, entry| {
                let stale = now.duration_since(entry.touched) >= max_age;
                if stale {
                    debug!("clearing stale echo counter for {path} (count {})", entry.count);
                    cleared += 1;
                }
                !stale
            });
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_without_block_passes_through() {
        let registry = EchoRegistry::new();
        assert!(!registry.take(Direction::Local, "src/a.txt"));
    }

    #[test]
    fn test_block_take_one_for_one() {
        let registry = EchoRegistry::new();
        registry.block(Direction::Local, "src/a.txt");

        assert!(registry.take(Direction::Local, "src/a.txt"));
        // Balanced: a second event for the same path is a real edit.
        assert!(!registry.take(Direction::Local, "src/a.txt"));
    }

    #[test]
    fn test_directions_are_independent() {
        let registry = EchoRegistry::new();
        registry.block(Direction::Remote, "src/a.txt");

        assert!(!registry.take(Direction::Local, "src/a.txt"));
        assert!(registry.take(Direction::Remote, "src/a.txt"));
    }

    #[test]
    fn test_counters_accumulate() {
        let registry = EchoRegistry::new();
        registry.block(Direction::Local, "a");
        registry.block(Direction::Local, "a");

        assert!(registry.take(Direction::Local, "a"));
        assert!(registry.take(Direction::Local, "a"));
        assert!(!registry.take(Direction::Local, "a"));
    }

    #[test]
    fn test_sweep_clears_stale_entries() {
        let registry = EchoRegistry::new();
        registry.block(Direction::Local, "a");
        registry.block(Direction::Remote, "b");

        // Nothing is older than an hour yet.
        assert_eq!(registry.sweep_stale(Duration::from_secs(3600)), 0);
        assert!(!registry.is_empty());

        // Everything is older than zero.
        assert_eq!(registry.sweep_stale(Duration::ZERO), 2);
        assert!(registry.is_empty());
        assert!(!registry.take(Direction::Local, "a"));
    }
}
