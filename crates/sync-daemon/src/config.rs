//! Session configuration.
//!
//! Built from CLI arguments in `main.rs`; the intervals carry
//! production defaults and exist as fields so tests can shrink them.

use std::path::PathBuf;
use std::time::Duration;

/// How the local watcher observes the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Platform-native event source with a stabilization pass.
    Native,
    /// Portable snapshot polling.
    Poll,
}

/// Everything one sync session needs to start.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Container identifier (id or name).
    pub container: String,
    /// Local sync root; may be relative, resolved at session start with
    /// symlinks dereferenced.
    pub local: PathBuf,
    /// Remote sync root; if relative, resolved against the container's
    /// working directory.
    pub remote: String,
    /// Path of the pre-built agent binary uploaded into the container.
    pub agent_binary: PathBuf,
    /// Local watcher mode.
    pub watch_mode: WatchMode,
    /// Force-resync interval for hot directories; None disables.
    pub fallback_sync_interval: Option<Duration>,
    /// Emit per-file transfer lines.
    pub debug: bool,
    /// Batch flush interval of the transfer engine.
    pub tick_interval: Duration,
    /// Snapshot interval of the polling watcher.
    pub poll_interval: Duration,
}

impl SyncConfig {
    /// Production defaults for the given container and roots.
    pub fn new(container: &str, local: impl Into<PathBuf>, remote: &str) -> Self {
        Self {
            container: container.to_string(),
            local: local.into(),
            remote: remote.to_string(),
            agent_binary: PathBuf::from("/usr/local/lib/sync-agent/changed"),
            watch_mode: WatchMode::Native,
            fallback_sync_interval: None,
            debug: false,
            tick_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(700),
        }
    }
}
