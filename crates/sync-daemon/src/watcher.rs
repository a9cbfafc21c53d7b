//! Local file watcher.
//!
//! Emits debounced `Change`s for the local sync root into a bounded
//! channel. Two modes share one loop body: polling (snapshot + diff on
//! a timer, portable) and native (notify events trigger a stabilization
//! pass that re-snapshots until the tree stops moving, which collapses
//! editor save-swap bursts into one logical set).

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::{Change, Direction, EchoRegistry, IgnoreSet, Snapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{SyncConfig, WatchMode};

/// Capacity of the change channel. Large enough that batches flushing
/// every second keep up; when it fills, the watcher blocks and the
/// backpressure reaches the event source.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Debounce window applied to native events before a stabilization pass.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Maximum snapshot passes per event burst.
const STABILIZATION_MAX_PASSES: usize = 10;

/// Cooldown between stabilization passes.
const STABILIZATION_COOLDOWN: Duration = Duration::from_millis(200);

/// How long a directory stays "hot" after a native event.
const HOT_WINDOW: Duration = Duration::from_secs(600);

/// A running local watcher.
pub struct LocalWatcher {
    /// Filtered change stream, consumed by the orchestrator.
    pub changes: mpsc::Receiver<Change>,
    handle: JoinHandle<()>,
}

impl LocalWatcher {
    /// Start watching `root` in the mode the config selects.
    pub fn spawn(
        root: PathBuf,
        ignore: Arc<IgnoreSet>,
        echo: Arc<EchoRegistry>,
        config: &SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        let watch_loop = WatchLoop {
            root,
            ignore,
            echo,
            tx,
            prev: Snapshot::empty(),
            hot: HashMap::new(),
        };

        let fallback = config.fallback_sync_interval;
        let handle = match config.watch_mode {
            WatchMode::Poll => {
                let interval = config.poll_interval;
                tokio::spawn(watch_loop.run_poll(interval, cancel))
            }
            WatchMode::Native => tokio::spawn(watch_loop.run_native(fallback, cancel)),
        };

        Self {
            changes: rx,
            handle,
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

struct WatchLoop {
    root: PathBuf,
    ignore: Arc<IgnoreSet>,
    echo: Arc<EchoRegistry>,
    tx: mpsc::Sender<Change>,
    prev: Snapshot,
    /// Directories with a native event in the last `HOT_WINDOW`.
    hot: HashMap<PathBuf, Instant>,
}

impl WatchLoop {
    /// Polling mode: snapshot + diff on every tick.
    ///
    /// The first tick diffs against the empty snapshot, which produces
    /// the initial upload set.
    async fn run_poll(mut self, interval: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if !self.resync_root().await {
                break;
            }
        }
        debug!("local watcher (poll) stopped");
    }

    /// Native mode: notify events feed bursts; each burst triggers a
    /// stabilization pass. Hot directories are optionally re-synced on
    /// the fallback interval to cover event sources that drop events.
    async fn run_native(mut self, fallback: Option<Duration>, cancel: CancellationToken) {
        let (burst_tx, mut burst_rx) = mpsc::unbounded_channel();

        let mut debouncer = match new_debouncer(
            DEBOUNCE_WINDOW,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events.into_iter().map(|e| e.path).collect();
                    let _ = burst_tx.send(paths);
                }
                Err(e) => error!("file watcher error: {e}"),
            },
        ) {
            Ok(debouncer) => debouncer,
            Err(e) => {
                error!("failed to create file watcher: {e}");
                return;
            }
        };
        if let Err(e) = debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)
        {
            error!("failed to watch {}: {e}", self.root.display());
            return;
        }

        // Initial pass against the empty snapshot.
        if !self.stabilize().await {
            return;
        }

        let mut fallback_tick =
            tokio::time::interval(fallback.unwrap_or(Duration::from_secs(3600)));
        fallback_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        fallback_tick.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                burst = burst_rx.recv() => {
                    let Some(paths) = burst else { break };
                    self.mark_hot(paths);
                    while let Ok(more) = burst_rx.try_recv() {
                        self.mark_hot(more);
                    }
                    if !self.stabilize().await {
                        break;
                    }
                }
                _ = fallback_tick.tick(), if fallback.is_some() => {
                    if !self.fallback_resync().await {
                        break;
                    }
                }
            }
        }
        drop(debouncer);
        debug!("local watcher (native) stopped");
    }

    /// One full snapshot + diff + dispatch. Returns false when the
    /// orchestrator is gone.
    async fn resync_root(&mut self) -> bool {
        let Some(cur) = self.snapshot(self.root.clone()).await else {
            return true;
        };
        let changes = self.prev.diff(&cur, &self.root);
        self.prev = cur;
        self.dispatch(changes).await
    }

    /// Repeated snapshot + diff until a pass finds the tree unchanged,
    /// or the pass cap elapses. Per path, only the last op of the burst
    /// survives.
    async fn stabilize(&mut self) -> bool {
        let mut collapsed: HashMap<String, Change> = HashMap::new();

        for pass in 0..STABILIZATION_MAX_PASSES {
            let Some(cur) = self.snapshot(self.root.clone()).await else {
                break;
            };
            let delta = self.prev.diff(&cur, &self.root);
            self.prev = cur;
            if delta.is_empty() {
                break;
            }
            debug!("stabilization pass {pass}: {} change(s)", delta.len());
            for change in delta {
                collapsed.insert(change.path.clone(), change);
            }
            tokio::time::sleep(STABILIZATION_COOLDOWN).await;
        }

        self.dispatch(collapsed.into_values().collect()).await
    }

    /// Re-walk every hot directory even without fresh events.
    async fn fallback_resync(&mut self) -> bool {
        let now = Instant::now();
        self.hot
            .retain(|_, touched| now.duration_since(*touched) < HOT_WINDOW);

        // Hot dirs nested inside other hot dirs are covered by the
        // outer walk.
        let dirs: Vec<PathBuf> = self
            .hot
            .keys()
            .filter(|dir| {
                !self
                    .hot
                    .keys()
                    .any(|other| *other != **dir && dir.starts_with(other))
            })
            .cloned()
            .collect();

        for dir in dirs {
            debug!("fallback resync of {}", dir.display());
            let cur = match self.snapshot(dir.clone()).await {
                Some(cur) => cur,
                // Directory gone; its files diff away as removes.
                None => Snapshot::empty(),
            };
            let delta = self.prev.subtree(&dir).diff(&cur, &self.root);
            self.prev.replace_subtree(&dir, cur);
            if !self.dispatch(delta).await {
                return false;
            }
        }
        true
    }

    async fn snapshot(&self, root: PathBuf) -> Option<Snapshot> {
        let label = root.clone();
        match tokio::task::spawn_blocking(move || Snapshot::take(&root)).await {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(e)) => {
                // Transient per the error policy: report and keep watching.
                warn!("snapshot of {} failed: {e}", label.display());
                None
            }
            Err(e) => {
                error!("snapshot task panicked: {e}");
                None
            }
        }
    }

    fn mark_hot(&mut self, paths: Vec<PathBuf>) {
        let now = Instant::now();
        for path in paths {
            let dir = if path.is_dir() {
                path
            } else {
                match path.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => continue,
                }
            };
            self.hot.insert(dir, now);
        }
    }

    /// Filter candidates through the ignore set and the echo registry,
    /// then forward. Returns false when the receiver is gone.
    async fn dispatch(&mut self, changes: Vec<Change>) -> bool {
        for change in changes {
            if self.ignore.matches(&change.path) {
                continue;
            }
            if self.echo.take(Direction::Local, &change.path) {
                debug!("suppressed echo for {}", change.path);
                continue;
            }
            if self.tx.send(change).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use sync_core::ChangeOp;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::new("c1", "/tmp", "/app");
        config.watch_mode = WatchMode::Poll;
        config.poll_interval = Duration::from_millis(50);
        config
    }

    fn spawn_poll_watcher(
        root: &std::path::Path,
        echo: Arc<EchoRegistry>,
    ) -> (LocalWatcher, CancellationToken) {
        let ignore = Arc::new(IgnoreSet::discover(root).unwrap());
        let cancel = CancellationToken::new();
        let watcher = LocalWatcher::spawn(
            root.to_path_buf(),
            ignore,
            echo,
            &test_config(),
            cancel.clone(),
        );
        (watcher, cancel)
    }

    async fn next_change(watcher: &mut LocalWatcher) -> Change {
        timeout(Duration::from_secs(5), watcher.changes.recv())
            .await
            .expect("timed out waiting for change")
            .expect("watcher channel closed")
    }

    #[tokio::test]
    async fn test_poll_watcher_emits_initial_adds() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.txt"), "hi").unwrap();

        let (mut watcher, cancel) = spawn_poll_watcher(dir.path(), Arc::new(EchoRegistry::new()));

        let change = next_change(&mut watcher).await;
        assert_eq!(change.op, ChangeOp::Add);
        assert_eq!(change.path, "src/a.txt");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_poll_watcher_detects_create_and_remove() {
        let dir = TempDir::new().unwrap();
        let (mut watcher, cancel) = spawn_poll_watcher(dir.path(), Arc::new(EchoRegistry::new()));

        let path = dir.path().join("new.txt");
        fs::write(&path, "x").unwrap();
        let change = next_change(&mut watcher).await;
        assert_eq!(change.op, ChangeOp::Add);
        assert_eq!(change.path, "new.txt");

        fs::remove_file(&path).unwrap();
        let change = next_change(&mut watcher).await;
        assert_eq!(change.op, ChangeOp::Remove);
        assert_eq!(change.path, "new.txt");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_poll_watcher_honors_ignore_rules() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".syncignore"), "*.log\n").unwrap();

        let (mut watcher, cancel) = spawn_poll_watcher(dir.path(), Arc::new(EchoRegistry::new()));
        // The ignore file itself is watched like any other file.
        let first = next_change(&mut watcher).await;
        assert_eq!(first.path, ".syncignore");

        fs::write(dir.path().join("debug.log"), "noise").unwrap();
        fs::write(dir.path().join("kept.txt"), "signal").unwrap();

        let change = next_change(&mut watcher).await;
        assert_eq!(change.path, "kept.txt", "ignored path must not be forwarded");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_native_watcher_collapses_rapid_rewrites() {
        let dir = TempDir::new().unwrap();
        let ignore = Arc::new(IgnoreSet::discover(dir.path()).unwrap());
        let cancel = CancellationToken::new();
        let mut config = SyncConfig::new("c1", "/tmp", "/app");
        config.watch_mode = WatchMode::Native;
        let mut watcher = LocalWatcher::spawn(
            dir.path().to_path_buf(),
            ignore,
            Arc::new(EchoRegistry::new()),
            &config,
            cancel.clone(),
        );
        // Let the event source register before writing.
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Save-swap style burst, well inside the debounce window.
        let path = dir.path().join("burst.txt");
        for contents in ["v1", "v2", "v3"] {
            fs::write(&path, contents).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let change = next_change(&mut watcher).await;
        assert_eq!(change.op, ChangeOp::Add);
        assert_eq!(change.path, "burst.txt");

        // The whole burst collapses into that single add.
        let extra = timeout(Duration::from_millis(1200), watcher.changes.recv()).await;
        assert!(extra.is_err(), "burst produced a second change: {extra:?}");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_poll_watcher_swallows_blocked_echo() {
        let dir = TempDir::new().unwrap();
        let echo = Arc::new(EchoRegistry::new());
        let (mut watcher, cancel) = spawn_poll_watcher(dir.path(), Arc::clone(&echo));

        // The engine blocks before its write becomes observable.
        echo.block(Direction::Local, "mirrored.txt");
        fs::write(dir.path().join("mirrored.txt"), "from remote").unwrap();

        // The mirrored write is swallowed; only the real edit arrives.
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(dir.path().join("real.txt"), "local edit").unwrap();

        let change = next_change(&mut watcher).await;
        assert_eq!(change.path, "real.txt");

        cancel.cancel();
    }
}
