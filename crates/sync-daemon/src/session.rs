//! Sync session orchestration.
//!
//! A session wires one local root to one container: waits for the
//! container, resolves roots, injects the agent, spawns both watchers,
//! and drives the transfer engine on a fixed tick. Status lines go out
//! over a channel for the frontend to print.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{posix_join, Change, EchoRegistry, IgnoreSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::container::{ContainerApi, ContainerError, ContainerInfo};
use crate::engine::TransferEngine;
use crate::remote::{inject_agent, RemoteWatcher};
use crate::watcher::LocalWatcher;

/// Capacity of the status line channel.
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Suppressions older than this are presumed leaked (the mirrored write
/// failed, or the event source dropped the echo) and are swept.
const ECHO_MAX_AGE: Duration = Duration::from_secs(30);

/// Consecutive container inspection failures tolerated while waiting
/// for the container to start.
const MAX_INSPECT_FAILURES: u32 = 5;

/// A running sync session.
pub struct SyncSession {
    /// Human-readable progress lines: transfer summaries, per-file
    /// lines in debug mode, `error:`-prefixed failures.
    pub status: mpsc::Receiver<String>,
    handle: JoinHandle<()>,
}

impl SyncSession {
    /// Bring the session up and start the tick loop.
    ///
    /// Fails fast on anything the session cannot run without: container
    /// never inspectable, unreadable ignore file, missing agent binary.
    pub async fn start(
        api: Arc<dyn ContainerApi>,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let info = wait_for_running(api.as_ref(), &config.container, &cancel).await?;

        let remote_root = resolve_remote_root(&info.working_dir, &config.remote);
        let local_root = canonical_local_root(&config.local)?;
        info!(
            "syncing {} <-> {}:{remote_root}",
            local_root.display(),
            config.container
        );

        let ignore = Arc::new(IgnoreSet::discover(&local_root)?);
        let echo = Arc::new(EchoRegistry::new());

        let agent = tokio::fs::read(&config.agent_binary)
            .await
            .with_context(|| {
                format!("reading agent binary {}", config.agent_binary.display())
            })?;
        inject_agent(api.as_ref(), &config.container, &agent).await?;

        let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);

        let remote = RemoteWatcher::spawn(
            Arc::clone(&api),
            config.container.clone(),
            remote_root.clone(),
            Arc::clone(&ignore),
            Arc::clone(&echo),
            fatal_tx,
            cancel.clone(),
        )
        .await?;
        let local = LocalWatcher::spawn(
            local_root.clone(),
            ignore,
            Arc::clone(&echo),
            &config,
            cancel.clone(),
        );

        let engine = TransferEngine::new(
            api,
            config.container.clone(),
            local_root,
            remote_root,
            Arc::clone(&echo),
            status_tx.clone(),
            config.debug,
        );

        let handle = tokio::spawn(tick_loop(
            engine,
            local,
            remote,
            echo,
            fatal_rx,
            status_tx,
            config.tick_interval,
            cancel,
        ));

        Ok(Self {
            status: status_rx,
            handle,
        })
    }

    /// Wait for the tick loop to finish.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Poll container state until it is running.
async fn wait_for_running(
    api: &dyn ContainerApi,
    container: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<ContainerInfo> {
    let mut failures = 0u32;
    loop {
        match api.inspect_container(container).await {
            Ok(info) if info.running => return Ok(info),
            Ok(_) => {
                failures = 0;
                info!("waiting for container {container} to start");
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_INSPECT_FAILURES {
                    return Err(e).context(format!("container {container} not inspectable"));
                }
                warn!("inspecting container {container} failed ({failures}): {e}");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                anyhow::bail!("cancelled while waiting for container {container}");
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}

/// Resolve the configured remote root to an absolute container path.
///
/// A relative root is anchored at the container's working directory;
/// containers without one anchor at `/`.
fn resolve_remote_root(working_dir: &str, remote: &str) -> String {
    if remote.starts_with('/') {
        let trimmed = remote.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    } else {
        let base = if working_dir.is_empty() { "/" } else { working_dir };
        posix_join(base, remote.trim_end_matches('/'))
    }
}

/// Canonicalize the local root, dereferencing symlinks, so the watcher
/// and the native event source agree on the paths they report.
fn canonical_local_root(local: &std::path::Path) -> anyhow::Result<PathBuf> {
    std::fs::canonicalize(local)
        .with_context(|| format!("resolving local root {}", local.display()))
}

#[allow(clippy::too_many_arguments)]
async fn tick_loop(
    engine: TransferEngine,
    mut local: LocalWatcher,
    mut remote: RemoteWatcher,
    echo: Arc<EchoRegistry>,
    mut fatal_rx: mpsc::Receiver<ContainerError>,
    status_tx: mpsc::Sender<String>,
    tick_interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(tick_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("session cancelled");
                break;
            }
            Some(err) = fatal_rx.recv() => {
                let _ = status_tx
                    .send(format!("error: remote watcher failed: {err}"))
                    .await;
                cancel.cancel();
                break;
            }
            _ = tick.tick() => {
                let outbound = drain(&mut local.changes);
                let inbound = drain(&mut remote.changes);
                if outbound.is_empty() && inbound.is_empty() {
                    // Idle ticks double as suppression housekeeping.
                    let swept = echo.sweep_stale(ECHO_MAX_AGE);
                    if swept > 0 {
                        debug!("swept {swept} stale echo suppression(s)");
                    }
                } else {
                    // A flush can sit in transfer retries for a while;
                    // shutdown must not wait those out.
                    tokio::select! {
                        _ = engine.flush(outbound, inbound) => {}
                        _ = cancel.cancelled() => {
                            debug!("session cancelled mid-flush");
                            break;
                        }
                    }
                }
            }
        }
    }

    local.abort();
    remote.abort();
}

fn drain(rx: &mut mpsc::Receiver<Change>) -> Vec<Change> {
    let mut changes = Vec::new();
    while let Ok(change) = rx.try_recv() {
        changes.push(change);
    }
    changes
}
