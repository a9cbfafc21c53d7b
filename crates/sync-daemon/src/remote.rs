//! Remote file watcher, backed by an agent injected into the container.
//!
//! The agent binary is uploaded as `/changed` and exec'd with the
//! remote sync root as its only argument. It reports events over
//! stdout, one per line: `<op>|<base>|<relpath>`. The agent never exits
//! during normal operation; its stdout reaching EOF is fatal for the
//! sync session.

use futures::StreamExt;
use std::sync::Arc;
use sync_core::{Change, ChangeOp, Direction, EchoRegistry, IgnoreSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::{ContainerApi, ContainerError};
use crate::watcher::CHANGE_CHANNEL_CAPACITY;

/// Where the agent lands inside the container.
pub const AGENT_REMOTE_PATH: &str = "/changed";

/// Longest agent line we accept before treating the stream as garbage.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Upload the agent binary to the container root.
///
/// The archive holds a single executable entry named `changed`.
pub async fn inject_agent(
    api: &dyn ContainerApi,
    container: &str,
    agent: &[u8],
) -> Result<(), ContainerError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(agent.len() as u64);
    header.set_mode(0o755);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, "changed", agent)?;
    let archive = builder.into_inner()?;

    api.upload(container, archive, "/").await?;
    info!("agent uploaded to {container}:{AGENT_REMOTE_PATH}");
    Ok(())
}

/// A running remote watcher.
pub struct RemoteWatcher {
    /// Filtered change stream, consumed by the orchestrator.
    pub changes: mpsc::Receiver<Change>,
    handle: JoinHandle<()>,
}

impl RemoteWatcher {
    /// Exec the injected agent and stream its events.
    ///
    /// `fatal` receives exactly one message if the agent dies; the
    /// orchestrator ends the session on it.
    pub async fn spawn(
        api: Arc<dyn ContainerApi>,
        container: String,
        remote_root: String,
        ignore: Arc<IgnoreSet>,
        echo: Arc<EchoRegistry>,
        fatal: mpsc::Sender<ContainerError>,
        cancel: CancellationToken,
    ) -> Result<Self, ContainerError> {
        let cmd = vec![AGENT_REMOTE_PATH.to_string(), remote_root.clone()];
        let exec = api.create_exec(&container, &cmd, true).await?;
        let handle = api.start_exec_streaming(exec).await?;

        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(
            handle.stdout,
            remote_root,
            ignore,
            echo,
            tx,
            fatal,
            cancel,
        ));

        Ok(Self {
            changes: rx,
            handle: task,
        })
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run(
    stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    remote_root: String,
    ignore: Arc<IgnoreSet>,
    echo: Arc<EchoRegistry>,
    tx: mpsc::Sender<Change>,
    fatal: mpsc::Sender<ContainerError>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("remote watcher cancelled");
                return;
            }
            line = lines.next() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!("dropping unreadable agent output: {e}");
                continue;
            }
            None => {
                // Normal operation never reaches EOF.
                let _ = fatal.send(ContainerError::Vanished).await;
                return;
            }
        };

        let change = match Change::parse_agent_line(&line) {
            Ok(change) => change,
            Err(e) => {
                warn!("dropping agent line: {e}");
                continue;
            }
        };

        // Removes never cross from the container to the local tree: a
        // misbehaving container must not be able to delete source files.
        if change.op == ChangeOp::Remove {
            debug!("dropping remote remove for {}", change.path);
            continue;
        }

        if change.base != std::path::Path::new(remote_root.as_str()) {
            warn!(
                "agent reported base {} outside sync root {remote_root}, dropping",
                change.base.display()
            );
            continue;
        }

        if ignore.matches(&change.path) {
            continue;
        }
        if echo.take(Direction::Remote, &change.path) {
            debug!("suppressed remote echo for {}", change.path);
            continue;
        }

        if tx.send(change).await.is_err() {
            return;
        }
    }
}
