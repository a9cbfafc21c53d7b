//! Container transport abstraction.
//!
//! Implementations:
//! - `DockerCli` - Shells out to the `docker` binary (production)
//! - `FakeContainer` - In-memory container for tests
//!
//! The trait mirrors the small slice of the container engine API the
//! synchronizer needs: prepared execs that can be started streaming or
//! detached, exec inspection (the only signal when an exec dies without
//! closing stdout), tar upload, and container inspection.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;

/// Identifier of a prepared exec, scoped to the `ContainerApi` instance
/// that created it.
pub type ExecId = u64;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("container {0} not found")]
    NotFound(String),

    #[error("unknown exec id {0}")]
    UnknownExec(ExecId),

    #[error("exec exited with status {0}")]
    NonZeroExit(i64),

    #[error("exec terminated without reporting a status")]
    Vanished,

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected inspect output: {0}")]
    Inspect(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result of inspecting a started exec.
#[derive(Debug, Clone)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

/// Result of inspecting a container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub running: bool,
    /// The container's configured working directory; may be empty.
    pub working_dir: String,
}

/// A started streaming exec: its stdout plus a completion signal.
pub struct ExecHandle {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves when the exec finishes. A dropped sender means the exec
    /// vanished without reporting a status.
    pub exit: oneshot::Receiver<Result<(), ContainerError>>,
}

impl ExecHandle {
    /// Await completion, discarding any unread stdout.
    pub async fn wait(self) -> Result<(), ContainerError> {
        match self.exit.await {
            Ok(result) => result,
            Err(_) => Err(ContainerError::Vanished),
        }
    }
}

/// The container engine operations the synchronizer consumes.
///
/// Any call may fail transiently; retry policy lives with the callers.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Prepare an exec without starting it.
    async fn create_exec(
        &self,
        container: &str,
        cmd: &[String],
        attach_stdout: bool,
    ) -> Result<ExecId, ContainerError>;

    /// Start a prepared exec and stream its stdout.
    async fn start_exec_streaming(&self, exec: ExecId) -> Result<ExecHandle, ContainerError>;

    /// Start a prepared exec fire-and-forget.
    async fn start_exec_detached(&self, exec: ExecId) -> Result<(), ContainerError>;

    /// Report whether a started exec is still running and how it exited.
    async fn inspect_exec(&self, exec: ExecId) -> Result<ExecStatus, ContainerError>;

    /// Stream a tar archive into the container, extracted at `target`.
    async fn upload(
        &self,
        container: &str,
        archive: Vec<u8>,
        target: &str,
    ) -> Result<(), ContainerError>;

    /// Inspect the container's run state and working directory.
    async fn inspect_container(&self, container: &str) -> Result<ContainerInfo, ContainerError>;
}

// ============================================================================
// DockerCli
// ============================================================================

struct PreparedExec {
    container: String,
    cmd: Vec<String>,
    attach_stdout: bool,
    status: Arc<Mutex<ExecStatus>>,
}

/// Production transport backed by the `docker` CLI.
///
/// Exec status is tracked in-process: the child's exit is recorded as
/// soon as it is reaped, which is what `inspect_exec` serves. That is
/// the same signal the engine API would give us, without depending on a
/// daemon socket client.
pub struct DockerCli {
    binary: PathBuf,
    next_exec: AtomicU64,
    execs: Mutex<HashMap<ExecId, PreparedExec>>,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use an alternative CLI binary (e.g. `podman`).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            next_exec: AtomicU64::new(1),
            execs: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }

    fn prepared(&self, exec: ExecId) -> Result<(String, Vec<String>, bool, Arc<Mutex<ExecStatus>>), ContainerError> {
        let execs = self.execs.lock().expect("exec table mutex poisoned");
        let prepared = execs.get(&exec).ok_or(ContainerError::UnknownExec(exec))?;
        Ok((
            prepared.container.clone(),
            prepared.cmd.clone(),
            prepared.attach_stdout,
            Arc::clone(&prepared.status),
        ))
    }

    fn record_exit(status: &Arc<Mutex<ExecStatus>>, code: Option<i64>, error: Option<String>) {
        let mut status = status.lock().expect("exec status mutex poisoned");
        status.running = false;
        status.exit_code = code;
        status.error = error;
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerApi for DockerCli {
    async fn create_exec(
        &self,
        container: &str,
        cmd: &[String],
        attach_stdout: bool,
    ) -> Result<ExecId, ContainerError> {
        let id = self.next_exec.fetch_add(1, Ordering::Relaxed);
        let mut execs = self.execs.lock().expect("exec table mutex poisoned");
        execs.insert(
            id,
            PreparedExec {
                container: container.to_string(),
                cmd: cmd.to_vec(),
                attach_stdout,
                status: Arc::new(Mutex::new(ExecStatus {
                    running: false,
                    exit_code: None,
                    error: None,
                })),
            },
        );
        Ok(id)
    }

    async fn start_exec_streaming(&self, exec: ExecId) -> Result<ExecHandle, ContainerError> {
        let (container, cmd, attach_stdout, status) = self.prepared(exec)?;

        let mut command = self.command();
        command.arg("exec").arg(&container).args(&cmd);
        if attach_stdout {
            command.stdout(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|source| ContainerError::Spawn {
            tool: self.binary.display().to_string(),
            source,
        })?;
        status.lock().expect("exec status mutex poisoned").running = true;

        let stdout: Box<dyn AsyncRead + Send + Unpin> = match child.stdout.take() {
            Some(stdout) => Box::new(stdout),
            None => Box::new(tokio::io::empty()),
        };

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = match child.wait().await {
                Ok(exit) => {
                    let code = exit.code().map(i64::from);
                    DockerCli::record_exit(&status, code, None);
                    if exit.success() {
                        Ok(())
                    } else {
                        Err(ContainerError::NonZeroExit(code.unwrap_or(-1)))
                    }
                }
                Err(e) => {
                    DockerCli::record_exit(&status, None, Some(e.to_string()));
                    Err(ContainerError::Io(e))
                }
            };
            let _ = exit_tx.send(result);
        });

        Ok(ExecHandle {
            stdout,
            exit: exit_rx,
        })
    }

    async fn start_exec_detached(&self, exec: ExecId) -> Result<(), ContainerError> {
        let (container, cmd, _, status) = self.prepared(exec)?;

        let mut child = self
            .command()
            .arg("exec")
            .arg("--detach")
            .arg(&container)
            .args(&cmd)
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                tool: self.binary.display().to_string(),
                source,
            })?;
        status.lock().expect("exec status mutex poisoned").running = true;

        // Reap in the background so the child never lingers as a zombie.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(exit) => {
                    let code = exit.code().map(i64::from);
                    DockerCli::record_exit(&status, code, None);
                    if !exit.success() {
                        debug!("detached exec exited with {:?}", code);
                    }
                }
                Err(e) => DockerCli::record_exit(&status, None, Some(e.to_string())),
            }
        });
        Ok(())
    }

    async fn inspect_exec(&self, exec: ExecId) -> Result<ExecStatus, ContainerError> {
        let (_, _, _, status) = self.prepared(exec)?;
        let status = status.lock().expect("exec status mutex poisoned");
        Ok(status.clone())
    }

    async fn upload(
        &self,
        container: &str,
        archive: Vec<u8>,
        target: &str,
    ) -> Result<(), ContainerError> {
        let mut child = self
            .command()
            .arg("cp")
            .arg("-")
            .arg(format!("{container}:{target}"))
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                tool: self.binary.display().to_string(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&archive).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ContainerError::CommandFailed {
                command: "docker cp".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerInfo, ContainerError> {
        let output = self
            .command()
            .arg("inspect")
            .arg("--type")
            .arg("container")
            .arg(container)
            .stdout(Stdio::piped())
            .output()
            .await
            .map_err(|source| ContainerError::Spawn {
                tool: self.binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ContainerError::NotFound(container.to_string()));
        }

        let inspected: Vec<InspectedContainer> = serde_json::from_slice(&output.stdout)
            .map_err(|e| ContainerError::Inspect(e.to_string()))?;
        let inspected = inspected
            .into_iter()
            .next()
            .ok_or_else(|| ContainerError::NotFound(container.to_string()))?;

        Ok(ContainerInfo {
            running: inspected.state.running,
            working_dir: inspected.config.working_dir,
        })
    }
}

#[derive(Debug, Deserialize)]
struct InspectedContainer {
    #[serde(rename = "State")]
    state: InspectedState,
    #[serde(rename = "Config")]
    config: InspectedConfig,
}

#[derive(Debug, Deserialize)]
struct InspectedState {
    #[serde(rename = "Running")]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct InspectedConfig {
    #[serde(rename = "WorkingDir", default)]
    working_dir: String,
}

// ============================================================================
// FakeContainer
// ============================================================================

/// A file inside the fake container.
#[derive(Debug, Clone)]
pub struct FakeFile {
    pub contents: Vec<u8>,
    pub mode: u32,
}

#[derive(Default)]
struct FakeState {
    running: bool,
    working_dir: String,
    files: HashMap<String, FakeFile>,
    execs: HashMap<ExecId, Vec<String>>,
    statuses: HashMap<ExecId, ExecStatus>,
    next_exec: u64,
    streamed: Vec<Vec<String>>,
    detached: Vec<Vec<String>>,
    uploads: usize,
    fail_streams: u32,
    silent_deaths: u32,
    agent_stdout: Option<tokio::io::DuplexStream>,
    // Kept alive so silently-dead exec stdouts never reach EOF.
    zombie_pipes: Vec<tokio::io::DuplexStream>,
    zombie_exits: Vec<oneshot::Sender<Result<(), ContainerError>>>,
}

/// In-memory container for tests.
///
/// Interprets the handful of commands the synchronizer issues (`tar czf -`,
/// `rm -f`, the injected agent) against an in-memory filesystem, and can
/// script failures: execs that exit non-zero, and execs that die without
/// closing stdout (only visible through `inspect_exec`).
pub struct FakeContainer {
    state: Mutex<FakeState>,
    agent_stdin: tokio::sync::Mutex<Option<tokio::io::DuplexStream>>,
}

impl FakeContainer {
    pub fn new(working_dir: &str) -> Self {
        let (agent_stdin, agent_stdout) = tokio::io::duplex(64 * 1024);
        let state = FakeState {
            running: true,
            working_dir: working_dir.to_string(),
            next_exec: 1,
            agent_stdout: Some(agent_stdout),
            ..FakeState::default()
        };
        Self {
            state: Mutex::new(state),
            agent_stdin: tokio::sync::Mutex::new(Some(agent_stdin)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake container mutex poisoned")
    }

    /// Put a file into the container filesystem.
    pub fn insert_file(&self, path: &str, contents: &[u8], mode: u32) {
        self.lock().files.insert(
            path.to_string(),
            FakeFile {
                contents: contents.to_vec(),
                mode,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<FakeFile> {
        self.lock().files.get(path).cloned()
    }

    pub fn set_running(&self, running: bool) {
        self.lock().running = running;
    }

    /// The next `n` streaming tar execs exit with status 1.
    pub fn fail_next_streams(&self, n: u32) {
        self.lock().fail_streams = n;
    }

    /// The next `n` streaming tar execs die without closing stdout;
    /// only `inspect_exec` reveals the failure.
    pub fn silently_kill_next_streams(&self, n: u32) {
        self.lock().silent_deaths = n;
    }

    /// Feed one line of agent output to whoever is reading the agent exec.
    pub async fn push_agent_line(&self, line: &str) {
        let mut stdin = self.agent_stdin.lock().await;
        if let Some(pipe) = stdin.as_mut() {
            pipe.write_all(line.as_bytes()).await.expect("agent pipe closed");
            pipe.write_all(b"\n").await.expect("agent pipe closed");
        }
    }

    /// Simulate the agent exiting: its stdout reaches EOF.
    pub async fn close_agent(&self) {
        self.agent_stdin.lock().await.take();
    }

    pub fn streamed_cmds(&self) -> Vec<Vec<String>> {
        self.lock().streamed.clone()
    }

    pub fn detached_cmds(&self) -> Vec<Vec<String>> {
        self.lock().detached.clone()
    }

    pub fn upload_count(&self) -> usize {
        self.lock().uploads
    }

    /// Build the gzip'd tar stream `tar czf - <paths>` would produce.
    fn tar_stream(state: &FakeState, paths: &[String]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for path in paths {
            if let Some(file) = state.files.get(path) {
                let mut header = tar::Header::new_gnu();
                header.set_size(file.contents.len() as u64);
                header.set_mode(file.mode);
                header.set_entry_type(tar::EntryType::Regular);
                // Real tar strips the leading slash from member names.
                let name = path.trim_start_matches('/');
                builder
                    .append_data(&mut header, name, file.contents.as_slice())
                    .expect("in-memory tar build");
            }
        }
        let encoder = builder.into_inner().expect("in-memory tar finish");
        encoder.finish().expect("in-memory gzip finish")
    }
}

#[async_trait]
impl ContainerApi for FakeContainer {
    async fn create_exec(
        &self,
        container: &str,
        cmd: &[String],
        _attach_stdout: bool,
    ) -> Result<ExecId, ContainerError> {
        let mut state = self.lock();
        if !state.running {
            return Err(ContainerError::NotFound(container.to_string()));
        }
        let id = state.next_exec;
        state.next_exec += 1;
        state.execs.insert(id, cmd.to_vec());
        state.statuses.insert(
            id,
            ExecStatus {
                running: true,
                exit_code: None,
                error: None,
            },
        );
        Ok(id)
    }

    async fn start_exec_streaming(&self, exec: ExecId) -> Result<ExecHandle, ContainerError> {
        let mut state = self.lock();
        let cmd = state
            .execs
            .get(&exec)
            .cloned()
            .ok_or(ContainerError::UnknownExec(exec))?;
        state.streamed.push(cmd.clone());

        let (exit_tx, exit_rx) = oneshot::channel();

        // The injected agent: stream whatever the test pushes.
        if cmd.first().map(|c| c.ends_with("changed")).unwrap_or(false) {
            let stdout = state
                .agent_stdout
                .take()
                .ok_or(ContainerError::UnknownExec(exec))?;
            state.zombie_exits.push(exit_tx);
            return Ok(ExecHandle {
                stdout: Box::new(stdout),
                exit: exit_rx,
            });
        }

        if state.silent_deaths > 0 {
            state.silent_deaths -= 1;
            state.statuses.insert(
                exec,
                ExecStatus {
                    running: false,
                    exit_code: Some(137),
                    error: None,
                },
            );
            let (write_half, read_half) = tokio::io::duplex(16);
            state.zombie_pipes.push(write_half);
            state.zombie_exits.push(exit_tx);
            return Ok(ExecHandle {
                stdout: Box::new(read_half),
                exit: exit_rx,
            });
        }

        if state.fail_streams > 0 {
            state.fail_streams -= 1;
            state.statuses.insert(
                exec,
                ExecStatus {
                    running: false,
                    exit_code: Some(1),
                    error: None,
                },
            );
            let _ = exit_tx.send(Err(ContainerError::NonZeroExit(1)));
            return Ok(ExecHandle {
                stdout: Box::new(tokio::io::empty()),
                exit: exit_rx,
            });
        }

        let stdout: Box<dyn AsyncRead + Send + Unpin> = match cmd.first().map(String::as_str) {
            Some("tar") => {
                // ["tar", "czf", "-", paths...]
                let paths: Vec<String> = cmd.iter().skip(3).cloned().collect();
                Box::new(std::io::Cursor::new(Self::tar_stream(&state, &paths)))
            }
            Some("rm") => {
                for path in cmd.iter().skip(2) {
                    state.files.remove(path);
                }
                Box::new(tokio::io::empty())
            }
            _ => Box::new(tokio::io::empty()),
        };

        state.statuses.insert(
            exec,
            ExecStatus {
                running: false,
                exit_code: Some(0),
                error: None,
            },
        );
        let _ = exit_tx.send(Ok(()));
        Ok(ExecHandle {
            stdout,
            exit: exit_rx,
        })
    }

    async fn start_exec_detached(&self, exec: ExecId) -> Result<(), ContainerError> {
        let mut state = self.lock();
        let cmd = state
            .execs
            .get(&exec)
            .cloned()
            .ok_or(ContainerError::UnknownExec(exec))?;
        if cmd.first().map(String::as_str) == Some("rm") {
            for path in cmd.iter().skip(2) {
                state.files.remove(path);
            }
        }
        state.detached.push(cmd);
        state.statuses.insert(
            exec,
            ExecStatus {
                running: false,
                exit_code: Some(0),
                error: None,
            },
        );
        Ok(())
    }

    async fn inspect_exec(&self, exec: ExecId) -> Result<ExecStatus, ContainerError> {
        self.lock()
            .statuses
            .get(&exec)
            .cloned()
            .ok_or(ContainerError::UnknownExec(exec))
    }

    async fn upload(
        &self,
        container: &str,
        archive: Vec<u8>,
        target: &str,
    ) -> Result<(), ContainerError> {
        let mut state = self.lock();
        if !state.running {
            return Err(ContainerError::NotFound(container.to_string()));
        }
        state.uploads += 1;

        let mut tar = tar::Archive::new(archive.as_slice());
        for entry in tar.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap_or(0o644);
            let mut contents = Vec::new();
            io::Read::read_to_end(&mut entry, &mut contents)?;
            let abs = format!(
                "{}/{}",
                target.trim_end_matches('/'),
                name.trim_start_matches('/')
            );
            state.files.insert(abs, FakeFile { contents, mode });
        }
        Ok(())
    }

    async fn inspect_container(&self, _container: &str) -> Result<ContainerInfo, ContainerError> {
        let state = self.lock();
        Ok(ContainerInfo {
            running: state.running,
            working_dir: state.working_dir.clone(),
        })
    }
}
