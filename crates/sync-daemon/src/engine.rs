//! Transfer engine: moves batched changes across the container boundary.
//!
//! Runs on the orchestrator's tick. Outbound adds become a tar upload,
//! outbound removes a detached `rm -f` exec, inbound adds a streamed
//! `tar czf -` exec extracted locally. Every write the engine performs
//! registers an echo suppression for the watcher that will observe it.

use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use sync_core::{posix_join, Change, ChangeOp, Direction, EchoRegistry};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::container::{ContainerApi, ContainerError, ExecHandle};

/// Cap on path arguments per container exec, respecting the argv length
/// limit of the exec mechanism. Larger batches are split and sent
/// sequentially.
pub const MAX_EXEC_PATHS: usize = 2000;

/// Attempts per transfer before the batch is reported failed.
const TRANSFER_ATTEMPTS: usize = 3;

/// Delay before probing a streaming exec that has produced no EOF.
const INSPECT_DELAY: Duration = Duration::from_secs(5);

pub struct TransferEngine {
    api: Arc<dyn ContainerApi>,
    container: String,
    local_root: PathBuf,
    remote_root: String,
    echo: Arc<EchoRegistry>,
    status: mpsc::Sender<String>,
    debug: bool,
    inspect_delay: Duration,
}

impl TransferEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ContainerApi>,
        container: String,
        local_root: PathBuf,
        remote_root: String,
        echo: Arc<EchoRegistry>,
        status: mpsc::Sender<String>,
        debug: bool,
    ) -> Self {
        Self {
            api,
            container,
            local_root,
            remote_root,
            echo,
            status,
            debug,
            inspect_delay: INSPECT_DELAY,
        }
    }

    /// Shorten the exec probe delay; tests exercise the silent-death
    /// path without waiting out the production timer.
    pub fn set_inspect_delay(&mut self, delay: Duration) {
        self.inspect_delay = delay;
    }

    /// Flush one tick's worth of drained changes.
    ///
    /// Inbound removes never arrive here (the remote watcher drops
    /// them); they are discarded again regardless.
    pub async fn flush(&self, outbound: Vec<Change>, inbound: Vec<Change>) {
        let (out_adds, out_removes) = partition(outbound);
        let (in_adds, in_removes) = partition(inbound);
        if !in_removes.is_empty() {
            debug!("discarding {} inbound remove(s)", in_removes.len());
        }

        if !out_adds.is_empty() {
            self.upload_adds(&out_adds).await;
        }
        if !out_removes.is_empty() {
            self.remove_remote(&out_removes).await;
        }
        if !in_adds.is_empty() {
            self.download_adds(&in_adds).await;
        }
    }

    /// Outbound adds: tar the local files under their remote absolute
    /// paths and stream the archives into the container at `/`, one
    /// archive per chunk of the batch cap.
    async fn upload_adds(&self, adds: &[Change]) {
        let mut uploaded = 0;
        for chunk in adds.chunks(MAX_EXEC_PATHS) {
            uploaded += self.upload_chunk(chunk).await;
        }
        if uploaded > 0 {
            self.emit(format!("{uploaded} files uploaded")).await;
        }
    }

    async fn upload_chunk(&self, adds: &[Change]) -> usize {
        let local_root = self.local_root.clone();
        let remote_root = self.remote_root.clone();
        let rels: Vec<String> = adds.iter().map(|c| c.path.clone()).collect();

        let built = tokio::task::spawn_blocking(move || {
            build_outbound_archive(&local_root, &remote_root, &rels)
        })
        .await;
        let (archive, included) = match built {
            Ok(Ok(built)) => built,
            Ok(Err(e)) => {
                // Archive-level failure aborts the chunk; no partial upload.
                self.emit(format!("error: outbound archive failed: {e}")).await;
                return 0;
            }
            Err(e) => {
                self.emit(format!("error: outbound archive task failed: {e}")).await;
                return 0;
            }
        };
        if included.is_empty() {
            return 0;
        }

        // The agent inside the container will report these writes;
        // suppress before they become observable.
        for rel in &included {
            self.echo.block(Direction::Remote, rel);
        }

        for attempt in 1..=TRANSFER_ATTEMPTS {
            match self
                .api
                .upload(&self.container, archive.clone(), "/")
                .await
            {
                Ok(()) => break,
                Err(e) if attempt < TRANSFER_ATTEMPTS => {
                    warn!("upload attempt {attempt} failed: {e}");
                }
                Err(e) => {
                    self.emit(format!("error: upload failed: {e}")).await;
                    return 0;
                }
            }
        }

        if self.debug {
            for rel in &included {
                let base = self.local_root.display();
                self.emit(format!("-> {base}/{rel}")).await;
            }
        }
        included.len()
    }

    /// Outbound removes: fire-and-forget `rm -f` with absolute remote
    /// paths, chunked to the argv cap. Removes are not mirrored back by
    /// the container, so no echo suppression is registered.
    async fn remove_remote(&self, removes: &[Change]) {
        let mut removed = 0;
        for chunk in removes.chunks(MAX_EXEC_PATHS) {
            let mut cmd = vec!["rm".to_string(), "-f".to_string()];
            cmd.extend(
                chunk
                    .iter()
                    .map(|c| posix_join(&self.remote_root, &c.path)),
            );

            let started = match self.api.create_exec(&self.container, &cmd, false).await {
                Ok(exec) => self.api.start_exec_detached(exec).await,
                Err(e) => Err(e),
            };
            match started {
                Ok(()) => removed += chunk.len(),
                Err(e) => warn!("detached remove exec failed: {e}"),
            }
        }
        if removed > 0 {
            self.emit(format!("{removed} files removed")).await;
        }
    }

    /// Inbound adds: run `tar czf -` in the container in chunks, read
    /// the gzip'd stream, extract under the local root.
    async fn download_adds(&self, adds: &[Change]) {
        let mut downloaded = 0;
        for chunk in adds.chunks(MAX_EXEC_PATHS) {
            let paths: Vec<String> = chunk
                .iter()
                .map(|c| posix_join(&self.remote_root, &c.path))
                .collect();

            let archive = match self.fetch_archive(&paths).await {
                Ok(archive) => archive,
                Err(e) => {
                    self.emit(format!("error: inbound batch failed: {e}")).await;
                    continue;
                }
            };

            match self.extract_archive(archive).await {
                Ok(written) => {
                    if self.debug {
                        for rel in &written {
                            self.emit(format!("<- {}/{rel}", self.remote_root)).await;
                        }
                    }
                    downloaded += written.len();
                }
                Err(e) => {
                    self.emit(format!("error: inbound extract failed: {e}")).await;
                }
            }
        }
        if downloaded > 0 {
            self.emit(format!("{downloaded} files downloaded")).await;
        }
    }

    /// One chunk's exec, retried with a fresh exec on failure.
    async fn fetch_archive(&self, paths: &[String]) -> Result<Vec<u8>, ContainerError> {
        let mut cmd = vec!["tar".to_string(), "czf".to_string(), "-".to_string()];
        cmd.extend(paths.iter().cloned());

        let mut last_err = ContainerError::Vanished;
        for attempt in 1..=TRANSFER_ATTEMPTS {
            match self.fetch_once(&cmd).await {
                Ok(archive) => return Ok(archive),
                Err(e) => {
                    if attempt < TRANSFER_ATTEMPTS {
                        self.emit(format!(
                            "error: remote tar exec failed (attempt {attempt} of {TRANSFER_ATTEMPTS}): {e}; retrying"
                        ))
                        .await;
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Start the exec, consume stdout, and race completion against a
    /// delayed `inspect_exec` probe. The probe is the only signal when
    /// the exec dies without closing its stdout.
    async fn fetch_once(&self, cmd: &[String]) -> Result<Vec<u8>, ContainerError> {
        let exec = self.api.create_exec(&self.container, cmd, true).await?;
        let ExecHandle { mut stdout, exit } = self.api.start_exec_streaming(exec).await?;

        let read = async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            Ok::<_, io::Error>(buf)
        };
        tokio::pin!(read);
        tokio::pin!(exit);

        loop {
            let probe = tokio::time::sleep(self.inspect_delay);
            tokio::pin!(probe);

            tokio::select! {
                buf = &mut read => {
                    let buf = buf?;
                    // Stream closed; confirm the exec actually succeeded.
                    return match (&mut exit).await {
                        Ok(Ok(())) => Ok(buf),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(ContainerError::Vanished),
                    };
                }
                _ = &mut probe => {
                    let status = self.api.inspect_exec(exec).await?;
                    if !status.running {
                        match status.exit_code {
                            Some(0) => {
                                // Finished cleanly; the stream should EOF
                                // momentarily, keep reading.
                            }
                            Some(code) => return Err(ContainerError::NonZeroExit(code)),
                            None => return Err(ContainerError::Vanished),
                        }
                    }
                }
            }
        }
    }

    async fn extract_archive(&self, archive: Vec<u8>) -> io::Result<Vec<String>> {
        let local_root = self.local_root.clone();
        let remote_root = self.remote_root.clone();
        let echo = Arc::clone(&self.echo);
        tokio::task::spawn_blocking(move || {
            extract_inbound_archive(&archive, &local_root, &remote_root, &echo)
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn emit(&self, line: String) {
        if self.status.send(line).await.is_err() {
            debug!("status receiver dropped");
        }
    }
}

/// Split into (adds, removes), deduplicated per path keeping the last
/// occurrence; a tick may drain several bursts touching one file.
fn partition(changes: Vec<Change>) -> (Vec<Change>, Vec<Change>) {
    let mut latest: HashMap<String, Change> = HashMap::new();
    for change in changes {
        latest.insert(change.path.clone(), change);
    }
    latest
        .into_values()
        .partition(|change| change.op == ChangeOp::Add)
}

/// Build the outbound tar in memory. Per-file stat/open failures skip
/// the entry; archive write failures abort the whole batch.
fn build_outbound_archive(
    local_root: &Path,
    remote_root: &str,
    rels: &[String],
) -> io::Result<(Vec<u8>, Vec<String>)> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut included = Vec::new();

    for rel in rels {
        let local = local_root.join(rel);
        let meta = match local.symlink_metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                debug!("skipping non-regular file {}", local.display());
                continue;
            }
            Err(e) => {
                warn!("skipping {}: {e}", local.display());
                continue;
            }
        };
        let mut file = match fs::File::open(&local) {
            Ok(file) => file,
            Err(e) => {
                warn!("skipping {}: {e}", local.display());
                continue;
            }
        };

        let mut header = tar::Header::new_gnu();
        header.set_size(meta.len());
        header.set_mode(file_mode(&meta));
        header.set_mtime(
            meta.modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        header.set_entry_type(tar::EntryType::Regular);

        let name = posix_join(remote_root, rel);
        builder.append_data(&mut header, name.trim_start_matches('/'), &mut file)?;
        included.push(rel.clone());
    }

    Ok((builder.into_inner()?, included))
}

/// Extract an inbound gzip'd tar under the local root.
///
/// Entries outside the remote root are dropped; per-entry write
/// failures skip the entry and the batch continues.
fn extract_inbound_archive(
    archive: &[u8],
    local_root: &Path,
    remote_root: &str,
    echo: &EchoRegistry,
) -> io::Result<Vec<String>> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let root_rel = remote_root.trim_matches('/');
    let mut written = Vec::new();

    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let name = name.trim_start_matches('/');

        let rel = if root_rel.is_empty() {
            name
        } else {
            match name.strip_prefix(root_rel) {
                Some(rest) if rest.starts_with('/') => &rest[1..],
                _ => {
                    warn!("tar entry {name} outside remote root {remote_root}, skipping");
                    continue;
                }
            }
        };
        if rel.is_empty() {
            continue;
        }
        // The archive bytes come from inside the container; a crafted
        // entry must not be able to climb out of the local root.
        if rel
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            warn!("tar entry {name} has an unsafe path, skipping");
            continue;
        }

        let dest = local_root.join(rel);
        let mode = entry.header().mode().unwrap_or(0o644);

        // Suppress the local watcher event this write is about to cause.
        echo.block(Direction::Local, rel);

        match write_entry(&mut entry, &dest, mode) {
            Ok(()) => written.push(rel.to_string()),
            Err(e) => warn!("skipping {rel}: {e}"),
        }
    }

    Ok(written)
}

fn write_entry<R: Read>(contents: &mut R, dest: &Path, mode: u32) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        create_dir_all_0755(parent)?;
    }
    let mut file = fs::File::create(dest)?;
    io::copy(contents, &mut file)?;
    file.sync_all()?;
    set_mode(&file, mode)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn create_dir_all_0755(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dir_all_0755(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FakeContainer;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        engine: TransferEngine,
        api: Arc<FakeContainer>,
        echo: Arc<EchoRegistry>,
        status_rx: mpsc::Receiver<String>,
        local: TempDir,
    }

    fn fixture() -> Fixture {
        let local = TempDir::new().unwrap();
        let api = Arc::new(FakeContainer::new("/app"));
        let echo = Arc::new(EchoRegistry::new());
        let (status_tx, status_rx) = mpsc::channel(8192);
        let engine = TransferEngine::new(
            Arc::clone(&api) as Arc<dyn ContainerApi>,
            "c1".to_string(),
            local.path().to_path_buf(),
            "/app".to_string(),
            Arc::clone(&echo),
            status_tx,
            true,
        );
        Fixture {
            engine,
            api,
            echo,
            status_rx,
            local,
        }
    }

    fn local_add(fx: &Fixture, rel: &str, contents: &str) -> Change {
        let path = fx.local.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
        Change::new(ChangeOp::Add, fx.local.path(), rel)
    }

    fn remote_add(rel: &str) -> Change {
        Change::new(ChangeOp::Add, "/app", rel)
    }

    fn drain_status(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_upload_add_mirrors_file_into_container() {
        let mut fx = fixture();
        let change = local_add(&fx, "src/a.txt", "hi");

        fx.engine.flush(vec![change], vec![]).await;

        let file = fx.api.file("/app/src/a.txt").expect("file uploaded");
        assert_eq!(file.contents, b"hi");

        let lines = drain_status(&mut fx.status_rx);
        assert!(lines.contains(&"1 files uploaded".to_string()), "{lines:?}");

        // Upload registered suppression for the remote watcher.
        assert!(fx.echo.take(Direction::Remote, "src/a.txt"));
    }

    #[tokio::test]
    async fn test_upload_skips_missing_local_file() {
        let mut fx = fixture();
        let present = local_add(&fx, "here.txt", "x");
        let missing = Change::new(ChangeOp::Add, fx.local.path(), "gone.txt");

        fx.engine.flush(vec![present, missing], vec![]).await;

        assert!(fx.api.file("/app/here.txt").is_some());
        assert!(fx.api.file("/app/gone.txt").is_none());
        let lines = drain_status(&mut fx.status_rx);
        assert!(lines.contains(&"1 files uploaded".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn test_upload_with_no_survivors_is_silent() {
        let mut fx = fixture();
        let missing = Change::new(ChangeOp::Add, fx.local.path(), "gone.txt");

        fx.engine.flush(vec![missing], vec![]).await;

        assert_eq!(fx.api.upload_count(), 0);
        assert!(drain_status(&mut fx.status_rx).is_empty());
    }

    #[tokio::test]
    async fn test_upload_chunks_large_batches_with_one_summary() {
        let mut fx = fixture();
        let count = 3000;
        let adds: Vec<Change> = (0..count)
            .map(|i| local_add(&fx, &format!("bulk/f{i}.txt"), "x"))
            .collect();

        fx.engine.flush(adds, vec![]).await;

        // 2000 + 1000, but a single combined summary.
        assert_eq!(fx.api.upload_count(), 2);
        assert!(fx.api.file("/app/bulk/f0.txt").is_some());
        assert!(fx.api.file("/app/bulk/f2999.txt").is_some());

        let lines = drain_status(&mut fx.status_rx);
        let summaries: Vec<_> = lines.iter().filter(|l| l.contains("uploaded")).collect();
        assert_eq!(summaries, vec![&format!("{count} files uploaded")]);
    }

    #[tokio::test]
    async fn test_removes_are_detached_and_chunked() {
        let mut fx = fixture();
        let removes: Vec<Change> = (0..2500)
            .map(|i| Change::new(ChangeOp::Remove, fx.local.path(), format!("f{i}.txt")))
            .collect();

        fx.engine.flush(removes, vec![]).await;

        let cmds = fx.api.detached_cmds();
        assert_eq!(cmds.len(), 2);
        let mut sizes: Vec<usize> = cmds.iter().map(|c| c.len() - 2).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![500, MAX_EXEC_PATHS]);
        assert!(cmds.iter().all(|c| c[0] == "rm" && c[1] == "-f"));

        let lines = drain_status(&mut fx.status_rx);
        assert!(lines.contains(&"2500 files removed".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn test_download_writes_file_and_blocks_local_echo() {
        let mut fx = fixture();
        fx.api.insert_file("/app/gen/out.bin", &[1, 2, 3], 0o640);

        fx.engine.flush(vec![], vec![remote_add("gen/out.bin")]).await;

        let dest = fx.local.path().join("gen/out.bin");
        assert_eq!(fs::read(&dest).unwrap(), vec![1, 2, 3]);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode, 0o640);
        }

        assert!(fx.echo.take(Direction::Local, "gen/out.bin"));
        let lines = drain_status(&mut fx.status_rx);
        assert!(lines.contains(&"1 files downloaded".to_string()), "{lines:?}");
        assert!(lines.contains(&"<- /app/gen/out.bin".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn test_download_chunks_large_batches() {
        let mut fx = fixture();
        let count = 4500;
        let adds: Vec<Change> = (0..count)
            .map(|i| {
                let rel = format!("bulk/f{i}");
                fx.api
                    .insert_file(&format!("/app/{rel}"), b"x", 0o644);
                remote_add(&rel)
            })
            .collect();

        fx.engine.flush(vec![], adds).await;

        let tar_execs: Vec<_> = fx
            .api
            .streamed_cmds()
            .into_iter()
            .filter(|c| c[0] == "tar")
            .collect();
        assert_eq!(tar_execs.len(), 3);
        assert!(tar_execs.iter().all(|c| c.len() - 3 <= MAX_EXEC_PATHS));

        let lines = drain_status(&mut fx.status_rx);
        assert!(
            lines.contains(&format!("{count} files downloaded")),
            "missing summary"
        );
    }

    #[tokio::test]
    async fn test_download_retries_after_failed_execs() {
        let mut fx = fixture();
        fx.api.insert_file("/app/gen/out.bin", &[9, 9], 0o644);
        fx.api.fail_next_streams(2);

        fx.engine.flush(vec![], vec![remote_add("gen/out.bin")]).await;

        let dest = fx.local.path().join("gen/out.bin");
        assert_eq!(fs::read(dest).unwrap(), vec![9, 9]);

        let lines = drain_status(&mut fx.status_rx);
        let retries = lines.iter().filter(|l| l.contains("retrying")).count();
        assert_eq!(retries, 2, "{lines:?}");
        assert!(lines.contains(&"1 files downloaded".to_string()));
    }

    #[tokio::test]
    async fn test_download_gives_up_after_three_failures() {
        let mut fx = fixture();
        fx.api.insert_file("/app/gen/out.bin", &[9], 0o644);
        fx.api.fail_next_streams(3);

        fx.engine.flush(vec![], vec![remote_add("gen/out.bin")]).await;

        assert!(!fx.local.path().join("gen/out.bin").exists());
        let lines = drain_status(&mut fx.status_rx);
        assert!(
            lines.iter().any(|l| l.starts_with("error: inbound batch failed")),
            "{lines:?}"
        );
    }

    #[tokio::test]
    async fn test_download_recovers_from_silently_dead_exec() {
        let mut fx = fixture();
        fx.engine.set_inspect_delay(Duration::from_millis(50));
        fx.api.insert_file("/app/gen/out.bin", &[7], 0o644);
        fx.api.silently_kill_next_streams(1);

        fx.engine.flush(vec![], vec![remote_add("gen/out.bin")]).await;

        let dest = fx.local.path().join("gen/out.bin");
        assert_eq!(fs::read(dest).unwrap(), vec![7]);
        let lines = drain_status(&mut fx.status_rx);
        assert_eq!(
            lines.iter().filter(|l| l.contains("retrying")).count(),
            1,
            "{lines:?}"
        );
    }

    #[tokio::test]
    async fn test_repeated_add_is_idempotent() {
        let mut fx = fixture();
        let change = local_add(&fx, "same.txt", "stable");

        fx.engine.flush(vec![change.clone()], vec![]).await;
        fx.engine.flush(vec![change], vec![]).await;

        let file = fx.api.file("/app/same.txt").unwrap();
        assert_eq!(file.contents, b"stable");
        assert_eq!(fx.api.upload_count(), 2);
        let _ = drain_status(&mut fx.status_rx);
    }

    #[tokio::test]
    async fn test_duplicate_changes_in_one_tick_collapse() {
        let mut fx = fixture();
        let first = local_add(&fx, "dup.txt", "v2");

        fx.engine.flush(vec![first.clone(), first], vec![]).await;

        let lines = drain_status(&mut fx.status_rx);
        assert!(lines.contains(&"1 files uploaded".to_string()), "{lines:?}");
    }

    #[test]
    fn test_partition_splits_and_dedupes() {
        let adds_and_removes = vec![
            Change::new(ChangeOp::Add, "/r", "a"),
            Change::new(ChangeOp::Remove, "/r", "b"),
            Change::new(ChangeOp::Remove, "/r", "a"),
        ];
        let (adds, removes) = partition(adds_and_removes);
        // The later remove for "a" wins.
        assert!(adds.is_empty());
        assert_eq!(removes.len(), 2);
    }

    #[test]
    fn test_extract_rejects_entries_outside_remote_root() {
        let local = TempDir::new().unwrap();
        let echo = EchoRegistry::new();

        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for name in ["etc/passwd", "apple/x.txt", "app/ok.txt"] {
            let mut header = tar::Header::new_gnu();
            header.set_size(2);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, &b"ok"[..]).unwrap();
        }
        // A hostile archive can carry `..` in the raw header name;
        // `append` writes the header verbatim, like bytes off the wire.
        let mut header = tar::Header::new_gnu();
        {
            let name = b"app/../escaped.txt";
            header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        }
        header.set_size(2);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"ok"[..]).unwrap();
        let archive = builder.into_inner().unwrap().finish().unwrap();

        let written =
            extract_inbound_archive(&archive, local.path(), "/app", &echo).unwrap();
        assert_eq!(written, vec!["ok.txt".to_string()]);
        assert!(local.path().join("ok.txt").exists());
        assert!(!PathBuf::from(local.path()).join("etc/passwd").exists());
        assert!(!local.path().parent().unwrap().join("escaped.txt").exists());
        // No suppression was registered for the rejected entries.
        assert!(!echo.take(Direction::Local, "../escaped.txt"));
    }
}
